//! Path and delay sampling.
//!
//! The RNG is owned by the caller and seeded once per process from the
//! operating system; sampling only advances it. Reseeding per call would
//! collapse entropy on fast call bursts.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::{MixDescriptor, Result, TransportError};

/// Select `count` distinct mixes in uniformly random order.
pub fn sample_mixes<'a, R: Rng + ?Sized>(
    rng: &mut R,
    mixes: &'a [MixDescriptor],
    count: usize,
) -> Result<Vec<&'a MixDescriptor>> {
    if mixes.len() < count {
        return Err(TransportError::TooFewMixes {
            need: count,
            have: mixes.len(),
        });
    }
    // choose_multiple keeps the original slice order; shuffle to make the
    // sequence itself uniform.
    let mut picked: Vec<&MixDescriptor> = mixes.choose_multiple(rng, count).collect();
    picked.shuffle(rng);
    Ok(picked)
}

/// Draw `n` independent delays (in seconds) from `Exp(rate)`.
pub fn sample_delays<R: Rng + ?Sized>(rng: &mut R, rate: f64, n: usize) -> Result<Vec<f64>> {
    let exp = Exp::new(rate).map_err(|_| TransportError::InvalidRate(rate))?;
    Ok((0..n).map(|_| exp.sample(rng)).collect())
}

/// Convert a sampled delay to the millisecond field carried in the header.
pub fn delay_to_ms(delay_secs: f64) -> u32 {
    (delay_secs * 1000.0).round() as u32
}
