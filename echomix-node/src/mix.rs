//! The mix runtime: accept, unwrap, delay, forward.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use echomix_sphinx::{KeyPair, RoutingAction, SphinxPacket};
use echomix_transport::envelope::{
    self, Envelope, EnvelopeCodec, ASSIGN_FLAG, COMM_FLAG, PULL_FLAG,
};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::codec::Framed;

use crate::{NodeConfig, NodeError, ReplayGuard, Result};

/// Key material, limits and replay state shared by every connection task.
pub(crate) struct NodeCore {
    pub(crate) config: NodeConfig,
    keypair: KeyPair,
    replay: Mutex<ReplayGuard>,
    inflight: Semaphore,
}

impl NodeCore {
    pub(crate) fn new(config: NodeConfig, keypair: KeyPair) -> Self {
        Self {
            replay: Mutex::new(ReplayGuard::new(config.replay_capacity, config.replay_ttl)),
            inflight: Semaphore::new(config.max_in_flight),
            config,
            keypair,
        }
    }

    /// Claim an in-flight slot; sheds the packet at the ceiling.
    pub(crate) fn admit(&self) -> Result<SemaphorePermit<'_>> {
        self.inflight
            .try_acquire()
            .map_err(|_| NodeError::Backpressure)
    }

    /// Parse and unwrap one onion layer, enforcing replay freshness.
    pub(crate) fn peel(&self, body: &[u8]) -> Result<RoutingAction> {
        let packet = SphinxPacket::from_bytes(body)?;
        let unwrapped = packet.unwrap(self.keypair.secret())?;
        let fresh = self
            .replay
            .lock()
            .expect("replay guard lock poisoned")
            .insert(unwrapped.replay_tag);
        if !fresh {
            return Err(NodeError::Replay);
        }
        Ok(unwrapped.action)
    }

    /// Sleep the sender-chosen delay, then forward the peeled packet.
    pub(crate) async fn forward_after_delay(
        &self,
        next: SocketAddr,
        delay_ms: u32,
        packet: &SphinxPacket,
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;

        let frame = Envelope::new(COMM_FLAG, packet.to_bytes());
        if let Err(first) = envelope::send_to(next, frame.clone(), self.config.io_timeout).await {
            // One retry with jittered backoff; a second failure drops the
            // packet, which is all a mix may do.
            let base = self.config.retry_backoff;
            let cap = (base.as_millis() as u64) / 2;
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=cap));
            tracing::warn!(
                id = %self.config.id,
                %next,
                error = %first,
                "forward failed, retrying once"
            );
            tokio::time::sleep(base + jitter).await;
            envelope::send_to(next, frame, self.config.io_timeout).await?;
        }
        tracing::debug!(id = %self.config.id, %next, "packet forwarded");
        Ok(())
    }

    /// Full relay path for a `COMM` body at a plain mix.
    pub(crate) async fn process_comm(&self, body: &[u8]) -> Result<()> {
        match self.peel(body)? {
            RoutingAction::Relay {
                next_address,
                delay_ms,
                packet,
            } => self.forward_after_delay(next_address, delay_ms, &packet).await,
            RoutingAction::Deliver { .. } => Err(NodeError::NotAProvider),
        }
    }
}

/// A relay mix: unwraps one layer per packet, delays, forwards.
pub struct MixNode {
    core: Arc<NodeCore>,
    listener: TcpListener,
}

impl MixNode {
    /// Bind the listener. Callers treat failure as fatal.
    pub async fn bind(config: NodeConfig, keypair: KeyPair) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_address).await?;
        tracing::info!(id = %config.id, addr = %listener.local_addr()?, "mix listening");
        Ok(Self {
            core: Arc::new(NodeCore::new(config, keypair)),
            listener,
        })
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever. Per-connection failures are logged and
    /// never stop the loop.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let core = self.core.clone();
                    tokio::spawn(handle_connection(core, stream, peer));
                }
                Err(e) => {
                    tracing::error!(id = %self.core.config.id, error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(core: Arc<NodeCore>, stream: TcpStream, peer: SocketAddr) {
    let mut framed = Framed::new(stream, EnvelopeCodec);
    let frame = match envelope::recv_one(&mut framed, core.config.io_timeout).await {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(id = %core.config.id, %peer, error = %e, "inbound read failed");
            return;
        }
    };
    // Push model: nothing is ever written back on this connection.
    drop(framed);

    match frame.flag {
        COMM_FLAG => {
            let _permit = match core.admit() {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(id = %core.config.id, error = %e, "packet shed");
                    return;
                }
            };
            if let Err(e) = core.process_comm(&frame.body).await {
                tracing::warn!(id = %core.config.id, error = %e, "packet dropped");
            }
        }
        ASSIGN_FLAG | PULL_FLAG => {
            tracing::info!(id = %core.config.id, flag = frame.flag, "provider-only envelope at a mix, dropped");
        }
        flag => {
            tracing::info!(id = %core.config.id, flag, "envelope flag not recognised, dropped");
        }
    }
}
