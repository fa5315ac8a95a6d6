//! The sending client.
//!
//! A client attaches to one provider. It registers to obtain a bearer
//! token, wraps outgoing messages into Sphinx packets over a freshly
//! sampled path, and periodically pulls its inbox. Delivered payloads and
//! the registration token arrive on the client's own listener, so the
//! provider never needs a long-lived connection to the client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use echomix_sphinx::{Hop, KeyPair, SphinxPacket, FINAL_FLAG, RELAY_FLAG};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::codec::Framed;

use crate::envelope::{
    self, Envelope, EnvelopeCodec, PullRequest, AUTH_FAILED_FLAG, ASSIGN_FLAG, COMM_FLAG,
    PULL_FLAG, TOKEN_FLAG,
};
use crate::path::{delay_to_ms, sample_delays, sample_mixes};
use crate::{ClientDescriptor, Directory, MixDescriptor, Result, TransportError};

/// Configuration for a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Our stable identifier.
    pub id: String,
    /// Address the delivery listener binds to; port 0 picks a free port.
    pub listen_address: SocketAddr,
    /// Id of the provider we attach to.
    pub provider_id: String,
    /// Rate parameter λ of the per-hop exponential delay (mean = 1/λ s).
    pub delay_rate: f64,
    /// Number of intermediate mixes between the two providers.
    pub mix_hops: usize,
    /// Interval between inbox pulls.
    pub poll_interval: Duration,
    /// Deadline for every dial, read and write.
    pub io_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: "client".into(),
            listen_address: "127.0.0.1:0".parse().expect("static address"),
            provider_id: "provider".into(),
            delay_rate: 5.0,
            mix_hops: 2,
            poll_interval: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// A mix network client bound to its delivery listener.
pub struct Client {
    config: ClientConfig,
    keypair: KeyPair,
    directory: Directory,
    provider: MixDescriptor,
    local_addr: SocketAddr,
    rng: StdRng,
    token: Arc<RwLock<Option<Vec<u8>>>>,
    token_ready: Arc<Notify>,
    incoming: mpsc::Receiver<Vec<u8>>,
}

impl Client {
    /// Bind the delivery listener and spawn its accept loop.
    pub async fn bind(
        config: ClientConfig,
        keypair: KeyPair,
        directory: Directory,
    ) -> Result<Self> {
        let provider = directory.provider(&config.provider_id)?.clone();
        let listener = TcpListener::bind(config.listen_address).await?;
        let local_addr = listener.local_addr()?;

        let (incoming_tx, incoming) = mpsc::channel(128);
        let token = Arc::new(RwLock::new(None));
        let token_ready = Arc::new(Notify::new());
        tokio::spawn(listen_loop(
            listener,
            config.id.clone(),
            incoming_tx,
            token.clone(),
            token_ready.clone(),
            config.io_timeout,
        ));

        tracing::info!(id = %config.id, %local_addr, "client listening");
        Ok(Self {
            config,
            keypair,
            directory,
            provider,
            local_addr,
            rng: StdRng::from_entropy(),
            token,
            token_ready,
            incoming,
        })
    }

    /// The address deliveries arrive on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Our descriptor as sent to the provider at registration.
    pub fn descriptor(&self) -> ClientDescriptor {
        ClientDescriptor {
            id: self.config.id.clone(),
            host: self.local_addr.ip().to_string(),
            port: self.local_addr.port(),
            public_key: self.keypair.public_bytes(),
            provider_id: self.config.provider_id.clone(),
        }
    }

    /// Register with our provider and wait for the bearer token.
    ///
    /// Registering again replaces the token on both sides.
    pub async fn register(&self) -> Result<()> {
        let body = serde_json::to_vec(&self.descriptor())?;
        envelope::send_to(
            self.provider.address(),
            Envelope::new(ASSIGN_FLAG, body),
            self.config.io_timeout,
        )
        .await?;

        tokio::time::timeout(self.config.io_timeout, self.token_ready.notified())
            .await
            .map_err(|_| TransportError::Timeout)?;
        tracing::info!(id = %self.config.id, "registered with provider");
        Ok(())
    }

    /// Wrap `message` for `recipient_id` and inject it at our provider.
    pub async fn send(&mut self, message: &[u8], recipient_id: &str) -> Result<()> {
        let recipient = self.directory.client(recipient_id)?.clone();
        let egress = self.directory.provider(&recipient.provider_id)?.clone();

        let mixes = sample_mixes(&mut self.rng, self.directory.mixes(), self.config.mix_hops)?;
        let mut nodes: Vec<&MixDescriptor> = Vec::with_capacity(self.config.mix_hops + 2);
        nodes.push(&self.provider);
        nodes.extend(mixes);
        nodes.push(&egress);

        let delays = sample_delays(&mut self.rng, self.config.delay_rate, nodes.len())?;

        let mut hops = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let (next, flag) = match nodes.get(i + 1) {
                Some(successor) => (successor.address(), RELAY_FLAG),
                None => (recipient.id.clone(), FINAL_FLAG),
            };
            hops.push(Hop {
                public_key: node.public_point()?,
                next,
                flag,
                delay_ms: delay_to_ms(delays[i]),
            });
        }

        let packet = SphinxPacket::build(&mut self.rng, message, &hops)?;
        envelope::send_to(
            self.provider.address(),
            Envelope::new(COMM_FLAG, packet.to_bytes()),
            self.config.io_timeout,
        )
        .await?;
        tracing::debug!(id = %self.config.id, recipient = %recipient_id, "packet injected");
        Ok(())
    }

    /// Ask our provider to flush the inbox towards our listener.
    pub async fn pull(&self) -> Result<()> {
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotRegistered)?;
        let request = PullRequest {
            client_id: self.config.id.clone(),
            token,
        };

        let stream = tokio::time::timeout(
            self.config.io_timeout,
            tokio::net::TcpStream::connect(self.provider.address()),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        let mut framed = Framed::new(stream, EnvelopeCodec);

        use futures::SinkExt;
        tokio::time::timeout(
            self.config.io_timeout,
            framed.send(Envelope::new(PULL_FLAG, serde_json::to_vec(&request)?)),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        // The provider replies on this connection only to reject the token;
        // deliveries go to our listener.
        use futures::StreamExt;
        match tokio::time::timeout(self.config.io_timeout, framed.next()).await {
            Err(_) | Ok(None) => Ok(()),
            Ok(Some(Ok(reply))) if reply.flag == AUTH_FAILED_FLAG => {
                Err(TransportError::AuthFailed)
            }
            Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(e))) => Err(e.into()),
        }
    }

    /// Pull the inbox on the configured interval until the task is dropped.
    pub async fn run_pull_loop(&self) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.pull().await {
                tracing::warn!(id = %self.config.id, error = %e, "inbox pull failed");
            }
        }
    }

    /// Next delivered payload, if any.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }
}

async fn listen_loop(
    listener: TcpListener,
    id: String,
    incoming: mpsc::Sender<Vec<u8>>,
    token: Arc<RwLock<Option<Vec<u8>>>>,
    token_ready: Arc<Notify>,
    io_timeout: Duration,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "accept failed");
                continue;
            }
        };

        let incoming = incoming.clone();
        let token = token.clone();
        let token_ready = token_ready.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, EnvelopeCodec);
            let envelope = match envelope::recv_one(&mut framed, io_timeout).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(id = %id, %peer, error = %e, "inbound read failed");
                    return;
                }
            };

            match envelope.flag {
                TOKEN_FLAG => {
                    *token.write().await = Some(envelope.body);
                    token_ready.notify_one();
                    tracing::debug!(id = %id, "token received");
                }
                COMM_FLAG => {
                    if incoming.send(envelope.body).await.is_err() {
                        tracing::debug!(id = %id, "receiver dropped, payload discarded");
                    }
                }
                flag => {
                    tracing::debug!(id = %id, flag, "unrecognised envelope dropped");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with_provider() -> Directory {
        Directory::new(
            Vec::new(),
            vec![MixDescriptor {
                id: "provider".into(),
                host: "127.0.0.1".into(),
                port: 1, // never dialled in these tests
                public_key: [2u8; 32],
            }],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn bind_reports_local_address() {
        let mut rng = StdRng::seed_from_u64(1);
        let keypair = KeyPair::generate(&mut rng);
        let client = Client::bind(ClientConfig::default(), keypair, directory_with_provider())
            .await
            .unwrap();
        assert_ne!(client.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn descriptor_reflects_bound_listener() {
        let mut rng = StdRng::seed_from_u64(2);
        let keypair = KeyPair::generate(&mut rng);
        let public = keypair.public_bytes();
        let client = Client::bind(ClientConfig::default(), keypair, directory_with_provider())
            .await
            .unwrap();

        let descriptor = client.descriptor();
        assert_eq!(descriptor.id, "client");
        assert_eq!(descriptor.port, client.local_addr().port());
        assert_eq!(descriptor.public_key, public);
        assert_eq!(descriptor.provider_id, "provider");
    }

    #[tokio::test]
    async fn unknown_provider_fails_bind() {
        let mut rng = StdRng::seed_from_u64(3);
        let keypair = KeyPair::generate(&mut rng);
        let config = ClientConfig {
            provider_id: "missing".into(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            Client::bind(config, keypair, directory_with_provider()).await,
            Err(TransportError::UnknownId(_))
        ));
    }

    #[tokio::test]
    async fn pull_before_registration_is_rejected() {
        let mut rng = StdRng::seed_from_u64(4);
        let keypair = KeyPair::generate(&mut rng);
        let client = Client::bind(ClientConfig::default(), keypair, directory_with_provider())
            .await
            .unwrap();
        assert!(matches!(
            client.pull().await,
            Err(TransportError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn listener_routes_token_and_payload() {
        let mut rng = StdRng::seed_from_u64(5);
        let keypair = KeyPair::generate(&mut rng);
        let mut client =
            Client::bind(ClientConfig::default(), keypair, directory_with_provider())
                .await
                .unwrap();
        let addr = client.local_addr();

        envelope::send_to(
            addr,
            Envelope::new(TOKEN_FLAG, b"secret-token".to_vec()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        envelope::send_to(
            addr,
            Envelope::new(COMM_FLAG, b"hello".to_vec()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(
            client.token.read().await.as_deref(),
            Some(b"secret-token".as_slice())
        );
    }
}
