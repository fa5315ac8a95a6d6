//! The provider runtime: a mix that also owns client state.
//!
//! Providers are the network's points of attachment. They register clients
//! and hand out bearer tokens, buffer final-hop payloads in per-client
//! inboxes, and flush an inbox towards its owner on an authenticated pull.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use echomix_sphinx::{KeyPair, RoutingAction};
use echomix_transport::envelope::{
    self, Envelope, EnvelopeCodec, PullRequest, ASSIGN_FLAG, AUTH_FAILED_FLAG, COMM_FLAG,
    PULL_FLAG, TOKEN_FLAG,
};
use echomix_transport::{ClientDescriptor, TransportError};
use futures::SinkExt;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::codec::Framed;

use crate::inbox::validate_id;
use crate::mix::NodeCore;
use crate::{InboxStore, NodeConfig, Result};

/// Width of the bearer token handed out at registration.
const TOKEN_SIZE: usize = 32;

/// What a pull found in the inbox. The original wire protocol called these
/// signals NI, EI and SI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The id never registered here.
    NoInbox,
    /// Registered, but nothing is buffered.
    Empty,
    /// This many messages were delivered (and deleted).
    Sent(usize),
}

/// Provider-side record of a registered client.
#[derive(Debug, Clone)]
struct ClientRecord {
    host: String,
    port: u16,
    #[allow(dead_code)]
    public_key: [u8; 32],
    token: Vec<u8>,
}

impl ClientRecord {
    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct ProviderCore {
    node: NodeCore,
    /// Writers are ASSIGN handlers; PULL and store paths only read.
    clients: RwLock<HashMap<String, ClientRecord>>,
    inboxes: InboxStore,
}

/// A provider node.
pub struct Provider {
    core: Arc<ProviderCore>,
    listener: TcpListener,
}

impl Provider {
    /// Bind the listener. Callers treat failure as fatal.
    pub async fn bind(config: NodeConfig, keypair: KeyPair) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_address).await?;
        tracing::info!(id = %config.id, addr = %listener.local_addr()?, "provider listening");
        let inboxes = InboxStore::new(config.inbox_root.clone());
        Ok(Self {
            core: Arc::new(ProviderCore {
                node: NodeCore::new(config, keypair),
                clients: RwLock::new(HashMap::new()),
                inboxes,
            }),
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
                    tracing::error!(id = %self.core.node.config.id, error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(core: Arc<ProviderCore>, stream: TcpStream, peer: SocketAddr) {
    let mut framed = Framed::new(stream, EnvelopeCodec);
    let frame = match envelope::recv_one(&mut framed, core.node.config.io_timeout).await {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(id = %core.node.config.id, %peer, error = %e, "inbound read failed");
            return;
        }
    };

    match frame.flag {
        COMM_FLAG => {
            drop(framed);
            let _permit = match core.node.admit() {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(id = %core.node.config.id, error = %e, "packet shed");
                    return;
                }
            };
            if let Err(e) = core.process_comm(&frame.body).await {
                tracing::warn!(id = %core.node.config.id, error = %e, "packet dropped");
            }
        }
        ASSIGN_FLAG => {
            drop(framed);
            match core.handle_assign(&frame.body).await {
                Ok(id) => tracing::info!(id = %core.node.config.id, client = %id, "client registered"),
                Err(e) => {
                    tracing::warn!(id = %core.node.config.id, error = %e, "registration failed")
                }
            }
        }
        PULL_FLAG => match core.handle_pull(&mut framed, &frame.body).await {
            Ok(FetchOutcome::NoInbox) => {
                tracing::info!(id = %core.node.config.id, "pull for id with no inbox")
            }
            Ok(FetchOutcome::Empty) => {
                tracing::info!(id = %core.node.config.id, "inbox empty, nothing to deliver")
            }
            Ok(FetchOutcome::Sent(count)) => {
                tracing::info!(id = %core.node.config.id, count, "inbox flushed to client")
            }
            Err(e) => tracing::warn!(id = %core.node.config.id, error = %e, "pull failed"),
        },
        flag => {
            tracing::info!(id = %core.node.config.id, flag, "envelope flag not recognised, dropped");
        }
    }
}

impl ProviderCore {
    /// `COMM` at a provider: relay like any mix, except a final-flagged
    /// layer lands in the recipient's inbox after its delay.
    async fn process_comm(&self, body: &[u8]) -> Result<()> {
        match self.node.peel(body)? {
            RoutingAction::Relay {
                next_address,
                delay_ms,
                packet,
            } => {
                self.node
                    .forward_after_delay(next_address, delay_ms, &packet)
                    .await
            }
            RoutingAction::Deliver {
                recipient_id,
                delay_ms,
                payload,
            } => {
                tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
                self.store_message(&recipient_id, &payload).await
            }
        }
    }

    async fn store_message(&self, recipient_id: &str, payload: &[u8]) -> Result<()> {
        let message_id = random_message_id();
        self.inboxes
            .store(recipient_id, &message_id, payload)
            .await?;
        tracing::info!(
            id = %self.node.config.id,
            recipient = %recipient_id,
            message = %message_id,
            "message stored"
        );
        Ok(())
    }

    /// Register (or re-register) a client: mint a fresh token, upsert the
    /// record, make sure the inbox exists, and push the token to the
    /// client's declared address.
    async fn handle_assign(&self, body: &[u8]) -> Result<String> {
        let descriptor: ClientDescriptor = serde_json::from_slice(body)?;
        validate_id(&descriptor.id)?;

        let mut token = vec![0u8; TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut token);

        let record = ClientRecord {
            host: descriptor.host.clone(),
            port: descriptor.port,
            public_key: descriptor.public_key,
            token: token.clone(),
        };
        let address = record.address();

        // Last write wins: a re-registration invalidates the old token.
        self.clients
            .write()
            .await
            .insert(descriptor.id.clone(), record);
        self.inboxes.ensure(&descriptor.id).await?;

        envelope::send_to(
            address.as_str(),
            Envelope::new(TOKEN_FLAG, token),
            self.node.config.io_timeout,
        )
        .await?;
        Ok(descriptor.id)
    }

    /// Authenticated inbox flush. On a bad token the reply goes back on the
    /// pull connection; deliveries always go to the registered address.
    async fn handle_pull(
        &self,
        framed: &mut Framed<TcpStream, EnvelopeCodec>,
        body: &[u8],
    ) -> Result<FetchOutcome> {
        let request: PullRequest = serde_json::from_slice(body)?;
        let record = self.clients.read().await.get(&request.client_id).cloned();

        let authed = record
            .as_ref()
            .map(|r| authenticate(&r.token, &request.token))
            .unwrap_or(false);
        let Some(record) = record.filter(|_| authed) else {
            tracing::warn!(
                id = %self.node.config.id,
                client = %request.client_id,
                "pull authentication failed"
            );
            let _ = framed
                .send(Envelope::new(AUTH_FAILED_FLAG, Vec::new()))
                .await;
            return Err(TransportError::AuthFailed.into());
        };

        let Some(messages) = self.inboxes.entries(&request.client_id).await? else {
            return Ok(FetchOutcome::NoInbox);
        };
        if messages.is_empty() {
            return Ok(FetchOutcome::Empty);
        }

        let address = record.address();
        let mut sent = 0;
        for message in messages {
            match envelope::send_to(
                address.as_str(),
                Envelope::new(COMM_FLAG, message.payload),
                self.node.config.io_timeout,
            )
            .await
            {
                Ok(()) => {
                    tracing::info!(
                        id = %self.node.config.id,
                        client = %request.client_id,
                        message = %message.id,
                        address = %address,
                        "stored message delivered"
                    );
                    // Deleted only once the send went through; a failed send
                    // leaves the message for the next pull.
                    self.inboxes.remove(&request.client_id, &message.id).await?;
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        id = %self.node.config.id,
                        client = %request.client_id,
                        error = %e,
                        "delivery failed, leaving remaining messages buffered"
                    );
                    break;
                }
            }
        }
        Ok(FetchOutcome::Sent(sent))
    }
}

/// Constant-time token comparison; a timing oracle here would let an
/// attacker recover tokens byte by byte.
fn authenticate(stored: &[u8], presented: &[u8]) -> bool {
    bool::from(stored.ct_eq(presented))
}

fn random_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
