//! Quinn-based QUIC host for the sync engine.
//!
//! Accepts display and controller connections, requires `client_identify` as
//! the first frame, registers the client with the [`SyncEngine`], then feeds
//! every decoded frame to [`SyncEngine::handle_message`] until the stream ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig, VarInt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::codec::JsonMessageCodec;
use crate::application::engine::SyncEngine;
use crate::application::ports::{ClientConnection, MessageCodec};
use crate::domain::identity::{ClientId, ClientRole};
use crate::domain::messages::{ClientMsg, ServerMsg};

use super::frame::{read_frame, write_frame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Per-client outbound half
// ---------------------------------------------------------------------------

/// [`ClientConnection`] over the client's bidirectional stream.
pub struct QuicClientConnection {
    connection: Connection,
    send: Mutex<SendStream>,
    codec: JsonMessageCodec,
}

#[async_trait]
impl ClientConnection for QuicClientConnection {
    async fn send(&self, msg: &ServerMsg) -> anyhow::Result<()> {
        let payload = self.codec.encode(msg)?;
        let mut send = self.send.lock().await;
        write_frame(&mut send, &payload).await
    }

    fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"server shutdown");
    }
}

struct Identity {
    role: ClientRole,
    display_name: Option<String>,
    capabilities: Vec<String>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct SyncServer {
    endpoint: Endpoint,
    engine: Arc<SyncEngine>,
    codec: JsonMessageCodec,
    next_client: AtomicU64,
}

impl SyncServer {
    /// Create and bind the server.
    pub fn new(bind_addr: SocketAddr, engine: Arc<SyncEngine>) -> anyhow::Result<Self> {
        let server_config = Self::generate_self_signed_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr)?;
        info!(addr = %endpoint.local_addr()?, "Sync server listening");

        Ok(Self {
            endpoint,
            engine,
            codec: JsonMessageCodec,
            next_client: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Run the accept loop until `cancel` fires, then close the endpoint.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        if let Err(e) = server.handle_connection(conn).await {
                            warn!("Connection handler error: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            });
        }
        self.endpoint.close(VarInt::from_u32(0), b"server stopping");
        info!("Sync server stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Connection handling
    // -----------------------------------------------------------------------

    async fn handle_connection(&self, connection: Connection) -> anyhow::Result<()> {
        let client_id = ClientId::new(format!(
            "client-{}",
            self.next_client.fetch_add(1, Ordering::Relaxed)
        ));
        info!(%client_id, remote = %connection.remote_address(), "New connection");

        let (send, mut recv) = connection.accept_bi().await?;
        let identity =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, self.read_identify(&mut recv)).await??;

        let outbound = Arc::new(QuicClientConnection {
            connection: connection.clone(),
            send: Mutex::new(send),
            codec: JsonMessageCodec,
        });
        let display_name = identity
            .display_name
            .clone()
            .unwrap_or_else(|| client_id.to_string());
        let registered = self
            .engine
            .register_client(client_id.clone(), outbound, display_name, identity.role)
            .await;
        if !registered {
            info!(%client_id, "Engine is shut down; connection refused");
            return Ok(());
        }
        if !identity.capabilities.is_empty() {
            self.engine
                .handle_message(
                    &client_id,
                    ClientMsg::ClientIdentify {
                        role: identity.role,
                        display_name: identity.display_name,
                        capabilities: identity.capabilities,
                    },
                )
                .await;
        }

        let result = self.message_loop(&client_id, &mut recv).await;

        self.engine.unregister_client(&client_id).await;
        info!(%client_id, "Connection closed");
        result
    }

    async fn read_identify(&self, recv: &mut RecvStream) -> anyhow::Result<Identity> {
        let frame = read_frame(recv)
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream ended before client_identify"))?;
        match self.codec.decode(&frame)? {
            ClientMsg::ClientIdentify {
                role,
                display_name,
                capabilities,
            } => Ok(Identity {
                role,
                display_name,
                capabilities,
            }),
            other => anyhow::bail!("expected client_identify, got {}", other.kind()),
        }
    }

    async fn message_loop(&self, client_id: &ClientId, recv: &mut RecvStream) -> anyhow::Result<()> {
        while let Some(frame) = read_frame(recv).await? {
            match self.codec.decode(&frame) {
                Ok(msg) => self.engine.handle_message(client_id, msg).await,
                Err(e) => debug!(%client_id, "Dropping undecodable frame: {e}"),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Self-signed TLS config (dev only)
    // -----------------------------------------------------------------------

    fn generate_self_signed_config() -> anyhow::Result<ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;
        let cert_der = cert.cert.der().to_vec();
        let key_der =
            rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let server_crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::pki_types::CertificateDer::from(cert_der)],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key_der),
        )?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(quinn::IdleTimeout::try_from(
            Duration::from_secs(30),
        )?));
        // Displays may sit idle between sync rounds.
        transport_config.keep_alive_interval(Some(Duration::from_secs(10)));

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_config.transport_config(Arc::new(transport_config));
        Ok(server_config)
    }
}
