//! Quinn-based display client.
//!
//! Opens the single bidirectional stream, sends `client_identify`, then hands
//! every server frame to a [`LocalScheduler`] and writes back its replies.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::codec::JsonMessageCodec;
use crate::application::local_schedule::LocalScheduler;
use crate::domain::messages::ClientMsg;

use super::frame::{read_frame, write_frame};

pub struct DisplayClient {
    connection: Connection,
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
    codec: JsonMessageCodec,
}

impl DisplayClient {
    /// Connect, open the stream and identify. `identify` must be a
    /// `client_identify` message.
    pub async fn connect(
        server_addr: SocketAddr,
        server_name: &str,
        identify: ClientMsg,
    ) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(
            matches!(identify, ClientMsg::ClientIdentify { .. }),
            "first message must be client_identify, got {}",
            identify.kind()
        );

        let bind: SocketAddr = if server_addr.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let mut endpoint = Endpoint::client(bind)?;

        // The host serves a self-signed certificate (dev only).
        let crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
        endpoint.set_default_client_config(ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
        )));

        info!(%server_addr, "Connecting to sync server");
        let connection = endpoint.connect(server_addr, server_name)?.await?;
        let (send, recv) = connection.open_bi().await?;

        let client = Arc::new(Self {
            connection,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            codec: JsonMessageCodec,
        });
        client.send(&identify).await?;
        info!("Identified to sync server");
        Ok(client)
    }

    pub async fn send(&self, msg: &ClientMsg) -> anyhow::Result<()> {
        let payload = self.codec.encode_client(msg)?;
        let mut send = self.send.lock().await;
        write_frame(&mut send, &payload).await
    }

    /// Serve server messages through `scheduler` until the server closes the
    /// stream or `cancel` fires.
    pub async fn run(&self, scheduler: &LocalScheduler, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut recv = self.recv.lock().await;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut recv) => frame?,
            };
            let Some(frame) = frame else { break };
            let msg = match self.codec.decode_server(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Dropping undecodable frame: {e}");
                    continue;
                }
            };
            if let Some(reply) = scheduler.handle(&msg).await {
                self.send(&reply).await?;
            }
        }
        scheduler.cancel_pending().await;
        Ok(())
    }

    pub fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"client leaving");
    }
}

// ---------------------------------------------------------------------------
// Dev-only certificate verifier (skip verification)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::adapters::clock::SystemClock;
    use crate::adapters::quic::server::SyncServer;
    use crate::application::engine::SyncEngine;
    use crate::application::ports::{Clock, LocalPlayer};
    use crate::config::SyncConfig;
    use crate::domain::identity::ClientRole;

    struct StillPlayer;

    #[async_trait]
    impl LocalPlayer for StillPlayer {
        async fn preload(&self, _url: &str) -> anyhow::Result<(f64, Option<f64>)> {
            Ok((1.0, Some(90.0)))
        }
        async fn play(&self, _url: &str, _position_seconds: f64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn pause(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn position(&self) -> f64 {
            0.0
        }
    }

    /// Wall clock shifted by a fixed amount, standing in for a display whose
    /// clock was never synchronized.
    struct SkewedClock(i64);

    impl Clock for SkewedClock {
        fn now_ms(&self) -> i64 {
            SystemClock.now_ms() + self.0
        }
    }

    /// Records the server-clock instant playback started.
    #[derive(Default)]
    struct StartRecorder {
        started_at: std::sync::Mutex<Option<i64>>,
    }

    #[async_trait]
    impl LocalPlayer for StartRecorder {
        async fn preload(&self, _url: &str) -> anyhow::Result<(f64, Option<f64>)> {
            Ok((1.0, None))
        }
        async fn play(&self, _url: &str, _position_seconds: f64) -> anyhow::Result<()> {
            *self.started_at.lock().unwrap() = Some(SystemClock.now_ms());
            Ok(())
        }
        async fn pause(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn position(&self) -> f64 {
            0.0
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skewed_display_starts_on_the_server_instant() {
        let engine = SyncEngine::new(SyncConfig::default(), Arc::new(SystemClock));
        let server =
            Arc::new(SyncServer::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&engine)).unwrap());
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(Arc::clone(&server).run(cancel.clone()));

        let client = DisplayClient::connect(
            addr,
            "localhost",
            ClientMsg::ClientIdentify {
                role: ClientRole::Player,
                display_name: None,
                capabilities: vec![],
            },
        )
        .await
        .unwrap();
        let player = Arc::new(StartRecorder::default());
        let scheduler = Arc::new(LocalScheduler::new(
            player.clone(),
            Arc::new(SkewedClock(5_000)),
        ));
        let client_task = {
            let client = Arc::clone(&client);
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(&scheduler, cancel).await })
        };

        let mut synced = false;
        for _ in 0..100 {
            let measured = engine
                .list_players()
                .await
                .first()
                .and_then(|p| p.clock_offset_ms);
            if measured.is_some() && (scheduler.clock_offset_ms() - 5_000).abs() < 100 {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(synced, "display never learned its clock offset");
        let measured = engine.list_players().await[0].clock_offset_ms.unwrap();
        assert!((measured - 5_000.0).abs() < 100.0);

        let outcome = engine.play_video("intro.mp4", 0.0).await;
        let scheduled_at = outcome.command.unwrap().scheduled_at_ms;

        let mut started_at = None;
        for _ in 0..100 {
            started_at = *player.started_at.lock().unwrap();
            if started_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let started_at = started_at.expect("playback never started");
        assert!(
            (started_at - scheduled_at).abs() < 150,
            "started at {started_at}, scheduled for {scheduled_at}"
        );

        cancel.cancel();
        client_task.await.unwrap().unwrap();
        client.close();
        server_task.await.unwrap().unwrap();
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn display_syncs_and_acknowledges_over_loopback() {
        let engine = SyncEngine::new(SyncConfig::default(), Arc::new(SystemClock));
        let server =
            Arc::new(SyncServer::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&engine)).unwrap());
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(Arc::clone(&server).run(cancel.clone()));

        let client = DisplayClient::connect(
            addr,
            "localhost",
            ClientMsg::ClientIdentify {
                role: ClientRole::Player,
                display_name: Some("Stage left".into()),
                capabilities: vec![],
            },
        )
        .await
        .unwrap();
        let scheduler = Arc::new(LocalScheduler::new(Arc::new(StillPlayer), Arc::new(SystemClock)));
        let client_task = {
            let client = Arc::clone(&client);
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(&scheduler, cancel).await })
        };

        // Registration pings the new player; wait for the answer to land.
        let mut synced = false;
        for _ in 0..100 {
            let players = engine.list_players().await;
            if players.first().is_some_and(|p| !p.latency_samples.is_empty()) {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(synced, "clock sync never completed");
        assert_eq!(engine.list_players().await[0].display_name, "Stage left");

        let outcome = engine.play_video("intro.mp4", 0.0).await;
        assert!(outcome.started);
        let readiness = outcome.readiness.unwrap();
        assert_eq!(readiness.ready_count, 1);
        assert_eq!(readiness.video_duration, Some(90.0));

        cancel.cancel();
        client_task.await.unwrap().unwrap();
        client.close();
        server_task.await.unwrap().unwrap();
        engine.shutdown().await;
    }
}
