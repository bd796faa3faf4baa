//! Port traits (interfaces) that the engine components depend on.
//!
//! Adapters implement these traits; components never reference Quinn, channels,
//! or the system clock directly.

use async_trait::async_trait;

use crate::domain::messages::{ClientMsg, CodecError, ServerMsg};

// ---------------------------------------------------------------------------
// ClientConnection (per-client outbound half of the message channel)
// ---------------------------------------------------------------------------

/// Outbound handle for one connected client.
///
/// May become closed at any time; callers check [`is_open`](Self::is_open)
/// before sending and treat send errors as per-recipient failures.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Deliver one message over the reliable, ordered channel.
    async fn send(&self, msg: &ServerMsg) -> anyhow::Result<()>;

    fn is_open(&self) -> bool;

    /// Actively close the connection.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// MessageCodec (serialization at the transport boundary)
// ---------------------------------------------------------------------------

pub trait MessageCodec: Send + Sync {
    fn encode(&self, msg: &ServerMsg) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<ClientMsg, CodecError>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

// ---------------------------------------------------------------------------
// Local playback (display side)
// ---------------------------------------------------------------------------

/// The media element a display client drives.
#[async_trait]
pub trait LocalPlayer: Send + Sync {
    /// Start buffering `url`. Returns the buffered fraction and, if known,
    /// the media duration in seconds.
    async fn preload(&self, url: &str) -> anyhow::Result<(f64, Option<f64>)>;

    async fn play(&self, url: &str, position_seconds: f64) -> anyhow::Result<()>;

    async fn pause(&self) -> anyhow::Result<()>;

    /// Current playback position in seconds.
    fn position(&self) -> f64;
}
