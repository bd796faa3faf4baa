//! Domain identifiers and client classification.
//!
//! These are **pure data** — no I/O, no framework dependencies.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque client identifier, stable for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one issuance of a preload/play/pause command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

/// Correlates a `clock_sync_ping` with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PingId(pub u64);

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// What a connected endpoint is used for.
///
/// Only [`ClientRole::Player`] clients take part in clock sync and receive
/// playback commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientRole {
    Player,
    Control,
    SingerDisplay,
}

impl ClientRole {
    pub fn is_player(self) -> bool {
        matches!(self, Self::Player)
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Player => "player",
            Self::Control => "control",
            Self::SingerDisplay => "singer-display",
        };
        f.write_str(name)
    }
}
