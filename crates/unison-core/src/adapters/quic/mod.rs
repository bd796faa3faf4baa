//! QUIC transport (Quinn). One bidirectional stream per client carries
//! 4-byte big-endian length-prefixed JSON frames.

pub mod client;
pub mod frame;
pub mod server;
