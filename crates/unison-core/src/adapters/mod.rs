pub mod channel;
pub mod clock;
pub mod codec;
pub mod quic;
