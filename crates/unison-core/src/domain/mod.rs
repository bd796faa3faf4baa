pub mod identity;
pub mod messages;
pub mod playback;
