//! In-process [`ClientConnection`] backed by a tokio mpsc channel.
//!
//! Used by hosts that already own a per-client writer task (they forward the
//! receiver into their socket) and by tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::application::ports::ClientConnection;
use crate::domain::messages::ServerMsg;

pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<ServerMsg>,
    closed: AtomicBool,
}

impl ChannelConnection {
    /// Create a connection and the receiving end its messages arrive on.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<ServerMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

#[async_trait]
impl ClientConnection for ChannelConnection {
    async fn send(&self, msg: &ServerMsg) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("connection closed");
        }
        self.tx
            .send(msg.clone())
            .map_err(|_| anyhow::anyhow!("receiver dropped"))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
