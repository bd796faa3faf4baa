//! Length-prefixed framing over a Quinn stream.

use quinn::{ReadExactError, RecvStream, SendStream};

/// Frames larger than this are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 1 << 20;

pub async fn write_frame(send: &mut SendStream, payload: &[u8]) -> anyhow::Result<()> {
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_LEN,
        "frame of {} bytes exceeds limit",
        payload.len()
    );
    let len = (payload.len() as u32).to_be_bytes();
    send.write_all(&len).await?;
    send.write_all(payload).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` when the peer finished the stream cleanly
/// between frames.
pub async fn read_frame(recv: &mut RecvStream) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");

    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
