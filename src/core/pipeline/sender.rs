//! Sender side of the chunk pipeline: stream one file over an open byte
//! channel.
//!
//! The framing is `file-meta` (text), then the file in [`CHUNK_SIZE`]
//! binary slices in offset order, then `file-end` (text). The channel's
//! ordering guarantee is the only sequencing mechanism, so slices are
//! queued strictly in order and never concurrently.

use crate::core::config::{
    CHUNK_SIZE, SEND_BUFFER_DRAIN_TIMEOUT, SEND_BUFFER_HIGH_WATER, SEND_BUFFER_POLL_INTERVAL,
};
use crate::core::engine::ChannelEvent;
use crate::core::pipeline::frame::ControlFrame;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Verify the channel is `Open`; return an error otherwise.
fn assert_open(dc: &Arc<RTCDataChannel>) -> Result<()> {
    let state = dc.ready_state();
    if state == RTCDataChannelState::Open {
        Ok(())
    } else {
        Err(anyhow!("data channel not open: {state:?}"))
    }
}

/// Wait until the SCTP send buffer has room for the next slice.
///
/// The queue-side `send` never blocks on the transport, so without this
/// gate a fast disk piles the whole file into `buffered_amount` on a slow
/// link. Polls until `buffered_amount + next` fits under the high water
/// mark, bounded by [`SEND_BUFFER_DRAIN_TIMEOUT`].
async fn wait_for_buffer_space(dc: &Arc<RTCDataChannel>, next_msg_size: usize) -> Result<()> {
    assert_open(dc)?;
    if dc.buffered_amount().await as usize + next_msg_size <= SEND_BUFFER_HIGH_WATER {
        return Ok(());
    }

    let buffered = dc.buffered_amount().await;
    debug!(
        channel = %dc.label(),
        buffered,
        next_msg = next_msg_size,
        high_watermark = SEND_BUFFER_HIGH_WATER,
        "Applying backpressure, waiting for buffer to drain"
    );

    let deadline = tokio::time::Instant::now() + SEND_BUFFER_DRAIN_TIMEOUT;
    loop {
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(anyhow!(
                "data channel '{}' closed during backpressure wait",
                dc.label()
            ));
        }
        if dc.buffered_amount().await as usize + next_msg_size <= SEND_BUFFER_HIGH_WATER {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "send buffer failed to drain within {:?}",
                SEND_BUFFER_DRAIN_TIMEOUT
            ));
        }
        tokio::time::sleep(SEND_BUFFER_POLL_INTERVAL).await;
    }
}

/// Stream `path` over `dc`: meta frame, ordered slices, end frame.
///
/// Progress is reported to the engine through `events` after each slice is
/// queued. Returns once `file-end` has been handed to the transport;
/// [`ChannelEvent::SendComplete`] is the caller-visible completion signal.
pub async fn send_file(
    dc: Arc<RTCDataChannel>,
    transfer_id: Uuid,
    path: &Path,
    file_name: &str,
    file_size: u64,
    file_type: &str,
    sender_id: &str,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> Result<()> {
    assert_open(&dc)?;

    let meta = ControlFrame::FileMeta {
        file_name: file_name.to_string(),
        file_size,
        file_type: file_type.to_string(),
        sender_id: sender_id.to_string(),
    };
    dc.send_text(meta.encode()?)
        .await
        .context("sending file-meta frame")?;

    info!(
        event = "file_send_started",
        transfer_id = %transfer_id,
        file = %file_name,
        size = file_size,
        "Streaming file"
    );

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;

    loop {
        let n = file.read(&mut buf).await.context("reading file slice")?;
        if n == 0 {
            break;
        }
        wait_for_buffer_space(&dc, n).await?;
        dc.send(&Bytes::copy_from_slice(&buf[..n]))
            .await
            .context("queuing file slice")?;
        sent += n as u64;
        let _ = events.send(ChannelEvent::SendProgress {
            transfer_id,
            bytes_sent: sent,
            file_size,
        });
    }

    if sent != file_size {
        // The file changed on disk between the request and the stream. The
        // receiver will flag the mismatch on its side too.
        warn!(
            event = "file_size_changed",
            transfer_id = %transfer_id,
            declared = file_size,
            sent,
            "File size differs from the declared size"
        );
    }

    dc.send_text(ControlFrame::FileEnd {}.encode()?)
        .await
        .context("sending file-end frame")?;
    let _ = events.send(ChannelEvent::SendComplete { transfer_id });

    info!(
        event = "file_send_finished",
        transfer_id = %transfer_id,
        bytes = sent,
        "All slices and file-end queued"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The driver runs each send on its own task, so the whole send loop
    // (backpressure logging included) must stay `Send`.
    fn _send_loop_is_spawnable(
        dc: Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let _ = tokio::spawn(async move {
            let _ = send_file(
                dc,
                Uuid::nil(),
                Path::new("a.bin"),
                "a.bin",
                0,
                "application/octet-stream",
                "1",
                events,
            )
            .await;
        });
    }
}
