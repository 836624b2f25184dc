//! QEMU stream socket framing: each Ethernet frame is prefixed by its
//! length as a 4-byte big-endian integer.

use hostlink_core::error::{HostlinkError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame; anything larger means the stream is out of sync.
pub const MAX_FRAME: usize = 65_550;

/// Read one frame. Returns `None` on a clean EOF between frames; EOF inside
/// the length prefix or the body is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(HostlinkError::ProtocolError(format!(
                "stream ended after {filled} of 4 length bytes"
            )));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(HostlinkError::ProtocolError(format!("invalid frame length {len}")));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    if frame.len() > MAX_FRAME {
        return Err(HostlinkError::ProtocolError(format!(
            "frame of {} bytes is too large",
            frame.len()
        )));
    }
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
