use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::command::{decode_frame, decode_header, Frame, HEADER_LEN};

/// Reads the next complete frame from a transport stream, waiting until all bytes announced in
///  the frame's header have arrived.
///
/// Returns `Ok(None)` if the stream ended cleanly at a frame boundary. EOF in the middle of a
///  frame, an I/O error or a malformed frame are errors, and the transport connection must not
///  be used for further reads after them.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, max_frame_len: usize) -> anyhow::Result<Option<Frame>> {
    let mut header_buf = [0u8; HEADER_LEN];

    let mut num_read = 0;
    while num_read < HEADER_LEN {
        let n = reader.read(&mut header_buf[num_read..]).await?;
        if n == 0 {
            if num_read == 0 {
                return Ok(None);
            }
            bail!("EOF after {} bytes of a frame header", num_read);
        }
        num_read += n;
    }

    let header = decode_header(&header_buf, max_frame_len)?;
    trace!("received frame header {:?}", header);

    let mut frame_buf = vec![0u8; header.frame_len];
    frame_buf[..HEADER_LEN].copy_from_slice(&header_buf);
    reader.read_exact(&mut frame_buf[HEADER_LEN..]).await?;

    decode_frame(&frame_buf, max_frame_len).map(Some)
}
