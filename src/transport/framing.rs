use std::io::ErrorKind;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Reads a single length-prefixed frame. Returns `None` if the stream ended cleanly at a
///  frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_len: usize) -> anyhow::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len: usize = u32::from_be_bytes(len_buf).safe_cast();
    if frame_len > max_frame_len {
        bail!("received a frame of {} bytes which exceeds the configured maximum ({}) - closing the connection because it is apparently compromised", frame_len, max_frame_len);
    }

    let mut buf = BytesMut::zeroed(frame_len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

/// Returns the number of bytes written, including the length prefix
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8], max_frame_len: usize) -> anyhow::Result<usize> {
    if frame.len() > max_frame_len {
        bail!("frame of {} bytes exceeds the configured maximum ({})", frame.len(), max_frame_len);
    }

    let frame_len: u32 = frame.len().prechecked_cast();
    writer.write_all(frame_len.to_be_bytes().as_ref()).await?;
    writer.write_all(frame).await?;
    Ok(frame.len() + size_of::<u32>())
}
