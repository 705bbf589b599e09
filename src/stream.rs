//! DNS over a byte stream: 2-byte big-endian length prefix, then the message.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::QueryContext;
use crate::dns::HEADER_LEN;
use crate::error::ForwardError;

/// Send `msg` and read one length-prefixed reply, bounded by `ctx`.
///
/// If `ctx` is already done the stream is not touched and the context's
/// error is returned. I/O errors are returned as they are; retrying is up
/// to the caller.
pub async fn send_stream_dns<S>(
    ctx: &QueryContext,
    stream: &mut S,
    msg: &[u8],
) -> Result<Vec<u8>, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(err) = ctx.err() {
        return Err(err);
    }

    let len = u16::try_from(msg.len()).map_err(|_| ForwardError::Codec("message too long"))?;

    ctx.run(async {
        let mut frame = Vec::with_capacity(2 + msg.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(msg);
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut prefix = [0u8; 2];
        stream.read_exact(&mut prefix).await?;
        let reply_len = u16::from_be_bytes(prefix) as usize;
        if reply_len < HEADER_LEN {
            return Err(ForwardError::Codec("stream reply shorter than a header"));
        }

        let mut reply = vec![0u8; reply_len];
        stream.read_exact(&mut reply).await?;
        Ok(reply)
    })
    .await
}

/// Read one length-prefixed message, `None` on a clean EOF before the prefix.
pub async fn read_message<S>(stream: &mut S) -> io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut msg = vec![0u8; u16::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut msg).await?;
    Ok(Some(msg))
}

/// Frame `msg` with its length prefix and write it.
pub async fn write_message<S>(stream: &mut S, msg: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(msg.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message too long"))?;
    let mut frame = Vec::with_capacity(2 + msg.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg);
    stream.write_all(&frame).await?;
    stream.flush().await
}
