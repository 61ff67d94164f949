//! Async framing on top of any `AsyncRead + AsyncWrite`, used by the
//! daemon's `GreeterSocket` to talk to an accepted greeter connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{decode, encode, Frame};
use crate::{Error, Result};

/// Read one full message from `io`, or `Ok(None)` on clean EOF before any
/// bytes of a new frame have arrived.
pub async fn read_message<M, R>(io: &mut R) -> Result<Option<M>>
where
    M: Frame,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 {
        return Err(Error::Malformed("frame length smaller than tag field"));
    }

    let mut rest = vec![0u8; len];
    io.read_exact(&mut rest).await?;
    let tag = u32::from_be_bytes(rest[0..4].try_into().unwrap());
    let msg = decode(tag, &rest[4..])?;
    Ok(Some(msg))
}

pub async fn write_message<M, W>(io: &mut W, msg: &M) -> Result<()>
where
    M: Frame,
    W: AsyncWrite + Unpin,
{
    let bytes = encode(msg);
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}
