//! Async frame codec.
//!
//! Reads never return short: either the full count arrives or the call
//! fails with [`IpcError::ConnectionClosed`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IpcError;

pub async fn write_u64<W>(writer: &mut W, value: u64) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&value.to_le_bytes()).await?;
    Ok(())
}

pub async fn read_u64<R>(reader: &mut R) -> Result<u64, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 8];
    read_full(reader, &mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_u64(writer, data.len() as u64).await?;
    writer.write_all(data).await?;
    Ok(())
}

/// Read one frame, refusing lengths above `max_len` before allocating.
pub async fn read_frame<R>(reader: &mut R, max_len: u64) -> Result<Vec<u8>, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_u64(reader).await?;
    if len > max_len {
        return Err(IpcError::FrameTooLarge { len, max: max_len });
    }
    let mut data = vec![0u8; len as usize];
    read_full(reader, &mut data).await?;
    Ok(data)
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(IpcError::ConnectionClosed {
                expected: buf.len() as u64,
                received: filled as u64,
            });
        }
        filled += n;
    }
    Ok(())
}
