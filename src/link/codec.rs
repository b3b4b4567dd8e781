//! Length-prefixed framing shared by hub and client

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::messages::Envelope;
use crate::error::TransportError;

/// Default maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Read one envelope from the stream
pub async fn read_frame<R>(stream: &mut R, max_frame: usize) -> Result<Envelope, TransportError>
where
    R: AsyncRead + Unpin,
{
    // Read 4-byte length
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_frame {
        return Err(TransportError::FrameTooLarge {
            size: len,
            limit: max_frame,
        });
    }

    // Read payload
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    Ok(Envelope::from_json(&buf)?)
}

/// Write one envelope to the stream
pub async fn write_frame<W>(stream: &mut W, msg: &Envelope) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let wire = msg.to_wire()?;
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}
