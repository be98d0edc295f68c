//! Length-prefixed JSON framing: u32 big-endian length, then the
//! document. Bounded so a corrupt peer cannot trigger an unbounded
//! allocation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::RpcError;

/// Upper bound on a single frame.
pub const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| RpcError::Oversize(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::Oversize(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between
/// frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::Oversize(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Response, RpcStatus};

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        let value = Response::error("boom");
        write_frame(&mut buf, &value).await.unwrap();

        let mut reader = buf.as_slice();
        let back: Response = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(back.status, RpcStatus::Error("boom".to_string()));
    }

    #[tokio::test]
    async fn test_eof_between_frames() {
        let mut reader: &[u8] = &[];
        let got: Option<Response> = read_frame(&mut reader).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut reader = buf.as_slice();
        let got: Result<Option<Response>, _> = read_frame(&mut reader).await;
        assert!(matches!(got, Err(RpcError::Oversize(_))));
    }
}
