//! Кадры с префиксом длины для потоковых транспортов

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Максимальный размер кадра (защита от мусора в префиксе)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Прочитать один кадр. `Ok(None)` - собеседник закрыл соединение между кадрами
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Слишком большой кадр: {} байт", len),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Записать кадр с префиксом длины
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "Слишком большой кадр"));
    }
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    writer.write_all(&buf).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"third frame").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"third frame".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }
}
