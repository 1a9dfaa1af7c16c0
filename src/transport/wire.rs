use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::{AppError, AppResult, TransportError};

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads one newline-delimited JSON frame.
///
/// # Errors
///
/// Returns an error on EOF, on an oversized or non-UTF-8 frame, or when the
/// payload does not deserialize into `T`.
pub async fn read_frame<T>(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> AppResult<T>
where
    T: DeserializeOwned,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let bytes = reader.read_until(b'\n', &mut buffer).await.map_err(|err| {
        AppError::transport(TransportError::Io {
            context: "read frame",
            source: err,
        })
    })?;
    if bytes == 0 {
        return Err(AppError::transport(TransportError::ConnectionClosed));
    }
    if buffer.len() > MAX_FRAME_BYTES {
        return Err(AppError::transport(TransportError::FrameTooLarge {
            max_bytes: MAX_FRAME_BYTES,
        }));
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    let line = std::str::from_utf8(&buffer)
        .map_err(|err| AppError::transport(TransportError::FrameInvalidUtf8 { source: err }))?;
    serde_json::from_str::<T>(line).map_err(|err| {
        AppError::transport(TransportError::Deserialize {
            context: "frame",
            source: err,
        })
    })
}

/// Writes one value as a newline-delimited JSON frame.
///
/// # Errors
///
/// Returns an error when serialization or the socket write fails.
pub async fn send_frame<T>(writer: &mut tokio::net::tcp::OwnedWriteHalf, value: &T) -> AppResult<()>
where
    T: Serialize,
{
    let mut payload = serde_json::to_string(value).map_err(|err| {
        AppError::transport(TransportError::Serialize {
            context: "frame",
            source: err,
        })
    })?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await.map_err(|err| {
        AppError::transport(TransportError::Io {
            context: "send frame",
            source: err,
        })
    })
}
