//! Length-prefixed MessagePack framing.
//!
//! Every message on a request-reply or streaming connection is one frame: a
//! big-endian `u32` length followed by that many bytes of MessagePack. The
//! payloads are encoded with field names so the format stays
//! self-describing across versions.
//!
//! A request is a header frame (`seq`, `method`) followed by a body frame
//! with the encoded arguments. A response is a header frame (`seq`,
//! optional `error`) followed by a body frame, except that an error
//! response carries its error string in lieu of a body, so no body frame
//! follows.

use std::io;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_SIZE;

/// Header of a request frame pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Caller-chosen sequence number, echoed on the response.
    pub seq: u64,
    /// Name of the method to dispatch.
    pub method: String,
}

/// Header of a response frame pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Sequence number of the request being answered.
    pub seq: u64,
    /// Error string when the dispatch failed; `None` means a body frame
    /// follows.
    pub error: Option<String>,
}

/// Opening header of a streaming RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingRpcHeader {
    /// Name of the streaming handler to invoke.
    pub method: String,
}

/// Acknowledgement sent before a streaming handler takes the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingRpcAck {
    /// Empty on success; otherwise the reason the stream was refused.
    pub error: String,
}

/// Read one frame. `Ok(None)` on clean EOF at a frame boundary; EOF inside
/// a frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum of {MAX_FRAME_SIZE}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload.into()))
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame of {} bytes exceeds maximum of {MAX_FRAME_SIZE}",
                payload.len()
            ),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame and decode it. `Ok(None)` on clean EOF.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let Some(frame) = read_frame(reader).await? else {
        return Ok(None);
    };
    let value = rmp_serde::from_slice(&frame)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(value))
}

/// Encode a value and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = rmp_serde::to_vec_named(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_frame(writer, &payload).await
}

/// Whether a transport error is a normal connection termination rather
/// than a failure worth logging and counting.
pub fn is_normal_close(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof || err.to_string().contains("closed")
}
