use crate::measurements::BenchmarkResult;
use crate::transport::{Packet, Topic};
use crate::{Error, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame body accepted from a socket.
///
/// Payloads are capped at 1 MiB on average, so anything far beyond this is
/// treated as a corrupted stream rather than allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serializes a packet into a socket frame.
///
/// The frame format is:
/// - First 4 bytes: body length as big-endian u32
/// - Next byte: topic (`0` data, `1` signal)
/// - Remaining bytes: payload, untouched
///
/// # Errors
///
/// Returns `Error::Protocol` if the body would exceed [`MAX_FRAME_LEN`].
///
/// # Examples
///
/// ```
/// use mqbench::protocol::serialize_frame;
/// use mqbench::transport::Packet;
///
/// let frame = serialize_frame(&Packet::data(vec![7u8; 3])).unwrap();
/// assert_eq!(frame, vec![0, 0, 0, 4, 0, 7, 7, 7]);
/// ```
pub fn serialize_frame(packet: &Packet) -> Result<Vec<u8>> {
    let body_len = 1 + packet.payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            body_len, MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.push(packet.topic.as_byte());
    frame.extend_from_slice(&packet.payload);
    Ok(frame)
}

/// Reads one frame from an async reader.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame starts.
///
/// # Errors
///
/// Returns an error if:
/// - Reading from the stream fails or it ends mid-frame
/// - The length is zero or exceeds [`MAX_FRAME_LEN`]
/// - The topic byte is unknown
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Packet>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("invalid frame length {}", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let topic = Topic::from_byte(body[0])
        .ok_or_else(|| Error::Protocol(format!("unknown topic byte {}", body[0])))?;
    let mut payload = Bytes::from(body);
    let _ = payload.split_to(1);
    Ok(Some(Packet { topic, payload }))
}

/// Serializes a receiver result for the back-channel (UTF-8 JSON).
pub fn encode_result(result: &BenchmarkResult) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(result)?))
}

/// Parses a back-channel result.
pub fn decode_result(bytes: &[u8]) -> Result<BenchmarkResult> {
    Ok(serde_json::from_slice(bytes)?)
}
