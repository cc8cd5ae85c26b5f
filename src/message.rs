//! Benchmark message format: a send timestamp followed by an opaque payload.
//!
//! # Message Format
//!
//! ```text
//! ┌──────────────────────┬──────────────┐
//! │   Timestamp (ms)     │   Payload    │
//! │ (8 bytes, little-e.) │  (variable)  │
//! └──────────────────────┴──────────────┘
//! ```
//!
//! - **Timestamp**: sender wall-clock time at encode, milliseconds since UNIX epoch
//! - **Payload**: filler bytes, length chosen by the traffic generator
//!
//! A timestamp of `0` is the sentinel that ends a run. Whatever follows a zero
//! header is ignored.
//!
//! # Examples
//!
//! ```
//! use mqbench::message::{decode, encode, sentinel, Frame};
//!
//! let bytes = encode(1_700_000_000_000, b"hello");
//! assert_eq!(bytes.len(), 8 + 5);
//!
//! let (timestamp, payload) = decode(&bytes).unwrap();
//! assert_eq!(timestamp, 1_700_000_000_000);
//! assert_eq!(payload, b"hello");
//!
//! assert_eq!(Frame::parse(&sentinel()).unwrap(), Frame::Sentinel);
//! ```

use crate::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the timestamp header in bytes
pub const HEADER_SIZE: usize = 8;

/// Timestamp value reserved for the end-of-stream sentinel
pub const SENTINEL_TIMESTAMP: u64 = 0;

/// Decoded view of a benchmark message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Regular message carrying its send time
    Data { timestamp_ms: u64, payload: &'a [u8] },
    /// End of the current run
    Sentinel,
}

impl<'a> Frame<'a> {
    /// Classifies raw message bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the message is shorter than the header.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let (timestamp_ms, payload) = decode(bytes)?;
        if timestamp_ms == SENTINEL_TIMESTAMP {
            Ok(Frame::Sentinel)
        } else {
            Ok(Frame::Data {
                timestamp_ms,
                payload,
            })
        }
    }
}

/// Encodes `timestamp_ms` and `payload` into a new message.
pub fn encode(timestamp_ms: u64, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HEADER_SIZE + payload.len());
    message.extend_from_slice(&timestamp_ms.to_le_bytes());
    message.extend_from_slice(payload);
    message
}

/// Splits a message into its timestamp and payload.
///
/// # Errors
///
/// Returns `Error::Protocol` if fewer than 8 bytes are given.
pub fn decode(bytes: &[u8]) -> Result<(u64, &[u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "message of {} bytes is shorter than the {}-byte header",
            bytes.len(),
            HEADER_SIZE
        )));
    }
    let (header, payload) = bytes.split_at(HEADER_SIZE);
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(header);
    Ok((u64::from_le_bytes(raw), payload))
}

/// The end-of-stream message: a zero timestamp and no payload.
pub fn sentinel() -> Vec<u8> {
    encode(SENTINEL_TIMESTAMP, &[])
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
///
/// A clock set before the epoch reads as `0`.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_little_endian() {
        let bytes = encode(0x0102_0304_0506_0708, &[]);
        assert_eq!(bytes, vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_sentinel_layout() {
        assert_eq!(sentinel(), vec![0u8; HEADER_SIZE]);
    }

    #[test]
    fn test_zero_header_with_leftover_payload_is_sentinel() {
        let bytes = encode(0, b"leftover framing");
        assert_eq!(Frame::parse(&bytes).unwrap(), Frame::Sentinel);
    }

    #[test]
    fn test_data_frame() {
        let bytes = encode(42, &[1, 2, 3]);
        match Frame::parse(&bytes).unwrap() {
            Frame::Data {
                timestamp_ms,
                payload,
            } => {
                assert_eq!(timestamp_ms, 42);
                assert_eq!(payload, &[1, 2, 3]);
            }
            Frame::Sentinel => panic!("Expected data frame"),
        }
    }

    #[test]
    fn test_short_message() {
        assert!(decode(&[1, 2, 3]).is_err());
        assert!(Frame::parse(&[]).is_err());
    }

    #[test]
    fn test_now_ms_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_ms() > 1_577_836_800_000);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: timestamps below 2^53 and arbitrary payloads survive encoding
            #[test]
            fn prop_encode_decode(
                timestamp in 0u64..(1u64 << 53),
                payload in proptest::collection::vec(any::<u8>(), 0..512),
            ) {
                let bytes = encode(timestamp, &payload);
                let (t, p) = decode(&bytes).unwrap();
                prop_assert_eq!(t, timestamp);
                prop_assert_eq!(p, payload.as_slice());
            }

            /// Property: only a zero header classifies as the sentinel
            #[test]
            fn prop_nonzero_timestamp_is_data(timestamp in 1u64..u64::MAX) {
                let bytes = encode(timestamp, &[]);
                let is_data = matches!(Frame::parse(&bytes).unwrap(), Frame::Data { .. });
                prop_assert!(is_data);
            }
        }
    }
}
