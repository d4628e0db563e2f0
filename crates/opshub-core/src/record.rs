//! Replay-log record codec.
//!
//! Format: 8-byte big-endian relative timestamp (milliseconds since session
//! start) + 4-byte big-endian payload length + payload bytes. The encoding
//! is a stable external format: files written by one version must replay
//! byte-accurately under any other.
//!
//! The codec ensures:
//! - Records are self-framing for sequential reads
//! - Maximum record size is enforced
//! - Partial reads return Ok(None) to support streaming decodes

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_RECORD_SIZE;
use crate::error::{Error, Result};

/// Length of the record header (8-byte timestamp + 4-byte length).
pub const RECORD_HEADER_LEN: usize = 12;

/// One decoded replay-log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEvent {
    /// Milliseconds since the start of the session.
    pub elapsed_ms: u64,
    /// Raw bytes written to the browser-side stream at that instant.
    pub payload: Bytes,
}

/// Encode one event, appending to `buf`.
pub fn encode_event(buf: &mut BytesMut, elapsed_ms: u64, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_RECORD_SIZE {
        return Err(Error::recording(format!(
            "record too large: {} bytes (max {})",
            payload.len(),
            MAX_RECORD_SIZE
        )));
    }
    buf.reserve(RECORD_HEADER_LEN + payload.len());
    buf.put_u64(elapsed_ms);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Decode one event from the front of `buf`.
///
/// Returns:
/// - Ok(Some(event)) if a complete record was decoded (buffer is advanced)
/// - Ok(None) if more data is needed (buffer unchanged)
/// - Err if the record header is invalid
pub fn decode_event(buf: &mut BytesMut) -> Result<Option<RecordEvent>> {
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }

    // Peek the length without consuming.
    let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(Error::recording(format!(
            "record length {} exceeds maximum {}",
            len, MAX_RECORD_SIZE
        )));
    }
    if buf.len() < RECORD_HEADER_LEN + len {
        return Ok(None);
    }

    let elapsed_ms = buf.get_u64();
    let _len = buf.get_u32();
    let payload = buf.split_to(len).freeze();
    Ok(Some(RecordEvent {
        elapsed_ms,
        payload,
    }))
}

/// Decode every complete record in `data`.
///
/// Trailing partial bytes (a crash mid-append) are ignored rather than
/// treated as corruption, so a truncated log still replays its prefix.
pub fn decode_all(data: &[u8]) -> Result<Vec<RecordEvent>> {
    let mut buf = BytesMut::from(data);
    let mut events = Vec::new();
    while let Some(event) = decode_event(&mut buf)? {
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_event() {
        let mut buf = BytesMut::new();
        encode_event(&mut buf, 1500, b"hello\r\n").unwrap();

        let event = decode_event(&mut buf).unwrap().unwrap();
        assert_eq!(event.elapsed_ms, 1500);
        assert_eq!(&event.payload[..], b"hello\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trip_preserves_ordering_and_bytes() {
        let writes: Vec<(u64, &[u8])> = vec![
            (0, b"$ "),
            (120, b"ls\r\n"),
            (121, b"\x1b[0mREADME.md\r\n"),
            (5000, b""),
        ];
        let mut buf = BytesMut::new();
        for (ts, data) in &writes {
            encode_event(&mut buf, *ts, data).unwrap();
        }

        let events = decode_all(&buf).unwrap();
        assert_eq!(events.len(), writes.len());
        for (event, (ts, data)) in events.iter().zip(&writes) {
            assert_eq!(event.elapsed_ms, *ts);
            assert_eq!(&event.payload[..], *data);
        }
    }

    #[test]
    fn partial_record_returns_none() {
        let mut buf = BytesMut::new();
        encode_event(&mut buf, 7, b"abcdef").unwrap();

        // Feed all but the last byte.
        let truncated = &buf[..buf.len() - 1];
        let mut partial = BytesMut::from(truncated);
        let before = partial.len();
        assert!(decode_event(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before);
    }

    #[test]
    fn truncated_tail_is_ignored_by_decode_all() {
        let mut buf = BytesMut::new();
        encode_event(&mut buf, 1, b"first").unwrap();
        encode_event(&mut buf, 2, b"second").unwrap();
        let truncated = &buf[..buf.len() - 3];

        let events = decode_all(truncated).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].payload[..], b"first");
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64(0);
        buf.put_u32(u32::MAX);
        buf.put_slice(&[0u8; 16]);
        assert!(decode_event(&mut buf).is_err());
    }
}
