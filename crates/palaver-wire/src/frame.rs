//! Frame encoding and incremental decoding.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::WireError;

/// Bytes of the frame header: a `u32` big-endian body length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on a frame body. Large enough for a snapshot chunk plus
/// slack, small enough to bound a connection's buffer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Appends one framed message to `buf`.
pub fn encode_frame<T: Serialize>(message: &T, buf: &mut BytesMut) -> Result<(), WireError> {
    let body = postcard::to_allocvec(message).map_err(WireError::Encode)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    buf.reserve(FRAME_HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Consumes one complete frame from `buf`, if present.
///
/// Returns `Ok(None)` when the buffer holds only a partial frame; callers
/// keep reading and retry. The frame's bytes are consumed only when a full
/// frame decodes.
pub fn decode_frame<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, WireError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buf[0..FRAME_HEADER_SIZE].try_into().expect("4 bytes")) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_SIZE);
    let body = buf.split_to(len);
    let message = postcard::from_bytes(&body).map_err(WireError::Malformed)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_one_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&("hello".to_string(), 7u64), &mut buf).unwrap();
        let decoded: Option<(String, u64)> = decode_frame(&mut buf).unwrap();
        assert_eq!(decoded, Some(("hello".to_string(), 7)));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut full = BytesMut::new();
        encode_frame(&"payload".to_string(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        let decoded: Option<String> = decode_frame(&mut partial).unwrap();
        assert!(decoded.is_none());
        // Nothing consumed while incomplete.
        assert_eq!(partial.len(), full.len() - 2);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        encode_frame(&1u32, &mut buf).unwrap();
        encode_frame(&2u32, &mut buf).unwrap();
        assert_eq!(decode_frame::<u32>(&mut buf).unwrap(), Some(1));
        assert_eq!(decode_frame::<u32>(&mut buf).unwrap(), Some(2));
        assert_eq!(decode_frame::<u32>(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            decode_frame::<u32>(&mut buf),
            Err(WireError::FrameTooLarge(_))
        ));
    }
}
