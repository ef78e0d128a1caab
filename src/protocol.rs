//! RESP-like wire framing: `*N\r\n` arrays of bulk strings in, typed replies
//! out.
//!
//! A concrete `tokio_util::codec::{Decoder, Encoder}` pair over this frame
//! format, shared by both the client-facing dispatcher and the node-to-node
//! talker.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DispatchError;

/// One RESP value. A request is always an `Array` of `Bulk` strings; a reply
/// may be any variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    pub fn ok() -> Self {
        Frame::Simple("OK".to_string())
    }

    pub fn nil() -> Self {
        Frame::Bulk(None)
    }

    pub fn bulk(bytes: impl Into<Vec<u8>>) -> Self {
        Frame::Bulk(Some(bytes.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(message.into())
    }

    pub fn array(items: Vec<Frame>) -> Self {
        Frame::Array(Some(items))
    }

    /// Interpret this frame as an inbound command: the array's bulk strings,
    /// uppercased command name first. `Protocol` error if this isn't an
    /// array of bulk strings.
    pub fn into_command(self) -> Result<Vec<Vec<u8>>, DispatchError> {
        match self {
            Frame::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Frame::Bulk(Some(bytes)) => Ok(bytes),
                    other => Err(DispatchError::Protocol(format!("expected bulk string, got {other:?}"))),
                })
                .collect(),
            other => Err(DispatchError::Protocol(format!("expected a command array, got {other:?}"))),
        }
    }
}

const MAX_INLINE_LEN: i64 = 512 * 1024 * 1024;

#[derive(Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = DispatchError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DispatchError> {
        decode_frame(src)
    }
}

fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, DispatchError> {
    let Some(line_end) = find_crlf(src) else { return Ok(None) };
    if src.is_empty() {
        return Ok(None);
    }
    let tag = src[0];
    match tag {
        b'+' => {
            let text = take_line(src, line_end)?;
            Ok(Some(Frame::Simple(text)))
        }
        b'-' => {
            let text = take_line(src, line_end)?;
            Ok(Some(Frame::Error(text)))
        }
        b':' => {
            let text = take_line(src, line_end)?;
            let value = text.parse::<i64>().map_err(|_| DispatchError::Protocol(format!("bad integer '{text}'")))?;
            Ok(Some(Frame::Integer(value)))
        }
        b'$' => decode_bulk(src, line_end),
        b'*' => decode_array(src, line_end),
        other => Err(DispatchError::Protocol(format!("unknown frame tag '{}'", other as char))),
    }
}

fn decode_bulk(src: &mut BytesMut, line_end: usize) -> Result<Option<Frame>, DispatchError> {
    let header_len = line_end + 2;
    let len_text = std::str::from_utf8(&src[1..line_end]).map_err(|_| DispatchError::Protocol("bad bulk length".into()))?;
    let len: i64 = len_text.parse().map_err(|_| DispatchError::Protocol(format!("bad bulk length '{len_text}'")))?;
    if len == -1 {
        src.advance(header_len);
        return Ok(Some(Frame::Bulk(None)));
    }
    if !(0..=MAX_INLINE_LEN).contains(&len) {
        return Err(DispatchError::Protocol(format!("bulk length {len} out of range")));
    }
    let len = len as usize;
    let total = header_len + len + 2;
    if src.len() < total {
        return Ok(None);
    }
    let bytes = src[header_len..header_len + len].to_vec();
    if &src[header_len + len..total] != b"\r\n" {
        return Err(DispatchError::Protocol("bulk string missing trailing CRLF".into()));
    }
    src.advance(total);
    Ok(Some(Frame::Bulk(Some(bytes))))
}

fn decode_array(src: &mut BytesMut, line_end: usize) -> Result<Option<Frame>, DispatchError> {
    let count_text = std::str::from_utf8(&src[1..line_end]).map_err(|_| DispatchError::Protocol("bad array length".into()))?;
    let count: i64 = count_text.parse().map_err(|_| DispatchError::Protocol(format!("bad array length '{count_text}'")))?;
    if count == -1 {
        src.advance(line_end + 2);
        return Ok(Some(Frame::Array(None)));
    }
    if count < 0 {
        return Err(DispatchError::Protocol(format!("negative array length {count}")));
    }

    let mut probe = src.clone();
    probe.advance(line_end + 2);
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match decode_frame(&mut probe)? {
            Some(frame) => items.push(frame),
            None => return Ok(None),
        }
    }
    let consumed = src.len() - probe.len();
    src.advance(consumed);
    Ok(Some(Frame::Array(Some(items))))
}

fn find_crlf(src: &BytesMut) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

fn take_line(src: &mut BytesMut, line_end: usize) -> Result<String, DispatchError> {
    let text = std::str::from_utf8(&src[1..line_end]).map_err(|_| DispatchError::Protocol("non-utf8 line".into()))?.to_string();
    src.advance(line_end + 2);
    Ok(text)
}

impl Encoder<Frame> for RespCodec {
    type Error = DispatchError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), DispatchError> {
        encode_frame(&frame, dst);
        Ok(())
    }
}

fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Simple(text) => {
            dst.put_u8(b'+');
            dst.put_slice(text.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Error(text) => {
            dst.put_u8(b'-');
            dst.put_slice(text.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Integer(value) => {
            dst.put_u8(b':');
            dst.put_slice(value.to_string().as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Bulk(None) => dst.put_slice(b"$-1\r\n"),
        Frame::Bulk(Some(bytes)) => {
            dst.put_u8(b'$');
            dst.put_slice(bytes.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(bytes);
            dst.put_slice(b"\r\n");
        }
        Frame::Array(None) => dst.put_slice(b"*-1\r\n"),
        Frame::Array(Some(items)) => {
            dst.put_u8(b'*');
            dst.put_slice(items.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            for item in items {
                encode_frame(item, dst);
            }
        }
    }
}

/// Build a command array frame from bulk-string pieces; the idiom every
/// outbound `RaftTalker` call uses to form a request.
pub fn command(parts: &[&[u8]]) -> Frame {
    Frame::array(parts.iter().map(|p| Frame::bulk(p.to_vec())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        let mut codec = RespCodec;
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn simple_string_roundtrips() {
        assert_eq!(roundtrip(Frame::ok()), Frame::Simple("OK".to_string()));
    }

    #[test]
    fn array_of_bulk_strings_roundtrips() {
        let frame = command(&[b"RAFT_APPEND_ENTRIES", b"node:1"]);
        let decoded = roundtrip(frame);
        assert_eq!(decoded.into_command().unwrap(), vec![b"RAFT_APPEND_ENTRIES".to_vec(), b"node:1".to_vec()]);
    }

    #[test]
    fn nil_bulk_and_nil_array_roundtrip() {
        assert_eq!(roundtrip(Frame::nil()), Frame::Bulk(None));
        assert_eq!(roundtrip(Frame::Array(None)), Frame::Array(None));
    }

    #[test]
    fn incomplete_frame_returns_none_without_consuming() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"$5\r\nhel");
        let mut codec = RespCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"lo\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Frame::Bulk(Some(b"hello".to_vec())));
    }

    #[test]
    fn negative_array_length_other_than_one_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"*-2\r\n");
        let mut codec = RespCodec;
        assert!(codec.decode(&mut buf).is_err());
    }
}
