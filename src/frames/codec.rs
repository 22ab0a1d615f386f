//! Binary encoding and incremental decoding of stream frames, plus the
//! outbound segmentation path.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! u8   frame type       (1 = DATA, 2 = FEEDBACK, 3 = RST, 4 = CLOSE)
//! u8   flags            (bit 0: has_continuation, DATA only)
//! u64  stream id        (destination)
//! u64  source stream id
//! u32  payload length
//! ...  payload
//! ```
//!
//! FEEDBACK's payload is a single u64: the cumulative consumed-byte count.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Frame, FrameHeader, FrameType};
use crate::error::{Result, StreamError};
use crate::types::StreamId;

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 1 + 1 + 8 + 8 + 4;

const FLAG_HAS_CONTINUATION: u8 = 0x01;

/// Append one frame to `out`.
pub fn encode_frame(frame: &Frame, out: &mut BytesMut) {
    let (type_byte, header, payload): (u8, &FrameHeader, &[u8]) = match frame {
        Frame::Data { header, payload } => (FrameType::Data as u8, header, payload.as_ref()),
        Frame::Feedback { header, .. } => (FrameType::Feedback as u8, header, &[]),
        Frame::Rst { header } => (FrameType::Rst as u8, header, &[]),
        Frame::Close { header } => (FrameType::Close as u8, header, &[]),
        Frame::Unknown {
            frame_type, header, ..
        } => (*frame_type, header, &[]),
    };
    let feedback = match frame {
        Frame::Feedback { consumed_size, .. } => Some(*consumed_size),
        _ => None,
    };
    let payload_len = if feedback.is_some() { 8 } else { payload.len() };

    out.reserve(FRAME_HEADER_LEN + payload_len);
    out.put_u8(type_byte);
    let mut flags = 0u8;
    if header.has_continuation {
        flags |= FLAG_HAS_CONTINUATION;
    }
    out.put_u8(flags);
    out.put_u64(header.stream_id);
    out.put_u64(header.source_stream_id);
    out.put_u32(payload_len as u32);
    match feedback {
        Some(consumed) => out.put_u64(consumed),
        None => out.put_slice(payload),
    }
}

/// Encode one frame into a standalone buffer.
pub fn encode_single(frame: &Frame) -> Bytes {
    let mut out = BytesMut::new();
    encode_frame(frame, &mut out);
    out.freeze()
}

/// Decode the next frame from `buf`, consuming its bytes.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; the
/// caller keeps accumulating and retries. Unknown type bytes decode into
/// [`Frame::Unknown`] with the payload skipped so the connection can keep
/// parsing subsequent frames.
pub fn decode_frame(buf: &mut Bytes) -> Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut peek = &buf[..];
    let type_byte = peek.get_u8();
    let flags = peek.get_u8();
    let stream_id = peek.get_u64();
    let source_stream_id = peek.get_u64();
    let payload_len = peek.get_u32() as usize;
    if buf.len() < FRAME_HEADER_LEN + payload_len {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    let mut payload = buf.split_to(payload_len);

    let header = FrameHeader {
        stream_id,
        source_stream_id,
        has_continuation: flags & FLAG_HAS_CONTINUATION != 0,
    };
    let frame = match FrameType::from(type_byte) {
        FrameType::Data => Frame::Data { header, payload },
        FrameType::Feedback => {
            if payload.len() != 8 {
                return Err(StreamError::Truncated);
            }
            Frame::Feedback {
                header,
                consumed_size: payload.get_u64(),
            }
        }
        FrameType::Rst => Frame::Rst { header },
        FrameType::Close => Frame::Close { header },
        FrameType::Unknown => Frame::Unknown {
            frame_type: type_byte,
            header,
        },
    };
    Ok(Some(frame))
}

/// Cut a batch of outbound messages into DATA frames.
///
/// Payloads above `max_segment` are split into a run of consecutive frames,
/// all but the last flagged with a continuation, each pushed as its own
/// socket write. Smaller payloads are coalesced into a shared socket write
/// while the running payload total stays within one segment; the pending
/// batch is flushed before an oversized payload starts.
///
/// Returns the total payload bytes framed.
pub fn cut_messages(
    dest: StreamId,
    source: StreamId,
    messages: Vec<Bytes>,
    max_segment: usize,
    out: &mut Vec<Bytes>,
) -> usize {
    debug_assert!(max_segment > 0);
    let mut batch = BytesMut::new();
    let mut batched_payload = 0usize;
    let mut total = 0usize;

    for mut data in messages {
        let len = data.len();
        total += len;
        if len > max_segment {
            if batched_payload > 0 {
                out.push(batch.split().freeze());
                batched_payload = 0;
            }
            let mut has_continuation = true;
            while has_continuation {
                let segment = data.split_to(max_segment.min(data.len()));
                has_continuation = !data.is_empty();
                let mut one = BytesMut::new();
                encode_frame(
                    &Frame::Data {
                        header: FrameHeader {
                            stream_id: dest,
                            source_stream_id: source,
                            has_continuation,
                        },
                        payload: segment,
                    },
                    &mut one,
                );
                out.push(one.freeze());
            }
        } else {
            if batched_payload + len > max_segment {
                out.push(batch.split().freeze());
                batched_payload = 0;
            }
            batched_payload += len;
            encode_frame(
                &Frame::Data {
                    header: FrameHeader::new(dest, source),
                    payload: data,
                },
                &mut batch,
            );
        }
    }
    if !batch.is_empty() {
        out.push(batch.freeze());
    }
    total
}
