//! Length prefixed framing. Every frame is `len: u32 | request_id: u64 |
//! payload`, little endian, where `len` counts payload bytes only. Frames
//! with request id 0 carry connection control traffic (the handshake).

use crate::buffer::Buffer;
use crate::parse::MessageBuilder;
use crate::shared::{NetError, NetResult, RequestId, Violation};
use byteorder::{ByteOrder, LittleEndian};

pub const HEADER_SIZE: usize = 12;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub request_id: RequestId,
}

impl FrameHeader {
    /// Parses a header from the start of `data`. Returns `None` when fewer
    /// than `HEADER_SIZE` bytes are available.
    #[inline]
    pub fn parse(data: &[u8]) -> Option<FrameHeader> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        Some(FrameHeader {
            payload_len: LittleEndian::read_u32(&data[..4]),
            request_id: LittleEndian::read_u64(&data[4..HEADER_SIZE]),
        })
    }

    #[inline]
    pub fn write(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[..4], self.payload_len);
        LittleEndian::write_u64(&mut out[4..HEADER_SIZE], self.request_id);
    }
}

/// Extracts one complete frame from the buffer. `Wait` until a full frame
/// has accumulated; a declared payload above `max_payload` is fatal.
pub fn extract(buffer: &mut Buffer, max_payload: usize) -> NetResult<(RequestId, Vec<u8>)> {
    let header = match FrameHeader::parse(buffer.data()) {
        Some(header) => header,
        None => return Err(NetError::Wait),
    };

    let payload_len = header.payload_len as usize;

    if payload_len > max_payload {
        return Err(NetError::Fatal(Violation::PayloadTooLarge {
            len: payload_len,
            max: max_payload,
        }));
    }

    if buffer.len() < HEADER_SIZE + payload_len {
        return Err(NetError::Wait);
    }

    let payload = buffer.data()[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();
    buffer.consume(HEADER_SIZE + payload_len);

    Ok((header.request_id, payload))
}

/// Appends a frame to the buffer. `Wait` when the buffer lacks space for the
/// whole frame; nothing is written in that case.
pub fn enqueue(buffer: &mut Buffer, request_id: RequestId, payload: &[u8]) -> NetResult<()> {
    let total = HEADER_SIZE + payload.len();

    if total > buffer.free_capacity() {
        return Err(NetError::Wait);
    }

    let header = FrameHeader {
        payload_len: payload.len() as u32,
        request_id,
    };

    let spare = buffer.spare();
    header.write(spare);
    spare[HEADER_SIZE..total].copy_from_slice(payload);
    buffer.commit(total);

    Ok(())
}

/// Builds a payload with the supplied closure and appends it as one frame,
/// validating it against the negotiated maximum.
pub fn enqueue_with<F>(
    buffer: &mut Buffer,
    request_id: RequestId,
    max_payload: usize,
    build: F,
) -> NetResult<()>
where
    F: FnOnce(&mut MessageBuilder),
{
    let mut builder = MessageBuilder::new();
    build(&mut builder);
    let payload = builder.into_payload();

    if payload.len() > max_payload {
        return Err(NetError::Fatal(Violation::PayloadTooLarge {
            len: payload.len(),
            max: max_payload,
        }));
    }

    enqueue(buffer, request_id, &payload)
}
