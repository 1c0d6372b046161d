//! Stream and datagram compute request processing.
//!
//! Both variants work on raw byte buffers; the event loop owns the sockets.

use super::frame::{
    compute, compute_or, decode_data, Header, HeaderError, DATAGRAM_CAPACITY, FAILURE_SENTINEL,
    HEADER_LEN, MAX_DATAGRAM_COUNT, MAX_STREAM_COUNT,
};
use bytes::BytesMut;

/// Status reported to the owning control session after a stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    ComputationOk,
    HeaderRecvFailed,
    InvalidHeader,
    MemoryError,
    DataRecvFailed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::ComputationOk => "Computation OK",
            Status::HeaderRecvFailed => "Header recv failed",
            Status::InvalidHeader => "Invalid header",
            Status::MemoryError => "Memory error",
            Status::DataRecvFailed => "Data recv failed",
        }
    }

    /// Status for a frame cut short after `buffered` bytes.
    pub fn truncated(buffered: usize) -> Self {
        if buffered < HEADER_LEN {
            Status::HeaderRecvFailed
        } else {
            Status::DataRecvFailed
        }
    }
}

/// Result of processing the front of a stream buffer.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Frame not complete yet.
    NeedData,
    /// Header flag was set; drop it without a reply.
    Ignored { consumed: usize },
    /// Frame rejected; report `status` only.
    Rejected { consumed: usize, status: Status },
    /// Echo `reply` and report success.
    Computed { consumed: usize, reply: BytesMut },
}

/// Process one frame from the front of `input`.
///
/// `scratch` is reused across frames to hold the decoded data words.
pub fn process_stream(input: &[u8], scratch: &mut Vec<u32>) -> StreamOutcome {
    let header = match Header::decode(input) {
        Some(header) => header,
        None => return StreamOutcome::NeedData,
    };

    match header.validate(MAX_STREAM_COUNT) {
        Ok(()) => {}
        Err(HeaderError::NonZeroFlag) => {
            return StreamOutcome::Ignored {
                consumed: HEADER_LEN,
            }
        }
        Err(_) => {
            return StreamOutcome::Rejected {
                consumed: HEADER_LEN,
                status: Status::InvalidHeader,
            }
        }
    }

    let consumed = header.frame_len();
    if input.len() < consumed {
        return StreamOutcome::NeedData;
    }

    if !decode_data(&header, &input[HEADER_LEN..consumed], scratch) {
        return StreamOutcome::Rejected {
            consumed,
            status: Status::MemoryError,
        };
    }

    let reply = compute_or(&header, scratch, FAILURE_SENTINEL);
    StreamOutcome::Computed { consumed, reply }
}

/// Process one datagram. Returns the reply packet, or `None` to drop it.
pub fn process_datagram(packet: &[u8]) -> Option<BytesMut> {
    let packet = &packet[..packet.len().min(DATAGRAM_CAPACITY)];
    let header = Header::decode(packet)?;
    header.validate(MAX_DATAGRAM_COUNT).ok()?;
    if packet.len() < header.frame_len() {
        return None;
    }

    let mut data = Vec::new();
    if !decode_data(&header, &packet[HEADER_LEN..header.frame_len()], &mut data) {
        return None;
    }
    compute(&header, &mut data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_stream_add() {
        let request = frame(&[0, 0, 3, 0, 1, 2, 43, 10, 20, 0]);
        let mut scratch = Vec::new();
        match process_stream(&request, &mut scratch) {
            StreamOutcome::Computed { consumed, reply } => {
                assert_eq!(consumed, request.len());
                assert_eq!(&reply[..HEADER_LEN], &request[..HEADER_LEN]);
                assert_eq!(words(&reply[HEADER_LEN..]), vec![10, 20, 30]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stream_need_data() {
        let request = frame(&[0, 0, 3, 0, 1, 2, 43, 10, 20, 0]);
        let mut scratch = Vec::new();
        assert!(matches!(
            process_stream(&request[..HEADER_LEN - 1], &mut scratch),
            StreamOutcome::NeedData
        ));
        assert!(matches!(
            process_stream(&request[..request.len() - 1], &mut scratch),
            StreamOutcome::NeedData
        ));
    }

    #[test]
    fn test_stream_modulo_by_zero_uses_sentinel() {
        let request = frame(&[0, 0, 3, 0, 1, 2, 37, 10, 0, 5]);
        let mut scratch = Vec::new();
        match process_stream(&request, &mut scratch) {
            StreamOutcome::Computed { reply, .. } => {
                assert_eq!(words(&reply[HEADER_LEN..]), vec![10, 0, FAILURE_SENTINEL]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stream_unknown_opcode_uses_sentinel() {
        let request = frame(&[0, 0, 2, 0, 1, 0, 99, 1, 2]);
        let mut scratch = Vec::new();
        match process_stream(&request, &mut scratch) {
            StreamOutcome::Computed { reply, .. } => {
                assert_eq!(words(&reply[HEADER_LEN..]), vec![FAILURE_SENTINEL, 2]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stream_invalid_header_consumes_header_only() {
        let mut scratch = Vec::new();
        for header in [
            [0, 0, 3, 3, 1, 2, 43],
            [0, 0, 0, 0, 0, 0, 43],
            [0, 0, 1025, 0, 1, 2, 43],
        ] {
            match process_stream(&frame(&header), &mut scratch) {
                StreamOutcome::Rejected {
                    consumed: HEADER_LEN,
                    status: Status::InvalidHeader,
                } => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_stream_flag_is_ignored() {
        let mut scratch = Vec::new();
        assert!(matches!(
            process_stream(&frame(&[1, 0, 3, 0, 1, 2, 43, 1, 2, 3]), &mut scratch),
            StreamOutcome::Ignored {
                consumed: HEADER_LEN
            }
        ));
    }

    #[test]
    fn test_stream_max_count() {
        let mut words_in = vec![0, 0, 1024, 0, 1023, 512, 43];
        words_in.extend((0..1024).map(|i| i as u32));
        let mut scratch = Vec::new();
        match process_stream(&frame(&words_in), &mut scratch) {
            StreamOutcome::Computed { reply, .. } => {
                let out = words(&reply[HEADER_LEN..]);
                assert_eq!(out.len(), 1024);
                assert_eq!(out[512], 1023);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_status() {
        assert_eq!(Status::truncated(5), Status::HeaderRecvFailed);
        assert_eq!(Status::truncated(HEADER_LEN), Status::DataRecvFailed);
    }

    #[test]
    fn test_datagram_multiply() {
        let request = frame(&[0, 3, 2, 0, 1, 0, 42, 6, 7]);
        let reply = process_datagram(&request).unwrap();
        assert_eq!(&reply[..HEADER_LEN], &request[..HEADER_LEN]);
        assert_eq!(words(&reply[HEADER_LEN..]), vec![42, 7]);
    }

    #[test]
    fn test_datagram_drops() {
        // modulo by zero
        assert!(process_datagram(&frame(&[0, 0, 2, 0, 1, 0, 37, 6, 0])).is_none());
        // unknown opcode
        assert!(process_datagram(&frame(&[0, 0, 2, 0, 1, 0, 1, 6, 2])).is_none());
        // count above the datagram bound, regardless of content
        let mut big = vec![0, 0, 108, 0, 1, 2, 43];
        big.extend(std::iter::repeat(1).take(108));
        assert!(process_datagram(&frame(&big)).is_none());
        // short packet
        assert!(process_datagram(&frame(&[0, 0, 3, 0, 1, 2, 43, 1, 2])).is_none());
        // index out of range
        assert!(process_datagram(&frame(&[0, 0, 2, 0, 2, 0, 43, 1, 2])).is_none());
        // flag set
        assert!(process_datagram(&frame(&[1, 0, 2, 0, 1, 0, 43, 1, 2])).is_none());
        assert!(process_datagram(&[0; 10]).is_none());
    }

    #[test]
    fn test_datagram_ignores_trailing_bytes() {
        let request = frame(&[0, 0, 2, 0, 1, 1, 37, 17, 5, 0xdead]);
        let reply = process_datagram(&request).unwrap();
        assert_eq!(reply.len(), HEADER_LEN + 8);
        assert_eq!(words(&reply[HEADER_LEN..]), vec![17, 2]);
    }
}
