//! Compute frame codec, bounds validation and arithmetic.

use bytes::{Buf, BufMut, BytesMut};

/// Header words: flag, reserved, count, idx1, idx2, idx_res, opcode.
pub const HEADER_WORDS: usize = 7;

/// Header size in bytes.
pub const HEADER_LEN: usize = HEADER_WORDS * 4;

/// Largest `count` accepted on stream channels.
pub const MAX_STREAM_COUNT: u32 = 1024;

/// Largest well-formed stream frame in bytes.
pub const MAX_STREAM_FRAME_LEN: usize = HEADER_LEN + MAX_STREAM_COUNT as usize * 4;

/// Receive buffer size for datagram channels.
pub const DATAGRAM_CAPACITY: usize = 512;

/// Largest `count` accepted on datagram channels.
pub const MAX_DATAGRAM_COUNT: u32 = 107;

/// Written to the result slot when the operation is undefined.
pub const FAILURE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Arithmetic operation selected by the header opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Add,
    Multiply,
    Modulo,
}

impl Opcode {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            43 => Some(Opcode::Add),
            42 => Some(Opcode::Multiply),
            37 => Some(Opcode::Modulo),
            _ => None,
        }
    }

    /// Apply in 32-bit wraparound arithmetic. `None` for modulo by zero.
    pub fn apply(self, a: u32, b: u32) -> Option<u32> {
        match self {
            Opcode::Add => Some(a.wrapping_add(b)),
            Opcode::Multiply => Some(a.wrapping_mul(b)),
            Opcode::Modulo => a.checked_rem(b),
        }
    }
}

/// Decoded frame header, host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flag: u32,
    pub reserved: u32,
    pub count: u32,
    pub idx1: u32,
    pub idx2: u32,
    pub idx_res: u32,
    pub opcode: u32,
}

impl Header {
    /// Decode from the first `HEADER_LEN` bytes of `input`.
    pub fn decode(input: &[u8]) -> Option<Self> {
        if input.len() < HEADER_LEN {
            return None;
        }
        let mut buf = &input[..HEADER_LEN];
        Some(Self {
            flag: buf.get_u32(),
            reserved: buf.get_u32(),
            count: buf.get_u32(),
            idx1: buf.get_u32(),
            idx2: buf.get_u32(),
            idx_res: buf.get_u32(),
            opcode: buf.get_u32(),
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        for word in [
            self.flag,
            self.reserved,
            self.count,
            self.idx1,
            self.idx2,
            self.idx_res,
            self.opcode,
        ] {
            out.put_u32(word);
        }
    }

    /// Check `count` against `1..=max_count` and every index against `count`.
    pub fn validate(&self, max_count: u32) -> Result<(), HeaderError> {
        if self.flag != 0 {
            return Err(HeaderError::NonZeroFlag);
        }
        if self.count == 0 || self.count > max_count {
            return Err(HeaderError::CountOutOfRange(self.count));
        }
        if [self.idx1, self.idx2, self.idx_res]
            .iter()
            .any(|&idx| idx >= self.count)
        {
            return Err(HeaderError::IndexOutOfRange);
        }
        Ok(())
    }

    /// Size of the data section in bytes.
    pub fn data_len(&self) -> usize {
        self.count as usize * 4
    }

    /// Full frame size in bytes.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.data_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Frames with a non-zero flag are silently ignored.
    NonZeroFlag,
    CountOutOfRange(u32),
    IndexOutOfRange,
}

/// Decode `header.count` words from `input` into `data`.
///
/// Returns `false` if the reservation cannot be satisfied.
pub fn decode_data(header: &Header, mut input: &[u8], data: &mut Vec<u32>) -> bool {
    data.clear();
    if data.try_reserve_exact(header.count as usize).is_err() {
        return false;
    }
    for _ in 0..header.count {
        data.push(input.get_u32());
    }
    true
}

/// Result of the header's operation, `None` when it is undefined.
fn evaluate(header: &Header, data: &[u32]) -> Option<u32> {
    let a = data[header.idx1 as usize];
    let b = data[header.idx2 as usize];
    Opcode::from_wire(header.opcode).and_then(|op| op.apply(a, b))
}

/// Compute into `data[idx_res]` and encode the echo frame.
///
/// Returns `None` when the operation is undefined.
pub fn compute(header: &Header, data: &mut [u32]) -> Option<BytesMut> {
    let result = evaluate(header, data)?;
    Some(store_and_encode(header, data, result))
}

/// Like [`compute`], but stores `fallback` when the operation is undefined.
pub fn compute_or(header: &Header, data: &mut [u32], fallback: u32) -> BytesMut {
    let result = evaluate(header, data).unwrap_or(fallback);
    store_and_encode(header, data, result)
}

fn store_and_encode(header: &Header, data: &mut [u32], result: u32) -> BytesMut {
    data[header.idx_res as usize] = result;

    let mut reply = BytesMut::with_capacity(header.frame_len());
    header.encode(&mut reply);
    for &word in data.iter() {
        reply.put_u32(word);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn test_opcode_apply() {
        assert_eq!(Opcode::Add.apply(u32::MAX, 2), Some(1));
        assert_eq!(Opcode::Multiply.apply(0x1_0000, 0x1_0000), Some(0));
        assert_eq!(Opcode::Multiply.apply(6, 7), Some(42));
        assert_eq!(Opcode::Modulo.apply(17, 5), Some(2));
        assert_eq!(Opcode::Modulo.apply(17, 0), None);
        assert_eq!(Opcode::from_wire(43), Some(Opcode::Add));
        assert_eq!(Opcode::from_wire(45), None);
    }

    #[test]
    fn test_header_decode_network_order() {
        let bytes = frame(&[0, 9, 3, 0, 1, 2, 43]);
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.reserved, 9);
        assert_eq!(header.count, 3);
        assert_eq!(header.opcode, 43);
        assert_eq!(header.frame_len(), HEADER_LEN + 12);
        assert!(Header::decode(&bytes[..HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn test_validate() {
        let ok = Header::decode(&frame(&[0, 0, 3, 0, 1, 2, 43])).unwrap();
        assert_eq!(ok.validate(MAX_STREAM_COUNT), Ok(()));

        let flagged = Header { flag: 1, ..ok };
        assert_eq!(flagged.validate(MAX_STREAM_COUNT), Err(HeaderError::NonZeroFlag));

        let empty = Header { count: 0, ..ok };
        assert_eq!(
            empty.validate(MAX_STREAM_COUNT),
            Err(HeaderError::CountOutOfRange(0))
        );

        let big = Header { count: 108, ..ok };
        assert!(big.validate(MAX_STREAM_COUNT).is_ok());
        assert_eq!(
            big.validate(MAX_DATAGRAM_COUNT),
            Err(HeaderError::CountOutOfRange(108))
        );

        for bad in [
            Header { idx1: 3, ..ok },
            Header { idx2: 7, ..ok },
            Header { idx_res: 3, ..ok },
        ] {
            assert_eq!(
                bad.validate(MAX_STREAM_COUNT),
                Err(HeaderError::IndexOutOfRange)
            );
        }
    }

    #[test]
    fn test_datagram_bound_fits_capacity() {
        assert!(HEADER_LEN + MAX_DATAGRAM_COUNT as usize * 4 <= DATAGRAM_CAPACITY);
    }

    #[test]
    fn test_compute_preserves_header_and_other_words() {
        let request = frame(&[0, 5, 4, 0, 1, 3, 42, 6, 7, 99, 0]);
        let header = Header::decode(&request).unwrap();
        let mut data = Vec::new();
        assert!(decode_data(&header, &request[HEADER_LEN..], &mut data));

        let reply = compute(&header, &mut data).unwrap();
        assert_eq!(&reply[..HEADER_LEN], &request[..HEADER_LEN]);
        assert_eq!(&reply[HEADER_LEN..], &frame(&[6, 7, 99, 42])[..]);
    }

    #[test]
    fn test_compute_undefined() {
        let request = frame(&[0, 0, 2, 0, 1, 1, 37, 10, 0]);
        let header = Header::decode(&request).unwrap();
        let mut data = Vec::new();
        assert!(decode_data(&header, &request[HEADER_LEN..], &mut data));

        assert!(compute(&header, &mut data.clone()).is_none());

        let reply = compute_or(&header, &mut data, FAILURE_SENTINEL);
        assert_eq!(&reply[HEADER_LEN..], &frame(&[10, FAILURE_SENTINEL])[..]);

        let unknown = Header { opcode: 1, ..header };
        assert!(compute(&unknown, &mut data).is_none());
        let reply = compute_or(&unknown, &mut data, FAILURE_SENTINEL);
        assert_eq!(&reply[HEADER_LEN..], &frame(&[10, FAILURE_SENTINEL])[..]);
    }
}
