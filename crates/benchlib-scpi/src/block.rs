//! IEEE-488.2 definite-length block data.
//!
//! Wire format: `#`, one digit `n` (1-9), `n` decimal digits giving the
//! payload length `L`, `L` raw bytes, then the reply terminator.
//!
//! Headers often straddle reads on slow links, so [`BlockHeaderReader`]
//! accumulates them across polls and never asks for more bytes than the
//! header can still contain.

use benchlib_core::error::{Error, Result};

/// `#`, the digit count, and at most nine length digits.
pub const MAX_HEADER_LEN: usize = 11;

/// A decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Number of length digits.
    pub digit_count: usize,
    /// Payload length in bytes.
    pub byte_length: usize,
}

impl BlockHeader {
    /// Header length on the wire.
    pub fn header_len(&self) -> usize {
        2 + self.digit_count
    }

    /// Decode a header from the start of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` is a valid but incomplete prefix.
    pub fn decode(buf: &[u8]) -> Result<Option<BlockHeader>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != b'#' {
            return Err(Error::Protocol(format!(
                "invalid block header: expected '#', got {:#04x}",
                buf[0]
            )));
        }
        let Some(&count) = buf.get(1) else {
            return Ok(None);
        };
        if !(b'1'..=b'9').contains(&count) {
            return Err(Error::Protocol(format!(
                "invalid block header digit count '{}'",
                count.escape_ascii()
            )));
        }

        let digit_count = (count - b'0') as usize;
        let Some(digits) = buf.get(2..2 + digit_count) else {
            return Ok(None);
        };

        let mut byte_length = 0usize;
        for &d in digits {
            if !d.is_ascii_digit() {
                return Err(Error::Protocol(format!(
                    "invalid block length '{}'",
                    digits.escape_ascii()
                )));
            }
            byte_length = byte_length * 10 + (d - b'0') as usize;
        }

        Ok(Some(BlockHeader {
            digit_count,
            byte_length,
        }))
    }
}

/// Outcome of feeding bytes to a [`BlockHeaderReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    Complete(BlockHeader),
    /// More header bytes are needed.
    Pending,
}

/// Incremental block header decoder.
#[derive(Debug, Clone, Default)]
pub struct BlockHeaderReader {
    buf: [u8; MAX_HEADER_LEN],
    filled: usize,
}

impl BlockHeaderReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header bytes received so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// How many more bytes the header can need, given what has arrived.
    ///
    /// Before the digit count is known this covers only `#` and the count.
    pub fn remaining(&self) -> usize {
        if self.filled < 2 {
            2 - self.filled
        } else {
            let digit_count = self.buf[1].saturating_sub(b'0') as usize;
            (2 + digit_count).saturating_sub(self.filled)
        }
    }

    /// Append header bytes. `data` must not exceed [`remaining`](Self::remaining).
    ///
    /// A malformed header resets the reader.
    pub fn feed(&mut self, data: &[u8]) -> Result<HeaderStatus> {
        if data.len() > self.remaining() {
            return Err(Error::InvalidArgument(format!(
                "fed {} header bytes, only {} expected",
                data.len(),
                self.remaining()
            )));
        }
        self.buf[self.filled..self.filled + data.len()].copy_from_slice(data);
        self.filled += data.len();

        match BlockHeader::decode(&self.buf[..self.filled]) {
            Ok(Some(header)) => Ok(HeaderStatus::Complete(header)),
            Ok(None) => Ok(HeaderStatus::Pending),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// Forget any partial header.
    pub fn reset(&mut self) {
        self.filled = 0;
    }
}

/// Frame `payload` as a definite-length block followed by `\n`.
pub fn encode_block(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().to_string();
    let mut out = Vec::with_capacity(2 + length.len() + payload.len() + 1);
    out.push(b'#');
    out.extend_from_slice(length.len().to_string().as_bytes());
    out.extend_from_slice(length.as_bytes());
    out.extend_from_slice(payload);
    out.push(b'\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_complete() {
        let header = BlockHeader::decode(b"#9000001200").unwrap().unwrap();
        assert_eq!(header.digit_count, 9);
        assert_eq!(header.byte_length, 1200);
        assert_eq!(header.header_len(), 11);
    }

    #[test]
    fn decode_incomplete_prefixes() {
        assert_eq!(BlockHeader::decode(b"").unwrap(), None);
        assert_eq!(BlockHeader::decode(b"#").unwrap(), None);
        assert_eq!(BlockHeader::decode(b"#4").unwrap(), None);
        assert_eq!(BlockHeader::decode(b"#412").unwrap(), None);
    }

    #[test]
    fn decode_rejects_bad_headers() {
        assert!(matches!(BlockHeader::decode(b"X9"), Err(Error::Protocol(_))));
        assert!(matches!(BlockHeader::decode(b"#0"), Err(Error::Protocol(_))));
        assert!(matches!(BlockHeader::decode(b"#A"), Err(Error::Protocol(_))));
        assert!(matches!(BlockHeader::decode(b"#3 12"), Err(Error::Protocol(_))));
    }

    #[test]
    fn encoded_block_decodes_to_payload() {
        let payload: Vec<u8> = (0..=255).collect();
        let wire = encode_block(&payload);
        assert_eq!(&wire[..5], b"#3256");

        let header = BlockHeader::decode(&wire).unwrap().unwrap();
        let start = header.header_len();
        assert_eq!(&wire[start..start + header.byte_length], &payload[..]);
        assert_eq!(wire.last(), Some(&b'\n'));
    }

    #[test]
    fn encode_empty_block() {
        assert_eq!(encode_block(b""), b"#10\n");
    }

    #[test]
    fn reader_across_polls() {
        let mut reader = BlockHeaderReader::new();
        assert_eq!(reader.remaining(), 2);

        assert_eq!(reader.feed(b"#").unwrap(), HeaderStatus::Pending);
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.feed(b"4").unwrap(), HeaderStatus::Pending);
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.feed(b"14").unwrap(), HeaderStatus::Pending);
        assert_eq!(reader.remaining(), 2);

        let status = reader.feed(b"00").unwrap();
        assert_eq!(
            status,
            HeaderStatus::Complete(BlockHeader {
                digit_count: 4,
                byte_length: 1400,
            })
        );
        assert_eq!(reader.remaining(), 0);

        reader.reset();
        assert_eq!(reader.filled(), 0);
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn reader_rejects_overfeed() {
        let mut reader = BlockHeaderReader::new();
        assert!(matches!(reader.feed(b"#11"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn reader_rejects_garbage_early() {
        let mut reader = BlockHeaderReader::new();
        assert!(reader.feed(b"RE").is_err());
        assert_eq!(reader.filled(), 0);
        assert_eq!(reader.remaining(), 2);
    }
}
