use alloy_primitives::B256;
use thiserror::Error;

/// Errors raised while decoding or authenticating a consensus payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The byte stream violates the wire layout (truncation, trailing bytes,
    /// or a field outside its domain).
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    /// The envelope signature does not verify against the origin validator.
    #[error("bad envelope signature from validator {validator_index}")]
    BadSignature { validator_index: u16 },
}

/// Sequential little-endian reader over a payload byte slice.
///
/// Every accessor fails with `MalformedPayload` instead of panicking, and
/// `finish` rejects trailing bytes so that two distinct byte strings never
/// decode to the same value.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(CodecError::MalformedPayload("length overflow"))?;
        if end > self.data.len() {
            return Err(CodecError::MalformedPayload("unexpected end of payload"));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_b256(&mut self) -> Result<B256, CodecError> {
        Ok(B256::from_slice(self.take(32)?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Consumes the reader, failing if any bytes are left unread.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.remaining() != 0 {
            return Err(CodecError::MalformedPayload("trailing bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reads_little_endian() {
        let data = [0x01, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 2);
        assert_eq!(r.read_u32().unwrap(), 3);
        r.finish().expect("exact length should finish cleanly");
    }

    #[test]
    fn test_reader_rejects_truncation() {
        let data = [0x01, 0x02];
        let mut r = ByteReader::new(&data);
        assert_eq!(
            r.read_u32(),
            Err(CodecError::MalformedPayload("unexpected end of payload"))
        );
    }

    #[test]
    fn test_reader_rejects_trailing_bytes() {
        let data = [0x01, 0x02];
        let mut r = ByteReader::new(&data);
        r.read_u8().unwrap();
        assert_eq!(
            r.finish(),
            Err(CodecError::MalformedPayload("trailing bytes"))
        );
    }
}
