use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::DatabaseIntegrityError;

/// Extension trait to write a length-tagged field
pub trait WriteLengthTaggedExt: Write {
    fn write_with_len(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        self.write_u32::<LittleEndian>(data.len() as u32)?;
        self.write_all(data)?;
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteLengthTaggedExt for W {}

/// Bounds-checked cursor over a byte slice.
///
/// Header and block parsing walk untrusted input; every read through this
/// cursor turns a truncated buffer into a [DatabaseIntegrityError::Truncated]
/// instead of a panic.
pub(crate) struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> SliceReader<'a> {
    pub(crate) fn new(data: &'a [u8], context: &'static str) -> Self {
        Self { data, pos: 0, context }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated(&self) -> DatabaseIntegrityError {
        DatabaseIntegrityError::Truncated { context: self.context }
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DatabaseIntegrityError> {
        if self.remaining() < len {
            return Err(self.truncated());
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DatabaseIntegrityError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, DatabaseIntegrityError> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DatabaseIntegrityError> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, DatabaseIntegrityError> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    /// Read a `u32`-length-tagged byte field
    pub(crate) fn read_with_len(&mut self) -> Result<&'a [u8], DatabaseIntegrityError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }
}

#[cfg(test)]
mod io_tests {
    use super::*;
    use crate::error::DatabaseIntegrityError;

    #[test]
    fn write_then_read_length_tagged() -> Result<(), DatabaseIntegrityError> {
        let mut buf = Vec::new();
        buf.write_with_len(b"payload").unwrap();

        let mut reader = SliceReader::new(&buf, "test");
        assert_eq!(reader.read_with_len()?, b"payload");
        assert!(reader.is_empty());

        Ok(())
    }

    #[test]
    fn truncated_reads_are_errors() {
        let mut reader = SliceReader::new(&[1, 2, 3], "test");
        assert!(reader.read_u16().is_ok());
        assert!(matches!(
            reader.read_u32(),
            Err(DatabaseIntegrityError::Truncated { .. })
        ));
    }
}
