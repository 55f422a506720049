use crate::{PakratError, PakratResult};
use std::convert::TryInto;

/// Little-endian cursor over a borrowed byte slice.
///
/// All table and archive parsing goes through this. Running off the end of the
/// input fails with a `Configuration` error naming the reader's context,
/// because truncated bytes mean broken packaging output.
pub struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(
        data: &'a [u8],
        context: &'static str,
    ) -> Self {
        ByteReader {
            data,
            position: 0,
            context,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn read_bytes(
        &mut self,
        count: usize,
    ) -> PakratResult<&'a [u8]> {
        if count > self.remaining() {
            return Err(PakratError::Configuration(format!(
                "truncated {}: wanted {} bytes at offset {} with {} remaining",
                self.context,
                count,
                self.position,
                self.remaining()
            )));
        }

        let bytes = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(bytes)
    }

    pub fn read_u16(&mut self) -> PakratResult<u16> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> PakratResult<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> PakratResult<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    /// A string is a u16 byte length followed by that many bytes of UTF-8.
    pub fn read_str(&mut self) -> PakratResult<&'a str> {
        let len = self.read_u16()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| {
            PakratError::Configuration(format!(
                "invalid UTF-8 string in {} at offset {}",
                self.context, start
            ))
        })
    }

    /// Tables own their byte range exactly; leftover bytes are a packaging bug.
    pub fn expect_end(&self) -> PakratResult<()> {
        if self.remaining() != 0 {
            return Err(PakratError::Configuration(format!(
                "{} has {} trailing bytes",
                self.context,
                self.remaining()
            )));
        }

        Ok(())
    }
}
