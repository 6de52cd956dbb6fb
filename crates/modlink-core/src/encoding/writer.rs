use crate::EncodeError;

/// A byte writer that encodes frames into a caller-owned buffer.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn as_written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), EncodeError> {
        if self.remaining() < 1 {
            return Err(EncodeError::BufferTooSmall);
        }
        self.buf[self.pos] = value;
        self.pos += 1;
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        if self.remaining() < data.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        let end = self.pos + data.len();
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    pub fn write_be_u16(&mut self, value: u16) -> Result<(), EncodeError> {
        self.write_all(&value.to_be_bytes())
    }

    pub fn write_be_words(&mut self, words: &[u16]) -> Result<(), EncodeError> {
        if self.remaining() < words.len() * 2 {
            return Err(EncodeError::BufferTooSmall);
        }
        for word in words {
            self.write_be_u16(*word)?;
        }
        Ok(())
    }

    /// Write `data` as upper-case hexadecimal text, two characters per byte.
    pub fn write_hex_upper(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let len = data.len() * 2;
        if self.remaining() < len {
            return Err(EncodeError::BufferTooSmall);
        }
        let out = &mut self.buf[self.pos..self.pos + len];
        hex::encode_to_slice(data, out).map_err(|_| EncodeError::InvalidLength)?;
        out.make_ascii_uppercase();
        self.pos += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Writer;
    use crate::EncodeError;

    #[test]
    fn writer_writes_values() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.write_u8(0x11).unwrap();
        w.write_be_words(&[0x0306, 0x0001]).unwrap();
        assert_eq!(w.as_written(), &[0x11, 0x03, 0x06, 0x00, 0x01]);
    }

    #[test]
    fn writer_writes_upper_hex() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.write_u8(b':').unwrap();
        w.write_hex_upper(&[0x0A, 0xF3]).unwrap();
        assert_eq!(w.as_written(), b":0AF3");
        assert_eq!(
            w.write_hex_upper(&[0x01, 0x02]).unwrap_err(),
            EncodeError::BufferTooSmall
        );
    }

    #[test]
    fn writer_bounds() {
        let mut buf = [0u8; 3];
        let mut w = Writer::new(&mut buf);
        w.write_be_u16(0x1234).unwrap();
        assert_eq!(
            w.write_be_words(&[0x0001]).unwrap_err(),
            EncodeError::BufferTooSmall
        );
        w.write_u8(0).unwrap();
        assert_eq!(w.write_u8(0).unwrap_err(), EncodeError::BufferTooSmall);
    }
}
