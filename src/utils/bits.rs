use crate::error::{MuxError, Result};

/// A big-endian bit reader over a byte slice.
///
/// Used when decoding packed descriptor and header fields.
///
/// Example:
/// ```
/// use tsmux_engine::utils::BitReader;
///
/// let data = [0b10110011];
/// let mut reader = BitReader::new(&data);
///
/// assert_eq!(reader.read_bit().unwrap(), true);
/// assert_eq!(reader.read_bits(3).unwrap(), 0b011);
/// ```
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    /// Creates a new BitReader from a byte slice
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    /// Reads a single bit. Returns error at end of data.
    pub fn read_bit(&mut self) -> Result<bool> {
        if self.byte_offset >= self.data.len() {
            return Err(MuxError::InvalidData("reached end of data".into()));
        }

        let bit = (self.data[self.byte_offset] >> (7 - self.bit_offset)) & 1;
        self.bit_offset += 1;

        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }

        Ok(bit == 1)
    }

    /// Reads n bits (n <= 64) as a big-endian number.
    pub fn read_bits(&mut self, n: u32) -> Result<u64> {
        if n > 64 {
            return Err(MuxError::InvalidData("too many bits requested".into()));
        }
        if (n as usize) > self.available_bits() {
            return Err(MuxError::InvalidData("reached end of data".into()));
        }

        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    /// Skips n bits in the stream.
    pub fn skip_bits(&mut self, n: u32) -> Result<()> {
        self.read_bits(n).map(|_| ())
    }

    /// Returns number of bits available to read.
    pub fn available_bits(&self) -> usize {
        (self.data.len() - self.byte_offset) * 8 - self.bit_offset as usize
    }
}

/// A big-endian bit writer producing a byte vector.
///
/// Descriptor payloads such as the ATSC AC-3 audio descriptor pack several
/// sub-byte fields; this keeps the field widths readable at the call site.
///
/// ```
/// use tsmux_engine::utils::BitWriter;
///
/// let mut w = BitWriter::new();
/// w.write_bits(0b101, 3);
/// w.write_bits(0b01011, 5);
/// assert_eq!(w.into_bytes(), vec![0b1010_1011]);
/// ```
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_offset: u8,
}

impl BitWriter {
    /// Creates an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the low `n` bits of `value`, most significant first
    pub fn write_bits(&mut self, value: u64, n: u32) {
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Writes a single bit
    pub fn write_bit(&mut self, bit: bool) {
        if self.bit_offset == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.bytes.last_mut() {
                *last |= 0x80 >> self.bit_offset;
            }
        }
        self.bit_offset = (self.bit_offset + 1) % 8;
    }

    /// Appends whole bytes; the writer must be byte aligned
    pub fn write_bytes(&mut self, data: &[u8]) {
        debug_assert_eq!(self.bit_offset, 0);
        self.bytes.extend_from_slice(data);
    }

    /// Whether the next write starts on a byte boundary
    pub fn is_aligned(&self) -> bool {
        self.bit_offset == 0
    }

    /// Finishes writing, padding the last byte with zero bits
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bits_across_bytes() {
        let data = [0xAB, 0xCD];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(4).unwrap(), 0xA);
        assert_eq!(reader.read_bits(8).unwrap(), 0xBC);
        assert_eq!(reader.available_bits(), 4);
        assert!(reader.read_bits(5).is_err());
    }

    #[test]
    fn test_writer_packs_fields() {
        let mut w = BitWriter::new();
        w.write_bits(0, 3);
        w.write_bits(8, 5);
        w.write_bits(0x12, 6);
        w.write_bits(0, 2);
        assert!(w.is_aligned());
        w.write_bytes(b"x");
        assert_eq!(w.into_bytes(), vec![0x08, 0x48, b'x']);
    }

    #[test]
    fn test_writer_reader_agree() {
        let mut w = BitWriter::new();
        w.write_bits(0x1FF, 9);
        w.write_bits(0x2A, 7);
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(9).unwrap(), 0x1FF);
        assert_eq!(r.read_bits(7).unwrap(), 0x2A);
    }
}
