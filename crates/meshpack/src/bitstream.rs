//! Byte-aligned stream primitives shared by the index and vertex codecs.
//!
//! Both codecs write into caller-sized buffers and read from untrusted
//! input, so every access goes through a bounds-checked cursor that reports
//! failures as errors instead of panicking.

use crate::error::{Precondition, StreamError};

/// Maximum number of bytes a `u64` varint occupies.
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes [`write_varint`] emits for `value`.
#[must_use]
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append `value` as a little-endian base-128 varint.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let group = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(group);
            return;
        }
        out.push(group | 0x80);
    }
}

/// Read a varint starting at `*pos`, advancing `pos` past it.
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, StreamError> {
    let start = *pos;
    let mut result = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = data.get(*pos) else {
            return Err(StreamError::UnexpectedEof { position: *pos });
        };
        *pos += 1;

        let group = u64::from(byte & 0x7f);
        // The tenth group only has room for the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return Err(StreamError::MalformedVarint { position: start });
        }
        result |= group << (7 * i);

        if byte < 0x80 {
            return Ok(result);
        }
    }
    Err(StreamError::MalformedVarint { position: start })
}

/// Map a signed byte delta onto small unsigned values (0, -1, 1, -2, ...).
#[inline]
#[must_use]
pub fn zigzag8(v: u8) -> u8 {
    ((v as i8 >> 7) as u8) ^ (v << 1)
}

/// Inverse of [`zigzag8`].
#[inline]
#[must_use]
pub fn unzigzag8(v: u8) -> u8 {
    (v & 1).wrapping_neg() ^ (v >> 1)
}

/// Map a wrapping 32-bit delta onto small unsigned values.
#[inline]
#[must_use]
pub fn zigzag32(d: u32) -> u32 {
    (d << 1) ^ ((d as i32 >> 31) as u32)
}

/// Inverse of [`zigzag32`].
#[inline]
#[must_use]
pub fn unzigzag32(v: u32) -> u32 {
    (v >> 1) ^ (v & 1).wrapping_neg()
}

/// Pack a format tag (high nibble) and version (low nibble) into one byte.
#[inline]
#[must_use]
pub(crate) fn header_byte(tag: u8, version: u8) -> u8 {
    debug_assert_eq!(tag & 0x0f, 0);
    debug_assert!(version < 16);
    tag | version
}

/// Bounds-checked write cursor over a caller-provided buffer.
#[derive(Debug)]
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8], Precondition> {
        if self.remaining() < len {
            return Err(Precondition::DestinationTooSmall {
                required: self.pos + len,
                actual: self.buf.len(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&mut self.buf[start..start + len])
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<(), Precondition> {
        self.reserve(1)?[0] = byte;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Precondition> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Write `len` copies of `byte`.
    pub fn fill(&mut self, len: usize, byte: u8) -> Result<(), Precondition> {
        self.reserve(len)?.fill(byte);
        Ok(())
    }

    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Precondition> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Overwrite four bytes written earlier at `at`.
    pub fn patch_u32_le(&mut self, at: usize, value: u32) -> Result<(), Precondition> {
        let slot = self.buf[..self.pos]
            .get_mut(at..at.saturating_add(4))
            .ok_or(Precondition::DestinationTooSmall {
                required: at.saturating_add(4),
                actual: self.pos,
            })?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_varint(&mut self, mut value: u64) -> Result<(), Precondition> {
        loop {
            let group = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                return self.write_u8(group);
            }
            self.write_u8(group | 0x80)?;
        }
    }
}

/// Bounds-checked read cursor over encoded bytes.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(StreamError::UnexpectedEof { position: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], StreamError> {
        if self.remaining() < len {
            return Err(StreamError::UnexpectedEof {
                position: self.data.len(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, StreamError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_varint(&mut self) -> Result<u64, StreamError> {
        read_varint(self.data, &mut self.pos)
    }

    /// Read a varint that must fit in `usize`.
    pub fn read_len(&mut self) -> Result<usize, StreamError> {
        let position = self.pos;
        let value = self.read_varint()?;
        usize::try_from(value).map_err(|_| StreamError::MalformedVarint { position })
    }

    /// Read a header byte and check its tag and version.
    pub(crate) fn read_header(&mut self, tag: u8, newest: u8) -> Result<u8, StreamError> {
        let byte = self.read_u8()?;
        if byte & 0xf0 != tag {
            return Err(StreamError::UnknownTag {
                expected: tag,
                found: byte & 0xf0,
            });
        }
        let version = byte & 0x0f;
        if version > newest {
            return Err(StreamError::UnsupportedVersion {
                newest,
                found: version,
            });
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_single_byte() {
        let mut out = Vec::new();
        write_varint(&mut out, 127);
        assert_eq!(out, [0x7f]);

        let mut pos = 0;
        assert_eq!(read_varint(&out, &mut pos), Ok(127));
        assert_eq!(pos, 1);
    }

    #[test]
    fn varint_multi_byte() {
        let mut out = Vec::new();
        write_varint(&mut out, 300);
        assert_eq!(out, [0xac, 0x02]);
        assert_eq!(varint_len(300), 2);
    }

    #[test]
    fn varint_truncated() {
        let mut pos = 0;
        assert_eq!(
            read_varint(&[0x80, 0x80], &mut pos),
            Err(StreamError::UnexpectedEof { position: 2 })
        );
    }

    #[test]
    fn varint_overlong() {
        let data = [0xff; 11];
        let mut pos = 0;
        assert_eq!(
            read_varint(&data, &mut pos),
            Err(StreamError::MalformedVarint { position: 0 })
        );
    }

    #[test]
    fn zigzag_small_deltas() {
        assert_eq!(zigzag8(0), 0);
        assert_eq!(zigzag8(0xff), 1);
        assert_eq!(zigzag8(1), 2);
        assert_eq!(zigzag32(u32::MAX), 1);
        assert_eq!(zigzag32(1), 2);
    }

    #[test]
    fn writer_reports_overflow() {
        let mut buf = [0u8; 2];
        let mut writer = ByteWriter::new(&mut buf);
        writer.write_u8(1).unwrap();
        assert_eq!(
            writer.write_bytes(&[2, 3]),
            Err(Precondition::DestinationTooSmall {
                required: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn patched_length_reads_back() {
        let mut buf = [0u8; 8];
        let mut writer = ByteWriter::new(&mut buf);
        writer.write_u32_le(0).unwrap();
        writer.write_u8(9).unwrap();
        writer.patch_u32_le(0, 0x0102_0304).unwrap();
        assert!(writer.patch_u32_le(2, 0).is_err());

        let mut reader = ByteReader::new(&buf[..5]);
        assert_eq!(reader.read_u32_le(), Ok(0x0102_0304));
        assert_eq!(reader.read_u8(), Ok(9));
        assert!(reader.read_u32_le().is_err());
    }

    #[test]
    fn reader_header_checks() {
        let mut reader = ByteReader::new(&[0xe1]);
        assert_eq!(reader.read_header(0xe0, 1), Ok(1));

        let mut reader = ByteReader::new(&[0xe2]);
        assert_eq!(
            reader.read_header(0xe0, 1),
            Err(StreamError::UnsupportedVersion {
                newest: 1,
                found: 2
            })
        );

        let mut reader = ByteReader::new(&[0xa0]);
        assert!(matches!(
            reader.read_header(0xe0, 1),
            Err(StreamError::UnknownTag { .. })
        ));
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            prop_assert_eq!(out.len(), varint_len(value));

            let mut pos = 0;
            prop_assert_eq!(read_varint(&out, &mut pos), Ok(value));
            prop_assert_eq!(pos, out.len());
        }

        #[test]
        fn writer_matches_vec_varint(value in any::<u64>()) {
            let mut expected = Vec::new();
            write_varint(&mut expected, value);

            let mut buf = [0u8; MAX_VARINT_LEN];
            let mut writer = ByteWriter::new(&mut buf);
            writer.write_varint(value).unwrap();
            let len = writer.position();
            prop_assert_eq!(&buf[..len], &expected[..]);
        }

        #[test]
        fn zigzag_inverts(v in any::<u8>(), d in any::<u32>()) {
            prop_assert_eq!(unzigzag8(zigzag8(v)), v);
            prop_assert_eq!(unzigzag32(zigzag32(d)), d);
        }
    }
}
