//! Positioned binary reading over an opened store file.
//!
//! [`OwnedBytes`] is a cheaply-cloneable byte container backed either by an
//! in-memory buffer or a shared memory mapping; every iterator and analyzer
//! over the same store holds its own clone and seeks independently.
//! [`FileReader`] is the positioned cursor used by all block decoders:
//! seek, fixed-width little-endian reads, LEB128 varints, and raw ranges.
//! Reading past the end of the buffer is an error, never a panic.

use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{Error, Result};

// ── OwnedBytes ────────────────────────────────────────────────────────────

enum Backing {
    Buffer(Vec<u8>),
    Mapped(Mmap),
}

impl AsRef<[u8]> for Backing {
    fn as_ref(&self) -> &[u8] {
        match self {
            Backing::Buffer(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

/// Owned bytes with cheap cloning (Arc-backed).
#[derive(Clone)]
pub struct OwnedBytes {
    data: Arc<Backing>,
    range: Range<usize>,
}

impl OwnedBytes {
    pub fn new(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(Backing::Buffer(data)),
            range: 0..len,
        }
    }

    /// Memory-map a file read-only. The mapping stays alive for as long as
    /// any clone of the returned bytes does.
    pub fn mmap(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let len = mmap.len();
        Ok(Self {
            data: Arc::new(Backing::Mapped(mmap)),
            range: 0..len,
        })
    }

    /// Hint the OS that the mapping will be scanned front to back.
    /// No-op for in-memory buffers.
    pub fn advise_sequential(&self) {
        #[cfg(unix)]
        if let Backing::Mapped(m) = &*self.data {
            let _ = m.advise(memmap2::Advice::Sequential);
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn slice(&self, range: Range<usize>) -> Self {
        let start = self.range.start + range.start;
        let end = self.range.start + range.end;
        assert!(end <= self.range.end);
        Self {
            data: Arc::clone(&self.data),
            range: start..end,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref().as_ref()[self.range.clone()]
    }
}

impl AsRef<[u8]> for OwnedBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for OwnedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedBytes({} bytes)", self.len())
    }
}

// ── FileReader ────────────────────────────────────────────────────────────

/// Positioned cursor over store bytes. One per iterator/analyzer; not shared.
#[derive(Clone)]
pub struct FileReader {
    data: OwnedBytes,
    pos: usize,
}

impl FileReader {
    pub fn new(data: OwnedBytes) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    pub fn seek(&mut self, offset: u64) {
        self.pos = offset as usize;
    }

    pub fn data(&self) -> &OwnedBytes {
        &self.data
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.pos.checked_add(n).ok_or_else(eof)?;
        if end > self.data.len() {
            return Err(eof());
        }
        let slice = &self.data.as_slice()[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let src = self.take(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Borrow `n` bytes at the current position and advance past them.
    pub fn read_slice(&mut self, n: usize) -> Result<&[u8]> {
        self.take(n)
    }

    /// Fill `dst` with little-endian u32 words.
    pub fn read_u32_words(&mut self, dst: &mut [u32]) -> Result<()> {
        let src = self.take(dst.len() * 4)?;
        for (i, w) in dst.iter_mut().enumerate() {
            *w = u32::from_le_bytes(src[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Ok(())
    }

    /// LEB128 varint, at most 32 bits of payload.
    #[inline]
    pub fn unpack_u32(&mut self) -> Result<u32> {
        let v = self.unpack_u64()?;
        u32::try_from(v).map_err(|_| Error::Corruption("varint exceeds 32 bits".into()))
    }

    /// LEB128 varint, at most 64 bits of payload.
    pub fn unpack_u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(Error::Corruption("varint exceeds 64 bits".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Corruption(format!("invalid utf8: {e}")))
    }
}

fn eof() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "read past end of store file",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_fixed_width() {
        let mut buf = Vec::new();
        buf.push(0x7u8);
        buf.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        buf.extend_from_slice(&0x0123_4567_89AB_CDEFu64.to_le_bytes());

        let mut r = FileReader::new(OwnedBytes::new(buf));
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn test_reader_varint() {
        let mut buf = Vec::new();
        for &v in &[0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut x = v;
            loop {
                let byte = (x & 0x7f) as u8;
                x >>= 7;
                if x == 0 {
                    buf.push(byte);
                    break;
                }
                buf.push(byte | 0x80);
            }
        }
        let mut r = FileReader::new(OwnedBytes::new(buf));
        for &v in &[0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            assert_eq!(r.unpack_u64().unwrap(), v);
        }
    }

    #[test]
    fn test_reader_seek_and_slice() {
        let data: Vec<u8> = (0..64).collect();
        let bytes = OwnedBytes::new(data);
        let sub = bytes.slice(16..32);
        assert_eq!(sub.len(), 16);
        assert_eq!(sub.as_slice()[0], 16);

        let mut r = FileReader::new(bytes);
        r.seek(60);
        assert_eq!(r.read_u32().unwrap(), u32::from_le_bytes([60, 61, 62, 63]));
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn test_truncated_varint() {
        let mut r = FileReader::new(OwnedBytes::new(vec![0x80, 0x80]));
        assert!(r.unpack_u64().is_err());
    }
}
