//! Bounds-checked little-endian field access for on-disk structures.
//!
//! Every read names the structure it decodes so a truncated or malformed
//! sector surfaces as an `InvalidLayout` error instead of a panic.

use crate::error::{Error, Result};

pub struct LeFields<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> LeFields<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or_else(|| {
                Error::invalid_layout(format!(
                    "{} truncated: need {} bytes at offset {}, have {}",
                    self.what,
                    len,
                    offset,
                    self.buf.len()
                ))
            })
    }

    pub fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn u32(&self, offset: usize) -> Result<u32> {
        let raw = self.array::<4>(offset)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn u64(&self, offset: usize) -> Result<u64> {
        let raw = self.array::<8>(offset)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(offset, N)?);
        Ok(out)
    }

    /// Sub-view of `len` bytes starting at `offset`, labelled `what`.
    pub fn slice(&self, offset: usize, len: usize, what: &'static str) -> Result<LeFields<'a>> {
        Ok(LeFields::new(self.bytes(offset, len)?, what))
    }
}
