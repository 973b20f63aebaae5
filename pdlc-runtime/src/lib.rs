// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Support types targeted by the generated Rust codecs.
//!
//! Generated views guard every access with a size check before
//! reading, so the unchecked accessors below index directly; the
//! checked variants are provided for manual use of the crate.

/// Errors returned by the checked slice accessors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("attempted to access {wanted} bytes with {available} remaining")]
    OutOfBounds { wanted: usize, available: usize },
}

/// Non-owning view over input bytes, consumed from the front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice<'a> {
    data: &'a [u8],
}

impl<'a> Slice<'a> {
    pub fn new(data: &'a [u8]) -> Slice<'a> {
        Slice { data }
    }

    /// Number of remaining bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The remaining bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Borrow `len` bytes starting at `offset`.
    /// The caller must have checked the bounds.
    pub fn subrange(&self, offset: usize, len: usize) -> Slice<'a> {
        Slice { data: &self.data[offset..offset + len] }
    }

    pub fn try_subrange(&self, offset: usize, len: usize) -> Result<Slice<'a>, RuntimeError> {
        if offset + len > self.data.len() {
            return Err(RuntimeError::OutOfBounds {
                wanted: offset + len,
                available: self.data.len(),
            });
        }
        Ok(self.subrange(offset, len))
    }

    /// Advance past the first `n` bytes.
    /// The caller must have checked the bounds.
    pub fn skip(&mut self, n: usize) {
        self.data = &self.data[n..];
    }

    /// Drop all remaining bytes.
    pub fn clear(&mut self) {
        self.data = &self.data[self.data.len()..];
    }

    /// Read a little-endian unsigned integer of `WIDTH` bytes and
    /// advance. The caller must have checked the bounds.
    pub fn read_le<const WIDTH: usize>(&mut self) -> u64 {
        let mut value = 0u64;
        for i in (0..WIDTH).rev() {
            value = (value << 8) | self.data[i] as u64;
        }
        self.skip(WIDTH);
        value
    }

    /// Read a big-endian unsigned integer of `WIDTH` bytes and
    /// advance. The caller must have checked the bounds.
    pub fn read_be<const WIDTH: usize>(&mut self) -> u64 {
        let mut value = 0u64;
        for i in 0..WIDTH {
            value = (value << 8) | self.data[i] as u64;
        }
        self.skip(WIDTH);
        value
    }

    pub fn try_read_le<const WIDTH: usize>(&mut self) -> Result<u64, RuntimeError> {
        if self.data.len() < WIDTH {
            return Err(RuntimeError::OutOfBounds { wanted: WIDTH, available: self.data.len() });
        }
        Ok(self.read_le::<WIDTH>())
    }

    pub fn try_read_be<const WIDTH: usize>(&mut self) -> Result<u64, RuntimeError> {
        if self.data.len() < WIDTH {
            return Err(RuntimeError::OutOfBounds { wanted: WIDTH, available: self.data.len() });
        }
        Ok(self.read_be::<WIDTH>())
    }
}

impl<'a> From<&'a [u8]> for Slice<'a> {
    fn from(data: &'a [u8]) -> Slice<'a> {
        Slice::new(data)
    }
}

/// Owning byte sink filled by the generated serialisers.
///
/// Values wider than the declared field width are masked on write;
/// this is the documented contract of the generated builders.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Builder {
    bytes: Vec<u8>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn with_capacity(capacity: usize) -> Builder {
        Builder { bytes: Vec::with_capacity(capacity) }
    }

    /// Number of bytes written so far.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// Append a little-endian unsigned integer of `WIDTH` bytes.
    /// Bits beyond `8 * WIDTH` are masked off.
    pub fn write_le<const WIDTH: usize>(&mut self, value: u64) {
        let mut value = value;
        for _ in 0..WIDTH {
            self.bytes.push(value as u8);
            value >>= 8;
        }
    }

    /// Append a big-endian unsigned integer of `WIDTH` bytes.
    /// Bits beyond `8 * WIDTH` are masked off.
    pub fn write_be<const WIDTH: usize>(&mut self, value: u64) {
        for i in (0..WIDTH).rev() {
            self.bytes.push((value >> (8 * i)) as u8);
        }
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Append `n` zero bytes.
    pub fn append_zeroes(&mut self, n: usize) {
        self.bytes.resize(self.bytes.len() + n, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_reads_little_endian() {
        let data = [0x11, 0x22, 0x33, 0x44];
        let mut slice = Slice::new(&data);
        assert_eq!(slice.read_le::<2>(), 0x2211);
        assert_eq!(slice.read_le::<2>(), 0x4433);
        assert!(slice.is_empty());
    }

    #[test]
    fn slice_reads_big_endian() {
        let data = [0x11, 0x22, 0x33];
        let mut slice = Slice::new(&data);
        assert_eq!(slice.read_be::<3>(), 0x112233);
    }

    #[test]
    fn slice_subrange_and_skip() {
        let data = [1, 2, 3, 4, 5];
        let mut slice = Slice::new(&data);
        let sub = slice.subrange(1, 3);
        assert_eq!(sub.bytes(), &[2, 3, 4]);
        slice.skip(4);
        assert_eq!(slice.size(), 1);
        slice.clear();
        assert!(slice.is_empty());
    }

    #[test]
    fn checked_reads_report_shortage() {
        let data = [1, 2];
        let mut slice = Slice::new(&data);
        assert_eq!(
            slice.try_read_le::<4>(),
            Err(RuntimeError::OutOfBounds { wanted: 4, available: 2 })
        );
        assert_eq!(slice.try_read_le::<2>(), Ok(0x0201));
    }

    #[test]
    fn builder_writes() {
        let mut builder = Builder::new();
        builder.write_le::<2>(0x1234);
        builder.write_be::<2>(0x1234);
        builder.append_bytes(&[0xff]);
        builder.append_zeroes(2);
        assert_eq!(builder.bytes(), &[0x34, 0x12, 0x12, 0x34, 0xff, 0, 0]);
        assert_eq!(builder.size(), 7);
    }

    #[test]
    fn builder_masks_wide_values() {
        let mut builder = Builder::new();
        builder.write_le::<1>(0x1ff);
        assert_eq!(builder.bytes(), &[0xff]);
    }
}
