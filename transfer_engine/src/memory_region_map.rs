//! Interval index from logical buffers to physical registrations.
//!
//! A single registration is capped at `max_region_size` bytes, so a logical buffer
//! is carved into contiguous slices, each registered on one device context under
//! a derived key (`<buffer>#<n>`). Slices of one buffer are stored in a `BTreeMap`
//! keyed by their start address; a predecessor lookup finds the slice containing
//! any address in the buffer.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::ops::Bound;

use crate::error::RdmaError;
use crate::error::Result;

/// A contiguous piece of a logical buffer backed by one physical registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySlice {
    /// Index of the device context holding the registration.
    pub context_index: usize,
    /// Registration key on that context.
    pub key: String,
    /// Start address of the whole logical buffer.
    pub logical_base: usize,
    /// Start address of this slice.
    pub start: usize,
    pub length: usize,
}

impl MemorySlice {
    /// One past the last address of the slice.
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    /// Offset of the slice start within the logical buffer.
    pub fn logical_offset(&self) -> usize {
        self.start - self.logical_base
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }
}

impl fmt::Display for MemorySlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [0x{:x}, 0x{:x}) on context {}",
            self.key,
            self.start,
            self.end(),
            self.context_index
        )
    }
}

/// Derived registration key of slice `index` of `buffer`.
pub fn slice_key(buffer: &str, index: usize) -> String {
    format!("{buffer}#{index}")
}

#[derive(Debug)]
pub struct MemoryRegionMap {
    max_region_size: usize,
    buffers: HashMap<String, BTreeMap<usize, MemorySlice>>,
}

impl MemoryRegionMap {
    pub fn new(max_region_size: usize) -> Self {
        Self {
            max_region_size: max_region_size.max(1),
            buffers: HashMap::new(),
        }
    }

    pub fn max_region_size(&self) -> usize {
        self.max_region_size
    }

    /// Carves `[addr, addr + length)` into slices of at most `max_region_size` bytes.
    ///
    /// `place` is called once per slice, in address order, with the slice key, start
    /// address and length; it registers the slice somewhere and returns the index of
    /// the context that now holds it. Returns the number of slices.
    pub fn register<F>(&mut self, buffer: &str, addr: usize, length: usize, mut place: F) -> Result<usize>
    where
        F: FnMut(&str, usize, usize) -> Result<usize>,
    {
        if self.buffers.contains_key(buffer) {
            return Err(RdmaError::DuplicateMemoryRegion(buffer.to_string()));
        }

        let mut slices = BTreeMap::new();
        let mut offset = 0;
        while offset < length {
            let slice_length = (length - offset).min(self.max_region_size);
            let key = slice_key(buffer, slices.len());
            let start = addr + offset;
            let context_index = place(&key, start, slice_length)?;
            slices.insert(
                start,
                MemorySlice {
                    context_index,
                    key,
                    logical_base: addr,
                    start,
                    length: slice_length,
                },
            );
            offset += slice_length;
        }

        let count = slices.len();
        tracing::debug!("registered {} ({} bytes) as {} slices", buffer, length, count);
        self.buffers.insert(buffer.to_string(), slices);
        Ok(count)
    }

    /// Slices of `buffer` in address order.
    pub fn slices(&self, buffer: &str) -> Result<impl Iterator<Item = &MemorySlice>> {
        Ok(self.buffer(buffer)?.values())
    }

    /// Total registered length of `buffer`.
    pub fn buffer_len(&self, buffer: &str) -> Result<usize> {
        Ok(self.buffer(buffer)?.values().map(|slice| slice.length).sum())
    }

    /// Slice containing `offset` bytes into `buffer`.
    pub fn resolve(&self, buffer: &str, offset: usize) -> Result<&MemorySlice> {
        self.slices_from(buffer, offset)?
            .next()
            .ok_or_else(|| self.out_of_range(buffer, offset, 0))
    }

    /// The slice containing `offset` followed by every later slice of `buffer`.
    pub fn slices_from(
        &self,
        buffer: &str,
        offset: usize,
    ) -> Result<impl Iterator<Item = &MemorySlice>> {
        let slices = self.buffer(buffer)?;
        let Some(base) = slices.values().next().map(|slice| slice.logical_base) else {
            return Err(self.out_of_range(buffer, offset, 0));
        };
        let addr = base + offset;
        let containing = slices
            .range(..=addr)
            .next_back()
            .filter(|(_, slice)| slice.contains(addr))
            .map(|(start, _)| *start)
            .ok_or_else(|| self.out_of_range(buffer, offset, 0))?;
        Ok(slices
            .range((Bound::Included(containing), Bound::Unbounded))
            .map(|(_, slice)| slice))
    }

    pub fn contains(&self, buffer: &str) -> bool {
        self.buffers.contains_key(buffer)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    fn buffer(&self, buffer: &str) -> Result<&BTreeMap<usize, MemorySlice>> {
        self.buffers
            .get(buffer)
            .ok_or_else(|| RdmaError::UnknownBuffer(buffer.to_string()))
    }

    fn out_of_range(&self, buffer: &str, offset: usize, length: usize) -> RdmaError {
        RdmaError::OutOfRange {
            key: buffer.to_string(),
            offset,
            length,
            size: self.buffer_len(buffer).unwrap_or(0),
        }
    }
}
