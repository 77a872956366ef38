//! Bump-style region carving over caller-owned byte buffers.
//!
//! Nothing here allocates. A `RegionCursor` walks a buffer identified by its
//! base address and capacity and hands out `Region`s whose *absolute* start
//! address is rounded up to the requested alignment. Regions are later turned
//! into typed slices of the same buffer.

use crate::api::error::{QnbitError, QnbitResult};
use crate::core::layout::align_up;

/// A byte range inside a caller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    fn check_bounds(&self, what: &'static str, actual: usize) -> QnbitResult<()> {
        if self.end() > actual {
            return Err(QnbitError::BufferTooSmall { what, required: self.end(), actual });
        }
        Ok(())
    }

    pub fn view<'a>(&self, what: &'static str, buf: &'a [u8]) -> QnbitResult<&'a [u8]> {
        self.check_bounds(what, buf.len())?;
        Ok(&buf[self.offset..self.end()])
    }

    pub fn view_mut<'a>(&self, what: &'static str, buf: &'a mut [u8]) -> QnbitResult<&'a mut [u8]> {
        self.check_bounds(what, buf.len())?;
        Ok(&mut buf[self.offset..self.end()])
    }

    pub fn view_f32<'a>(&self, what: &'static str, buf: &'a [u8]) -> QnbitResult<&'a [f32]> {
        let bytes = self.view(what, buf)?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|_| QnbitError::Misaligned { what, alignment: std::mem::align_of::<f32>() })
    }

    pub fn view_f32_mut<'a>(
        &self,
        what: &'static str,
        buf: &'a mut [u8],
    ) -> QnbitResult<&'a mut [f32]> {
        let bytes = self.view_mut(what, buf)?;
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|_| QnbitError::Misaligned { what, alignment: std::mem::align_of::<f32>() })
    }
}

/// Hands out consecutive aligned regions of one buffer.
#[derive(Debug, Clone)]
pub struct RegionCursor {
    base_addr: usize,
    offset: usize,
    capacity: usize,
}

impl RegionCursor {
    pub fn new(base_addr: usize, capacity: usize) -> Self {
        Self { base_addr, offset: 0, capacity }
    }

    /// Carve `len` bytes whose absolute address is a multiple of `alignment`.
    pub fn alloc(&mut self, what: &'static str, len: usize, alignment: usize) -> QnbitResult<Region> {
        let start = align_up(self.base_addr + self.offset, alignment) - self.base_addr;
        let end = start + len;
        if end > self.capacity {
            return Err(QnbitError::BufferTooSmall { what, required: end, actual: self.capacity });
        }
        self.offset = end;
        Ok(Region { offset: start, len })
    }
}
