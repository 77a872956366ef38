//! Geometry of the packed quantized-B buffer.
//!
//! One caller-owned buffer holds three regions in order: packed data (32-byte
//! aligned on x86_64), block sums (64-byte aligned) and scales. Offsets are
//! derived from the buffer's address, so a packed buffer must be used at the
//! address it was packed at.

use crate::api::error::{QnbitError, QnbitResult};
use crate::api::types::{BitWidth, PackedQuantBMut, PackedQuantBRef, PackedQuantBShape};
use crate::core::arena::{Region, RegionCursor};
use crate::core::layout::{self, PACKED_DATA_ALIGNMENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedQuantBLayout {
    pub shape: PackedQuantBShape,
    pub data: Region,
    pub blk_sum: Region,
    pub scale: Region,
}

impl PackedQuantBLayout {
    /// Lay out the regions for a buffer starting at `base_addr` with `capacity` bytes.
    pub fn new(base_addr: usize, capacity: usize, shape: PackedQuantBShape) -> QnbitResult<Self> {
        let (data_len, blk_sum_len, scale_len) = Self::region_sizes(&shape);
        let mut cursor = RegionCursor::new(base_addr, capacity);
        let data = cursor.alloc("packed quant B data", data_len, PACKED_DATA_ALIGNMENT)?;
        let blk_sum = cursor.alloc("packed quant B blk sum", blk_sum_len, layout::blk_sum_alignment())?;
        let scale = cursor.alloc("packed quant B scale", scale_len, std::mem::align_of::<f32>())?;
        Ok(Self { shape, data, blk_sum, scale })
    }

    /// Layout of `buf` at its current address.
    pub fn for_buffer(buf: &[u8], shape: PackedQuantBShape) -> QnbitResult<Self> {
        Self::new(buf.as_ptr() as usize, buf.len(), shape)
    }

    fn region_sizes(shape: &PackedQuantBShape) -> (usize, usize, usize) {
        let blocks = shape.n * shape.block_count_k;
        let data = blocks * layout::blk_data_size_in_bytes(shape.bit_width, shape.blk_len);
        let blk_sum = layout::blk_sum_len(shape.n, shape.block_count_k) * std::mem::size_of::<f32>();
        let scale = blocks * std::mem::size_of::<f32>();
        (data, blk_sum, scale)
    }

    /// Buffer size that fits the layout at any base address.
    pub fn required_size(n: usize, block_count_k: usize, blk_len: usize, bit_width: BitWidth) -> usize {
        let shape = PackedQuantBShape { n, block_count_k, blk_len, bit_width };
        let (data, blk_sum, scale) = Self::region_sizes(&shape);
        let max_alignment = PACKED_DATA_ALIGNMENT.max(layout::blk_sum_alignment());
        data + blk_sum + scale + 2 * (max_alignment - 1)
    }

    pub fn split<'a>(&self, buf: &'a [u8]) -> QnbitResult<PackedQuantBRef<'a>> {
        Ok(PackedQuantBRef {
            shape: self.shape,
            data: self.data.view("packed quant B data", buf)?,
            blk_sum: self.blk_sum.view_f32("packed quant B blk sum", buf)?,
            scale: self.scale.view_f32("packed quant B scale", buf)?,
        })
    }

    pub fn split_mut<'a>(&self, buf: &'a mut [u8]) -> QnbitResult<PackedQuantBMut<'a>> {
        if self.scale.end() > buf.len() {
            return Err(QnbitError::BufferTooSmall {
                what: "packed quant B buffer",
                required: self.scale.end(),
                actual: buf.len(),
            });
        }
        // Regions are ordered and non-overlapping.
        let (head, scale_bytes) = buf.split_at_mut(self.scale.offset);
        let (head, blk_sum_bytes) = head.split_at_mut(self.blk_sum.offset);
        let scale = Region { offset: 0, len: self.scale.len }.view_f32_mut("packed quant B scale", scale_bytes)?;
        let blk_sum = Region { offset: 0, len: self.blk_sum.len }
            .view_f32_mut("packed quant B blk sum", blk_sum_bytes)?;
        let data = self.data.view_mut("packed quant B data", head)?;
        Ok(PackedQuantBMut { shape: self.shape, data, blk_sum, scale })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(n: usize, block_count_k: usize, blk_len: usize, bit_width: BitWidth) -> PackedQuantBShape {
        PackedQuantBShape { n, block_count_k, blk_len, bit_width }
    }

    #[test]
    fn test_regions_ordered_and_aligned() {
        let s = shape(17, 3, 32, BitWidth::Four);
        for base in [0usize, 1, 7, 31, 33, 63, 4096 + 5] {
            let size = PackedQuantBLayout::required_size(17, 3, 32, BitWidth::Four);
            let layout = PackedQuantBLayout::new(base, size, s).unwrap();
            assert_eq!((base + layout.data.offset) % PACKED_DATA_ALIGNMENT, 0);
            assert_eq!((base + layout.blk_sum.offset) % 64, 0);
            assert_eq!(layout.scale.offset, layout.blk_sum.end());
            assert!(layout.data.end() <= layout.blk_sum.offset);
            assert!(layout.scale.end() <= size);
            assert_eq!(layout.data.len, 17 * 3 * 16);
            assert_eq!(layout.blk_sum.len, 2 * 16 * 3 * 4);
            assert_eq!(layout.scale.len, 17 * 3 * 4);
        }
    }

    #[test]
    fn test_too_small_buffer() {
        let s = shape(4, 1, 32, BitWidth::Eight);
        assert!(PackedQuantBLayout::new(0, 16, s).is_err());
    }

    #[test]
    fn test_split_mut_views() {
        let s = shape(3, 2, 16, BitWidth::Four);
        let size = PackedQuantBLayout::required_size(3, 2, 16, BitWidth::Four);
        let mut buf = vec![0u8; size];
        let layout = PackedQuantBLayout::for_buffer(&buf, s).unwrap();
        let views = layout.split_mut(&mut buf).unwrap();
        assert_eq!(views.data.len(), 3 * 2 * 8);
        assert_eq!(views.blk_sum.len(), 16 * 2);
        assert_eq!(views.scale.len(), 6);
        assert_eq!(views.blk_sum.as_ptr() as usize % 64, 0);
    }
}
