//! Per-call scratch sizing for the int8 paths.
//!
//! Float compute types need no workspace. Int8 stores the quantized
//! activations either as interleaved Q8 blocks (`[f32 scale][blk_len x i8]`,
//! row and packed paths) or in the separated block-sum layout
//! (data, then scales, then block sums).

use crate::api::error::{QnbitError, QnbitResult};
use crate::api::types::{ComputeType, QuantABlkSumMut};
use crate::core::arena::{Region, RegionCursor};
use crate::core::layout;

pub fn per_gemm_workspace_size(
    m: usize,
    _n: usize,
    k: usize,
    blk_len: usize,
    _has_zero_point: bool,
    compute_type: ComputeType,
) -> usize {
    match compute_type {
        ComputeType::Int8 => {
            let block_count_k = layout::block_count_k(k, blk_len);
            // Q8 block plus one f32 block sum per block. Large enough for
            // either activation layout.
            m * block_count_k * (layout::q8_blk_size(blk_len) + std::mem::size_of::<f32>())
        }
        ComputeType::Fp32 | ComputeType::Fp16 => 0,
    }
}

pub fn per_gemm_workspace_alignment(_blk_len: usize, compute_type: ComputeType) -> usize {
    match compute_type {
        ComputeType::Int8 => std::mem::align_of::<f32>(),
        ComputeType::Fp32 | ComputeType::Fp16 => 1,
    }
}

/// Distance between consecutive per-GEMM regions of a batch workspace.
pub fn per_gemm_workspace_stride(per_gemm_size: usize, alignment: usize) -> usize {
    layout::align_up(per_gemm_size, alignment)
}

/// Bytes for `batch` GEMMs, including slack to align an arbitrary base.
pub fn batch_workspace_size(per_gemm_size: usize, alignment: usize, batch: usize) -> usize {
    if per_gemm_size == 0 || batch == 0 {
        return 0;
    }
    per_gemm_workspace_stride(per_gemm_size, alignment) * batch + alignment - 1
}

/// Offset of the first aligned byte of a workspace buffer.
pub fn aligned_start(buf: &[u8], alignment: usize) -> usize {
    let addr = buf.as_ptr() as usize;
    layout::align_up(addr, alignment) - addr
}

/// Regions of the separated block-sum layout for `m` rows.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceLayout {
    pub data: Region,
    pub scale: Region,
    pub blk_sum: Region,
}

impl WorkspaceLayout {
    pub fn new(buf: &[u8], m: usize, block_count_k: usize, blk_len: usize) -> QnbitResult<Self> {
        let blocks = m * block_count_k;
        let f32_align = std::mem::align_of::<f32>();
        let mut cursor = RegionCursor::new(buf.as_ptr() as usize, buf.len());
        let data = cursor.alloc("quant A data", blocks * blk_len, 1)?;
        let scale = cursor.alloc("quant A scale", blocks * std::mem::size_of::<f32>(), f32_align)?;
        let blk_sum = cursor.alloc("quant A blk sum", blocks * std::mem::size_of::<f32>(), f32_align)?;
        Ok(Self { data, scale, blk_sum })
    }

    pub fn split_mut<'a>(&self, buf: &'a mut [u8]) -> QnbitResult<QuantABlkSumMut<'a>> {
        if self.blk_sum.end() > buf.len() {
            return Err(QnbitError::BufferTooSmall {
                what: "quant A workspace",
                required: self.blk_sum.end(),
                actual: buf.len(),
            });
        }
        let (head, blk_sum_bytes) = buf.split_at_mut(self.blk_sum.offset);
        let (head, scale_bytes) = head.split_at_mut(self.scale.offset);
        let blk_sum = Region { offset: 0, len: self.blk_sum.len }.view_f32_mut("quant A blk sum", blk_sum_bytes)?;
        let scale = Region { offset: 0, len: self.scale.len }.view_f32_mut("quant A scale", scale_bytes)?;
        let data = self.data.view_mut("quant A data", head)?;
        Ok(QuantABlkSumMut { data: bytemuck::cast_slice_mut(data), scale, blk_sum })
    }
}
