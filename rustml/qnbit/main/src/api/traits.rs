//! Kernel dispatch table.
//!
//! Every slot is an optional plain function pointer. A table leaves a slot
//! unbound (`None`) when it has no implementation for that variant, and the
//! driver treats the variant as unavailable.

use half::f16;

use crate::api::types::{
    Capability, ComputeType, PackedQuantBMut, PackedQuantBRef, QuantABlkSum, QuantBColumns,
};

/// Bytes needed to pack B: `(n, k, blk_len, has_zero_point, compute_type)`.
pub type PackQuantBDataSizeFn = fn(usize, usize, usize, bool, ComputeType) -> usize;

/// Per-GEMM workspace bytes: `(m, n, k, blk_len, has_zero_point, compute_type)`.
pub type PerGemmWorkspaceSizeFn = fn(usize, usize, usize, usize, bool, ComputeType) -> usize;

/// Per-GEMM workspace alignment: `(blk_len, compute_type)`.
pub type PerGemmWorkspaceAlignmentFn = fn(usize, ComputeType) -> usize;

/// Reorders raw column-major 4-bit data for the float paths:
/// `(n, k, blk_len, quant_b_data, packed_b_data)`.
pub type Q4BitPackQuantBDataFn = fn(usize, usize, usize, &[u8], &mut [u8]);

/// Fills the data, block-sum and scale regions of a packed B buffer.
pub type PackQuantBDataAndBlkSumFn = fn(&QuantBColumns<'_, f32>, &mut PackedQuantBMut<'_>);

/// Single-row fp32 kernel:
/// `(blk_len, a, quant_b, c, count_n, count_k, bias)`.
pub type SQ4BitGemmM1KernelCompFp32Fn =
    fn(usize, &[f32], &QuantBColumns<'_, f32>, &mut [f32], usize, usize, Option<&[f32]>);

/// Dequantizes B into 16-column f32 panels for the panel GEMM:
/// `(blk_len, fp_data, quant_b, count_n, count_k)`.
pub type SQ4BitBlkDequantBForSgemmCompFp32Fn =
    fn(usize, &mut [f32], &QuantBColumns<'_, f32>, usize, usize);

/// Dequantizes B into column-major f16 with `ldb = block_count_k * blk_len`:
/// `(blk_len, fp_data, quant_b, count_n, count_k)`.
pub type HQ4BitBlkDequantBForHgemmCompFp16Fn =
    fn(usize, &mut [f16], &QuantBColumns<'_, f16>, usize, usize);

/// fp16 GEMM against dequantized B:
/// `(a, b, bias, c, count_m, count_n, count_k, lda, ldb, ldc)`.
pub type HQ4BitGemmKernelCompFp16Fn = fn(
    &[f16],
    &[f16],
    Option<&[f16]>,
    &mut [f16],
    usize,
    usize,
    usize,
    usize,
    usize,
    usize,
);

/// Fully packed int8 kernel. `c` starts at `(range_start_m, range_start_n)`;
/// quantized A, packed B and bias are indexed absolutely:
/// `(blk_len, quant_a, packed_b, c, range_start_m, range_count_m,
///   range_start_n, range_count_n, count_k, ldc, bias)`.
pub type SQ4BitGemmKernelPackedCompInt8Fn = fn(
    usize,
    &[u8],
    &PackedQuantBRef<'_>,
    &mut [f32],
    usize,
    usize,
    usize,
    usize,
    usize,
    usize,
    Option<&[f32]>,
);

/// Block-sum int8 kernel computing `sum(scale_a * scale_b * dot(qa, qb))`, the
/// zero-point term `sum(blk_sum_a * blk_sum_b)` and bias. C is overwritten.
/// Returns the number of rows processed:
/// `(blk_len, quant_a, quant_b, c, count_m, count_n, count_k, block_count_k, ldc, bias, quant_b_blk_sum)`.
pub type SQNBitGemmKernelBlkSumCompInt8Fn = fn(
    usize,
    &QuantABlkSum<'_>,
    &QuantBColumns<'_, f32>,
    &mut [f32],
    usize,
    usize,
    usize,
    usize,
    usize,
    Option<&[f32]>,
    &[f32],
) -> usize;

/// Row-count int8 kernel. Handles at most `INT8_KERNEL_TILE_M` rows and
/// returns how many it processed:
/// `(blk_len, quant_a, quant_b, c, count_m, count_n, count_k, block_count_k, ldc, bias)`.
pub type SQ4BitGemmKernelCompInt8Fn = fn(
    usize,
    &[u8],
    &QuantBColumns<'_, f32>,
    &mut [f32],
    usize,
    usize,
    usize,
    usize,
    usize,
    Option<&[f32]>,
) -> usize;

/// Quantizes a whole row-major A into Q8 blocks:
/// `(blk_len, a, count_m, count_k, lda, quant_a)`.
pub type QuantizeAPackedCompInt8Fn = fn(usize, &[f32], usize, usize, usize, &mut [u8]);

/// Quantizes one row of A into Q8 blocks: `(blk_len, a, count_k, quant_a)`.
pub type QuantizeARowCompInt8Fn = fn(usize, &[f32], usize, &mut [u8]);

/// Quantizes one row of A into the separated layout and writes block sums:
/// `(blk_len, a, count_k, quant_a, scales, blk_sums)`.
pub type QuantizeARowComputeBlkSumCompInt8Fn =
    fn(usize, &[f32], usize, &mut [i8], &mut [f32], &mut [f32]);

/// Whether the fully packed int8 pair applies: `(k, blk_len, has_zero_point)`.
pub type UsePackedCompInt8Fn = fn(usize, usize, bool) -> bool;

/// A capability-specific set of block-quantized GEMM kernels.
pub trait QnbitKernels: Send + Sync {
    fn capability(&self) -> Capability;

    fn name(&self) -> &'static str;

    fn q4bit_gemm_pack_quant_b_data_size(&self) -> Option<PackQuantBDataSizeFn> {
        None
    }

    fn q8bit_gemm_pack_quant_b_data_size(&self) -> Option<PackQuantBDataSizeFn> {
        None
    }

    fn per_gemm_workspace_size(&self) -> Option<PerGemmWorkspaceSizeFn> {
        None
    }

    fn per_gemm_workspace_alignment(&self) -> Option<PerGemmWorkspaceAlignmentFn> {
        None
    }

    fn sq4bit_gemm_pack_quant_b_data(&self) -> Option<Q4BitPackQuantBDataFn> {
        None
    }

    fn hq4bit_gemm_pack_quant_b_data(&self) -> Option<Q4BitPackQuantBDataFn> {
        None
    }

    fn sq4bit_gemm_pack_quant_b_data_and_blk_sum(&self) -> Option<PackQuantBDataAndBlkSumFn> {
        None
    }

    fn sq8bit_gemm_pack_quant_b_data_and_blk_sum(&self) -> Option<PackQuantBDataAndBlkSumFn> {
        None
    }

    fn sq4bit_gemm_m1_kernel_comp_fp32(&self) -> Option<SQ4BitGemmM1KernelCompFp32Fn> {
        None
    }

    fn sq4bit_blk_dequant_b_for_sgemm_comp_fp32(
        &self,
    ) -> Option<SQ4BitBlkDequantBForSgemmCompFp32Fn> {
        None
    }

    fn hq4bit_blk_dequant_b_for_hgemm_comp_fp16(
        &self,
    ) -> Option<HQ4BitBlkDequantBForHgemmCompFp16Fn> {
        None
    }

    fn hq4bit_gemm_kernel_comp_fp16(&self) -> Option<HQ4BitGemmKernelCompFp16Fn> {
        None
    }

    fn sq4bit_gemm_kernel_packed_comp_int8(&self) -> Option<SQ4BitGemmKernelPackedCompInt8Fn> {
        None
    }

    fn sq4bit_gemm_kernel_blk_sum_comp_int8(&self) -> Option<SQNBitGemmKernelBlkSumCompInt8Fn> {
        None
    }

    fn sq8bit_gemm_kernel_blk_sum_comp_int8(&self) -> Option<SQNBitGemmKernelBlkSumCompInt8Fn> {
        None
    }

    fn sq4bit_gemm_kernel_comp_int8(&self) -> Option<SQ4BitGemmKernelCompInt8Fn> {
        None
    }

    fn quantize_a_packed_comp_int8(&self) -> Option<QuantizeAPackedCompInt8Fn> {
        None
    }

    fn quantize_a_row_comp_int8(&self) -> Option<QuantizeARowCompInt8Fn> {
        None
    }

    fn quantize_a_row_compute_blk_sum_comp_int8(
        &self,
    ) -> Option<QuantizeARowComputeBlkSumCompInt8Fn> {
        None
    }

    fn use_packed_comp_int8(&self) -> Option<UsePackedCompInt8Fn> {
        None
    }

    /// Names of the slots this table binds, in declaration order.
    fn bound_slots(&self) -> Vec<&'static str> {
        let slots = [
            ("q4bit_gemm_pack_quant_b_data_size", self.q4bit_gemm_pack_quant_b_data_size().is_some()),
            ("q8bit_gemm_pack_quant_b_data_size", self.q8bit_gemm_pack_quant_b_data_size().is_some()),
            ("per_gemm_workspace_size", self.per_gemm_workspace_size().is_some()),
            ("per_gemm_workspace_alignment", self.per_gemm_workspace_alignment().is_some()),
            ("sq4bit_gemm_pack_quant_b_data", self.sq4bit_gemm_pack_quant_b_data().is_some()),
            ("hq4bit_gemm_pack_quant_b_data", self.hq4bit_gemm_pack_quant_b_data().is_some()),
            (
                "sq4bit_gemm_pack_quant_b_data_and_blk_sum",
                self.sq4bit_gemm_pack_quant_b_data_and_blk_sum().is_some(),
            ),
            (
                "sq8bit_gemm_pack_quant_b_data_and_blk_sum",
                self.sq8bit_gemm_pack_quant_b_data_and_blk_sum().is_some(),
            ),
            ("sq4bit_gemm_m1_kernel_comp_fp32", self.sq4bit_gemm_m1_kernel_comp_fp32().is_some()),
            (
                "sq4bit_blk_dequant_b_for_sgemm_comp_fp32",
                self.sq4bit_blk_dequant_b_for_sgemm_comp_fp32().is_some(),
            ),
            (
                "hq4bit_blk_dequant_b_for_hgemm_comp_fp16",
                self.hq4bit_blk_dequant_b_for_hgemm_comp_fp16().is_some(),
            ),
            ("hq4bit_gemm_kernel_comp_fp16", self.hq4bit_gemm_kernel_comp_fp16().is_some()),
            (
                "sq4bit_gemm_kernel_packed_comp_int8",
                self.sq4bit_gemm_kernel_packed_comp_int8().is_some(),
            ),
            (
                "sq4bit_gemm_kernel_blk_sum_comp_int8",
                self.sq4bit_gemm_kernel_blk_sum_comp_int8().is_some(),
            ),
            (
                "sq8bit_gemm_kernel_blk_sum_comp_int8",
                self.sq8bit_gemm_kernel_blk_sum_comp_int8().is_some(),
            ),
            ("sq4bit_gemm_kernel_comp_int8", self.sq4bit_gemm_kernel_comp_int8().is_some()),
            ("quantize_a_packed_comp_int8", self.quantize_a_packed_comp_int8().is_some()),
            ("quantize_a_row_comp_int8", self.quantize_a_row_comp_int8().is_some()),
            (
                "quantize_a_row_compute_blk_sum_comp_int8",
                self.quantize_a_row_compute_blk_sum_comp_int8().is_some(),
            ),
            ("use_packed_comp_int8", self.use_packed_comp_int8().is_some()),
        ];
        slots.iter().filter(|(_, bound)| *bound).map(|(name, _)| *name).collect()
    }
}
