//! Block-quantized GEMM kernels.
//!
//! Kernel bodies are written once, generic over a [`DotPrimitives`]
//! implementation, and monomorphized per instruction set. Each capability's
//! table binds those instantiations into its dispatch slots.
//!
//! Packed 4-bit layout: a block is split into sub-blocks of
//! `sub_blk_len(blk_len)` values. Byte `j` of a sub-block of `S` values holds
//! value `j` in its low nibble and value `j + S/2` in its high nibble.

use crate::api::types::{BitWidth, QuantBColumns};
use crate::core::layout;

/// Block-level dot products, one implementation per instruction set.
pub trait DotPrimitives {
    /// `sum(a[i] * (q[i] - zero_point))` over one packed 4-bit sub-block of
    /// `a.len()` values.
    fn dot_f32_q4(a: &[f32], packed: &[u8], zero_point: f32) -> f32;

    /// `sum(q[i] * qa[i])` over one packed 4-bit sub-block, `q` unsigned.
    fn dot_i8_q4(packed: &[u8], qa: &[i8]) -> i32;

    /// `sum(qa[i] * b[i])` with `b` unsigned 8-bit codes.
    fn dot_i8_u8(qa: &[i8], b: &[u8]) -> i32;
}

pub(crate) fn dot_f32_q4_scalar(a: &[f32], packed: &[u8], zero_point: f32) -> f32 {
    let half = a.len() / 2;
    let mut sum = 0.0f32;
    for j in 0..half {
        let byte = packed[j];
        sum += a[j] * ((byte & 0x0F) as f32 - zero_point);
        sum += a[j + half] * ((byte >> 4) as f32 - zero_point);
    }
    sum
}

pub(crate) fn dot_i8_q4_scalar(packed: &[u8], qa: &[i8]) -> i32 {
    let half = qa.len() / 2;
    let mut sum = 0i32;
    for j in 0..half {
        let byte = packed[j];
        sum += (byte & 0x0F) as i32 * qa[j] as i32;
        sum += (byte >> 4) as i32 * qa[j + half] as i32;
    }
    sum
}

pub(crate) fn dot_i8_u8_scalar(qa: &[i8], b: &[u8]) -> i32 {
    qa.iter().zip(b).map(|(&x, &y)| x as i32 * y as i32).sum()
}

/// Dot product of one full block of `a` with one packed 4-bit block.
#[inline]
pub(crate) fn dot_f32_q4_blk<D: DotPrimitives>(
    a: &[f32],
    packed_blk: &[u8],
    blk_len: usize,
    zero_point: f32,
) -> f32 {
    let sub = layout::sub_blk_len(blk_len);
    a[..blk_len]
        .chunks_exact(sub)
        .zip(packed_blk.chunks_exact(sub / 2))
        .map(|(a, p)| D::dot_f32_q4(a, p, zero_point))
        .sum()
}

#[inline]
pub(crate) fn dot_i8_q4_blk<D: DotPrimitives>(packed_blk: &[u8], qa: &[i8], blk_len: usize) -> i32 {
    let sub = layout::sub_blk_len(blk_len);
    qa[..blk_len]
        .chunks_exact(sub)
        .zip(packed_blk.chunks_exact(sub / 2))
        .map(|(q, p)| D::dot_i8_q4(p, q))
        .sum()
}

/// Unsigned codes of one packed 4-bit block, in logical order.
pub(crate) fn unpack_q4_blk(packed_blk: &[u8], blk_len: usize, out: &mut [u8]) {
    let sub = layout::sub_blk_len(blk_len);
    let half = sub / 2;
    for (values, bytes) in out[..blk_len].chunks_exact_mut(sub).zip(packed_blk.chunks_exact(half)) {
        for (j, &byte) in bytes.iter().enumerate() {
            values[j] = byte & 0x0F;
            values[j + half] = byte >> 4;
        }
    }
}

/// Scale and quantized values of one Q8 block `[f32 scale][blk_len x i8]`.
#[inline]
pub(crate) fn read_q8_blk(blk: &[u8], blk_len: usize) -> (f32, &[i8]) {
    let scale = f32::from_le_bytes([blk[0], blk[1], blk[2], blk[3]]);
    let data = bytemuck::cast_slice(&blk[4..4 + blk_len]);
    (scale, data)
}

#[inline]
pub(crate) fn sum_i8(values: &[i8]) -> i32 {
    values.iter().map(|&v| v as i32).sum()
}

#[inline]
pub(crate) fn zero_point_f32<S>(quant_b: &QuantBColumns<'_, S>, bit_width: BitWidth, n: usize, k_blk: usize) -> f32 {
    quant_b.zero_point_at(bit_width, n, k_blk) as f32
}

/// Binds the slots every capability provides.
macro_rules! impl_common_slots {
    ($dot:ty) => {
        fn q4bit_gemm_pack_quant_b_data_size(&self) -> Option<$crate::api::traits::PackQuantBDataSizeFn> {
            Some($crate::core::kernels::pack::q4bit_gemm_pack_quant_b_data_size)
        }

        fn q8bit_gemm_pack_quant_b_data_size(&self) -> Option<$crate::api::traits::PackQuantBDataSizeFn> {
            Some($crate::core::kernels::pack::q8bit_gemm_pack_quant_b_data_size)
        }

        fn per_gemm_workspace_size(&self) -> Option<$crate::api::traits::PerGemmWorkspaceSizeFn> {
            Some($crate::core::workspace::per_gemm_workspace_size)
        }

        fn per_gemm_workspace_alignment(&self) -> Option<$crate::api::traits::PerGemmWorkspaceAlignmentFn> {
            Some($crate::core::workspace::per_gemm_workspace_alignment)
        }

        fn sq4bit_gemm_pack_quant_b_data(&self) -> Option<$crate::api::traits::Q4BitPackQuantBDataFn> {
            Some($crate::core::kernels::pack::q4bit_pack_quant_b_data)
        }

        fn hq4bit_gemm_pack_quant_b_data(&self) -> Option<$crate::api::traits::Q4BitPackQuantBDataFn> {
            Some($crate::core::kernels::pack::q4bit_pack_quant_b_data)
        }

        fn sq4bit_gemm_pack_quant_b_data_and_blk_sum(
            &self,
        ) -> Option<$crate::api::traits::PackQuantBDataAndBlkSumFn> {
            Some($crate::core::kernels::pack::sq4bit_gemm_pack_quant_b_data_and_blk_sum)
        }

        fn sq8bit_gemm_pack_quant_b_data_and_blk_sum(
            &self,
        ) -> Option<$crate::api::traits::PackQuantBDataAndBlkSumFn> {
            Some($crate::core::kernels::pack::sq8bit_gemm_pack_quant_b_data_and_blk_sum)
        }

        fn sq4bit_gemm_m1_kernel_comp_fp32(
            &self,
        ) -> Option<$crate::api::traits::SQ4BitGemmM1KernelCompFp32Fn> {
            Some($crate::core::kernels::fp32::sq4bit_gemm_m1_kernel_comp_fp32::<$dot>)
        }

        fn sq4bit_blk_dequant_b_for_sgemm_comp_fp32(
            &self,
        ) -> Option<$crate::api::traits::SQ4BitBlkDequantBForSgemmCompFp32Fn> {
            Some($crate::core::kernels::fp32::sq4bit_blk_dequant_b_for_sgemm_comp_fp32)
        }

        fn hq4bit_blk_dequant_b_for_hgemm_comp_fp16(
            &self,
        ) -> Option<$crate::api::traits::HQ4BitBlkDequantBForHgemmCompFp16Fn> {
            Some($crate::core::kernels::fp16::hq4bit_blk_dequant_b_for_hgemm_comp_fp16)
        }

        fn hq4bit_gemm_kernel_comp_fp16(&self) -> Option<$crate::api::traits::HQ4BitGemmKernelCompFp16Fn> {
            Some($crate::core::kernels::fp16::hq4bit_gemm_kernel_comp_fp16)
        }

        fn sq4bit_gemm_kernel_blk_sum_comp_int8(
            &self,
        ) -> Option<$crate::api::traits::SQNBitGemmKernelBlkSumCompInt8Fn> {
            Some($crate::core::kernels::int8::sq4bit_gemm_kernel_blk_sum_comp_int8::<$dot>)
        }

        fn sq8bit_gemm_kernel_blk_sum_comp_int8(
            &self,
        ) -> Option<$crate::api::traits::SQNBitGemmKernelBlkSumCompInt8Fn> {
            Some($crate::core::kernels::int8::sq8bit_gemm_kernel_blk_sum_comp_int8::<$dot>)
        }

        fn sq4bit_gemm_kernel_comp_int8(&self) -> Option<$crate::api::traits::SQ4BitGemmKernelCompInt8Fn> {
            Some($crate::core::kernels::int8::sq4bit_gemm_kernel_comp_int8::<$dot>)
        }

        fn quantize_a_row_comp_int8(&self) -> Option<$crate::api::traits::QuantizeARowCompInt8Fn> {
            Some($crate::core::kernels::quantize_a::quantize_a_row_comp_int8)
        }

        fn quantize_a_row_compute_blk_sum_comp_int8(
            &self,
        ) -> Option<$crate::api::traits::QuantizeARowComputeBlkSumCompInt8Fn> {
            Some($crate::core::kernels::quantize_a::quantize_a_row_compute_blk_sum_comp_int8)
        }
    };
}

/// Binds the fully packed int8 pair and its predicate.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
macro_rules! impl_packed_int8_slots {
    ($dot:ty) => {
        fn sq4bit_gemm_kernel_packed_comp_int8(
            &self,
        ) -> Option<$crate::api::traits::SQ4BitGemmKernelPackedCompInt8Fn> {
            Some($crate::core::kernels::int8::sq4bit_gemm_kernel_packed_comp_int8::<$dot>)
        }

        fn quantize_a_packed_comp_int8(&self) -> Option<$crate::api::traits::QuantizeAPackedCompInt8Fn> {
            Some($crate::core::kernels::quantize_a::quantize_a_packed_comp_int8)
        }

        fn use_packed_comp_int8(&self) -> Option<$crate::api::traits::UsePackedCompInt8Fn> {
            Some($crate::core::kernels::int8::use_packed_comp_int8)
        }
    };
}

pub mod fp16;
pub mod fp32;
pub mod int8;
pub mod pack;
pub mod quantize_a;
pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub mod avx2;

#[cfg(target_arch = "aarch64")]
pub mod neon;
