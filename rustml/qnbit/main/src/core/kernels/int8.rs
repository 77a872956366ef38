//! int8 compute path kernels.

use smallvec::SmallVec;

use crate::api::types::{BitWidth, PackedQuantBRef, QuantABlkSum, QuantBColumns, INT8_KERNEL_TILE_M};
use crate::core::kernels::{dot_i8_q4_blk, read_q8_blk, sum_i8, zero_point_f32, DotPrimitives};
use crate::core::layout;
use crate::core::runtime::PackedInt8Policy;

/// Whether the fully packed pair applies, per the current [`PackedInt8Policy`].
///
/// A pure function of its arguments while the policy is unchanged. Set the
/// policy (`RuntimeConfig::apply` or `store_thresholds`) before the first
/// GEMM; a batch call reads it once and keeps that variant for every entry.
pub fn use_packed_comp_int8(k: usize, blk_len: usize, has_zero_point: bool) -> bool {
    PackedInt8Policy::current().allows(k, blk_len, has_zero_point)
}

/// Shared loop of the block-sum kernels; `dot` gives the integer dot product
/// of one A block with column `n`, block `k_blk` of B.
#[allow(clippy::too_many_arguments)]
#[inline]
fn blk_sum_kernel(
    blk_len: usize,
    quant_a: &QuantABlkSum<'_>,
    quant_b: &QuantBColumns<'_, f32>,
    c: &mut [f32],
    count_m: usize,
    count_n: usize,
    block_count_k: usize,
    ldc: usize,
    bias: Option<&[f32]>,
    quant_b_blk_sum: &[f32],
    dot: impl Fn(&[i8], usize) -> i32,
) -> usize {
    let stride = quant_b.block_stride;
    debug_assert!(quant_b_blk_sum.len() >= layout::blk_sum_len(count_n, block_count_k));
    for m in 0..count_m {
        let a_data = &quant_a.data[m * block_count_k * blk_len..(m + 1) * block_count_k * blk_len];
        let a_scale = &quant_a.scale[m * block_count_k..(m + 1) * block_count_k];
        let a_blk_sum = &quant_a.blk_sum[m * block_count_k..(m + 1) * block_count_k];
        let c_row = &mut c[m * ldc..m * ldc + count_n];
        for (n, out) in c_row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for k_blk in 0..block_count_k {
                // zero-point term: scale_a * sum(qa) * (-scale_b * zp)
                acc += a_blk_sum[k_blk] * quant_b_blk_sum[layout::blk_sum_index(n, k_blk, block_count_k)];
                let scale = a_scale[k_blk] * quant_b.scale[n * stride + k_blk];
                if scale == 0.0 {
                    continue;
                }
                let qa = &a_data[k_blk * blk_len..(k_blk + 1) * blk_len];
                acc += scale * dot(qa, n * stride + k_blk) as f32;
            }
            *out = acc + bias.map_or(0.0, |b| b[n]);
        }
    }
    count_m
}

/// `sum(scale_a * scale_b * dot(qa, qb)) + sum(blk_sum_a * blk_sum_b)` for 4-bit
/// B in the packed layout. B columns start at column 0 of the block-sum panels.
#[allow(clippy::too_many_arguments)]
pub fn sq4bit_gemm_kernel_blk_sum_comp_int8<D: DotPrimitives>(
    blk_len: usize,
    quant_a: &QuantABlkSum<'_>,
    quant_b: &QuantBColumns<'_, f32>,
    c: &mut [f32],
    count_m: usize,
    count_n: usize,
    _count_k: usize,
    block_count_k: usize,
    ldc: usize,
    bias: Option<&[f32]>,
    quant_b_blk_sum: &[f32],
) -> usize {
    let blk_bytes = layout::blk_data_size_in_bytes(BitWidth::Four, blk_len);
    blk_sum_kernel(
        blk_len,
        quant_a,
        quant_b,
        c,
        count_m,
        count_n,
        block_count_k,
        ldc,
        bias,
        quant_b_blk_sum,
        |qa, idx| dot_i8_q4_blk::<D>(&quant_b.data[idx * blk_bytes..(idx + 1) * blk_bytes], qa, blk_len),
    )
}

/// 8-bit variant of [`sq4bit_gemm_kernel_blk_sum_comp_int8`].
#[allow(clippy::too_many_arguments)]
pub fn sq8bit_gemm_kernel_blk_sum_comp_int8<D: DotPrimitives>(
    blk_len: usize,
    quant_a: &QuantABlkSum<'_>,
    quant_b: &QuantBColumns<'_, f32>,
    c: &mut [f32],
    count_m: usize,
    count_n: usize,
    _count_k: usize,
    block_count_k: usize,
    ldc: usize,
    bias: Option<&[f32]>,
    quant_b_blk_sum: &[f32],
) -> usize {
    blk_sum_kernel(
        blk_len,
        quant_a,
        quant_b,
        c,
        count_m,
        count_n,
        block_count_k,
        ldc,
        bias,
        quant_b_blk_sum,
        |qa, idx| D::dot_i8_u8(qa, &quant_b.data[idx * blk_len..(idx + 1) * blk_len]),
    )
}

/// Q8 rows of A against 4-bit B with explicit zero points. Handles at most
/// `INT8_KERNEL_TILE_M` rows and returns how many.
#[allow(clippy::too_many_arguments)]
pub fn sq4bit_gemm_kernel_comp_int8<D: DotPrimitives>(
    blk_len: usize,
    quant_a: &[u8],
    quant_b: &QuantBColumns<'_, f32>,
    c: &mut [f32],
    count_m: usize,
    count_n: usize,
    _count_k: usize,
    block_count_k: usize,
    ldc: usize,
    bias: Option<&[f32]>,
) -> usize {
    let rows = count_m.min(INT8_KERNEL_TILE_M);
    let q8_blk_size = layout::q8_blk_size(blk_len);
    let row_bytes = block_count_k * q8_blk_size;
    let blk_bytes = layout::blk_data_size_in_bytes(BitWidth::Four, blk_len);
    let stride = quant_b.block_stride;

    for m in 0..rows {
        let a_row = &quant_a[m * row_bytes..(m + 1) * row_bytes];
        let a_sums: SmallVec<[i32; 64]> =
            a_row.chunks_exact(q8_blk_size).map(|blk| sum_i8(read_q8_blk(blk, blk_len).1)).collect();
        let c_row = &mut c[m * ldc..m * ldc + count_n];
        for (n, out) in c_row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (k_blk, blk) in a_row.chunks_exact(q8_blk_size).enumerate() {
                let (a_scale, qa) = read_q8_blk(blk, blk_len);
                let idx = n * stride + k_blk;
                let scale = a_scale * quant_b.scale[idx];
                if scale == 0.0 {
                    continue;
                }
                let zp = zero_point_f32(quant_b, BitWidth::Four, n, k_blk);
                let dot = dot_i8_q4_blk::<D>(&quant_b.data[idx * blk_bytes..(idx + 1) * blk_bytes], qa, blk_len);
                acc += scale * (dot as f32 - zp * a_sums[k_blk] as f32);
            }
            *out = acc + bias.map_or(0.0, |b| b[n]);
        }
    }
    rows
}

/// Fully packed kernel for the tile starting at `(range_start_m, range_start_n)`.
/// Zero points come from the packed block sums.
#[allow(clippy::too_many_arguments)]
pub fn sq4bit_gemm_kernel_packed_comp_int8<D: DotPrimitives>(
    blk_len: usize,
    quant_a: &[u8],
    packed_b: &PackedQuantBRef<'_>,
    c: &mut [f32],
    range_start_m: usize,
    range_count_m: usize,
    range_start_n: usize,
    range_count_n: usize,
    count_k: usize,
    ldc: usize,
    bias: Option<&[f32]>,
) {
    let block_count_k = layout::block_count_k(count_k, blk_len);
    debug_assert_eq!(block_count_k, packed_b.shape.block_count_k);
    let q8_blk_size = layout::q8_blk_size(blk_len);
    let row_bytes = block_count_k * q8_blk_size;
    let blk_bytes = layout::blk_data_size_in_bytes(BitWidth::Four, blk_len);

    for m in 0..range_count_m {
        let a_row = &quant_a[(range_start_m + m) * row_bytes..(range_start_m + m + 1) * row_bytes];
        let a_blk_sums: SmallVec<[f32; 64]> = a_row
            .chunks_exact(q8_blk_size)
            .map(|blk| {
                let (scale, qa) = read_q8_blk(blk, blk_len);
                scale * sum_i8(qa) as f32
            })
            .collect();
        let c_row = &mut c[m * ldc..m * ldc + range_count_n];
        for (j, out) in c_row.iter_mut().enumerate() {
            let n = range_start_n + j;
            let mut acc = 0.0f32;
            for (k_blk, blk) in a_row.chunks_exact(q8_blk_size).enumerate() {
                let (a_scale, qa) = read_q8_blk(blk, blk_len);
                let idx = n * block_count_k + k_blk;
                let packed = &packed_b.data[idx * blk_bytes..(idx + 1) * blk_bytes];
                let dot = dot_i8_q4_blk::<D>(packed, qa, blk_len);
                acc += a_scale * packed_b.scale[idx] * dot as f32;
                acc += a_blk_sums[k_blk] * packed_b.blk_sum[layout::blk_sum_index(n, k_blk, block_count_k)];
            }
            *out = acc + bias.map_or(0.0, |b| b[n]);
        }
    }
}
