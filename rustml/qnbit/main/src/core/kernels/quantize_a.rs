//! On-the-fly int8 quantization of the activations.
//!
//! Symmetric per block: `scale = max|a| / 127`, `q = round(a / scale)`
//! clamped to `[-127, 127]`. A partial last block is zero-padded and an
//! all-zero block gets `scale = 0`.

use crate::core::layout;

/// Quantize up to `dst.len()` values of `src` and return the block scale.
fn quantize_blk(src: &[f32], dst: &mut [i8]) -> f32 {
    let amax = src.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
    let scale = amax / 127.0;
    let inv_scale = if scale == 0.0 { 0.0 } else { 1.0 / scale };

    for (q, &v) in dst.iter_mut().zip(src) {
        *q = (v * inv_scale).round().clamp(-127.0, 127.0) as i8;
    }
    dst[src.len()..].fill(0);
    scale
}

/// One row of A as `block_count_k` Q8 blocks `[f32 scale][blk_len x i8]`.
pub fn quantize_a_row_comp_int8(blk_len: usize, a: &[f32], count_k: usize, quant_a: &mut [u8]) {
    let q8_blk_size = layout::q8_blk_size(blk_len);
    let block_count_k = layout::block_count_k(count_k, blk_len);
    debug_assert!(quant_a.len() >= block_count_k * q8_blk_size);

    for (src, blk) in a[..count_k].chunks(blk_len).zip(quant_a.chunks_exact_mut(q8_blk_size)) {
        let (scale_bytes, data) = blk.split_at_mut(std::mem::size_of::<f32>());
        let scale = quantize_blk(src, bytemuck::cast_slice_mut(data));
        scale_bytes.copy_from_slice(&scale.to_le_bytes());
    }
}

/// All `count_m` rows of A (row stride `lda`) as consecutive Q8 rows.
pub fn quantize_a_packed_comp_int8(
    blk_len: usize,
    a: &[f32],
    count_m: usize,
    count_k: usize,
    lda: usize,
    quant_a: &mut [u8],
) {
    let row_bytes = layout::block_count_k(count_k, blk_len) * layout::q8_blk_size(blk_len);
    if row_bytes == 0 {
        return;
    }
    for (m, row) in quant_a.chunks_exact_mut(row_bytes).take(count_m).enumerate() {
        quantize_a_row_comp_int8(blk_len, &a[m * lda..m * lda + count_k], count_k, row);
    }
}

/// One row of A in the separated layout, with `blk_sum = scale * sum(q)`.
pub fn quantize_a_row_compute_blk_sum_comp_int8(
    blk_len: usize,
    a: &[f32],
    count_k: usize,
    quant_a: &mut [i8],
    scales: &mut [f32],
    blk_sums: &mut [f32],
) {
    let blocks = a[..count_k].chunks(blk_len).zip(quant_a.chunks_exact_mut(blk_len));
    for ((src, dst), (scale, blk_sum)) in blocks.zip(scales.iter_mut().zip(blk_sums.iter_mut())) {
        *scale = quantize_blk(src, dst);
        *blk_sum = *scale * dst.iter().map(|&q| q as i32).sum::<i32>() as f32;
    }
}
