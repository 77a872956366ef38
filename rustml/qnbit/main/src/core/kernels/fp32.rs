//! fp32 compute path: single-row kernel, dequantize-to-panels and the small
//! panel GEMM that consumes them.

use crate::api::types::{BitWidth, QuantBColumns, MAX_BLK_LEN};
use crate::core::kernels::{dot_f32_q4_blk, unpack_q4_blk, zero_point_f32, DotPrimitives};
use crate::core::layout::{self, BLK_SUM_PANEL_N};

/// `c[n] = sum_k a[k] * B[k, n] (+ bias[n])` for one row of A.
pub fn sq4bit_gemm_m1_kernel_comp_fp32<D: DotPrimitives>(
    blk_len: usize,
    a: &[f32],
    quant_b: &QuantBColumns<'_, f32>,
    c: &mut [f32],
    count_n: usize,
    count_k: usize,
    bias: Option<&[f32]>,
) {
    let block_count_k = layout::block_count_k(count_k, blk_len);
    let stride = quant_b.block_stride;
    let blk_bytes = layout::blk_data_size_in_bytes(BitWidth::Four, blk_len);
    debug_assert!(a.len() >= count_k);
    debug_assert!(c.len() >= count_n);

    let mut tail = [0.0f32; MAX_BLK_LEN];
    let tail_len = count_k - (block_count_k.saturating_sub(1)) * blk_len;
    if block_count_k > 0 {
        tail[..tail_len].copy_from_slice(&a[count_k - tail_len..count_k]);
    }

    for (n, out) in c[..count_n].iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for k_blk in 0..block_count_k {
            let k0 = k_blk * blk_len;
            let a_blk = if k0 + blk_len <= count_k { &a[k0..k0 + blk_len] } else { &tail[..blk_len] };
            let idx = n * stride + k_blk;
            let scale = quant_b.scale[idx];
            if scale == 0.0 {
                continue;
            }
            let packed = &quant_b.data[idx * blk_bytes..(idx + 1) * blk_bytes];
            let zp = zero_point_f32(quant_b, BitWidth::Four, n, k_blk);
            acc += scale * dot_f32_q4_blk::<D>(a_blk, packed, blk_len, zp);
        }
        *out = acc + bias.map_or(0.0, |b| b[n]);
    }
}

/// Dequantize `count_n` columns into 16-column panels:
/// `fp_data[(panel * k_pad + k) * 16 + lane]` with `k_pad = block_count_k * blk_len`.
/// Lanes past `count_n` are zero.
pub fn sq4bit_blk_dequant_b_for_sgemm_comp_fp32(
    blk_len: usize,
    fp_data: &mut [f32],
    quant_b: &QuantBColumns<'_, f32>,
    count_n: usize,
    count_k: usize,
) {
    let block_count_k = layout::block_count_k(count_k, blk_len);
    let k_pad = block_count_k * blk_len;
    let panel_len = k_pad * BLK_SUM_PANEL_N;
    let blk_bytes = layout::blk_data_size_in_bytes(BitWidth::Four, blk_len);
    let panels = layout::div_round_up(count_n, BLK_SUM_PANEL_N);
    debug_assert!(fp_data.len() >= panels * panel_len);

    let mut codes = [0u8; MAX_BLK_LEN];
    for (p, panel) in fp_data[..panels * panel_len].chunks_exact_mut(panel_len).enumerate() {
        panel.fill(0.0);
        let lanes = (count_n - p * BLK_SUM_PANEL_N).min(BLK_SUM_PANEL_N);
        for lane in 0..lanes {
            let n = p * BLK_SUM_PANEL_N + lane;
            for k_blk in 0..block_count_k {
                let idx = n * quant_b.block_stride + k_blk;
                let scale = quant_b.scale[idx];
                let zp = zero_point_f32(quant_b, BitWidth::Four, n, k_blk);
                unpack_q4_blk(&quant_b.data[idx * blk_bytes..(idx + 1) * blk_bytes], blk_len, &mut codes);
                for (i, &q) in codes[..blk_len].iter().enumerate() {
                    panel[(k_blk * blk_len + i) * BLK_SUM_PANEL_N + lane] = scale * (q as f32 - zp);
                }
            }
        }
    }
}

/// `C = A * B (+ bias)`, or `C += A * B` when `accumulate`, with B in
/// 16-column panels of `ldb_k` rows each.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sgemm_panel16(
    a: &[f32],
    lda: usize,
    b_panels: &[f32],
    ldb_k: usize,
    c: &mut [f32],
    ldc: usize,
    count_m: usize,
    count_n: usize,
    count_k: usize,
    bias: Option<&[f32]>,
    accumulate: bool,
) {
    let panels = layout::div_round_up(count_n, BLK_SUM_PANEL_N);
    for m in 0..count_m {
        let a_row = &a[m * lda..m * lda + count_k];
        for p in 0..panels {
            let panel = &b_panels[p * ldb_k * BLK_SUM_PANEL_N..];
            let mut acc = [0.0f32; BLK_SUM_PANEL_N];
            for (k, &av) in a_row.iter().enumerate() {
                if av == 0.0 {
                    continue;
                }
                let b_row = &panel[k * BLK_SUM_PANEL_N..(k + 1) * BLK_SUM_PANEL_N];
                for (acc_l, &b) in acc.iter_mut().zip(b_row) {
                    *acc_l += av * b;
                }
            }

            let n0 = p * BLK_SUM_PANEL_N;
            let lanes = (count_n - n0).min(BLK_SUM_PANEL_N);
            let c_row = &mut c[m * ldc + n0..m * ldc + n0 + lanes];
            for (lane, out) in c_row.iter_mut().enumerate() {
                let v = acc[lane] + bias.map_or(0.0, |b| b[n0 + lane]);
                if accumulate {
                    *out += v;
                } else {
                    *out = v;
                }
            }
        }
    }
}
