//! fp16 compute path. Accumulation happens in f32.

use half::f16;

use crate::api::types::{BitWidth, QuantBColumns, MAX_BLK_LEN};
use crate::core::kernels::{unpack_q4_blk, zero_point_f32};
use crate::core::layout;

/// Dequantize `count_n` columns into column-major f16, `ldb = block_count_k * blk_len`.
pub fn hq4bit_blk_dequant_b_for_hgemm_comp_fp16(
    blk_len: usize,
    fp_data: &mut [f16],
    quant_b: &QuantBColumns<'_, f16>,
    count_n: usize,
    count_k: usize,
) {
    let block_count_k = layout::block_count_k(count_k, blk_len);
    let ldb = block_count_k * blk_len;
    let blk_bytes = layout::blk_data_size_in_bytes(BitWidth::Four, blk_len);
    if ldb == 0 {
        return;
    }
    debug_assert!(fp_data.len() >= count_n * ldb);

    let mut codes = [0u8; MAX_BLK_LEN];
    for (n, column) in fp_data[..count_n * ldb].chunks_exact_mut(ldb).enumerate() {
        for (k_blk, out) in column.chunks_exact_mut(blk_len).enumerate() {
            let idx = n * quant_b.block_stride + k_blk;
            let scale = quant_b.scale[idx].to_f32();
            let zp = zero_point_f32(quant_b, BitWidth::Four, n, k_blk);
            unpack_q4_blk(&quant_b.data[idx * blk_bytes..(idx + 1) * blk_bytes], blk_len, &mut codes);
            for (v, &q) in out.iter_mut().zip(&codes[..blk_len]) {
                *v = f16::from_f32(scale * (q as f32 - zp));
            }
        }
    }
}

/// `C = A * B (+ bias)` with column-major B.
#[allow(clippy::too_many_arguments)]
pub fn hq4bit_gemm_kernel_comp_fp16(
    a: &[f16],
    b: &[f16],
    bias: Option<&[f16]>,
    c: &mut [f16],
    count_m: usize,
    count_n: usize,
    count_k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
) {
    for m in 0..count_m {
        let a_row = &a[m * lda..m * lda + count_k];
        let c_row = &mut c[m * ldc..m * ldc + count_n];
        for (n, out) in c_row.iter_mut().enumerate() {
            let b_col = &b[n * ldb..n * ldb + count_k];
            let mut acc: f32 = a_row.iter().zip(b_col).map(|(x, y)| x.to_f32() * y.to_f32()).sum();
            if let Some(bias) = bias {
                acc += bias[n].to_f32();
            }
            *out = f16::from_f32(acc);
        }
    }
}
