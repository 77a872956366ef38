//! Packing of quantized B into the kernel layout.

use rayon::prelude::*;

use crate::api::types::{BitWidth, ComputeType, PackedQuantBMut, QuantBColumns};
use crate::core::layout;
use crate::core::packed::PackedQuantBLayout;

pub fn q4bit_gemm_pack_quant_b_data_size(
    n: usize,
    k: usize,
    blk_len: usize,
    _has_zero_point: bool,
    compute_type: ComputeType,
) -> usize {
    let block_count_k = layout::block_count_k(k, blk_len);
    match compute_type {
        ComputeType::Int8 => PackedQuantBLayout::required_size(n, block_count_k, blk_len, BitWidth::Four),
        ComputeType::Fp32 | ComputeType::Fp16 => {
            n * block_count_k * layout::blk_data_size_in_bytes(BitWidth::Four, blk_len)
        }
    }
}

/// 8-bit B is only packed for the int8 compute type; 0 means unsupported.
pub fn q8bit_gemm_pack_quant_b_data_size(
    n: usize,
    k: usize,
    blk_len: usize,
    _has_zero_point: bool,
    compute_type: ComputeType,
) -> usize {
    match compute_type {
        ComputeType::Int8 => {
            let block_count_k = layout::block_count_k(k, blk_len);
            PackedQuantBLayout::required_size(n, block_count_k, blk_len, BitWidth::Eight)
        }
        ComputeType::Fp32 | ComputeType::Fp16 => 0,
    }
}

/// Reorder one 4-bit block from raw order (value `i` in byte `i / 2`, even
/// values in the low nibble) into sub-block order.
fn pack_q4_blk(src: &[u8], dst: &mut [u8], blk_len: usize) {
    let sub = layout::sub_blk_len(blk_len);
    let half = sub / 2;
    let raw_value = |i: usize| (src[i / 2] >> ((i & 1) * 4)) & 0x0F;
    for (s, out) in dst[..blk_len / 2].chunks_exact_mut(half).enumerate() {
        let base = s * sub;
        for (j, byte) in out.iter_mut().enumerate() {
            *byte = raw_value(base + j) | (raw_value(base + j + half) << 4);
        }
    }
}

/// Reorder column-major raw 4-bit B into the packed sub-block layout.
pub fn q4bit_pack_quant_b_data(n: usize, k: usize, blk_len: usize, quant_b_data: &[u8], packed: &mut [u8]) {
    let block_count_k = layout::block_count_k(k, blk_len);
    let blk_bytes = layout::blk_data_size_in_bytes(BitWidth::Four, blk_len);
    let col_bytes = block_count_k * blk_bytes;
    debug_assert!(quant_b_data.len() >= n * col_bytes);
    debug_assert!(packed.len() >= n * col_bytes);
    if col_bytes == 0 {
        return;
    }

    packed[..n * col_bytes]
        .par_chunks_mut(col_bytes)
        .zip(quant_b_data[..n * col_bytes].par_chunks(col_bytes))
        .for_each(|(dst_col, src_col)| {
            for (dst, src) in dst_col.chunks_exact_mut(blk_bytes).zip(src_col.chunks_exact(blk_bytes)) {
                pack_q4_blk(src, dst, blk_len);
            }
        });
}

/// Copy scales and write `-scale * zero_point` into the 16-column block-sum panels.
fn pack_scales_and_blk_sums(quant_b: &QuantBColumns<'_, f32>, packed: &mut PackedQuantBMut<'_>) {
    let shape = packed.shape;
    let blocks = shape.n * shape.block_count_k;
    packed.scale[..blocks].copy_from_slice(&quant_b.scale[..blocks]);

    // padding columns of the last panel contribute nothing
    packed.blk_sum.fill(0.0);
    for n in 0..shape.n {
        for k_blk in 0..shape.block_count_k {
            let scale = quant_b.scale[n * shape.block_count_k + k_blk];
            let zero_point = quant_b.zero_point_at(shape.bit_width, n, k_blk) as f32;
            packed.blk_sum[layout::blk_sum_index(n, k_blk, shape.block_count_k)] = -scale * zero_point;
        }
    }
}

pub fn sq4bit_gemm_pack_quant_b_data_and_blk_sum(quant_b: &QuantBColumns<'_, f32>, packed: &mut PackedQuantBMut<'_>) {
    let shape = packed.shape;
    debug_assert_eq!(shape.bit_width, BitWidth::Four);
    let k = shape.block_count_k * shape.blk_len;
    q4bit_pack_quant_b_data(shape.n, k, shape.blk_len, quant_b.data, packed.data);
    pack_scales_and_blk_sums(quant_b, packed);
}

/// 8-bit data keeps its column-major order.
pub fn sq8bit_gemm_pack_quant_b_data_and_blk_sum(quant_b: &QuantBColumns<'_, f32>, packed: &mut PackedQuantBMut<'_>) {
    let shape = packed.shape;
    debug_assert_eq!(shape.bit_width, BitWidth::Eight);
    let len = shape.n * shape.block_count_k * shape.blk_len;
    packed.data[..len].copy_from_slice(&quant_b.data[..len]);
    pack_scales_and_blk_sums(quant_b, packed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::PackedQuantBShape;
    use crate::core::kernels::unpack_q4_blk;

    fn raw_pack(values: &[u8]) -> Vec<u8> {
        values.chunks(2).map(|p| p[0] | (p[1] << 4)).collect()
    }

    #[test]
    fn test_pack_roundtrips_through_unpack() {
        for blk_len in [4usize, 16, 32, 64, 128] {
            let values: Vec<u8> = (0..blk_len * 2).map(|i| (i * 5 % 16) as u8).collect();
            let raw = raw_pack(&values);
            let mut packed = vec![0u8; raw.len()];
            // one column, two blocks
            q4bit_pack_quant_b_data(1, blk_len * 2, blk_len, &raw, &mut packed);
            let mut out = vec![0u8; blk_len];
            for blk in 0..2 {
                let bytes = &packed[blk * blk_len / 2..(blk + 1) * blk_len / 2];
                unpack_q4_blk(bytes, blk_len, &mut out);
                assert_eq!(&out[..], &values[blk * blk_len..(blk + 1) * blk_len], "blk_len {}", blk_len);
            }
        }
    }

    #[test]
    fn test_blk_sum_is_negative_scale_times_zero_point() {
        let (n, block_count_k, blk_len) = (18usize, 2usize, 16usize);
        let raw = vec![0x88u8; n * block_count_k * blk_len / 2];
        let scale: Vec<f32> = (0..n * block_count_k).map(|i| 0.1 + i as f32 * 0.01).collect();
        // zero points 0..15 cycling, two per byte
        let zp: Vec<u8> = (0..n).map(|c| ((c % 16) as u8) | ((((c + 3) % 16) as u8) << 4)).collect();
        let quant_b = QuantBColumns { data: &raw, scale: &scale, zero_point: Some(&zp[..]), block_stride: block_count_k };

        let shape = PackedQuantBShape { n, block_count_k, blk_len, bit_width: BitWidth::Four };
        let size = q4bit_gemm_pack_quant_b_data_size(n, block_count_k * blk_len, blk_len, true, ComputeType::Int8);
        let mut buf = vec![0u8; size];
        let regions = PackedQuantBLayout::for_buffer(&buf, shape).unwrap();
        let mut views = regions.split_mut(&mut buf).unwrap();
        sq4bit_gemm_pack_quant_b_data_and_blk_sum(&quant_b, &mut views);

        for c in 0..n {
            for k_blk in 0..block_count_k {
                let expected_zp = (if k_blk == 0 { c % 16 } else { (c + 3) % 16 }) as f32;
                let s = scale[c * block_count_k + k_blk];
                let got = views.blk_sum[layout::blk_sum_index(c, k_blk, block_count_k)];
                assert!((got + s * expected_zp).abs() < 1e-6);
                assert_eq!(views.scale[c * block_count_k + k_blk], s);
            }
        }
        // columns 18..32 of the second panel stay zero
        assert_eq!(views.blk_sum[layout::blk_sum_index(20, 1, block_count_k)], 0.0);
    }

    #[test]
    fn test_eight_bit_default_zero_point() {
        let (n, block_count_k, blk_len) = (2usize, 1usize, 32usize);
        let raw: Vec<u8> = (0..64).collect();
        let scale = [0.5f32, 2.0];
        let quant_b = QuantBColumns { data: &raw, scale: &scale, zero_point: None, block_stride: block_count_k };
        let shape = PackedQuantBShape { n, block_count_k, blk_len, bit_width: BitWidth::Eight };
        let size = q8bit_gemm_pack_quant_b_data_size(n, 32, blk_len, false, ComputeType::Int8);
        let mut buf = vec![0u8; size];
        let regions = PackedQuantBLayout::for_buffer(&buf, shape).unwrap();
        let mut views = regions.split_mut(&mut buf).unwrap();
        sq8bit_gemm_pack_quant_b_data_and_blk_sum(&quant_b, &mut views);
        assert_eq!(views.data, &raw[..]);
        assert_eq!(views.blk_sum[0], -0.5 * 128.0);
        assert_eq!(views.blk_sum[1], -2.0 * 128.0);
    }

    #[test]
    fn test_float_pack_size_is_raw_size() {
        assert_eq!(q4bit_gemm_pack_quant_b_data_size(3, 70, 32, false, ComputeType::Fp32), 3 * 3 * 16);
        assert_eq!(q8bit_gemm_pack_quant_b_data_size(3, 70, 32, false, ComputeType::Fp16), 0);
    }
}
