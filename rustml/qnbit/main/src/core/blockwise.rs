//! Offline block quantization of the weight matrix.
//!
//! B arrives row-major `k x n` in f32 and is stored column-major: each of the
//! `n` columns is cut into `block_count_k` blocks of `blk_len` values along K,
//! each block with one scale and, for asymmetric schemes, one zero point.
//! 4-bit values are nibble-packed with even values in the low nibble. A
//! partial last block is padded with the zero point so padding dequantizes
//! to zero.

use half::f16;
use rayon::prelude::*;

use crate::api::error::{QnbitError, QnbitResult};
use crate::api::types::{BitWidth, QuantBColumns, QuantScheme};
use crate::core::layout;

/// Column-major block-quantized B, as produced by [`quantize_b_blockwise`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix {
    pub n: usize,
    pub k: usize,
    pub scheme: QuantScheme,
    /// `n * block_count_k` blocks of `blk_data_size` bytes.
    pub data: Vec<u8>,
    /// `n * block_count_k` scales.
    pub scale: Vec<f32>,
    /// `n * zero_points_size_in_bytes(block_count_k)` bytes when the scheme has zero points.
    pub zero_point: Option<Vec<u8>>,
}

impl QuantizedMatrix {
    /// Wraps externally quantized data after checking every length.
    pub fn from_parts(
        n: usize,
        k: usize,
        scheme: QuantScheme,
        data: Vec<u8>,
        scale: Vec<f32>,
        zero_point: Option<Vec<u8>>,
    ) -> QnbitResult<Self> {
        QuantScheme::validate_blk_len(scheme.blk_len)?;
        let block_count_k = scheme.block_count_k(k);
        let expect = |what: &'static str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(QnbitError::ShapeMismatch { what, expected, actual })
            }
        };
        expect("quant B data", n * block_count_k * scheme.blk_data_size(), data.len())?;
        expect("quant B scale", n * block_count_k, scale.len())?;
        match (&zero_point, scheme.has_zero_point) {
            (Some(zp), true) => expect(
                "zero points",
                n * layout::zero_points_size_in_bytes(scheme.bit_width, block_count_k),
                zp.len(),
            )?,
            (None, false) => {}
            (Some(_), false) => {
                return Err(QnbitError::InvalidData("zero points given for a symmetric scheme".into()))
            }
            (None, true) => return Err(QnbitError::InvalidData("asymmetric scheme without zero points".into())),
        }
        Ok(Self { n, k, scheme, data, scale, zero_point })
    }

    #[inline]
    pub fn block_count_k(&self) -> usize {
        self.scheme.block_count_k(self.k)
    }

    /// Kernel view over the raw (unpacked) data.
    pub fn columns(&self) -> QuantBColumns<'_, f32> {
        QuantBColumns {
            data: &self.data,
            scale: &self.scale,
            zero_point: self.zero_point.as_deref(),
            block_stride: self.block_count_k(),
        }
    }

    /// Scales as f16, for the fp16 compute path.
    pub fn scales_f16(&self) -> Vec<f16> {
        self.scale.iter().map(|&s| f16::from_f32(s)).collect()
    }

    /// Unsigned code of value `kk` in column `col`.
    fn code(&self, col: usize, kk: usize) -> u8 {
        let k_blk = kk / self.scheme.blk_len;
        let idx = col * self.block_count_k() + k_blk;
        let within = kk % self.scheme.blk_len;
        let blk = &self.data[idx * self.scheme.blk_data_size()..];
        match self.scheme.bit_width {
            BitWidth::Four => (blk[within / 2] >> ((within & 1) * 4)) & 0x0F,
            BitWidth::Eight => blk[within],
        }
    }
}

/// Block-quantize row-major `k x n` B.
///
/// Symmetric schemes (`has_zero_point == false`) map the value of largest
/// magnitude to code 0 around the implicit midpoint zero point. Asymmetric
/// schemes span `[min(0, min), max(0, max)]` with a per-block zero point.
pub fn quantize_b_blockwise(b: &[f32], k: usize, n: usize, scheme: QuantScheme) -> QnbitResult<QuantizedMatrix> {
    QuantScheme::validate_blk_len(scheme.blk_len)?;
    if b.len() < k * n {
        return Err(QnbitError::ShapeMismatch { what: "B", expected: k * n, actual: b.len() });
    }

    let block_count_k = scheme.block_count_k(k);
    let zp_bytes = layout::zero_points_size_in_bytes(scheme.bit_width, block_count_k);
    let columns: Vec<(Vec<u8>, Vec<f32>, Vec<u8>)> =
        (0..n).into_par_iter().map(|col| quantize_column(b, k, n, col, &scheme)).collect();

    let mut data = Vec::with_capacity(n * block_count_k * scheme.blk_data_size());
    let mut scale = Vec::with_capacity(n * block_count_k);
    let mut zero_point = Vec::with_capacity(n * zp_bytes);
    for (d, s, zp) in columns {
        data.extend_from_slice(&d);
        scale.extend_from_slice(&s);
        zero_point.extend_from_slice(&zp);
    }

    Ok(QuantizedMatrix {
        n,
        k,
        scheme,
        data,
        scale,
        zero_point: scheme.has_zero_point.then_some(zero_point),
    })
}

fn quantize_column(b: &[f32], k: usize, n: usize, col: usize, scheme: &QuantScheme) -> (Vec<u8>, Vec<f32>, Vec<u8>) {
    let blk_len = scheme.blk_len;
    let bit_width = scheme.bit_width;
    let block_count_k = scheme.block_count_k(k);
    let max_code = bit_width.max_code() as f32;

    let mut data = vec![0u8; block_count_k * scheme.blk_data_size()];
    let mut scales = vec![0.0f32; block_count_k];
    let mut zero_points = vec![0u8; layout::zero_points_size_in_bytes(bit_width, block_count_k)];
    let mut values = [0.0f32; crate::api::types::MAX_BLK_LEN];

    for k_blk in 0..block_count_k {
        let k0 = k_blk * blk_len;
        let len = (k - k0).min(blk_len);
        for (i, v) in values[..len].iter_mut().enumerate() {
            *v = b[(k0 + i) * n + col];
        }
        let values = &values[..len];

        let (scale, zp) = if scheme.has_zero_point {
            let min = values.iter().fold(0.0f32, |acc, &v| acc.min(v));
            let max = values.iter().fold(0.0f32, |acc, &v| acc.max(v));
            let scale = (max - min) / max_code;
            let zp = if scale == 0.0 { 0.0 } else { (-min / scale).round().clamp(0.0, max_code) };
            (scale, zp as u8)
        } else {
            // signed value of largest magnitude lands on code 0
            let extreme = values.iter().fold(0.0f32, |acc, &v| if v.abs() > acc.abs() { v } else { acc });
            let zp = bit_width.default_zero_point();
            (extreme / -(zp as f32), zp)
        };
        let inv_scale = if scale == 0.0 { 0.0 } else { 1.0 / scale };

        let blk = &mut data[k_blk * scheme.blk_data_size()..(k_blk + 1) * scheme.blk_data_size()];
        for i in 0..blk_len {
            let code = match values.get(i) {
                Some(&v) => ((v * inv_scale).round() + zp as f32).clamp(0.0, max_code) as u8,
                None => zp,
            };
            match bit_width {
                BitWidth::Four => blk[i / 2] |= code << ((i & 1) * 4),
                BitWidth::Eight => blk[i] = code,
            }
        }

        scales[k_blk] = scale;
        match bit_width {
            BitWidth::Four => zero_points[k_blk / 2] |= zp << ((k_blk & 1) * 4),
            BitWidth::Eight => zero_points[k_blk] = zp,
        }
    }
    (data, scales, zero_points)
}

/// Row-major `k x n` reconstruction of `matrix`.
pub fn dequantize_b_blockwise(matrix: &QuantizedMatrix) -> Vec<f32> {
    let (k, n) = (matrix.k, matrix.n);
    let block_count_k = matrix.block_count_k();
    let cols = matrix.columns();
    let mut out = vec![0.0f32; k * n];
    for (kk, row) in out.chunks_exact_mut(n.max(1)).take(k).enumerate() {
        let k_blk = kk / matrix.scheme.blk_len;
        for (col, v) in row.iter_mut().enumerate() {
            let scale = matrix.scale[col * block_count_k + k_blk];
            let zp = cols.zero_point_at(matrix.scheme.bit_width, col, k_blk) as f32;
            *v = scale * (matrix.code(col, kk) as f32 - zp);
        }
    }
    out
}
