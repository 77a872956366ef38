//! Core types for block-quantized GEMM.

use crate::api::error::{QnbitError, QnbitResult};
use crate::core::layout;

/// Smallest supported number of values per quantization block.
pub const MIN_BLK_LEN: usize = 4;

/// Largest supported number of values per quantization block.
pub const MAX_BLK_LEN: usize = 256;

/// Upper bound on rows handled by one call of the row-count-returning int8 kernel.
pub const INT8_KERNEL_TILE_M: usize = 4;

/// Bit width of the quantized B values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitWidth {
    Four,
    Eight,
}

impl BitWidth {
    #[inline]
    pub const fn bits(self) -> usize {
        match self {
            BitWidth::Four => 4,
            BitWidth::Eight => 8,
        }
    }

    pub fn from_bits(bits: usize) -> QnbitResult<Self> {
        match bits {
            4 => Ok(BitWidth::Four),
            8 => Ok(BitWidth::Eight),
            other => Err(QnbitError::InvalidBitWidth(other)),
        }
    }

    /// Largest unsigned code: 15 or 255.
    #[inline]
    pub const fn max_code(self) -> u8 {
        match self {
            BitWidth::Four => 0x0F,
            BitWidth::Eight => 0xFF,
        }
    }

    /// Zero point implied when a matrix carries none: the code midpoint,
    /// so codes are read as symmetric signed values.
    #[inline]
    pub const fn default_zero_point(self) -> u8 {
        match self {
            BitWidth::Four => 8,
            BitWidth::Eight => 128,
        }
    }
}

impl std::fmt::Display for BitWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Activation precision used for one GEMM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeType {
    /// f32 activations against dequantized weights.
    Fp32,
    /// f16 activations against dequantized weights.
    Fp16,
    /// Activations block-quantized to i8 on the fly, integer dot products.
    Int8,
}

impl ComputeType {
    pub const ALL: [ComputeType; 3] = [ComputeType::Fp32, ComputeType::Fp16, ComputeType::Int8];
}

impl std::fmt::Display for ComputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeType::Fp32 => write!(f, "fp32"),
            ComputeType::Fp16 => write!(f, "fp16"),
            ComputeType::Int8 => write!(f, "int8"),
        }
    }
}

/// CPU instruction set a kernel table is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scalar,
    Avx2,
    Neon,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Scalar, Capability::Avx2, Capability::Neon];
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Scalar => write!(f, "scalar"),
            Capability::Avx2 => write!(f, "AVX2"),
            Capability::Neon => write!(f, "NEON"),
        }
    }
}

/// How B was quantized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantScheme {
    pub bit_width: BitWidth,
    pub blk_len: usize,
    pub has_zero_point: bool,
}

impl QuantScheme {
    pub fn new(bit_width: BitWidth, blk_len: usize, has_zero_point: bool) -> QnbitResult<Self> {
        Self::validate_blk_len(blk_len)?;
        Ok(Self { bit_width, blk_len, has_zero_point })
    }

    pub fn validate_blk_len(blk_len: usize) -> QnbitResult<()> {
        if !blk_len.is_power_of_two() || !(MIN_BLK_LEN..=MAX_BLK_LEN).contains(&blk_len) {
            return Err(QnbitError::InvalidBlockLength {
                blk_len,
                min: MIN_BLK_LEN,
                max: MAX_BLK_LEN,
            });
        }
        Ok(())
    }

    #[inline]
    pub const fn blk_data_size(&self) -> usize {
        layout::blk_data_size_in_bytes(self.bit_width, self.blk_len)
    }

    #[inline]
    pub const fn block_count_k(&self, k: usize) -> usize {
        layout::block_count_k(k, self.blk_len)
    }
}

/// Column-major block-quantized B as the compute kernels read it.
///
/// Column `n`, block `k_blk` starts at byte `(n * block_stride + k_blk) * blk_data_size`
/// of `data`; its scale is `scale[n * block_stride + k_blk]`. Zero points, when
/// present, use `zero_points_size_in_bytes(bit_width, block_stride)` bytes per column.
#[derive(Debug, Clone, Copy)]
pub struct QuantBColumns<'a, S> {
    pub data: &'a [u8],
    pub scale: &'a [S],
    pub zero_point: Option<&'a [u8]>,
    /// Number of blocks between adjacent columns (`block_count_k`).
    pub block_stride: usize,
}

impl<'a, S> QuantBColumns<'a, S> {
    /// View starting at column `n_start`.
    pub fn offset_columns(&self, bit_width: BitWidth, blk_len: usize, n_start: usize) -> Self {
        let blk_data = layout::blk_data_size_in_bytes(bit_width, blk_len);
        let zp_stride = layout::zero_points_size_in_bytes(bit_width, self.block_stride);
        Self {
            data: &self.data[n_start * self.block_stride * blk_data..],
            scale: &self.scale[n_start * self.block_stride..],
            zero_point: self.zero_point.map(|zp| &zp[n_start * zp_stride..]),
            block_stride: self.block_stride,
        }
    }

    /// View starting at block `k_blk_start` of every column. 4-bit zero points
    /// pack two blocks per byte, so the start must be even for them.
    pub fn offset_blocks(&self, bit_width: BitWidth, blk_len: usize, k_blk_start: usize) -> Self {
        debug_assert!(bit_width == BitWidth::Eight || self.zero_point.is_none() || k_blk_start % 2 == 0);
        let blk_data = layout::blk_data_size_in_bytes(bit_width, blk_len);
        Self {
            data: &self.data[k_blk_start * blk_data..],
            scale: &self.scale[k_blk_start..],
            zero_point: self.zero_point.map(|zp| &zp[layout::zero_points_size_in_bytes(bit_width, k_blk_start)..]),
            block_stride: self.block_stride,
        }
    }

    /// Zero point of column `n`, block `k_blk`; the bit width's midpoint when absent.
    #[inline]
    pub fn zero_point_at(&self, bit_width: BitWidth, n: usize, k_blk: usize) -> u8 {
        match self.zero_point {
            None => bit_width.default_zero_point(),
            Some(zp) => {
                let stride = layout::zero_points_size_in_bytes(bit_width, self.block_stride);
                match bit_width {
                    BitWidth::Four => {
                        let byte = zp[n * stride + k_blk / 2];
                        (byte >> ((k_blk & 1) * 4)) & 0x0F
                    }
                    BitWidth::Eight => zp[n * stride + k_blk],
                }
            }
        }
    }
}

/// Quantized A in the separated layout used by the block-sum int8 kernels.
///
/// Row `m` owns `block_count_k * blk_len` values of `data` and
/// `block_count_k` entries of `scale` and `blk_sum`.
#[derive(Debug, Clone, Copy)]
pub struct QuantABlkSum<'a> {
    pub data: &'a [i8],
    pub scale: &'a [f32],
    /// `scale * sum(quantized values)` per block.
    pub blk_sum: &'a [f32],
}

#[derive(Debug)]
pub struct QuantABlkSumMut<'a> {
    pub data: &'a mut [i8],
    pub scale: &'a mut [f32],
    pub blk_sum: &'a mut [f32],
}

impl QuantABlkSumMut<'_> {
    pub fn as_ref(&self) -> QuantABlkSum<'_> {
        QuantABlkSum { data: self.data, scale: self.scale, blk_sum: self.blk_sum }
    }
}

/// Geometry shared by the packed B views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedQuantBShape {
    pub n: usize,
    pub block_count_k: usize,
    pub blk_len: usize,
    pub bit_width: BitWidth,
}

/// Read-only views into a packed quantized B buffer.
#[derive(Debug, Clone, Copy)]
pub struct PackedQuantBRef<'a> {
    pub shape: PackedQuantBShape,
    /// Reordered quantized data, same size as the raw column-major data.
    pub data: &'a [u8],
    /// Zero-point correction terms in 16-column panels.
    pub blk_sum: &'a [f32],
    /// Column-major scales.
    pub scale: &'a [f32],
}

impl<'a> PackedQuantBRef<'a> {
    /// The packed data and scales as kernel columns. Zero points are folded
    /// into `blk_sum` and are not carried here.
    pub fn columns(&self) -> QuantBColumns<'a, f32> {
        QuantBColumns {
            data: self.data,
            scale: self.scale,
            zero_point: None,
            block_stride: self.shape.block_count_k,
        }
    }
}

/// Mutable views into a packed quantized B buffer, filled by the packing slots.
#[derive(Debug)]
pub struct PackedQuantBMut<'a> {
    pub shape: PackedQuantBShape,
    pub data: &'a mut [u8],
    pub blk_sum: &'a mut [f32],
    pub scale: &'a mut [f32],
}

impl PackedQuantBMut<'_> {
    pub fn as_ref(&self) -> PackedQuantBRef<'_> {
        PackedQuantBRef {
            shape: self.shape,
            data: self.data,
            blk_sum: self.blk_sum,
            scale: self.scale,
        }
    }
}
