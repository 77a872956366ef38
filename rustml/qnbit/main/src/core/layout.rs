//! Block-quantization layout rules.
//!
//! Pure size and alignment arithmetic shared by the packed-weight builder,
//! the workspace sizing and every kernel. Nothing here touches memory.

use crate::api::types::BitWidth;

/// Required alignment of the packed quantized B data region.
///
/// 256-bit aligned loads on x86_64 need a 32-byte boundary; other targets
/// use the buffer base unmodified.
#[cfg(target_arch = "x86_64")]
pub const PACKED_DATA_ALIGNMENT: usize = 32;
#[cfg(not(target_arch = "x86_64"))]
pub const PACKED_DATA_ALIGNMENT: usize = 1;

/// Number of B columns that share one block-sum panel.
pub const BLK_SUM_PANEL_N: usize = 16;

/// Alignment of the block-sum array: one 16-lane f32 panel row.
#[inline]
pub const fn blk_sum_alignment() -> usize {
    BLK_SUM_PANEL_N * std::mem::size_of::<f32>()
}

/// Bytes of quantized data in one block of `blk_len` values.
#[inline]
pub const fn blk_data_size_in_bytes(bit_width: BitWidth, blk_len: usize) -> usize {
    debug_assert!((blk_len * bit_width.bits()) % 8 == 0);
    blk_len * bit_width.bits() / 8
}

/// Bytes needed to store `blk_count` zero points.
///
/// 4-bit zero points are packed two per byte (even block in the low nibble),
/// 8-bit zero points take a full byte each.
#[inline]
pub const fn zero_points_size_in_bytes(bit_width: BitWidth, blk_count: usize) -> usize {
    match bit_width {
        BitWidth::Four => div_round_up(blk_count, 2),
        BitWidth::Eight => blk_count,
    }
}

#[inline]
pub const fn div_round_up(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Number of quantization blocks along K.
#[inline]
pub const fn block_count_k(k: usize, blk_len: usize) -> usize {
    div_round_up(k, blk_len)
}

/// Size of one quantized-A block in the interleaved layout: an f32 scale
/// followed by `blk_len` i8 values.
#[inline]
pub const fn q8_blk_size(blk_len: usize) -> usize {
    std::mem::size_of::<f32>() + blk_len
}

/// Number of values the kernels process per packed 4-bit sub-block.
///
/// Blocks up to 64 values are packed whole; longer blocks are split into
/// 64-value sub-blocks.
#[inline]
pub const fn sub_blk_len(blk_len: usize) -> usize {
    if blk_len < 64 {
        blk_len
    } else {
        64
    }
}

/// Number of f32 entries in the block-sum array for `n` columns.
#[inline]
pub const fn blk_sum_len(n: usize, block_count_k: usize) -> usize {
    div_round_up(n, BLK_SUM_PANEL_N) * BLK_SUM_PANEL_N * block_count_k
}

/// Index of the block sum for column `n`, block `k_blk` in the 16-column
/// panel layout.
#[inline]
pub const fn blk_sum_index(n: usize, k_blk: usize, block_count_k: usize) -> usize {
    ((n / BLK_SUM_PANEL_N) * block_count_k + k_blk) * BLK_SUM_PANEL_N + n % BLK_SUM_PANEL_N
}
