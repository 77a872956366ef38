//! Facade re-exports for rustml-qnbit

pub use crate::api::error::*;
pub use crate::api::traits::*;
pub use crate::api::types::*;
pub use crate::core::blockwise::{dequantize_b_blockwise, quantize_b_blockwise, QuantizedMatrix};
pub use crate::core::dispatch::{dispatch_for, qnbit_dispatch};
pub use crate::core::gemm::{
    is_qnbit_gemm_available, qnbit_gemm, qnbit_gemm_batch, GemmDataParams, QnbitGemm, QnbitGemmParams,
};
pub use crate::core::layout::{
    blk_data_size_in_bytes, blk_sum_index, blk_sum_len, block_count_k, q8_blk_size, sub_blk_len,
    zero_points_size_in_bytes, BLK_SUM_PANEL_N, PACKED_DATA_ALIGNMENT,
};
pub use crate::core::packed::PackedQuantBLayout;
pub use crate::core::runtime::{OptProfile, PackedInt8Policy, RuntimeConfig};
pub use crate::core::workspace::{batch_workspace_size, per_gemm_workspace_alignment, per_gemm_workspace_size};
