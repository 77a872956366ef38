pub mod arena;
pub mod blockwise;
pub mod dispatch;
pub mod gemm;
pub mod kernels;
pub mod layout;
pub mod packed;
pub mod runtime;
pub mod workspace;
