//! # RustML QnBit
//!
//! Block-quantized n-bit GEMM: `C = A * B (+ bias)` with dense f32/f16
//! activations and 4-bit or 8-bit block-quantized weights.
//!
//! ## Features
//!
//! - Offline block quantization of B with optional per-block zero points
//! - Packing of B into a SIMD-friendly layout with precomputed block sums
//! - On-the-fly int8 quantization of A for integer dot products
//! - Kernel tables per instruction set (scalar, AVX2, NEON), probed once
//!
//! ## Example
//!
//! ```rust
//! use rustml_qnbit::{
//!     quantize_b_blockwise, BitWidth, ComputeType, GemmDataParams, QnbitGemm, QnbitGemmParams, QuantScheme,
//! };
//!
//! let (m, n, k) = (2, 8, 64);
//! let b: Vec<f32> = (0..k * n).map(|i| (i % 7) as f32 - 3.0).collect();
//! let scheme = QuantScheme::new(BitWidth::Four, 32, false).unwrap();
//! let quant_b = quantize_b_blockwise(&b, k, n, scheme).unwrap();
//!
//! let gemm = QnbitGemm::new();
//! let size = gemm.pack_quant_b_data_size(n, k, &scheme, ComputeType::Fp32).unwrap();
//! let mut packed = vec![0u8; size];
//! gemm.pack_quant_b_data(n, k, &scheme, ComputeType::Fp32, &quant_b.columns(), &mut packed).unwrap();
//!
//! let a = vec![0.5f32; m * k];
//! let mut c = vec![0.0f32; m * n];
//! let params = QnbitGemmParams { m, n, k, scheme, compute_type: ComputeType::Fp32 };
//! let mut data = GemmDataParams {
//!     a: &a,
//!     lda: k,
//!     packed_b: &packed,
//!     scale: &quant_b.scale,
//!     zero_point: None,
//!     bias: None,
//!     c: &mut c,
//!     ldc: n,
//! };
//! gemm.gemm_f32(&params, &mut data, None).unwrap();
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
