mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use half::f16;

use common::{tables, Problem};
use rustml_qnbit::*;

fn scalar() -> &'static dyn QnbitKernels {
    dispatch_for(Capability::Scalar).unwrap()
}

#[test]
fn test_4x4_blk4_unit_scale_zero_point_0() {
    // column c holds codes [c, c + 1, c + 2, c + 3]; zero point 0, scale 1
    let (m, n, k) = (4usize, 4usize, 4usize);
    let codes: Vec<u8> = (0..n).flat_map(|c| (0..k).map(move |kk| (c + kk) as u8)).collect();
    let raw: Vec<u8> = codes.chunks(2).map(|p| p[0] | (p[1] << 4)).collect();
    let scheme = QuantScheme::new(BitWidth::Four, 4, true).unwrap();
    let quant_b = QuantizedMatrix::from_parts(n, k, scheme, raw, vec![1.0; n], Some(vec![0; n])).unwrap();

    let a = vec![1.0f32; m * k];
    for kernels in tables() {
        let gemm = QnbitGemm::with_kernels(kernels);
        for rows in [1usize, m] {
            let size = gemm.pack_quant_b_data_size(n, k, &scheme, ComputeType::Fp32).unwrap();
            let mut packed = vec![0u8; size];
            gemm.pack_quant_b_data(n, k, &scheme, ComputeType::Fp32, &quant_b.columns(), &mut packed).unwrap();
            let params = QnbitGemmParams { m: rows, n, k, scheme, compute_type: ComputeType::Fp32 };
            let mut c = vec![0.0f32; rows * n];
            let mut data = GemmDataParams {
                a: &a,
                lda: k,
                packed_b: &packed,
                scale: &quant_b.scale,
                zero_point: quant_b.zero_point.as_deref(),
                bias: None,
                c: &mut c,
                ldc: n,
            };
            gemm.gemm_f32(&params, &mut data, None).unwrap();
            for r in 0..rows {
                for col in 0..n {
                    assert_eq!(c[r * n + col], (4 * col + 6) as f32, "{} row {} col {}", kernels.name(), r, col);
                }
            }
        }
    }
}

#[test]
fn test_int8_4x4_blk4_zero_point_3() {
    // column c holds codes [c + 5, .., c + 8]; zero point 3, scale 1
    let (m, n, k) = (4usize, 4usize, 4usize);
    let codes: Vec<u8> = (0..n).flat_map(|c| (0..k).map(move |kk| (c + kk + 5) as u8)).collect();
    let raw: Vec<u8> = codes.chunks(2).map(|p| p[0] | (p[1] << 4)).collect();
    let scheme = QuantScheme::new(BitWidth::Four, 4, true).unwrap();
    let quant_b = QuantizedMatrix::from_parts(n, k, scheme, raw, vec![1.0; n], Some(vec![3; n])).unwrap();

    let a = vec![1.0f32; m * k];
    let params = QnbitGemmParams { m, n, k, scheme, compute_type: ComputeType::Int8 };
    for kernels in tables() {
        let gemm = QnbitGemm::with_kernels(kernels);
        let size = gemm.pack_quant_b_data_size(n, k, &scheme, ComputeType::Int8).unwrap();
        let mut packed = vec![0u8; size];
        gemm.pack_quant_b_data(n, k, &scheme, ComputeType::Int8, &quant_b.columns(), &mut packed).unwrap();
        let mut workspace = vec![0u8; gemm.batch_workspace_size(&params, 1)];
        let mut c = vec![0.0f32; m * n];
        let mut data = GemmDataParams {
            a: &a,
            lda: k,
            packed_b: &packed,
            scale: &quant_b.scale,
            zero_point: quant_b.zero_point.as_deref(),
            bias: None,
            c: &mut c,
            ldc: n,
        };
        gemm.gemm_f32(&params, &mut data, Some(&mut workspace)).unwrap();
        for r in 0..m {
            for (col, want) in [14.0f32, 18.0, 22.0, 26.0].into_iter().enumerate() {
                let got = c[r * n + col];
                assert!((got - want).abs() < 1e-3, "{} row {} col {}: {}", kernels.name(), r, col, got);
            }
        }
    }
}

#[test]
fn test_fp32_matches_reference() {
    for has_zero_point in [false, true] {
        let scheme = QuantScheme::new(BitWidth::Four, 32, has_zero_point).unwrap();
        for (m, n, k) in [(1usize, 37usize, 96usize), (5, 20, 64), (3, 17, 40)] {
            let problem = Problem::new(m, n, k, scheme, 7);
            for kernels in tables() {
                let got = problem.run_f32(&QnbitGemm::with_kernels(kernels), ComputeType::Fp32);
                problem.assert_close(&got, 1e-4);
            }
        }
    }
}

#[test]
fn test_int8_zero_point_matches_reference() {
    for blk_len in [16usize, 32, 64] {
        let scheme = QuantScheme::new(BitWidth::Four, blk_len, true).unwrap();
        let problem = Problem::new(5, 20, blk_len * 3, scheme, 11);
        for kernels in tables() {
            let got = problem.run_f32(&QnbitGemm::with_kernels(kernels), ComputeType::Int8);
            problem.assert_close(&got, 3e-2);
        }
    }
}

#[test]
fn test_int8_partial_last_block() {
    let scheme = QuantScheme::new(BitWidth::Four, 16, true).unwrap();
    let problem = Problem::new(3, 9, 40, scheme, 3);
    for kernels in tables() {
        let got = problem.run_f32(&QnbitGemm::with_kernels(kernels), ComputeType::Int8);
        problem.assert_close(&got, 3e-2);
    }
}

#[test]
fn test_eight_bit_int8() {
    for has_zero_point in [false, true] {
        let scheme = QuantScheme::new(BitWidth::Eight, 32, has_zero_point).unwrap();
        let problem = Problem::new(4, 24, 96, scheme, 5);
        for kernels in tables() {
            let gemm = QnbitGemm::with_kernels(kernels);
            let got = problem.run_f32(&gemm, ComputeType::Int8);
            problem.assert_close(&got, 3e-2);
            assert!(matches!(
                gemm.pack_quant_b_data_size(24, 96, &scheme, ComputeType::Fp32),
                Err(QnbitError::Unsupported { .. })
            ));
        }
    }
}

#[test]
fn test_fp16_matches_reference() {
    let scheme = QuantScheme::new(BitWidth::Four, 32, true).unwrap();
    let problem = Problem::new(3, 18, 64, scheme, 9);
    let a16: Vec<f16> = problem.a.iter().map(|&v| f16::from_f32(v)).collect();
    let bias16: Vec<f16> = problem.bias.iter().map(|&v| f16::from_f32(v)).collect();
    let scale16 = problem.quant_b.scales_f16();

    for kernels in tables() {
        let gemm = QnbitGemm::with_kernels(kernels);
        let packed = problem.pack(&gemm, ComputeType::Fp16);
        let mut c = vec![f16::ZERO; problem.m * problem.n];
        let mut data = GemmDataParams {
            a: &a16,
            lda: problem.k,
            packed_b: &packed,
            scale: &scale16,
            zero_point: problem.quant_b.zero_point.as_deref(),
            bias: Some(&bias16),
            c: &mut c,
            ldc: problem.n,
        };
        gemm.gemm_f16(&problem.params(ComputeType::Fp16), &mut data).unwrap();
        let got: Vec<f32> = c.iter().map(|v| v.to_f32()).collect();
        problem.assert_close(&got, 1e-2);
    }
}

#[test]
fn test_float_paths_need_no_workspace() {
    let gemm = QnbitGemm::new();
    let scheme = QuantScheme::new(BitWidth::Four, 32, false).unwrap();
    let problem = Problem::new(2, 16, 64, scheme, 1);
    let params = problem.params(ComputeType::Fp32);
    assert_eq!(gemm.per_gemm_workspace_size(&params), 0);
    assert_eq!(gemm.batch_workspace_size(&params, 4), 0);

    let packed = problem.pack(&gemm, ComputeType::Fp32);
    let mut c = vec![0.0f32; 2 * 16];
    let mut data = GemmDataParams {
        a: &problem.a,
        lda: problem.k,
        packed_b: &packed,
        scale: &problem.quant_b.scale,
        zero_point: None,
        bias: Some(&problem.bias),
        c: &mut c,
        ldc: 16,
    };
    gemm.gemm_f32(&params, &mut data, None).unwrap();
    problem.assert_close(&c, 1e-4);
}

#[test]
fn test_float_paths_long_k_without_workspace() {
    // K spans several dequantized chunks and ends in a partial block
    for (blk_len, has_zero_point) in [(16usize, true), (256, true), (64, false)] {
        let scheme = QuantScheme::new(BitWidth::Four, blk_len, has_zero_point).unwrap();
        for (m, n) in [(1usize, 20usize), (3, 18), (6, 40)] {
            let problem = Problem::new(m, n, 1100, scheme, 21 + m as u64);
            let a16: Vec<f16> = problem.a.iter().map(|&v| f16::from_f32(v)).collect();
            let bias16: Vec<f16> = problem.bias.iter().map(|&v| f16::from_f32(v)).collect();
            let scale16 = problem.quant_b.scales_f16();
            for kernels in tables() {
                let gemm = QnbitGemm::with_kernels(kernels);
                let params = problem.params(ComputeType::Fp32);
                assert_eq!(gemm.per_gemm_workspace_size(&params), 0);
                let packed = problem.pack(&gemm, ComputeType::Fp32);
                let mut c = vec![0.0f32; m * n];
                let mut data = GemmDataParams {
                    a: &problem.a,
                    lda: problem.k,
                    packed_b: &packed,
                    scale: &problem.quant_b.scale,
                    zero_point: problem.quant_b.zero_point.as_deref(),
                    bias: Some(&problem.bias),
                    c: &mut c,
                    ldc: n,
                };
                gemm.gemm_f32(&params, &mut data, None).unwrap();
                problem.assert_close(&c, 1e-4);

                let packed = problem.pack(&gemm, ComputeType::Fp16);
                let mut c16 = vec![f16::ZERO; m * n];
                let mut data = GemmDataParams {
                    a: &a16,
                    lda: problem.k,
                    packed_b: &packed,
                    scale: &scale16,
                    zero_point: problem.quant_b.zero_point.as_deref(),
                    bias: Some(&bias16),
                    c: &mut c16,
                    ldc: n,
                };
                gemm.gemm_f16(&problem.params(ComputeType::Fp16), &mut data).unwrap();
                let got: Vec<f32> = c16.iter().map(|v| v.to_f32()).collect();
                problem.assert_close(&got, 2e-2);
            }
        }
    }
}

#[test]
fn test_bias_added_once_across_repeated_runs() {
    for (compute_type, has_zero_point) in [(ComputeType::Fp32, true), (ComputeType::Int8, true), (ComputeType::Int8, false)] {
        let scheme = QuantScheme::new(BitWidth::Four, 32, has_zero_point).unwrap();
        let problem = Problem::new(5, 24, 96, scheme, 13);
        for kernels in tables() {
            let gemm = QnbitGemm::with_kernels(kernels);
            let mut c = vec![0.0f32; problem.m * problem.n];
            problem.run_f32_into(&gemm, compute_type, &mut c);
            let first = c.clone();
            problem.run_f32_into(&gemm, compute_type, &mut c);
            assert_eq!(c, first, "{} {}", kernels.name(), compute_type);
        }
    }
}

#[test]
fn test_ldc_submatrix_leaves_padding_untouched() {
    let scheme = QuantScheme::new(BitWidth::Four, 32, false).unwrap();
    let problem = Problem::new(3, 10, 64, scheme, 21);
    let ldc = 13;
    for compute_type in [ComputeType::Fp32, ComputeType::Int8] {
        let gemm = QnbitGemm::new();
        let params = problem.params(compute_type);
        let packed = problem.pack(&gemm, compute_type);
        let mut workspace = vec![0u8; gemm.batch_workspace_size(&params, 1)];
        let mut c = vec![-7.0f32; 3 * ldc];
        let mut data = GemmDataParams {
            a: &problem.a,
            lda: problem.k,
            packed_b: &packed,
            scale: &problem.quant_b.scale,
            zero_point: None,
            bias: Some(&problem.bias),
            c: &mut c,
            ldc,
        };
        gemm.gemm_f32(&params, &mut data, Some(&mut workspace)).unwrap();
        let mut dense = Vec::new();
        for r in 0..3 {
            dense.extend_from_slice(&c[r * ldc..r * ldc + 10]);
            assert!(c[r * ldc + 10..(r + 1) * ldc].iter().all(|&v| v == -7.0));
        }
        problem.assert_close(&dense, if compute_type == ComputeType::Int8 { 3e-2 } else { 1e-4 });
    }
}

#[test]
fn test_batch_uses_disjoint_workspace_regions() {
    let scheme = QuantScheme::new(BitWidth::Four, 32, true).unwrap();
    let base = Problem::new(4, 16, 64, scheme, 31);
    let gemm = QnbitGemm::new();
    let params = base.params(ComputeType::Int8);
    let packed = base.pack(&gemm, ComputeType::Int8);

    let inputs: Vec<Vec<f32>> = (0..3).map(|i| base.a.iter().map(|&v| v * (i + 1) as f32).collect()).collect();
    let mut outputs = vec![vec![0.0f32; 4 * 16]; 3];

    // start one byte in so the driver has to realign
    let size = gemm.batch_workspace_size(&params, 3);
    let mut backing = vec![0u8; size + 1];
    {
        let mut data: Vec<GemmDataParams<'_, f32>> = inputs
            .iter()
            .zip(outputs.iter_mut())
            .map(|(a, c)| GemmDataParams {
                a: a.as_slice(),
                lda: 64,
                packed_b: &packed,
                scale: &base.quant_b.scale,
                zero_point: base.quant_b.zero_point.as_deref(),
                bias: None,
                c: c.as_mut_slice(),
                ldc: 16,
            })
            .collect();
        gemm.gemm_batch_f32(&params, &mut data, Some(&mut backing[1..])).unwrap();
    }

    for (i, out) in outputs.iter().enumerate() {
        let factor = (i + 1) as f64;
        let scale = base.expected.iter().fold(0.0f64, |a, e| a.max(e.abs())) * factor;
        for (j, &g) in out.iter().enumerate() {
            let e = (base.expected[j] - base.bias[j % 16] as f64) * factor;
            assert!((g as f64 - e).abs() <= 3e-2 * scale, "gemm {} element {}", i, j);
        }
    }
}

#[test]
fn test_workspace_too_small_is_an_error() {
    let scheme = QuantScheme::new(BitWidth::Four, 32, false).unwrap();
    let problem = Problem::new(2, 8, 64, scheme, 2);
    let gemm = QnbitGemm::new();
    let params = problem.params(ComputeType::Int8);
    let packed = problem.pack(&gemm, ComputeType::Int8);
    let mut workspace = vec![0u8; gemm.per_gemm_workspace_size(&params) / 2];
    let mut c = vec![0.0f32; 16];
    let mut data = GemmDataParams {
        a: &problem.a,
        lda: 64,
        packed_b: &packed,
        scale: &problem.quant_b.scale,
        zero_point: None,
        bias: None,
        c: &mut c,
        ldc: 8,
    };
    assert!(matches!(
        gemm.gemm_f32(&params, &mut data, Some(&mut workspace)),
        Err(QnbitError::BufferTooSmall { .. })
    ));
}

#[test]
fn test_packed_predicate_is_deterministic() {
    for kernels in tables() {
        if let Some(use_packed) = kernels.use_packed_comp_int8() {
            for (k, blk_len, zp) in [(256, 32, false), (4096, 128, true), (100, 16, false), (512, 64, false)] {
                assert_eq!(use_packed(k, blk_len, zp), use_packed(k, blk_len, zp));
            }
        }
    }
}

// Row-count fallback: a table with only the row kernel bound.

static ROWS_SEEN: AtomicUsize = AtomicUsize::new(0);
static ROW_CALLS: AtomicUsize = AtomicUsize::new(0);

#[allow(clippy::too_many_arguments)]
fn counting_row_kernel(
    blk_len: usize,
    quant_a: &[u8],
    quant_b: &QuantBColumns<'_, f32>,
    c: &mut [f32],
    count_m: usize,
    count_n: usize,
    count_k: usize,
    block_count_k: usize,
    ldc: usize,
    bias: Option<&[f32]>,
) -> usize {
    let kernel = scalar().sq4bit_gemm_kernel_comp_int8().unwrap();
    let rows = kernel(blk_len, quant_a, quant_b, c, count_m, count_n, count_k, block_count_k, ldc, bias);
    ROWS_SEEN.fetch_add(rows, Ordering::SeqCst);
    ROW_CALLS.fetch_add(1, Ordering::SeqCst);
    rows
}

struct RowOnlyKernels;

static ROW_ONLY: RowOnlyKernels = RowOnlyKernels;

impl QnbitKernels for RowOnlyKernels {
    fn capability(&self) -> Capability {
        Capability::Scalar
    }

    fn name(&self) -> &'static str {
        "row-only"
    }

    fn q4bit_gemm_pack_quant_b_data_size(&self) -> Option<PackQuantBDataSizeFn> {
        scalar().q4bit_gemm_pack_quant_b_data_size()
    }

    fn per_gemm_workspace_size(&self) -> Option<PerGemmWorkspaceSizeFn> {
        scalar().per_gemm_workspace_size()
    }

    fn per_gemm_workspace_alignment(&self) -> Option<PerGemmWorkspaceAlignmentFn> {
        scalar().per_gemm_workspace_alignment()
    }

    fn sq4bit_gemm_pack_quant_b_data_and_blk_sum(&self) -> Option<PackQuantBDataAndBlkSumFn> {
        scalar().sq4bit_gemm_pack_quant_b_data_and_blk_sum()
    }

    fn sq4bit_gemm_kernel_comp_int8(&self) -> Option<SQ4BitGemmKernelCompInt8Fn> {
        Some(counting_row_kernel)
    }

    fn quantize_a_row_comp_int8(&self) -> Option<QuantizeARowCompInt8Fn> {
        scalar().quantize_a_row_comp_int8()
    }
}

#[test]
fn test_row_count_kernel_covers_every_row_once() {
    let gemm = QnbitGemm::with_kernels(&ROW_ONLY);
    assert!(gemm.is_available(BitWidth::Four, 32, ComputeType::Int8));
    assert!(!gemm.is_available(BitWidth::Four, 32, ComputeType::Fp32));
    assert_eq!(ROW_ONLY.bound_slots().len(), 6);

    let scheme = QuantScheme::new(BitWidth::Four, 32, true).unwrap();
    let problem = Problem::new(9, 12, 64, scheme, 13);
    let got = problem.run_f32(&gemm, ComputeType::Int8);
    problem.assert_close(&got, 3e-2);
    assert_eq!(ROWS_SEEN.load(Ordering::SeqCst), 9);
    // at most INT8_KERNEL_TILE_M rows per call: 4 + 4 + 1
    assert_eq!(ROW_CALLS.load(Ordering::SeqCst), 3);
}
