#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rustml_qnbit::*;

pub fn tables() -> Vec<&'static dyn QnbitKernels> {
    Capability::ALL.iter().filter_map(|&cap| dispatch_for(cap)).collect()
}

/// Random A, B and bias plus the f64 reference computed from the dequantized B.
pub struct Problem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub a: Vec<f32>,
    pub bias: Vec<f32>,
    pub quant_b: QuantizedMatrix,
    pub expected: Vec<f64>,
}

impl Problem {
    pub fn new(m: usize, n: usize, k: usize, scheme: QuantScheme, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let a: Vec<f32> = (0..m * k).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let b: Vec<f32> = (0..k * n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let bias: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let quant_b = quantize_b_blockwise(&b, k, n, scheme).unwrap();
        let deq = dequantize_b_blockwise(&quant_b);
        let mut expected = vec![0.0f64; m * n];
        for r in 0..m {
            for col in 0..n {
                let dot: f64 = (0..k).map(|kk| a[r * k + kk] as f64 * deq[kk * n + col] as f64).sum();
                expected[r * n + col] = dot + bias[col] as f64;
            }
        }
        Self { m, n, k, a, bias, quant_b, expected }
    }

    pub fn params(&self, compute_type: ComputeType) -> QnbitGemmParams {
        QnbitGemmParams { m: self.m, n: self.n, k: self.k, scheme: self.quant_b.scheme, compute_type }
    }

    pub fn pack(&self, gemm: &QnbitGemm, compute_type: ComputeType) -> Vec<u8> {
        let scheme = self.quant_b.scheme;
        let size = gemm.pack_quant_b_data_size(self.n, self.k, &scheme, compute_type).unwrap();
        let mut packed = vec![0u8; size];
        gemm.pack_quant_b_data(self.n, self.k, &scheme, compute_type, &self.quant_b.columns(), &mut packed)
            .unwrap();
        packed
    }

    /// Runs an f32-activation GEMM with a freshly sized workspace.
    pub fn run_f32(&self, gemm: &QnbitGemm, compute_type: ComputeType) -> Vec<f32> {
        let mut c = vec![0.0f32; self.m * self.n];
        self.run_f32_into(gemm, compute_type, &mut c);
        c
    }

    /// Like [`Problem::run_f32`], but writes into an existing C.
    pub fn run_f32_into(&self, gemm: &QnbitGemm, compute_type: ComputeType, c: &mut [f32]) {
        let params = self.params(compute_type);
        let packed = self.pack(gemm, compute_type);
        let mut workspace = vec![0u8; gemm.batch_workspace_size(&params, 1)];
        let mut data = GemmDataParams {
            a: &self.a,
            lda: self.k,
            packed_b: &packed,
            scale: &self.quant_b.scale,
            zero_point: self.quant_b.zero_point.as_deref(),
            bias: Some(&self.bias),
            c,
            ldc: self.n,
        };
        gemm.gemm_f32(&params, &mut data, Some(&mut workspace)).unwrap();
    }

    pub fn assert_close(&self, got: &[f32], rel_tol: f64) {
        let scale = self.expected.iter().fold(0.0f64, |a, e| a.max(e.abs())).max(1e-6);
        for (i, (&g, &e)) in got.iter().zip(&self.expected).enumerate() {
            let err = (g as f64 - e).abs() / scale;
            assert!(err <= rel_tol, "element {}: {} vs {} (rel {:.3e})", i, g, e, err);
        }
    }
}
