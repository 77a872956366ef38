use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rustml_qnbit::{
    dequantize_b_blockwise, qnbit_dispatch, quantize_b_blockwise, BitWidth, Capability, ComputeType, GemmDataParams,
    OptProfile, QnbitGemm, QnbitGemmParams, QuantScheme,
};

/// RustML QnBit probe: inspect kernel dispatch and check GEMM accuracy.
#[derive(Parser)]
#[command(name = "rustml-qnbit-probe", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the detected capability, bound kernel slots and available variants.
    Info {
        /// Block length used for the availability matrix.
        #[arg(long, default_value_t = 32)]
        blk_len: usize,
    },

    /// Print packed-B and workspace sizes for a shape.
    Sizes {
        #[command(flatten)]
        shape: ShapeArgs,

        /// Compute type.
        #[arg(long, value_enum, default_value_t = ComputeArg::Int8)]
        compute: ComputeArg,

        /// Number of GEMMs in the batch.
        #[arg(long, default_value_t = 1)]
        batch: usize,
    },

    /// Run random GEMMs per compute type against an f64 reference.
    Verify {
        #[command(flatten)]
        shape: ShapeArgs,

        /// Only check this compute type.
        #[arg(long, value_enum)]
        compute: Option<ComputeArg>,

        /// Kernel table to use instead of the detected one.
        #[arg(long, value_enum)]
        capability: Option<CapabilityArg>,

        /// Runtime profile: optimized, baseline or aggressive.
        #[arg(long, default_value = "optimized")]
        profile: OptProfile,

        /// Maximum error relative to the largest reference value, for every compute type.
        #[arg(long)]
        tolerance: Option<f64>,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

#[derive(Args, Clone, Copy)]
struct ShapeArgs {
    #[arg(long, default_value_t = 4)]
    m: usize,

    #[arg(long, default_value_t = 64)]
    n: usize,

    #[arg(long, default_value_t = 256)]
    k: usize,

    #[arg(long, default_value_t = 32)]
    blk_len: usize,

    /// Bit width of B: 4 or 8.
    #[arg(long, default_value_t = 4)]
    bits: usize,

    /// Quantize B asymmetrically with per-block zero points.
    #[arg(long)]
    zero_point: bool,
}

impl ShapeArgs {
    fn scheme(&self) -> Result<QuantScheme> {
        let bit_width = BitWidth::from_bits(self.bits)?;
        Ok(QuantScheme::new(bit_width, self.blk_len, self.zero_point)?)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ComputeArg {
    Fp32,
    Fp16,
    Int8,
}

impl From<ComputeArg> for ComputeType {
    fn from(arg: ComputeArg) -> Self {
        match arg {
            ComputeArg::Fp32 => ComputeType::Fp32,
            ComputeArg::Fp16 => ComputeType::Fp16,
            ComputeArg::Int8 => ComputeType::Int8,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CapabilityArg {
    Scalar,
    Avx2,
    Neon,
}

impl From<CapabilityArg> for Capability {
    fn from(arg: CapabilityArg) -> Self {
        match arg {
            CapabilityArg::Scalar => Capability::Scalar,
            CapabilityArg::Avx2 => Capability::Avx2,
            CapabilityArg::Neon => Capability::Neon,
        }
    }
}

fn default_tolerance(compute_type: ComputeType) -> f64 {
    match compute_type {
        ComputeType::Fp32 => 1e-4,
        ComputeType::Fp16 => 1e-2,
        ComputeType::Int8 => 5e-2,
    }
}

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Largest `|got - expected|` relative to the largest `|expected|`.
fn relative_error(got: &[f64], expected: &[f64]) -> (f64, f64) {
    let max_abs = got.iter().zip(expected).fold(0.0f64, |acc, (g, e)| acc.max((g - e).abs()));
    let scale = expected.iter().fold(0.0f64, |acc, e| acc.max(e.abs())).max(1e-12);
    (max_abs, max_abs / scale)
}

/// Runs one GEMM and returns C in f64, or `None` when the variant is unavailable.
fn run_gemm(
    gemm: &QnbitGemm,
    shape: &ShapeArgs,
    compute_type: ComputeType,
    a: &[f32],
    b: &[f32],
    bias: &[f32],
) -> Result<Option<Vec<f64>>> {
    let scheme = shape.scheme()?;
    if !gemm.is_available(scheme.bit_width, scheme.blk_len, compute_type) {
        return Ok(None);
    }
    let ShapeArgs { m, n, k, .. } = *shape;
    let quant_b = quantize_b_blockwise(b, k, n, scheme)?;
    let size = gemm.pack_quant_b_data_size(n, k, &scheme, compute_type)?;
    let mut packed = vec![0u8; size];
    gemm.pack_quant_b_data(n, k, &scheme, compute_type, &quant_b.columns(), &mut packed)
        .context("packing B")?;
    let params = QnbitGemmParams { m, n, k, scheme, compute_type };

    let c = match compute_type {
        ComputeType::Fp16 => {
            let a16: Vec<f16> = a.iter().map(|&v| f16::from_f32(v)).collect();
            let bias16: Vec<f16> = bias.iter().map(|&v| f16::from_f32(v)).collect();
            let scale16 = quant_b.scales_f16();
            let mut c = vec![f16::ZERO; m * n];
            let mut data = GemmDataParams {
                a: &a16,
                lda: k,
                packed_b: &packed,
                scale: &scale16,
                zero_point: quant_b.zero_point.as_deref(),
                bias: Some(&bias16),
                c: &mut c,
                ldc: n,
            };
            gemm.gemm_f16(&params, &mut data)?;
            c.iter().map(|v| v.to_f64()).collect()
        }
        ComputeType::Fp32 | ComputeType::Int8 => {
            let mut workspace = vec![0u8; gemm.batch_workspace_size(&params, 1)];
            let mut c = vec![0.0f32; m * n];
            let mut data = GemmDataParams {
                a,
                lda: k,
                packed_b: &packed,
                scale: &quant_b.scale,
                zero_point: quant_b.zero_point.as_deref(),
                bias: Some(bias),
                c: &mut c,
                ldc: n,
            };
            gemm.gemm_f32(&params, &mut data, Some(&mut workspace))?;
            c.iter().map(|&v| v as f64).collect()
        }
    };
    Ok(Some(c))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Info { blk_len } => {
            let table = qnbit_dispatch();
            println!("Capability:    {}", Capability::detect());
            println!("Kernel table:  {}", table.name());
            println!("Rayon threads: {}", rayon::current_num_threads());
            println!();
            println!("Bound slots:");
            for slot in table.bound_slots() {
                println!("  {slot}");
            }
            println!();
            println!("Available variants (blk_len {blk_len}):");
            let gemm = QnbitGemm::new();
            for bit_width in [BitWidth::Four, BitWidth::Eight] {
                for compute_type in ComputeType::ALL {
                    let status = if gemm.is_available(bit_width, blk_len, compute_type) { "yes" } else { "no" };
                    println!("  {:<6} {:<5} {status}", bit_width.to_string(), compute_type.to_string());
                }
            }
        }

        Command::Sizes { shape, compute, batch } => {
            let scheme = shape.scheme()?;
            let compute_type = ComputeType::from(compute);
            let gemm = QnbitGemm::new();
            let packed = gemm.pack_quant_b_data_size(shape.n, shape.k, &scheme, compute_type)?;
            let params = QnbitGemmParams { m: shape.m, n: shape.n, k: shape.k, scheme, compute_type };
            println!("Packed B:            {packed} bytes");
            println!("Workspace per GEMM:  {} bytes", gemm.per_gemm_workspace_size(&params));
            println!("Workspace alignment: {}", gemm.per_gemm_workspace_alignment(&params));
            println!("Workspace (batch {batch}): {} bytes", gemm.batch_workspace_size(&params, batch));
        }

        Command::Verify { shape, compute, capability, profile, tolerance, seed } => {
            profile.runtime_config().apply()?;
            let gemm = match capability {
                Some(cap) => QnbitGemm::with_capability(cap.into())?,
                None => QnbitGemm::new(),
            };
            let scheme = shape.scheme()?;
            let ShapeArgs { m, n, k, .. } = shape;

            let mut rng = StdRng::seed_from_u64(seed);
            let a = random_vec(&mut rng, m * k);
            let b = random_vec(&mut rng, k * n);
            let bias = random_vec(&mut rng, n);

            let deq = dequantize_b_blockwise(&quantize_b_blockwise(&b, k, n, scheme)?);
            let mut expected = vec![0.0f64; m * n];
            for r in 0..m {
                for col in 0..n {
                    let dot: f64 = (0..k).map(|kk| a[r * k + kk] as f64 * deq[kk * n + col] as f64).sum();
                    expected[r * n + col] = dot + bias[col] as f64;
                }
            }

            let compute_types: Vec<ComputeType> = match compute {
                Some(c) => vec![c.into()],
                None => ComputeType::ALL.to_vec(),
            };
            let mut failures = 0usize;
            for compute_type in compute_types {
                let label = compute_type.to_string();
                let Some(got) = run_gemm(&gemm, &shape, compute_type, &a, &b, &bias)? else {
                    println!("{label:<5} unavailable on {} kernels", gemm.kernels().name());
                    continue;
                };
                let (max_abs, rel) = relative_error(&got, &expected);
                let limit = tolerance.unwrap_or_else(|| default_tolerance(compute_type));
                let verdict = if rel <= limit { "ok" } else { "FAIL" };
                println!("{label:<5} max_abs={max_abs:.3e} rel={rel:.3e} limit={limit:.1e} {verdict}");
                if rel > limit {
                    failures += 1;
                }
            }
            if failures > 0 {
                bail!("{failures} compute type(s) exceeded tolerance");
            }
        }
    }

    Ok(())
}
