use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::api::error::{QnbitError, QnbitResult};
use crate::api::types::Capability;

/// Global threshold (`m * n * k`) for switching GEMM tiling from sequential to parallel (rayon).
pub(crate) static GEMM_PAR_THRESHOLD: AtomicUsize = AtomicUsize::new(1 << 16);

/// Global minimum K for the fully packed int8 kernel.
pub(crate) static PACKED_INT8_MIN_K: AtomicUsize = AtomicUsize::new(256);

/// Whether the fully packed int8 kernel is restricted to B without zero points.
pub(crate) static PACKED_INT8_REQUIRE_NO_ZERO_POINT: AtomicBool = AtomicBool::new(true);

/// When the fully packed int8 kernel pair is preferred over the block-sum pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedInt8Policy {
    /// K below which the packed pair is not worth its A packing cost (default 256).
    pub min_k: usize,
    /// Only use the packed pair for B without explicit zero points (default true).
    pub require_no_zero_point: bool,
}

impl Default for PackedInt8Policy {
    fn default() -> Self {
        Self { min_k: 256, require_no_zero_point: true }
    }
}

impl PackedInt8Policy {
    /// The policy currently in effect.
    pub fn current() -> Self {
        Self {
            min_k: PACKED_INT8_MIN_K.load(Ordering::Relaxed),
            require_no_zero_point: PACKED_INT8_REQUIRE_NO_ZERO_POINT.load(Ordering::Relaxed),
        }
    }

    /// Whether a problem of this shape qualifies for the packed pair.
    pub fn allows(&self, k: usize, blk_len: usize, has_zero_point: bool) -> bool {
        if has_zero_point && self.require_no_zero_point {
            return false;
        }
        blk_len % 32 == 0 && k % blk_len == 0 && k >= self.min_k
    }
}

pub(crate) fn gemm_par_threshold() -> usize {
    GEMM_PAR_THRESHOLD.load(Ordering::Relaxed)
}

/// Runtime configuration for parallelism and kernel selection.
/// Must be applied (via `apply()`) before any computation to take effect.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of rayon threads. 0 means auto-detect (use all available cores).
    pub num_threads: usize,
    /// Minimum `m * n * k` before a GEMM is tiled across threads (default 65536).
    pub gemm_par_threshold: usize,
    pub packed_int8: PackedInt8Policy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            gemm_par_threshold: 1 << 16,
            packed_int8: PackedInt8Policy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Apply this runtime configuration globally.
    ///
    /// Optionally configures rayon's global thread pool and writes the
    /// thresholds to global atomics. Must be called before any GEMM for
    /// the settings to take effect.
    pub fn apply(&self) -> QnbitResult<()> {
        if self.num_threads != 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.num_threads)
                .build_global()
                .map_err(|e| QnbitError::Config(format!("Failed to set rayon thread pool: {}", e)))?;
        }

        self.store_thresholds();

        log::info!("[runtime] SIMD: {}", Capability::detect());
        log::info!("[runtime] Rayon threads: {}", rayon::current_num_threads());

        Ok(())
    }

    /// Write only the thresholds, leaving the thread pool alone. Like
    /// `apply`, this belongs before the first GEMM: a GEMM already running
    /// keeps the variant it picked.
    pub fn store_thresholds(&self) {
        GEMM_PAR_THRESHOLD.store(self.gemm_par_threshold, Ordering::Relaxed);
        PACKED_INT8_MIN_K.store(self.packed_int8.min_k, Ordering::Relaxed);
        PACKED_INT8_REQUIRE_NO_ZERO_POINT.store(self.packed_int8.require_no_zero_point, Ordering::Relaxed);
    }
}

/// Optimization profiles for A/B benchmarking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptProfile {
    /// Default thresholds.
    Optimized,
    /// Sequential tiling and no fully packed int8 kernel.
    Baseline,
    /// Parallel tiling for small problems, packed int8 kernel for any K.
    Aggressive,
}

impl OptProfile {
    /// Build a `RuntimeConfig` matching this profile.
    pub fn runtime_config(&self) -> RuntimeConfig {
        match self {
            OptProfile::Optimized => RuntimeConfig::default(),
            OptProfile::Baseline => RuntimeConfig {
                gemm_par_threshold: usize::MAX,
                packed_int8: PackedInt8Policy { min_k: usize::MAX, ..PackedInt8Policy::default() },
                ..RuntimeConfig::default()
            },
            OptProfile::Aggressive => RuntimeConfig {
                gemm_par_threshold: 1024,
                packed_int8: PackedInt8Policy { min_k: 0, ..PackedInt8Policy::default() },
                ..RuntimeConfig::default()
            },
        }
    }
}

impl std::str::FromStr for OptProfile {
    type Err = QnbitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "optimized" => Ok(OptProfile::Optimized),
            "baseline" => Ok(OptProfile::Baseline),
            "aggressive" => Ok(OptProfile::Aggressive),
            other => Err(QnbitError::Config(format!("unknown profile '{}'", other))),
        }
    }
}
