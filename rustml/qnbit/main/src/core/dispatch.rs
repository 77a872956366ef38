//! Process-wide kernel table selection.
//!
//! The host is probed once; the resulting table is immutable and shared
//! lock-free by every caller.

use std::sync::OnceLock;

use crate::api::traits::QnbitKernels;
use crate::api::types::Capability;
use crate::core::kernels::scalar::SCALAR_KERNELS;

static DISPATCH: OnceLock<&'static dyn QnbitKernels> = OnceLock::new();

impl Capability {
    /// Best capability of the running host.
    pub fn detect() -> Self {
        detect_capability()
    }

    /// Whether the running host can execute this capability's kernels.
    pub fn is_supported(self) -> bool {
        match self {
            Capability::Scalar => true,
            Capability::Avx2 => avx2_detected(),
            Capability::Neon => cfg!(target_arch = "aarch64"),
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn avx2_detected() -> bool {
    is_x86_feature_detected!("avx2")
}

#[cfg(not(target_arch = "x86_64"))]
fn avx2_detected() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
fn detect_capability() -> Capability {
    if avx2_detected() {
        Capability::Avx2
    } else {
        Capability::Scalar
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_capability() -> Capability {
    Capability::Neon
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_capability() -> Capability {
    Capability::Scalar
}

/// The kernel table for the host, chosen on first use.
pub fn qnbit_dispatch() -> &'static dyn QnbitKernels {
    *DISPATCH.get_or_init(|| {
        let capability = Capability::detect();
        let table = dispatch_for(capability).unwrap_or(&SCALAR_KERNELS);
        log::debug!("[qnbit] dispatch: {} kernels (detected {})", table.name(), capability);
        table
    })
}

/// The kernel table for `capability`, or `None` if the host cannot run it.
pub fn dispatch_for(capability: Capability) -> Option<&'static dyn QnbitKernels> {
    match capability {
        Capability::Scalar => Some(&SCALAR_KERNELS),
        Capability::Avx2 => avx2_table(),
        Capability::Neon => neon_table(),
    }
}

#[cfg(target_arch = "x86_64")]
fn avx2_table() -> Option<&'static dyn QnbitKernels> {
    crate::core::kernels::avx2::Avx2Kernels::get()
}

#[cfg(not(target_arch = "x86_64"))]
fn avx2_table() -> Option<&'static dyn QnbitKernels> {
    None
}

#[cfg(target_arch = "aarch64")]
fn neon_table() -> Option<&'static dyn QnbitKernels> {
    Some(&crate::core::kernels::neon::NEON_KERNELS)
}

#[cfg(not(target_arch = "aarch64"))]
fn neon_table() -> Option<&'static dyn QnbitKernels> {
    None
}
