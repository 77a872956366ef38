//! Portable kernels. Available on every host.

use crate::api::traits::QnbitKernels;
use crate::api::types::Capability;
use crate::core::kernels::{dot_f32_q4_scalar, dot_i8_q4_scalar, dot_i8_u8_scalar, DotPrimitives};

pub struct ScalarDot;

impl DotPrimitives for ScalarDot {
    #[inline]
    fn dot_f32_q4(a: &[f32], packed: &[u8], zero_point: f32) -> f32 {
        dot_f32_q4_scalar(a, packed, zero_point)
    }

    #[inline]
    fn dot_i8_q4(packed: &[u8], qa: &[i8]) -> i32 {
        dot_i8_q4_scalar(packed, qa)
    }

    #[inline]
    fn dot_i8_u8(qa: &[i8], b: &[u8]) -> i32 {
        dot_i8_u8_scalar(qa, b)
    }
}

/// Leaves the fully packed int8 pair unbound.
pub struct ScalarKernels;

pub(crate) static SCALAR_KERNELS: ScalarKernels = ScalarKernels;

impl QnbitKernels for ScalarKernels {
    fn capability(&self) -> Capability {
        Capability::Scalar
    }

    fn name(&self) -> &'static str {
        "scalar"
    }

    impl_common_slots!(ScalarDot);
}
