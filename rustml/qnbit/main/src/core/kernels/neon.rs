//! NEON kernels. The 4-bit x int8 block dot product is vectorized; the
//! float and 8-bit dot products use the scalar primitives.

use std::arch::aarch64::*;

use crate::api::traits::QnbitKernels;
use crate::api::types::Capability;
use crate::core::kernels::{dot_f32_q4_scalar, dot_i8_q4_scalar, dot_i8_u8_scalar, DotPrimitives};

/// Requires `qa.len() % 32 == 0`.
unsafe fn dot_i8_q4_neon(packed: &[u8], qa: &[i8]) -> i32 {
    let half = qa.len() / 2;
    let mask_0f = vdupq_n_u8(0x0F);
    let mut acc = vdupq_n_s32(0);

    let mut c = 0;
    while c < half {
        let bytes = vld1q_u8(packed.as_ptr().add(c));
        // codes are 0..15, so the signed reinterpretation is exact
        let lo = vreinterpretq_s8_u8(vandq_u8(bytes, mask_0f));
        let hi = vreinterpretq_s8_u8(vshrq_n_u8(bytes, 4));

        let qa_lo = vld1q_s8(qa.as_ptr().add(c));
        let qa_hi = vld1q_s8(qa.as_ptr().add(half + c));

        acc = vpadalq_s16(acc, vmull_s8(vget_low_s8(lo), vget_low_s8(qa_lo)));
        acc = vpadalq_s16(acc, vmull_s8(vget_high_s8(lo), vget_high_s8(qa_lo)));
        acc = vpadalq_s16(acc, vmull_s8(vget_low_s8(hi), vget_low_s8(qa_hi)));
        acc = vpadalq_s16(acc, vmull_s8(vget_high_s8(hi), vget_high_s8(qa_hi)));
        c += 16;
    }

    vaddvq_s32(acc)
}

pub struct NeonDot;

impl DotPrimitives for NeonDot {
    #[inline]
    fn dot_f32_q4(a: &[f32], packed: &[u8], zero_point: f32) -> f32 {
        dot_f32_q4_scalar(a, packed, zero_point)
    }

    #[inline]
    fn dot_i8_q4(packed: &[u8], qa: &[i8]) -> i32 {
        if qa.len() % 32 == 0 {
            debug_assert!(packed.len() >= qa.len() / 2);
            unsafe { dot_i8_q4_neon(packed, qa) }
        } else {
            dot_i8_q4_scalar(packed, qa)
        }
    }

    #[inline]
    fn dot_i8_u8(qa: &[i8], b: &[u8]) -> i32 {
        dot_i8_u8_scalar(qa, b)
    }
}

/// Binds every slot, including the fully packed int8 pair.
pub struct NeonKernels;

pub(crate) static NEON_KERNELS: NeonKernels = NeonKernels;

impl QnbitKernels for NeonKernels {
    fn capability(&self) -> Capability {
        Capability::Neon
    }

    fn name(&self) -> &'static str {
        "neon"
    }

    impl_common_slots!(NeonDot);
    impl_packed_int8_slots!(NeonDot);
}
