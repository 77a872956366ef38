//! AVX2 kernels.
//!
//! Vector paths cover 4-bit sub-blocks of 32 and 64 values and any 8-bit
//! block whose length is a multiple of 16. Other shapes use the scalar
//! primitives.

use std::arch::x86_64::*;

use crate::api::traits::QnbitKernels;
use crate::api::types::Capability;
use crate::core::kernels::{dot_f32_q4_scalar, dot_i8_q4_scalar, dot_i8_u8_scalar, DotPrimitives};

#[target_feature(enable = "avx2")]
unsafe fn hsum_ps(sum: __m256) -> f32 {
    let hi = _mm256_extractf128_ps(sum, 1);
    let lo = _mm256_castps256_ps128(sum);
    let sum128 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(sums, sums);
    _mm_cvtss_f32(_mm_add_ss(sums, shuf2))
}

#[target_feature(enable = "avx2")]
unsafe fn hsum_epi32(v: __m256i) -> i32 {
    let hi128 = _mm256_extracti128_si256(v, 1);
    let lo128 = _mm256_castsi256_si128(v);
    let sum128 = _mm_add_epi32(lo128, hi128);
    let hi64 = _mm_srli_si128(sum128, 8);
    let sum64 = _mm_add_epi32(sum128, hi64);
    let hi32 = _mm_srli_si128(sum64, 4);
    _mm_cvtsi128_si32(_mm_add_epi32(sum64, hi32))
}

/// `acc + a[0..16] * (codes - zp)` for 16 unsigned codes.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn mul_add_codes(acc: __m256, codes: __m128i, a: *const f32, zp: __m256) -> __m256 {
    let q0 = _mm256_sub_ps(_mm256_cvtepi32_ps(_mm256_cvtepu8_epi32(codes)), zp);
    let q1 = _mm256_sub_ps(_mm256_cvtepi32_ps(_mm256_cvtepu8_epi32(_mm_srli_si128(codes, 8))), zp);
    let acc = _mm256_add_ps(acc, _mm256_mul_ps(_mm256_loadu_ps(a), q0));
    _mm256_add_ps(acc, _mm256_mul_ps(_mm256_loadu_ps(a.add(8)), q1))
}

/// Requires `a.len() % 32 == 0`.
#[target_feature(enable = "avx2")]
unsafe fn dot_f32_q4_avx2(a: &[f32], packed: &[u8], zero_point: f32) -> f32 {
    let half = a.len() / 2;
    let mask_0f = _mm_set1_epi8(0x0F);
    let zp = _mm256_set1_ps(zero_point);
    let mut acc_lo = _mm256_setzero_ps();
    let mut acc_hi = _mm256_setzero_ps();

    let mut c = 0;
    while c < half {
        let bytes = _mm_loadu_si128(packed.as_ptr().add(c) as *const __m128i);
        let lo = _mm_and_si128(bytes, mask_0f);
        let hi = _mm_and_si128(_mm_srli_epi16(bytes, 4), mask_0f);
        acc_lo = mul_add_codes(acc_lo, lo, a.as_ptr().add(c), zp);
        acc_hi = mul_add_codes(acc_hi, hi, a.as_ptr().add(half + c), zp);
        c += 16;
    }

    hsum_ps(_mm256_add_ps(acc_lo, acc_hi))
}

/// Requires `qa.len() % 32 == 0`.
#[target_feature(enable = "avx2")]
unsafe fn dot_i8_q4_avx2(packed: &[u8], qa: &[i8]) -> i32 {
    let half = qa.len() / 2;
    let mask_0f = _mm_set1_epi8(0x0F);
    let ones_i16 = _mm256_set1_epi16(1);
    let mut acc = _mm256_setzero_si256();

    let mut c = 0;
    while c < half {
        let bytes = _mm_loadu_si128(packed.as_ptr().add(c) as *const __m128i);
        let lo = _mm_and_si128(bytes, mask_0f);
        let hi = _mm_and_si128(_mm_srli_epi16(bytes, 4), mask_0f);
        let q4 = _mm256_set_m128i(hi, lo);
        let q8 = _mm256_set_m128i(
            _mm_loadu_si128(qa.as_ptr().add(half + c) as *const __m128i),
            _mm_loadu_si128(qa.as_ptr().add(c) as *const __m128i),
        );
        // u4 * i8 pairs stay well inside i16
        let products = _mm256_maddubs_epi16(q4, q8);
        acc = _mm256_add_epi32(acc, _mm256_madd_epi16(products, ones_i16));
        c += 16;
    }

    hsum_epi32(acc)
}

#[target_feature(enable = "avx2")]
unsafe fn dot_i8_u8_avx2(qa: &[i8], b: &[u8]) -> i32 {
    let chunks = qa.len() / 16;
    let mut acc = _mm256_setzero_si256();
    for i in 0..chunks {
        let x = _mm256_cvtepi8_epi16(_mm_loadu_si128(qa.as_ptr().add(i * 16) as *const __m128i));
        let y = _mm256_cvtepu8_epi16(_mm_loadu_si128(b.as_ptr().add(i * 16) as *const __m128i));
        acc = _mm256_add_epi32(acc, _mm256_madd_epi16(x, y));
    }
    let tail = chunks * 16;
    hsum_epi32(acc) + dot_i8_u8_scalar(&qa[tail..], &b[tail..qa.len()])
}

pub struct Avx2Dot;

// SAFETY (all methods): `Avx2Dot` is only instantiated through `Avx2Kernels`,
// which is handed out only after AVX2 has been detected.
impl DotPrimitives for Avx2Dot {
    #[inline]
    fn dot_f32_q4(a: &[f32], packed: &[u8], zero_point: f32) -> f32 {
        if a.len() % 32 == 0 {
            debug_assert!(packed.len() >= a.len() / 2);
            unsafe { dot_f32_q4_avx2(a, packed, zero_point) }
        } else {
            dot_f32_q4_scalar(a, packed, zero_point)
        }
    }

    #[inline]
    fn dot_i8_q4(packed: &[u8], qa: &[i8]) -> i32 {
        if qa.len() % 32 == 0 {
            debug_assert!(packed.len() >= qa.len() / 2);
            unsafe { dot_i8_q4_avx2(packed, qa) }
        } else {
            dot_i8_q4_scalar(packed, qa)
        }
    }

    #[inline]
    fn dot_i8_u8(qa: &[i8], b: &[u8]) -> i32 {
        debug_assert!(b.len() >= qa.len());
        unsafe { dot_i8_u8_avx2(qa, b) }
    }
}

/// Binds every slot, including the fully packed int8 pair.
pub struct Avx2Kernels {
    _private: (),
}

static AVX2_KERNELS: Avx2Kernels = Avx2Kernels { _private: () };

impl Avx2Kernels {
    /// The AVX2 table, if the host supports AVX2.
    pub fn get() -> Option<&'static dyn QnbitKernels> {
        if is_x86_feature_detected!("avx2") {
            Some(&AVX2_KERNELS)
        } else {
            None
        }
    }
}

impl QnbitKernels for Avx2Kernels {
    fn capability(&self) -> Capability {
        Capability::Avx2
    }

    fn name(&self) -> &'static str {
        "avx2"
    }

    impl_common_slots!(Avx2Dot);
    impl_packed_int8_slots!(Avx2Dot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernels::scalar::ScalarDot;

    fn avx2() -> bool {
        is_x86_feature_detected!("avx2")
    }

    #[test]
    fn test_q4_dots_match_scalar() {
        if !avx2() {
            return;
        }
        for sub in [8usize, 16, 32, 64] {
            let packed: Vec<u8> = (0..sub / 2).map(|j| (j * 29 % 256) as u8).collect();
            let a: Vec<f32> = (0..sub).map(|i| (i as f32 * 0.37).sin()).collect();
            let qa: Vec<i8> = (0..sub).map(|i| ((i * 53 % 255) as i32 - 127) as i8).collect();

            let s = ScalarDot::dot_f32_q4(&a, &packed, 8.0);
            let v = Avx2Dot::dot_f32_q4(&a, &packed, 8.0);
            assert!((s - v).abs() < 1e-3, "sub {}: {} vs {}", sub, s, v);

            assert_eq!(ScalarDot::dot_i8_q4(&packed, &qa), Avx2Dot::dot_i8_q4(&packed, &qa), "sub {}", sub);
        }
    }

    #[test]
    fn test_u8_dot_matches_scalar_without_saturation() {
        if !avx2() {
            return;
        }
        for len in [4usize, 16, 36, 256] {
            let qa = vec![-127i8; len];
            let b = vec![255u8; len];
            assert_eq!(Avx2Dot::dot_i8_u8(&qa, &b), -127 * 255 * len as i32);
            let qa: Vec<i8> = (0..len).map(|i| ((i * 31 % 255) as i32 - 127) as i8).collect();
            let b: Vec<u8> = (0..len).map(|i| (i * 17 % 256) as u8).collect();
            assert_eq!(Avx2Dot::dot_i8_u8(&qa, &b), ScalarDot::dot_i8_u8(&qa, &b));
        }
    }

    #[test]
    fn test_table_binds_every_slot() {
        if let Some(table) = Avx2Kernels::get() {
            assert_eq!(table.bound_slots().len(), 20);
            assert_eq!(table.capability(), Capability::Avx2);
        }
    }
}
