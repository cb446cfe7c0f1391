//! SIMD kernels for integer/float PCM conversion.
//!
//! The wide paths process 16 samples per iteration with AVX2 and 8 with
//! SSE2, falling back to scalar loops elsewhere. Feature detection runs once
//! per process and is cached.

use std::sync::OnceLock;

/// Detected CPU vector capabilities.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    /// 128-bit integer/float vectors.
    pub sse2: bool,
    /// 256-bit float vectors.
    pub avx: bool,
    /// 256-bit integer vectors.
    pub avx2: bool,
}

static CPU_FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

/// Returns the cached CPU feature set.
pub fn cpu_features() -> CpuFeatures {
    *CPU_FEATURES.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            let features = CpuFeatures {
                sse2: is_x86_feature_detected!("sse2"),
                avx: is_x86_feature_detected!("avx"),
                avx2: is_x86_feature_detected!("avx2"),
            };
            tracing::debug!(?features, "detected CPU features");
            features
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            CpuFeatures {
                sse2: false,
                avx: false,
                avx2: false,
            }
        }
    })
}

const I16_TO_F32_SCALE: f32 = 1.0 / 32768.0;
// Symmetric with the forward scale so i16 -> f32 -> i16 is the identity;
// +1.0 saturates to 32767 on the way back.
const F32_TO_I16_SCALE: f32 = 32768.0;

/// Converts i16 PCM to f32 normalized to [-1.0, 1.0].
///
/// `dst` must have the same length as `src`.
pub fn i16_to_f32(src: &[i16], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    let features = cpu_features();

    #[cfg(target_arch = "x86_64")]
    {
        if features.avx2 {
            // SAFETY: AVX2 support was verified at runtime.
            unsafe { i16_to_f32_avx2(src, dst) };
            return;
        }
        if features.sse2 {
            // SAFETY: SSE2 support was verified at runtime.
            unsafe { i16_to_f32_sse2(src, dst) };
            return;
        }
    }
    let _ = features;
    i16_to_f32_scalar(src, dst);
}

/// Converts f32 PCM in [-1.0, 1.0] to i16, clamping out-of-range input.
///
/// `dst` must have the same length as `src`.
pub fn f32_to_i16(src: &[f32], dst: &mut [i16]) {
    debug_assert_eq!(src.len(), dst.len());
    let features = cpu_features();

    #[cfg(target_arch = "x86_64")]
    {
        if features.avx2 {
            // SAFETY: AVX2 support was verified at runtime.
            unsafe { f32_to_i16_avx2(src, dst) };
            return;
        }
        if features.sse2 {
            // SAFETY: SSE2 support was verified at runtime.
            unsafe { f32_to_i16_sse2(src, dst) };
            return;
        }
    }
    let _ = features;
    f32_to_i16_scalar(src, dst);
}

fn i16_to_f32_scalar(src: &[i16], dst: &mut [f32]) {
    for (s, d) in src.iter().zip(dst.iter_mut()) {
        *d = f32::from(*s) * I16_TO_F32_SCALE;
    }
}

fn f32_to_i16_scalar(src: &[f32], dst: &mut [i16]) {
    for (s, d) in src.iter().zip(dst.iter_mut()) {
        let scaled = (s.clamp(-1.0, 1.0) * F32_TO_I16_SCALE).round() as i32;
        *d = scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn i16_to_f32_avx2(src: &[i16], dst: &mut [f32]) {
    use std::arch::x86_64::*;

    let scale = _mm256_set1_ps(I16_TO_F32_SCALE);
    let mut i = 0;
    // 16 samples per iteration: widen each 128-bit half to i32, convert, scale.
    while i + 16 <= src.len() {
        let v = _mm256_loadu_si256(src.as_ptr().add(i).cast());
        let lo = _mm256_castsi256_si128(v);
        let hi = _mm256_extracti128_si256::<1>(v);

        let lo_f = _mm256_mul_ps(_mm256_cvtepi32_ps(_mm256_cvtepi16_epi32(lo)), scale);
        let hi_f = _mm256_mul_ps(_mm256_cvtepi32_ps(_mm256_cvtepi16_epi32(hi)), scale);

        _mm256_storeu_ps(dst.as_mut_ptr().add(i), lo_f);
        _mm256_storeu_ps(dst.as_mut_ptr().add(i + 8), hi_f);
        i += 16;
    }
    i16_to_f32_scalar(&src[i..], &mut dst[i..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn i16_to_f32_sse2(src: &[i16], dst: &mut [f32]) {
    use std::arch::x86_64::*;

    let scale = _mm_set1_ps(I16_TO_F32_SCALE);
    let mut i = 0;
    // 8 samples per iteration; sign-extend via unpack + arithmetic shift
    // (plain SSE2 has no cvtepi16).
    while i + 8 <= src.len() {
        let v = _mm_loadu_si128(src.as_ptr().add(i).cast());
        let lo = _mm_srai_epi32::<16>(_mm_unpacklo_epi16(v, v));
        let hi = _mm_srai_epi32::<16>(_mm_unpackhi_epi16(v, v));

        let lo_f = _mm_mul_ps(_mm_cvtepi32_ps(lo), scale);
        let hi_f = _mm_mul_ps(_mm_cvtepi32_ps(hi), scale);

        _mm_storeu_ps(dst.as_mut_ptr().add(i), lo_f);
        _mm_storeu_ps(dst.as_mut_ptr().add(i + 4), hi_f);
        i += 8;
    }
    i16_to_f32_scalar(&src[i..], &mut dst[i..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn f32_to_i16_avx2(src: &[f32], dst: &mut [i16]) {
    use std::arch::x86_64::*;

    let scale = _mm256_set1_ps(F32_TO_I16_SCALE);
    let lo_bound = _mm256_set1_ps(-1.0);
    let hi_bound = _mm256_set1_ps(1.0);
    let mut i = 0;
    while i + 16 <= src.len() {
        let a = _mm256_loadu_ps(src.as_ptr().add(i));
        let b = _mm256_loadu_ps(src.as_ptr().add(i + 8));

        let a = _mm256_mul_ps(_mm256_min_ps(_mm256_max_ps(a, lo_bound), hi_bound), scale);
        let b = _mm256_mul_ps(_mm256_min_ps(_mm256_max_ps(b, lo_bound), hi_bound), scale);

        // cvtps rounds to nearest; packs saturates and interleaves 128-bit
        // lanes, so restore order with a lane permute.
        let ia = _mm256_cvtps_epi32(a);
        let ib = _mm256_cvtps_epi32(b);
        let packed = _mm256_packs_epi32(ia, ib);
        let ordered = _mm256_permute4x64_epi64::<0b11_01_10_00>(packed);

        _mm256_storeu_si256(dst.as_mut_ptr().add(i).cast(), ordered);
        i += 16;
    }
    f32_to_i16_scalar(&src[i..], &mut dst[i..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn f32_to_i16_sse2(src: &[f32], dst: &mut [i16]) {
    use std::arch::x86_64::*;

    let scale = _mm_set1_ps(F32_TO_I16_SCALE);
    let lo_bound = _mm_set1_ps(-1.0);
    let hi_bound = _mm_set1_ps(1.0);
    let mut i = 0;
    while i + 8 <= src.len() {
        let a = _mm_loadu_ps(src.as_ptr().add(i));
        let b = _mm_loadu_ps(src.as_ptr().add(i + 4));

        let a = _mm_mul_ps(_mm_min_ps(_mm_max_ps(a, lo_bound), hi_bound), scale);
        let b = _mm_mul_ps(_mm_min_ps(_mm_max_ps(b, lo_bound), hi_bound), scale);

        let packed = _mm_packs_epi32(_mm_cvtps_epi32(a), _mm_cvtps_epi32(b));
        _mm_storeu_si128(dst.as_mut_ptr().add(i).cast(), packed);
        i += 8;
    }
    f32_to_i16_scalar(&src[i..], &mut dst[i..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_i16_to_f32(src: &[i16]) -> Vec<f32> {
        src.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }

    #[test]
    fn test_i16_to_f32_matches_scalar() {
        // Length 37 exercises both the vector body and the scalar tail.
        let src: Vec<i16> = (0..37).map(|i| (i * 997 - 18000) as i16).collect();
        let mut dst = vec![0.0f32; src.len()];
        i16_to_f32(&src, &mut dst);
        assert_eq!(dst, reference_i16_to_f32(&src));
    }

    #[test]
    fn test_i16_to_f32_extremes() {
        let src = [i16::MIN, -1, 0, 1, i16::MAX];
        let mut dst = [0.0f32; 5];
        i16_to_f32(&src, &mut dst);
        assert_eq!(dst[0], -1.0);
        assert_eq!(dst[2], 0.0);
        assert!((dst[4] - 0.99997).abs() < 1e-4);
    }

    #[test]
    fn test_f32_to_i16_clamps() {
        let src = [2.0f32, -2.0, 1.0, -1.0, 0.0];
        let mut dst = [0i16; 5];
        f32_to_i16(&src, &mut dst);
        assert_eq!(dst[0], 32767);
        assert_eq!(dst[1], -32768);
        assert_eq!(dst[2], 32767);
        assert_eq!(dst[3], -32768);
        assert_eq!(dst[4], 0);
    }

    #[test]
    fn test_f32_to_i16_long_buffer_matches_scalar() {
        let src: Vec<f32> = (0..103).map(|i| (i as f32 / 51.5) - 1.0).collect();
        let mut simd = vec![0i16; src.len()];
        f32_to_i16(&src, &mut simd);

        let mut scalar = vec![0i16; src.len()];
        f32_to_i16_scalar(&src, &mut scalar);
        // cvtps uses round-to-nearest-even; allow 1 LSB against round-half-away.
        for (a, b) in simd.iter().zip(&scalar) {
            assert!((i32::from(*a) - i32::from(*b)).abs() <= 1);
        }
    }

    #[test]
    fn test_round_trip_identity() {
        let src: Vec<i16> = (-32767i16..=32767).step_by(311).collect();
        let mut floats = vec![0.0f32; src.len()];
        i16_to_f32(&src, &mut floats);

        let mut back = vec![0i16; src.len()];
        f32_to_i16(&floats, &mut back);
        assert_eq!(src, back);
    }

    #[test]
    fn test_cpu_features_cached() {
        let a = cpu_features();
        let b = cpu_features();
        assert_eq!(a.sse2, b.sse2);
        assert_eq!(a.avx2, b.avx2);
    }
}
