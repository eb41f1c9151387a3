//! Float matmul kernels: F32×F32, BF16×BF16, F16×F16, and the thin
//! BF16/F16 × F32 GEMV paths.
//!
//! Each format pair has a scalar reference implementation and an
//! AVX2+FMA production path selected at runtime. The vector path walks
//! output tiles chosen by the residue of `(m - m0, n - n0)`: preferred
//! 4×3, falling through to 2×2, 2×1, 1×2, 1×1 (3×2 first under the
//! `precise` build, which runs Kahan-compensated accumulation).

#[inline]
fn bf16_to_f32(v: u16) -> f32 {
    f32::from_bits((v as u32) << 16)
}

#[inline]
fn f16_to_f32(v: u16) -> f32 {
    half::f16::from_bits(v).to_f32()
}

/// Static tile shape for the residue of an output region.
pub(crate) fn pick_tile(mr: usize, nr: usize) -> (usize, usize) {
    if cfg!(feature = "precise") {
        match (mr.min(3), nr.min(2)) {
            (3, 2) => (3, 2),
            (2, 2) => (2, 2),
            (m, 1) if m >= 2 => (2, 1),
            (1, 2) => (1, 2),
            _ => (1, 1),
        }
    } else {
        match (mr.min(4), nr.min(3)) {
            (4, 3) => (4, 3),
            (m, n) if m >= 2 && n >= 2 => (2, 2),
            (m, 1) if m >= 2 => (2, 1),
            (1, n) if n >= 2 => (1, 2),
            _ => (1, 1),
        }
    }
}

/// Contiguous tile share for thread `ith` of `nth`.
#[inline]
pub(crate) fn duty_range(tiles: usize, ith: usize, nth: usize) -> (usize, usize) {
    let duty = tiles.div_ceil(nth);
    let start = (duty * ith).min(tiles);
    let end = (start + duty).min(tiles);
    (start, end)
}

// ── Scalar reference path ───────────────────────────────────────────

/// Scalar `C = Aᵀ·B`, rows sliced per thread. The dot order is fixed,
/// so the result is independent of `nth`.
#[allow(clippy::too_many_arguments)]
unsafe fn gemm_scalar<A: Copy, B: Copy>(
    m: usize,
    n: usize,
    k: usize,
    a: *const A,
    lda: usize,
    b: *const B,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
    fa: impl Fn(A) -> f32,
    fb: impl Fn(B) -> f32,
) {
    let (start, end) = duty_range(m, ith, nth);
    for i in start..end {
        for j in 0..n {
            let mut acc = 0.0f32;
            for l in 0..k {
                acc += fa(*a.add(i * lda + l)) * fb(*b.add(j * ldb + l));
            }
            *c.add(j * ldc + i) = acc;
        }
    }
}

// ── AVX2 production path ────────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::{duty_range, pick_tile};
    use std::arch::x86_64::*;

    const PRECISE: bool = cfg!(feature = "precise");

    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    pub(crate) unsafe fn hsum(x: __m256) -> f32 {
        let lo = _mm256_castps256_ps128(x);
        let hi = _mm256_extractf128_ps(x, 1);
        let mut s = _mm_add_ps(lo, hi);
        s = _mm_add_ps(s, _mm_movehl_ps(s, s));
        s = _mm_add_ss(s, _mm_movehdup_ps(s));
        _mm_cvtss_f32(s)
    }

    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn load8_f32(p: *const f32) -> __m256 {
        _mm256_loadu_ps(p)
    }

    /// BF16 is the upper half of an f32: zero-extend and shift.
    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    pub(crate) unsafe fn load8_bf16(p: *const u16) -> __m256 {
        _mm256_castsi256_ps(_mm256_slli_epi32(
            _mm256_cvtepu16_epi32(_mm_loadu_si128(p as *const __m128i)),
            16,
        ))
    }

    #[target_feature(enable = "avx2,fma,f16c")]
    #[inline]
    unsafe fn load8_f16(p: *const u16) -> __m256 {
        _mm256_cvtph_ps(_mm_loadu_si128(p as *const __m128i))
    }

    macro_rules! float_walker {
        ($mnpack:ident, $entry:ident, $ta:ty, $tb:ty, $load_a:ident, $load_b:ident) => {
            #[target_feature(enable = "avx2,fma,f16c")]
            #[allow(clippy::too_many_arguments)]
            pub unsafe fn $entry(
                m: usize,
                n: usize,
                k: usize,
                a: *const $ta,
                lda: usize,
                b: *const $tb,
                ldb: usize,
                c: *mut f32,
                ldc: usize,
                ith: usize,
                nth: usize,
            ) {
                $mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, 0, m, 0, n);
            }

            #[target_feature(enable = "avx2,fma,f16c")]
            #[allow(clippy::too_many_arguments)]
            unsafe fn $mnpack(
                a: *const $ta,
                lda: usize,
                b: *const $tb,
                ldb: usize,
                c: *mut f32,
                ldc: usize,
                k: usize,
                ith: usize,
                nth: usize,
                m0: usize,
                m: usize,
                n0: usize,
                n: usize,
            ) {
                if m0 >= m || n0 >= n {
                    return;
                }
                let (mc, nc) = pick_tile(m - m0, n - n0);

                let ytiles = (m - m0) / mc;
                let xtiles = (n - n0) / nc;
                let tiles = ytiles * xtiles;
                let (start, end) = duty_range(tiles, ith, nth);
                for job in start..end {
                    let ii = m0 + job / xtiles * mc;
                    let jj = n0 + job % xtiles * nc;
                    let mut cv = [[_mm256_setzero_ps(); 4]; 3];
                    let mut ce = [[_mm256_setzero_ps(); 4]; 3];
                    let mut l = 0;
                    while l < k {
                        for j in 0..nc {
                            let bv = $load_b(b.add((jj + j) * ldb + l));
                            for i in 0..mc {
                                let av = $load_a(a.add((ii + i) * lda + l));
                                if PRECISE {
                                    let y = _mm256_sub_ps(_mm256_mul_ps(av, bv), ce[j][i]);
                                    let t = _mm256_add_ps(cv[j][i], y);
                                    ce[j][i] = _mm256_sub_ps(_mm256_sub_ps(t, cv[j][i]), y);
                                    cv[j][i] = t;
                                } else {
                                    cv[j][i] = _mm256_fmadd_ps(av, bv, cv[j][i]);
                                }
                            }
                        }
                        l += 8;
                    }
                    for j in 0..nc {
                        for i in 0..mc {
                            *c.add((jj + j) * ldc + ii + i) = hsum(cv[j][i]);
                        }
                    }
                }

                let mp = m0 + (m - m0) / mc * mc;
                let np = n0 + (n - n0) / nc * nc;
                $mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, mp, m, n0, np);
                $mnpack(a, lda, b, ldb, c, ldc, k, ith, nth, m0, m, np, n);
            }
        };
    }

    float_walker!(mnpack_f32, gemm_f32, f32, f32, load8_f32, load8_f32);
    float_walker!(mnpack_bf16, gemm_bf16, u16, u16, load8_bf16, load8_bf16);
    float_walker!(mnpack_f16, gemm_f16, u16, u16, load8_f16, load8_f16);

    macro_rules! thin_gemv {
        ($entry:ident, $ta:ty, $load_a:ident) => {
            /// n == 1 fast path against an FP32 vector.
            #[target_feature(enable = "avx2,fma,f16c")]
            pub unsafe fn $entry(
                m: usize,
                k: usize,
                a: *const $ta,
                lda: usize,
                b: *const f32,
                c: *mut f32,
                ith: usize,
                nth: usize,
            ) {
                let (start, end) = duty_range(m, ith, nth);
                for i in start..end {
                    let mut acc = _mm256_setzero_ps();
                    let mut l = 0;
                    while l < k {
                        let av = $load_a(a.add(i * lda + l));
                        let bv = _mm256_loadu_ps(b.add(l));
                        acc = _mm256_fmadd_ps(av, bv, acc);
                        l += 8;
                    }
                    *c.add(i) = hsum(acc);
                }
            }
        };
    }

    thin_gemv!(gemv_bf16_f32, u16, load8_bf16);
    thin_gemv!(gemv_f16_f32, u16, load8_f16);
}

// ── Public entries ──────────────────────────────────────────────────

/// # Safety
/// Pointer extents per the `sgemm` contract; `k % 8 == 0`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn gemm_f32(
    m: usize,
    n: usize,
    k: usize,
    a: *const f32,
    lda: usize,
    b: *const f32,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
) {
    #[cfg(target_arch = "x86_64")]
    if super::simd_available() {
        return avx2::gemm_f32(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
    }
    gemm_scalar(m, n, k, a, lda, b, ldb, c, ldc, ith, nth, |x| x, |x| x);
}

/// # Safety
/// Pointer extents per the `sgemm` contract; `k % 8 == 0`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn gemm_bf16(
    m: usize,
    n: usize,
    k: usize,
    a: *const u16,
    lda: usize,
    b: *const u16,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
) {
    #[cfg(target_arch = "x86_64")]
    if super::simd_available() {
        return avx2::gemm_bf16(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
    }
    gemm_scalar(m, n, k, a, lda, b, ldb, c, ldc, ith, nth, bf16_to_f32, bf16_to_f32);
}

/// # Safety
/// Pointer extents per the `sgemm` contract; `k % 8 == 0`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn gemm_f16(
    m: usize,
    n: usize,
    k: usize,
    a: *const u16,
    lda: usize,
    b: *const u16,
    ldb: usize,
    c: *mut f32,
    ldc: usize,
    ith: usize,
    nth: usize,
) {
    #[cfg(target_arch = "x86_64")]
    if super::simd_available() {
        return avx2::gemm_f16(m, n, k, a, lda, b, ldb, c, ldc, ith, nth);
    }
    gemm_scalar(m, n, k, a, lda, b, ldb, c, ldc, ith, nth, f16_to_f32, f16_to_f32);
}

/// # Safety
/// Pointer extents per the `sgemm` contract; `k % 8 == 0`.
pub unsafe fn gemv_bf16_f32(
    m: usize,
    k: usize,
    a: *const u16,
    lda: usize,
    b: *const f32,
    c: *mut f32,
    ith: usize,
    nth: usize,
) {
    #[cfg(target_arch = "x86_64")]
    if super::simd_available() {
        return avx2::gemv_bf16_f32(m, k, a, lda, b, c, ith, nth);
    }
    gemm_scalar(m, 1, k, a, lda, b, k, c, m, ith, nth, bf16_to_f32, |x| x);
}

/// # Safety
/// Pointer extents per the `sgemm` contract; `k % 8 == 0`.
pub unsafe fn gemv_f16_f32(
    m: usize,
    k: usize,
    a: *const u16,
    lda: usize,
    b: *const f32,
    c: *mut f32,
    ith: usize,
    nth: usize,
) {
    #[cfg(target_arch = "x86_64")]
    if super::simd_available() {
        return avx2::gemv_f16_f32(m, k, a, lda, b, c, ith, nth);
    }
    gemm_scalar(m, 1, k, a, lda, b, k, c, m, ith, nth, f16_to_f32, |x| x);
}
