//! Register-level tile product used inside every block tile.
//!
//! `c[m×n] += a[m×k] · b[k×n]` on packed f32 tiles with explicit leading
//! dimensions, dispatching to an AVX2+FMA inner loop when available and a
//! scalar loop otherwise.

use crate::simd::SimdCapability;

/// Accumulate one wave sub-tile.
#[allow(clippy::too_many_arguments)]
pub fn tile_matmul(
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    if SimdCapability::detect().avx2 {
        tile_matmul_avx2(a, lda, b, ldb, c, ldc, m, n, k);
    } else {
        tile_matmul_scalar(a, lda, b, ldb, c, ldc, m, n, k);
    }
}

#[allow(clippy::too_many_arguments)]
fn tile_matmul_scalar(
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    for i in 0..m {
        let c_row = &mut c[i * ldc..i * ldc + n];
        for p in 0..k {
            let a_val = a[i * lda + p];
            let b_row = &b[p * ldb..p * ldb + n];
            for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                *cv += a_val * bv;
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[allow(clippy::too_many_arguments)]
fn tile_matmul_avx2(
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    if !is_x86_feature_detected!("avx2") || !is_x86_feature_detected!("fma") {
        return tile_matmul_scalar(a, lda, b, ldb, c, ldc, m, n, k);
    }
    if m > 0 && n > 0 {
        assert!(c.len() >= (m - 1) * ldc + n, "C tile out of bounds");
        assert!(k == 0 || b.len() >= (k - 1) * ldb + n, "B tile out of bounds");
    }

    // Safety: AVX2+FMA checked above; bounds asserted for every row touched.
    unsafe { tile_matmul_avx2_inner(a, lda, b, ldb, c, ldc, m, n, k) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[allow(clippy::too_many_arguments)]
unsafe fn tile_matmul_avx2_inner(
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    use std::arch::x86_64::*;

    for i in 0..m {
        for p in 0..k {
            let a_scalar = a[i * lda + p];
            let a_val = _mm256_set1_ps(a_scalar);

            let mut j = 0;
            while j + 8 <= n {
                let c_ptr = c.as_mut_ptr().add(i * ldc + j);
                let b_ptr = b.as_ptr().add(p * ldb + j);

                let c_vec = _mm256_loadu_ps(c_ptr);
                let b_vec = _mm256_loadu_ps(b_ptr);
                _mm256_storeu_ps(c_ptr, _mm256_fmadd_ps(a_val, b_vec, c_vec));

                j += 8;
            }

            // Scalar tail
            while j < n {
                c[i * ldc + j] += a_scalar * b[p * ldb + j];
                j += 1;
            }
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[allow(clippy::too_many_arguments)]
fn tile_matmul_avx2(
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    tile_matmul_scalar(a, lda, b, ldb, c, ldc, m, n, k);
}
