//! Runtime SIMD capability detection.
//!
//! Detected once per process; the microkernel and `tessel info` read it.

use std::sync::OnceLock;

/// SIMD capabilities detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub avx2: bool,
    pub avx512f: bool,
    pub neon: bool,
    pub fma: bool,
}

static DETECTED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    /// Detect SIMD capabilities for the current CPU.
    pub fn detect() -> &'static SimdCapability {
        DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                SimdCapability {
                    avx2: is_x86_feature_detected!("avx2"),
                    avx512f: is_x86_feature_detected!("avx512f"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                SimdCapability {
                    avx2: false,
                    avx512f: false,
                    fma: false,
                    neon: true,
                }
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                SimdCapability {
                    avx2: false,
                    avx512f: false,
                    fma: false,
                    neon: false,
                }
            }
        })
    }

    /// Best tier the microkernel actually uses.
    ///
    /// Only the AVX2+FMA path is vectorised; AVX-512 and NEON hosts report
    /// their tier but run the AVX2 or scalar loop.
    pub fn kernel_tier(&self) -> &'static str {
        if self.avx2 && self.fma {
            "AVX2+FMA"
        } else {
            "scalar"
        }
    }

    /// Best available SIMD tier as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.avx512f {
            "AVX-512"
        } else if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }

    /// f32 lanes per vector register of the best tier.
    pub fn f32_lanes(&self) -> usize {
        if self.avx512f {
            16
        } else if self.avx2 {
            8
        } else if self.neon {
            4
        } else {
            1
        }
    }
}
