//! Compile-time configuration of a kernel variant and its name grammar.
//!
//! A kernel is identified by its configuration tuple. Names follow
//!
//! ```text
//! {prefix}_{block}x{m}x{n}x{k}_{wave_m}x{wave_n}_{rep_m}x{rep_n}_vec{w}_{sched}_v{pipe}[_{k_batch}][_{padding}]
//! ```
//!
//! e.g. `fp8fp8bf16_rowwise_256x128x128x128_32x32_2x2_vec16_intrawave_v3`.
//! The padding suffix is omitted for full M/N/K padding, which is the
//! default.

use std::fmt;
use std::str::FromStr;

use crate::error::{KernelError, Result};

/// Threads per wavefront. A block runs `block_size / WAVEFRONT` waves.
pub const WAVEFRONT: usize = 64;

/// Pipeline scheduling of the block's waves over the K loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheduler {
    /// Each wave walks the whole K panel of its sub-tile before the next wave.
    Intrawave,
    /// All waves advance together one K tile at a time.
    Interwave,
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheduler::Intrawave => write!(f, "intrawave"),
            Scheduler::Interwave => write!(f, "interwave"),
        }
    }
}

/// Which dimensions the kernel zero-pads instead of requiring divisibility
/// by the block tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PaddingMode {
    None,
    M,
    MN,
    #[default]
    MNK,
}

impl PaddingMode {
    pub fn pads_m(&self) -> bool {
        !matches!(self, PaddingMode::None)
    }

    pub fn pads_n(&self) -> bool {
        matches!(self, PaddingMode::MN | PaddingMode::MNK)
    }

    pub fn pads_k(&self) -> bool {
        matches!(self, PaddingMode::MNK)
    }

    fn suffix(&self) -> Option<&'static str> {
        match self {
            PaddingMode::None => Some("nopad"),
            PaddingMode::M => Some("padm"),
            PaddingMode::MN => Some("padmn"),
            PaddingMode::MNK => None,
        }
    }
}

/// The configuration tuple that identifies a kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelConfig {
    pub block_size: usize,
    pub m_per_block: usize,
    pub n_per_block: usize,
    pub k_per_block: usize,
    pub wave_m: usize,
    pub wave_n: usize,
    pub m_repeat: usize,
    pub n_repeat: usize,
    /// Vector load width along K and store width along N.
    pub vector_width: usize,
    pub scheduler: Scheduler,
    pub pipeline: u8,
    /// Number of K splits reduced into the output (split-K).
    pub k_batch: usize,
    pub padding: PaddingMode,
}

impl KernelConfig {
    /// Check that the wave layout tiles the block exactly.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(KernelError::InvalidConfig {
                name: self.to_string(),
                reason,
            })
        };
        let dims = [
            self.block_size,
            self.m_per_block,
            self.n_per_block,
            self.k_per_block,
            self.wave_m,
            self.wave_n,
            self.m_repeat,
            self.n_repeat,
            self.vector_width,
            self.k_batch,
        ];
        if dims.iter().any(|&d| d == 0) {
            return fail("all tile parameters must be positive".into());
        }
        if !(1..=5).contains(&self.pipeline) {
            return fail(format!("pipeline version v{} is not one of v1..v5", self.pipeline));
        }
        if self.block_size % WAVEFRONT != 0 {
            return fail(format!("block size {} is not a multiple of {WAVEFRONT}", self.block_size));
        }
        let wave_tile_m = self.wave_m * self.m_repeat;
        let wave_tile_n = self.wave_n * self.n_repeat;
        if self.m_per_block % wave_tile_m != 0 || self.n_per_block % wave_tile_n != 0 {
            return fail(format!(
                "wave tile {wave_tile_m}x{wave_tile_n} does not divide block tile {}x{}",
                self.m_per_block, self.n_per_block
            ));
        }
        let (wm, wn) = self.waves();
        if wm * wn != self.block_size / WAVEFRONT {
            return fail(format!(
                "{wm}x{wn} waves do not match block size {}",
                self.block_size
            ));
        }
        Ok(())
    }

    /// Wave grid of one block: (waves along M, waves along N).
    pub fn waves(&self) -> (usize, usize) {
        (
            self.m_per_block / (self.wave_m * self.m_repeat),
            self.n_per_block / (self.wave_n * self.n_repeat),
        )
    }

    /// Block tile volume, used to rank configurations by size.
    pub fn tile_volume(&self) -> usize {
        self.m_per_block * self.n_per_block * self.k_per_block
    }

    /// Whether a problem of this shape is inside the padding-safe range.
    pub fn supports(&self, m: usize, n: usize, k: usize) -> bool {
        if m == 0 || n == 0 || k == 0 {
            return false;
        }
        if n % self.vector_width != 0 || k % self.vector_width != 0 {
            return false;
        }
        (self.padding.pads_m() || m % self.m_per_block == 0)
            && (self.padding.pads_n() || n % self.n_per_block == 0)
            && (self.padding.pads_k() || k % (self.k_per_block * self.k_batch) == 0)
    }

    /// Full kernel name under a catalog prefix.
    pub fn name(&self, prefix: &str) -> String {
        format!("{prefix}_{self}")
    }

    /// Parse a full kernel name into its prefix and configuration.
    pub fn parse(name: &str) -> Result<(String, KernelConfig)> {
        let bad = |reason: &str| KernelError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let tokens: Vec<&str> = name.split('_').collect();
        let start = tokens
            .iter()
            .position(|t| parse_dims::<4>(t).is_some())
            .ok_or_else(|| bad("missing block tile token"))?;
        if start == 0 {
            return Err(bad("missing catalog prefix"));
        }
        let prefix = tokens[..start].join("_");
        let config: KernelConfig = tokens[start..].join("_").parse().map_err(|e: String| bad(&e))?;
        config.validate()?;
        Ok((prefix, config))
    }
}

fn parse_dims<const N: usize>(token: &str) -> Option<[usize; N]> {
    let mut out = [0usize; N];
    let mut parts = token.split('x');
    for slot in out.iter_mut() {
        *slot = parts.next()?.parse().ok()?;
    }
    parts.next().is_none().then_some(out)
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}_{}x{}_{}x{}_vec{}_{}_v{}",
            self.block_size,
            self.m_per_block,
            self.n_per_block,
            self.k_per_block,
            self.wave_m,
            self.wave_n,
            self.m_repeat,
            self.n_repeat,
            self.vector_width,
            self.scheduler,
            self.pipeline
        )?;
        if self.k_batch > 1 {
            write!(f, "_{}", self.k_batch)?;
        }
        if let Some(suffix) = self.padding.suffix() {
            write!(f, "_{suffix}")?;
        }
        Ok(())
    }
}

impl FromStr for KernelConfig {
    type Err = String;

    /// Parse the configuration part of a name (everything after the prefix).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut tokens = s.split('_');
        let mut next = |what: &str| tokens.next().ok_or_else(|| format!("missing {what}"));

        let [block_size, m_per_block, n_per_block, k_per_block] =
            parse_dims::<4>(next("block tile")?).ok_or("malformed block tile")?;
        let [wave_m, wave_n] = parse_dims::<2>(next("wave tile")?).ok_or("malformed wave tile")?;
        let [m_repeat, n_repeat] = parse_dims::<2>(next("repeats")?).ok_or("malformed repeats")?;
        let vector_width = next("vector width")?
            .strip_prefix("vec")
            .and_then(|w| w.parse().ok())
            .ok_or("malformed vector width")?;
        let scheduler = match next("scheduler")? {
            "intrawave" => Scheduler::Intrawave,
            "interwave" => Scheduler::Interwave,
            other => return Err(format!("unknown scheduler '{other}'")),
        };
        let pipeline = next("pipeline")?
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or("malformed pipeline version")?;

        let mut k_batch = 1;
        let mut padding = PaddingMode::MNK;
        for token in tokens {
            match token {
                "nopad" => padding = PaddingMode::None,
                "padm" => padding = PaddingMode::M,
                "padmn" => padding = PaddingMode::MN,
                t => {
                    k_batch = t
                        .parse()
                        .map_err(|_| format!("unexpected token '{t}'"))?;
                }
            }
        }

        Ok(KernelConfig {
            block_size,
            m_per_block,
            n_per_block,
            k_per_block,
            wave_m,
            wave_n,
            m_repeat,
            n_repeat,
            vector_width,
            scheduler,
            pipeline,
            k_batch,
            padding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "fp8fp8bf16_rowwise_256x128x128x128_32x32_2x2_vec16_intrawave_v3";

    #[test]
    fn test_parse_name() {
        let (prefix, cfg) = KernelConfig::parse(NAME).unwrap();
        assert_eq!(prefix, "fp8fp8bf16_rowwise");
        assert_eq!(cfg.block_size, 256);
        assert_eq!((cfg.m_per_block, cfg.n_per_block, cfg.k_per_block), (128, 128, 128));
        assert_eq!(cfg.waves(), (2, 2));
        assert_eq!(cfg.scheduler, Scheduler::Intrawave);
        assert_eq!(cfg.pipeline, 3);
        assert_eq!(cfg.k_batch, 1);
        assert_eq!(cfg.padding, PaddingMode::MNK);
        assert_eq!(cfg.name(&prefix), NAME);
    }

    #[test]
    fn test_parse_suffixes() {
        let (_, cfg) = KernelConfig::parse(
            "fp8fp8bf16_rowwise_128x16x32x128_16x16_1x1_vec16_interwave_v2_4_nopad",
        )
        .unwrap();
        assert_eq!(cfg.k_batch, 4);
        assert_eq!(cfg.padding, PaddingMode::None);
        assert!(cfg.to_string().ends_with("_v2_4_nopad"));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(KernelConfig::parse("256x128x128x128_32x32_2x2_vec16_intrawave_v3").is_err());
        assert!(KernelConfig::parse("p_256x128x128_32x32_2x2_vec16_intrawave_v3").is_err());
        assert!(KernelConfig::parse("p_256x128x128x128_32x32_2x2_vec16_sideways_v3").is_err());
        // 2x2 waves cannot fill a 128-thread block
        assert!(matches!(
            KernelConfig::parse("p_128x128x128x128_32x32_2x2_vec16_intrawave_v3"),
            Err(KernelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_supports_padding() {
        let (_, mut cfg) = KernelConfig::parse(NAME).unwrap();
        assert!(cfg.supports(5, 64, 48));
        assert!(!cfg.supports(5, 60, 48), "N must be a multiple of the vector width");
        assert!(!cfg.supports(0, 64, 64));

        cfg.padding = PaddingMode::None;
        assert!(!cfg.supports(5, 128, 128));
        assert!(cfg.supports(256, 128, 384));

        cfg.padding = PaddingMode::M;
        assert!(cfg.supports(5, 128, 128));
        assert!(!cfg.supports(5, 64, 128));
    }

    #[test]
    fn test_split_k_divisibility() {
        let (_, cfg) = KernelConfig::parse(
            "p_128x16x32x128_16x16_1x1_vec16_interwave_v2_4_padmn",
        )
        .unwrap();
        assert!(cfg.supports(3, 48, 512));
        assert!(!cfg.supports(3, 48, 256));
    }
}
