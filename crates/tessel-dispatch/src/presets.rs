//! Built-in tables and heuristic rules.
//!
//! Kernel names are configuration strings resolved under each catalog's
//! prefix. Heuristic rules are ordered by growing block tile so selection
//! grows with the problem.

use crate::heuristic::{HeuristicRules, RangeRule};
use crate::tables::TableSpec;

// =============================================================================
// FP8 rowwise
// =============================================================================

pub fn fp8_rowwise_tables() -> TableSpec {
    TableSpec::default()
        .exact(16, 8192, 8192, "128x16x32x128_16x16_1x1_vec16_interwave_v2_4")
        .exact(128, 4096, 4096, "256x128x128x128_32x32_2x2_vec16_intrawave_v5")
        .exact(4096, 4096, 4096, "256x256x256x128_16x16_8x8_vec16_intrawave_v3_nopad")
        .family(
            8192,
            8192,
            &[
                (16, "64x16x16x256_16x16_1x1_vec16_intrawave_v1"),
                (32, "256x32x128x256_32x32_1x1_vec16_intrawave_v3"),
                (64, "256x64x128x128_32x32_1x2_vec16_intrawave_v3"),
                (128, "256x128x128x128_32x32_2x2_vec16_intrawave_v3"),
                (512, "256x128x256x128_32x32_2x4_vec16_intrawave_v3"),
                (2048, "256x256x128x128_32x32_4x2_vec16_intrawave_v3"),
                (8192, "256x256x256x128_16x16_8x8_vec16_intrawave_v3"),
            ],
        )
        .family(
            1280,
            8192,
            &[
                (16, "128x16x32x512_16x16_1x1_vec16_interwave_v2"),
                (64, "128x32x64x128_32x32_1x1_vec16_interwave_v2"),
                (256, "256x64x128x128_32x32_1x2_vec16_intrawave_v3"),
                (1024, "256x128x128x128_32x32_2x2_vec16_intrawave_v3"),
            ],
        )
}

pub fn fp8_rowwise_rules() -> HeuristicRules {
    HeuristicRules {
        rules: vec![
            // Memory bound
            RangeRule::mnk(16, 2048, 2048, "64x16x16x128_16x16_1x1_vec16_interwave_v1"),
            RangeRule::m(16, "128x16x32x512_16x16_1x1_vec16_interwave_v2"),
            RangeRule::m(32, "256x32x128x256_32x32_1x1_vec16_intrawave_v3"),
            // Balanced
            RangeRule::m(64, "256x64x128x128_32x32_1x2_vec16_intrawave_v3"),
            RangeRule::mn(128, 4096, "256x128x128x128_32x32_2x2_vec16_intrawave_v3"),
            RangeRule::m(256, "256x128x256x128_32x32_2x4_vec16_intrawave_v3"),
            // Compute bound
            RangeRule::m(2048, "256x256x128x128_32x32_4x2_vec16_intrawave_v3"),
        ],
        default: "256x256x256x128_16x16_8x8_vec16_intrawave_v3".into(),
    }
}

// =============================================================================
// BF16
// =============================================================================

pub fn bf16_tables() -> TableSpec {
    TableSpec::default()
        .exact(128, 4096, 4096, "256x128x128x64_32x32_2x2_vec8_intrawave_v3")
        .exact(16, 4096, 4096, "128x16x32x64_16x16_1x1_vec8_interwave_v2_4")
        .family(
            4096,
            4096,
            &[
                (16, "64x16x16x64_16x16_1x1_vec8_interwave_v1"),
                (32, "128x32x64x64_32x32_1x1_vec8_interwave_v2"),
                (64, "256x64x128x64_32x32_1x2_vec8_intrawave_v3"),
                (128, "256x128x128x64_32x32_2x2_vec8_intrawave_v3"),
                (512, "256x128x256x64_32x32_2x4_vec8_intrawave_v3"),
                (4096, "256x256x256x64_32x32_4x4_vec8_intrawave_v4"),
            ],
        )
}

pub fn bf16_rules() -> HeuristicRules {
    HeuristicRules {
        rules: vec![
            RangeRule::mnk(16, 2048, 2048, "64x16x16x64_16x16_1x1_vec8_interwave_v1"),
            RangeRule::m(16, "128x16x32x64_16x16_1x1_vec8_intrawave_v2"),
            RangeRule::m(32, "128x32x64x64_32x32_1x1_vec8_interwave_v2"),
            RangeRule::m(64, "256x64x128x64_32x32_1x2_vec8_intrawave_v3"),
            RangeRule::m(128, "256x128x128x64_32x32_2x2_vec8_intrawave_v3"),
            RangeRule::m(512, "256x128x256x64_32x32_2x4_vec8_intrawave_v3"),
        ],
        default: "256x256x256x64_32x32_4x4_vec8_intrawave_v4".into(),
    }
}

// =============================================================================
// Grouped
// =============================================================================

pub fn fp8_grouped_tables() -> TableSpec {
    TableSpec::default()
        .family(
            5120,
            1024,
            &[
                (64, "128x16x32x128_16x16_1x1_vec16_interwave_v2"),
                (512, "256x64x128x128_32x32_1x2_vec16_intrawave_v3"),
                (4096, "256x128x128x128_32x32_2x2_vec16_intrawave_v3"),
            ],
        )
        .with_groups(16)
}

pub fn fp8_grouped_rules() -> HeuristicRules {
    HeuristicRules {
        rules: vec![
            RangeRule::m(64, "128x16x32x128_16x16_1x1_vec16_interwave_v2"),
            RangeRule::m(256, "128x32x64x128_32x32_1x1_vec16_interwave_v2"),
            RangeRule::m(1024, "256x64x128x128_32x32_1x2_vec16_intrawave_v3"),
            RangeRule::m(4096, "256x128x128x128_32x32_2x2_vec16_intrawave_v3"),
        ],
        default: "256x256x256x128_16x16_8x8_vec16_intrawave_v3".into(),
    }
}

pub fn bf16_grouped_tables() -> TableSpec {
    TableSpec::default()
        .family(
            2048,
            4096,
            &[
                (64, "128x16x32x64_16x16_1x1_vec8_interwave_v2"),
                (512, "256x64x128x64_32x32_1x2_vec8_intrawave_v3"),
                (4096, "256x128x128x64_32x32_2x2_vec8_intrawave_v3"),
            ],
        )
        .with_groups(8)
}

pub fn bf16_grouped_rules() -> HeuristicRules {
    HeuristicRules {
        rules: vec![
            RangeRule::m(64, "128x16x32x64_16x16_1x1_vec8_interwave_v2"),
            RangeRule::m(256, "128x32x64x64_32x32_1x1_vec8_interwave_v2"),
            RangeRule::m(1024, "256x64x128x64_32x32_1x2_vec8_intrawave_v3"),
            RangeRule::m(4096, "256x128x128x64_32x32_2x2_vec8_intrawave_v3"),
        ],
        default: "256x256x256x64_32x32_4x4_vec8_intrawave_v4".into(),
    }
}
