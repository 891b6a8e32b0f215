//! Size Gate Module
//!
//! Checks an encoded artifact against the fixed upload ceiling.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeGateResult {
    /// Artifact fits under the ceiling
    Accept { output_bytes: u64 },
    /// Artifact is larger than the ceiling
    Reject { output_bytes: u64, ceiling_bytes: u64 },
    /// No artifact was produced
    Missing,
}

impl SizeGateResult {
    pub fn is_accept(&self) -> bool {
        matches!(self, SizeGateResult::Accept { .. })
    }

    /// Size of the artifact, if there is one
    pub fn output_bytes(&self) -> Option<u64> {
        match self {
            SizeGateResult::Accept { output_bytes } | SizeGateResult::Reject { output_bytes, .. } => {
                Some(*output_bytes)
            }
            SizeGateResult::Missing => None,
        }
    }
}

/// Check if a byte count passes the size gate.
///
/// Returns `Accept` if `output_bytes <= ceiling_bytes`, otherwise `Reject`.
pub fn check_size_gate(output_bytes: u64, ceiling_bytes: u64) -> SizeGateResult {
    if output_bytes <= ceiling_bytes {
        SizeGateResult::Accept { output_bytes }
    } else {
        SizeGateResult::Reject {
            output_bytes,
            ceiling_bytes,
        }
    }
}

/// Check the file at `path` against the ceiling; a missing file yields `Missing`.
pub fn check_file(path: &Path, ceiling_bytes: u64) -> SizeGateResult {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => check_size_gate(meta.len(), ceiling_bytes),
        _ => SizeGateResult::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_size_gate_threshold(
            output_bytes in 0u64..=u64::MAX / 2,
            ceiling_bytes in 0u64..=u64::MAX / 2,
        ) {
            match check_size_gate(output_bytes, ceiling_bytes) {
                SizeGateResult::Accept { output_bytes: out } => {
                    prop_assert!(out <= ceiling_bytes,
                        "Accept returned but output_bytes ({}) > ceiling ({})",
                        out, ceiling_bytes);
                }
                SizeGateResult::Reject { output_bytes: out, ceiling_bytes: ceil } => {
                    prop_assert!(out > ceil,
                        "Reject returned but output_bytes ({}) <= ceiling ({})",
                        out, ceil);
                    prop_assert_eq!(out, output_bytes);
                }
                SizeGateResult::Missing => prop_assert!(false, "byte check never reports Missing"),
            }
        }
    }

    #[test]
    fn test_exactly_at_ceiling_is_accepted() {
        assert!(check_size_gate(10_380_902, 10_380_902).is_accept());
        assert!(!check_size_gate(10_380_903, 10_380_902).is_accept());
    }

    #[test]
    fn test_check_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.mp4");

        assert_eq!(check_file(&path, 100), SizeGateResult::Missing);

        std::fs::write(&path, vec![0u8; 150]).unwrap();
        assert_eq!(
            check_file(&path, 100),
            SizeGateResult::Reject {
                output_bytes: 150,
                ceiling_bytes: 100
            }
        );
        assert_eq!(check_file(&path, 150).output_bytes(), Some(150));
    }
}
