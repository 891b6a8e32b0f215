//! Resource planning for the encoder
//!
//! Derives how hard a single encode may push the host from CPU core count and configuration.
//! The host also serves HTTP, so the encoder never gets every core.

use crate::config::Config;

/// Resource plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Threads handed to the encoder (`-threads`)
    pub encoder_threads: u32,
    /// Whether the encoder runs under nice/ionice
    pub deprioritize: bool,
    /// CPU niceness (0-19)
    pub nice_level: i32,
    /// Best-effort IO priority level (0-7)
    pub ionice_level: u8,
}

impl ResourcePlan {
    /// Derive a resource plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.25, 1.0]
    /// - encoder_threads = round(cores * utilization), at least 1
    /// - Clamps nice to [0, 19] and ionice to [0, 7]
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let encoder_threads = ((total_cores as f32) * clamped_utilization).round() as u32;

        Self {
            total_cores,
            encoder_threads: encoder_threads.max(1),
            deprioritize: cfg.encoder.deprioritize,
            nice_level: cfg.encoder.nice_level.clamp(0, 19),
            ionice_level: cfg.encoder.ionice_level.min(7),
        }
    }
}

impl Default for ResourcePlan {
    fn default() -> Self {
        Self {
            total_cores: 1,
            encoder_threads: 1,
            deprioritize: true,
            nice_level: 10,
            ionice_level: 7,
        }
    }
}

fn clamp_utilization(util: f32) -> f32 {
    if util.is_nan() {
        return 1.0;
    }
    util.clamp(0.25, 1.0)
}

/// Public function to derive a resource plan from configuration
pub fn derive_plan(cfg: &Config) -> ResourcePlan {
    ResourcePlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_encoder_threads_follow_clamped_utilization(
            cores in 1u32..256,
            raw_utilization in -1.0f32..3.0,
        ) {
            let cfg = Config {
                cpu: CpuConfig {
                    logical_cores: Some(cores),
                    target_cpu_utilization: raw_utilization,
                },
                ..Config::default()
            };

            let plan = derive_plan(&cfg);

            let clamped = raw_utilization.clamp(0.25, 1.0);
            let expected = (((cores as f32) * clamped).round() as u32).max(1);

            prop_assert_eq!(plan.total_cores, cores);
            prop_assert_eq!(plan.encoder_threads, expected);
            prop_assert!(plan.encoder_threads >= 1 && plan.encoder_threads <= cores);
        }

        #[test]
        fn prop_priorities_are_clamped(
            nice in -40i32..40,
            ionice in 0u8..=255,
        ) {
            let mut cfg = Config::default();
            cfg.cpu.logical_cores = Some(4);
            cfg.encoder.nice_level = nice;
            cfg.encoder.ionice_level = ionice;

            let plan = derive_plan(&cfg);

            prop_assert!((0..=19).contains(&plan.nice_level));
            prop_assert!(plan.ionice_level <= 7);
        }
    }

    #[test]
    fn test_raspberry_pi_defaults() {
        let mut cfg = Config::default();
        cfg.cpu.logical_cores = Some(4);

        let plan = derive_plan(&cfg);

        // 4 cores * 0.75
        assert_eq!(plan.encoder_threads, 3);
        assert!(plan.deprioritize);
        assert_eq!(plan.nice_level, 10);
        assert_eq!(plan.ionice_level, 7);
    }

    #[test]
    fn test_auto_detected_cores_are_positive() {
        let plan = derive_plan(&Config::default());
        assert!(plan.total_cores >= 1);
        assert!(plan.encoder_threads >= 1);
    }
}
