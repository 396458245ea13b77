//! Configuration loading for the navigation core

use std::path::Path;

use serde::Deserialize;

use crate::common::{NavError, NavResult};
use crate::mapping::CostmapConfig;
use crate::mission_planning::MachineConfig;
use crate::path_planning::PlannerConfig;
use crate::path_tracking::ReturnConfig;
use crate::perception::{InputsConfig, TrackerConfig};

/// Top-level configuration. Every section may be omitted.
#[derive(Clone, Debug, Deserialize)]
pub struct NavConfig {
    #[serde(default)]
    pub costmap: CostmapConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub controller: ReturnConfig,
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub inputs: InputsConfig,

    /// Run costmap fusion and obstacle tracking on separate threads (default: true)
    #[serde(default = "default_parallel_update")]
    pub parallel_update: bool,
}

fn default_parallel_update() -> bool {
    true
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            costmap: CostmapConfig::default(),
            tracker: TrackerConfig::default(),
            planner: PlannerConfig::default(),
            controller: ReturnConfig::default(),
            machine: MachineConfig::default(),
            inputs: InputsConfig::default(),
            parallel_update: default_parallel_update(),
        }
    }
}

impl NavConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> NavResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> NavResult<Self> {
        let config: NavConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section plus the constraints that span sections.
    pub fn validate(&self) -> NavResult<()> {
        self.costmap.validate()?;
        self.tracker.validate()?;
        self.planner.validate()?;
        self.controller.validate()?;
        self.machine.validate()?;
        self.inputs.validate()?;

        // unknown space must stay traversable or nothing ever plans
        if self.costmap.baseline >= self.planner.blocking_threshold {
            return Err(NavError::Config(format!(
                "costmap baseline {} must be below blocking_threshold {}",
                self.costmap.baseline, self.planner.blocking_threshold
            )));
        }
        let reach = self.planner.search_radius + self.planner.clearance();
        if reach >= 0.5 * self.costmap.width_m.min(self.costmap.height_m) {
            return Err(NavError::Config(format!(
                "search radius plus clearance ({:.2} m) must fit inside the costmap window",
                reach
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NavConfig::from_toml_str("").unwrap();
        assert!(config.parallel_update);
        assert_eq!(config.planner.persistence_ticks, 3);
        assert_eq!(config.costmap.baseline, 0.5);
        assert_eq!(config.machine.clear_persistence_ticks, 3);
    }

    #[test]
    fn test_partial_sections() {
        let text = r#"
            parallel_update = false

            [planner]
            blocking_threshold = 0.8
            search_radius = 2.0

            [tracker]
            track_timeout = 2.5
        "#;
        let config = NavConfig::from_toml_str(text).unwrap();
        assert!(!config.parallel_update);
        assert_eq!(config.planner.blocking_threshold, 0.8);
        assert_eq!(config.planner.search_radius, 2.0);
        assert_eq!(config.planner.robot_radius, 0.3);
        assert_eq!(config.tracker.track_timeout, 2.5);
    }

    #[test]
    fn test_baseline_above_threshold_rejected() {
        let text = r#"
            [costmap]
            baseline = 0.8
        "#;
        let err = NavConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(err, NavError::Config(_)));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = NavConfig::from_toml_str("[planner\nrobot_radius = ").unwrap_err();
        assert!(matches!(err, NavError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = NavConfig::load(Path::new("/nonexistent/local_nav.toml")).unwrap_err();
        assert!(matches!(err, NavError::Io(_)));
    }
}
