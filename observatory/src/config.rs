//! Observatory configuration file
//!
//! One TOML table per subsystem. Every table may carry a driver reference
//! (`driver`, `transport`, `args`, `kwargs`) next to the subsystem's tunables;
//! a table without `driver` means the subsystem is not installed but keeps
//! its tunables. Roles that may have several devices use arrays of tables.
//!
//! ```toml
//! [site]
//! name = "Winer Observatory"
//! latitude = 31.6656
//! longitude = -110.6018
//!
//! [camera]
//! driver = "simulator"
//! cooler_setpoint = -10.0
//!
//! [[safety_monitor]]
//! driver = "simulator"
//! kwargs = { name = "roof" }
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// How a driver reaches its device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Local,
    Network,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Local => write!(f, "local"),
            Transport::Network => write!(f, "network"),
        }
    }
}

/// Driver reference embedded in a subsystem table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, Value>,
}

impl DriverSpec {
    pub fn driver(name: &str) -> Self {
        Self {
            driver: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn is_installed(&self) -> bool {
        self.driver.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSection {
    pub name: String,
    pub instrument_name: String,
    pub instrument_description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    /// Aperture diameter in metres
    pub diameter: f64,
    /// Focal length in millimetres
    pub focal_length: f64,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            name: "Starwatch Site".to_string(),
            instrument_name: "Starwatch Instrument".to_string(),
            instrument_description: "Starwatch observatory orchestration".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0.0,
            diameter: 0.0,
            focal_length: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSection {
    #[serde(flatten)]
    pub device: DriverSpec,
    pub cooler_setpoint: Option<f64>,
    pub cooler_tolerance: f64,
    pub max_dimension: Option<u32>,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            device: DriverSpec::default(),
            cooler_setpoint: None,
            cooler_tolerance: 1.0,
            max_dimension: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverCalibratorSection {
    #[serde(flatten)]
    pub device: DriverSpec,
    /// Mount altitude that points at the panel
    pub alt: f64,
    pub az: f64,
}

impl Default for CoverCalibratorSection {
    fn default() -> Self {
        Self {
            device: DriverSpec::default(),
            alt: 80.0,
            az: 180.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterWheelSection {
    #[serde(flatten)]
    pub device: DriverSpec,
    pub filters: Vec<String>,
    /// Focuser offset per filter, parallel to `filters`
    pub focus_offsets: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocuserSection {
    #[serde(flatten)]
    pub device: DriverSpec,
    pub max_error: f64,
}

impl Default for FocuserSection {
    fn default() -> Self {
        Self {
            device: DriverSpec::default(),
            max_error: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorSection {
    #[serde(flatten)]
    pub device: DriverSpec,
    pub reverse: bool,
    pub min_angle: Option<f64>,
    pub max_angle: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeSection {
    #[serde(flatten)]
    pub device: DriverSpec,
    pub min_altitude: f64,
    /// Seconds to wait after a slew
    pub settle_time: f64,
}

impl Default for TelescopeSection {
    fn default() -> Self {
        Self {
            device: DriverSpec::default(),
            min_altitude: 10.0,
            settle_time: 5.0,
        }
    }
}

/// Complete observatory configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub site: SiteSection,
    pub camera: CameraSection,
    pub cover_calibrator: CoverCalibratorSection,
    pub dome: DriverSpec,
    pub filter_wheel: FilterWheelSection,
    pub focuser: FocuserSection,
    pub observing_conditions: DriverSpec,
    pub rotator: RotatorSection,
    pub telescope: TelescopeSection,
    pub autofocus: DriverSpec,
    pub fwhm: DriverSpec,
    pub safety_monitor: Vec<DriverSpec>,
    pub switch: Vec<DriverSpec>,
    pub wcs: Vec<DriverSpec>,
}

impl ObservatoryConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loading observatory config from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Structural checks that clamping cannot repair
    pub fn validate(&self) -> Result<(), ConfigError> {
        let offsets = &self.filter_wheel.focus_offsets;
        if !offsets.is_empty() && offsets.len() != self.filter_wheel.filters.len() {
            return Err(ConfigError::InvalidValue {
                field: "filter_wheel.focus_offsets".to_string(),
                reason: format!(
                    "{} offsets for {} filters",
                    offsets.len(),
                    self.filter_wheel.filters.len()
                ),
            });
        }
        if let (Some(min), Some(max)) = (self.rotator.min_angle, self.rotator.max_angle) {
            if min >= max {
                return Err(ConfigError::InvalidValue {
                    field: "rotator.min_angle".to_string(),
                    reason: format!("{} is not below max_angle {}", min, max),
                });
            }
        }
        for (role, list) in [
            ("safety_monitor", &self.safety_monitor),
            ("switch", &self.switch),
            ("wcs", &self.wcs),
        ] {
            if list.iter().any(|spec| spec.driver.is_none()) {
                return Err(ConfigError::InvalidValue {
                    field: role.to_string(),
                    reason: "every entry needs a driver".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [site]
        name = "Test Site"
        latitude = 41.66
        longitude = -91.53
        focal_length = 2000.0

        [camera]
        driver = "simulator"
        cooler_setpoint = -10.0

        [filter_wheel]
        driver = "simulator"
        transport = "local"
        filters = ["L", "R"]
        focus_offsets = [0, 120]
        kwargs = { slots = 2 }

        [telescope]
        driver = "simulator"
        min_altitude = 20.0

        [[safety_monitor]]
        driver = "simulator"
        args = ["roof"]

        [[safety_monitor]]
        driver = "simulator"
        transport = "network"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ObservatoryConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.site.name, "Test Site");
        assert_eq!(config.camera.device.driver.as_deref(), Some("simulator"));
        assert_eq!(config.camera.cooler_tolerance, 1.0);
        assert_eq!(config.filter_wheel.focus_offsets, vec![0, 120]);
        assert_eq!(config.filter_wheel.device.kwargs["slots"], Value::from(2));
        assert_eq!(config.telescope.min_altitude, 20.0);
        assert_eq!(config.telescope.settle_time, 5.0);
        assert_eq!(config.safety_monitor.len(), 2);
        assert_eq!(config.safety_monitor[1].transport, Transport::Network);
        assert!(!config.dome.is_installed());
        assert_eq!(config.cover_calibrator.alt, 80.0);
    }

    #[test]
    fn test_offsets_must_match_filters() {
        let text = r#"
            [filter_wheel]
            filters = ["L", "R", "G"]
            focus_offsets = [0, 10]
        "#;
        assert!(matches!(
            ObservatoryConfig::from_toml_str(text),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.toml");
        let config = ObservatoryConfig::from_toml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let back = ObservatoryConfig::load(&path).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        assert!(matches!(
            ObservatoryConfig::from_toml_str("[site"),
            Err(ConfigError::Parse(_))
        ));
    }
}
