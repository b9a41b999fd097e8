//! Driver registry
//!
//! Maps a driver name from the config file to a factory for each subsystem
//! role. Factories receive the whole [`DriverSpec`] so they can read their
//! positional and keyword arguments.

use crate::config::{DriverSpec, Transport};
use crate::error::ConfigError;
use serde_json::Value;
use starwatch_devices::sim::*;
use starwatch_devices::*;
use std::collections::HashMap;
use std::sync::Arc;

type Factory<T> = Box<dyn Fn(&DriverSpec) -> Result<Arc<T>, ConfigError> + Send + Sync>;

struct Entry<T: ?Sized> {
    transports: Vec<Transport>,
    factory: Factory<T>,
}

/// Factories for a single role, keyed by driver name
pub struct RoleRegistry<T: ?Sized> {
    role: &'static str,
    entries: HashMap<String, Entry<T>>,
}

impl<T: ?Sized> RoleRegistry<T> {
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            entries: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, driver: &str, transports: &[Transport], factory: F)
    where
        F: Fn(&DriverSpec) -> Result<Arc<T>, ConfigError> + Send + Sync + 'static,
    {
        self.entries.insert(
            driver.to_string(),
            Entry {
                transports: transports.to_vec(),
                factory: Box::new(factory),
            },
        );
    }

    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a spec; `Ok(None)` when the section names no driver
    pub fn build(&self, spec: &DriverSpec) -> Result<Option<Arc<T>>, ConfigError> {
        let Some(driver) = spec.driver.as_deref() else {
            return Ok(None);
        };
        let entry = self
            .entries
            .get(driver)
            .ok_or_else(|| ConfigError::UnknownDriver {
                role: self.role.to_string(),
                driver: driver.to_string(),
            })?;
        if !entry.transports.contains(&spec.transport) {
            return Err(ConfigError::UnsupportedTransport {
                role: self.role.to_string(),
                driver: driver.to_string(),
                transport: spec.transport.to_string(),
            });
        }
        tracing::debug!("Building {} driver {}", self.role, driver);
        (entry.factory)(spec).map(Some)
    }

    /// Resolve every entry of a multi-device role
    pub fn build_all(&self, specs: &[DriverSpec]) -> Result<Vec<Arc<T>>, ConfigError> {
        let mut built = Vec::with_capacity(specs.len());
        for spec in specs {
            if let Some(device) = self.build(spec)? {
                built.push(device);
            }
        }
        Ok(built)
    }
}

/// One role registry per subsystem
pub struct DriverRegistry {
    pub camera: RoleRegistry<dyn Camera>,
    pub cover_calibrator: RoleRegistry<dyn CoverCalibrator>,
    pub dome: RoleRegistry<dyn Dome>,
    pub filter_wheel: RoleRegistry<dyn FilterWheel>,
    pub focuser: RoleRegistry<dyn Focuser>,
    pub observing_conditions: RoleRegistry<dyn ObservingConditions>,
    pub rotator: RoleRegistry<dyn Rotator>,
    pub safety_monitor: RoleRegistry<dyn SafetyMonitor>,
    pub switch: RoleRegistry<dyn Switch>,
    pub telescope: RoleRegistry<dyn Mount>,
    pub autofocus: RoleRegistry<dyn Autofocus>,
    pub fwhm: RoleRegistry<dyn FwhmEstimator>,
    pub wcs: RoleRegistry<dyn Solver>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self {
            camera: RoleRegistry::new("camera"),
            cover_calibrator: RoleRegistry::new("cover_calibrator"),
            dome: RoleRegistry::new("dome"),
            filter_wheel: RoleRegistry::new("filter_wheel"),
            focuser: RoleRegistry::new("focuser"),
            observing_conditions: RoleRegistry::new("observing_conditions"),
            rotator: RoleRegistry::new("rotator"),
            safety_monitor: RoleRegistry::new("safety_monitor"),
            switch: RoleRegistry::new("switch"),
            telescope: RoleRegistry::new("telescope"),
            autofocus: RoleRegistry::new("autofocus"),
            fwhm: RoleRegistry::new("fwhm"),
            wcs: RoleRegistry::new("wcs"),
        }
    }
}

/// Driver name under which the in-process simulators are registered
pub const SIMULATOR: &str = "simulator";

fn invalid(role: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidArgs {
        role: role.to_string(),
        driver: SIMULATOR.to_string(),
        reason: reason.into(),
    }
}

/// Device name from `kwargs.name`, else the first positional argument, else the role
fn sim_name(spec: &DriverSpec, role: &str) -> Result<String, ConfigError> {
    match spec.kwargs.get("name").or_else(|| spec.args.first()) {
        None => Ok(format!("Simulated {}", role)),
        Some(Value::String(name)) => Ok(name.clone()),
        Some(other) => Err(invalid(role, format!("name must be a string, got {}", other))),
    }
}

fn string_list(spec: &DriverSpec, role: &str, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
    match spec.kwargs.get(key) {
        None => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(role, format!("{} entries must be strings", key)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid(role, format!("{} must be a list", key))),
    }
}

fn number(spec: &DriverSpec, role: &str, key: &str) -> Result<Option<f64>, ConfigError> {
    match spec.kwargs.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(role, format!("{} must be a number", key))),
    }
}

impl DriverRegistry {
    /// Registry with the simulators available under the `simulator` driver name
    pub fn with_simulators() -> Self {
        let mut registry = Self::default();
        let local = [Transport::Local];

        registry.camera.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "camera")?;
            let mut camera = SimCamera::new(&name);
            if let (Some(w), Some(h)) = (number(spec, "camera", "width")?, number(spec, "camera", "height")?) {
                let pixel = number(spec, "camera", "pixel_size")?.unwrap_or(3.76);
                camera = camera.with_sensor(w as u32, h as u32, pixel);
            }
            if let Some(modes) = string_list(spec, "camera", "readout_modes")? {
                let modes: Vec<&str> = modes.iter().map(String::as_str).collect();
                camera = camera.with_readout_modes(&modes);
            }
            Ok(Arc::new(camera) as Arc<dyn Camera>)
        });
        registry.cover_calibrator.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "cover calibrator")?;
            Ok(Arc::new(SimCoverCalibrator::new(&name)) as Arc<dyn CoverCalibrator>)
        });
        registry.dome.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "dome")?;
            let slaved = spec.kwargs.get("slaved").and_then(Value::as_bool).unwrap_or(false);
            Ok(Arc::new(SimDome::new(&name).slaved(slaved)) as Arc<dyn Dome>)
        });
        registry.filter_wheel.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "filter wheel")?;
            let filters = string_list(spec, "filter wheel", "filters")?
                .unwrap_or_else(|| vec!["L".to_string(), "R".to_string(), "G".to_string(), "B".to_string()]);
            let filters: Vec<&str> = filters.iter().map(String::as_str).collect();
            Ok(Arc::new(SimFilterWheel::new(&name, &filters)) as Arc<dyn FilterWheel>)
        });
        registry.focuser.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "focuser")?;
            let mut focuser = SimFocuser::new(&name);
            if spec.kwargs.get("relative").and_then(Value::as_bool).unwrap_or(false) {
                focuser = focuser.relative();
            }
            Ok(Arc::new(focuser) as Arc<dyn Focuser>)
        });
        registry.observing_conditions.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "weather station")?;
            Ok(Arc::new(SimObservingConditions::new(&name)) as Arc<dyn ObservingConditions>)
        });
        registry.rotator.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "rotator")?;
            Ok(Arc::new(SimRotator::new(&name)) as Arc<dyn Rotator>)
        });
        registry.safety_monitor.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "safety monitor")?;
            Ok(Arc::new(SimSafetyMonitor::always_safe(&name)) as Arc<dyn SafetyMonitor>)
        });
        registry.switch.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "switch")?;
            let channels = string_list(spec, "switch", "channels")?
                .unwrap_or_else(|| vec!["Power".to_string()]);
            let channels: Vec<&str> = channels.iter().map(String::as_str).collect();
            Ok(Arc::new(SimSwitch::new(&name, &channels)) as Arc<dyn Switch>)
        });
        registry.telescope.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "mount")?;
            Ok(Arc::new(SimMount::new(&name)) as Arc<dyn Mount>)
        });
        registry.autofocus.register(SIMULATOR, &local, |spec| {
            let position = number(spec, "autofocus", "result")?.unwrap_or(25_000.0);
            Ok(Arc::new(SimAutofocus::new(position.round() as i32)) as Arc<dyn Autofocus>)
        });
        registry.fwhm.register(SIMULATOR, &local, |spec| {
            let fwhm = number(spec, "fwhm", "fwhm")?.unwrap_or(2.5);
            Ok(Arc::new(SimFwhmEstimator::Fixed(Some(fwhm))) as Arc<dyn FwhmEstimator>)
        });
        registry.wcs.register(SIMULATOR, &local, |spec| {
            let name = sim_name(spec, "solver")?;
            Ok(Arc::new(SimSolver::new(&name, SolverScript::NoMatch)) as Arc<dyn Solver>)
        });

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_driver_is_not_installed() {
        let registry = DriverRegistry::with_simulators();
        assert!(registry.dome.build(&DriverSpec::default()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_driver() {
        let registry = DriverRegistry::with_simulators();
        let err = registry.dome.build(&DriverSpec::driver("acme")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDriver { ref role, .. } if role == "dome"));
    }

    #[test]
    fn test_simulators_are_local_only() {
        let registry = DriverRegistry::with_simulators();
        let mut spec = DriverSpec::driver(SIMULATOR);
        spec.transport = Transport::Network;
        assert!(matches!(
            registry.telescope.build(&spec),
            Err(ConfigError::UnsupportedTransport { .. })
        ));
    }

    #[tokio::test]
    async fn test_kwargs_reach_simulator() {
        let registry = DriverRegistry::with_simulators();
        let spec = DriverSpec::driver(SIMULATOR)
            .with_kwarg("name", "Wheel")
            .with_kwarg("filters", vec!["Ha", "OIII"]);
        let wheel = registry.filter_wheel.build(&spec).unwrap().unwrap();
        assert_eq!(wheel.info().name, "Wheel");
        assert_eq!(wheel.names().await.unwrap(), vec!["Ha", "OIII"]);
    }

    #[test]
    fn test_bad_kwarg_type() {
        let registry = DriverRegistry::with_simulators();
        let spec = DriverSpec::driver(SIMULATOR).with_kwarg("name", 12);
        assert!(matches!(
            registry.rotator.build(&spec),
            Err(ConfigError::InvalidArgs { .. })
        ));
    }
}
