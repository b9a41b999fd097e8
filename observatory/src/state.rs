//! Shared observatory state
//!
//! Device handles are fixed at construction. Configuration lives in a single
//! `RwLock` mirror that every setter clamps into; readers copy what they need
//! and drop the lock before awaiting anything.

use crate::config::ObservatoryConfig;
use crate::control::Controlled;
use crate::error::{ConfigError, ObservatoryError, Result};
use crate::sky::{MeanSkyModel, Site, SkyModel};
use starwatch_devices::*;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Arcseconds per radian
const ARCSEC_PER_RADIAN: f64 = 206_265.0;

/// Installed subsystems; `None` or empty means not installed
#[derive(Debug, Default, Clone)]
pub struct Devices {
    pub camera: Option<Controlled<dyn Camera>>,
    pub cover_calibrator: Option<Controlled<dyn CoverCalibrator>>,
    pub dome: Option<Controlled<dyn Dome>>,
    pub filter_wheel: Option<Controlled<dyn FilterWheel>>,
    pub focuser: Option<Controlled<dyn Focuser>>,
    pub observing_conditions: Option<Controlled<dyn ObservingConditions>>,
    pub rotator: Option<Controlled<dyn Rotator>>,
    pub safety_monitors: Vec<Controlled<dyn SafetyMonitor>>,
    pub switches: Vec<Controlled<dyn Switch>>,
    pub telescope: Option<Controlled<dyn Mount>>,
    pub autofocus: Option<Arc<dyn Autofocus>>,
    pub fwhm: Option<Arc<dyn FwhmEstimator>>,
    pub solvers: Vec<Arc<dyn Solver>>,
}

impl Devices {
    pub fn with_camera(mut self, camera: Arc<dyn Camera>) -> Self {
        self.camera = Some(Controlled::new(camera));
        self
    }

    pub fn with_cover_calibrator(mut self, panel: Arc<dyn CoverCalibrator>) -> Self {
        self.cover_calibrator = Some(Controlled::new(panel));
        self
    }

    pub fn with_dome(mut self, dome: Arc<dyn Dome>) -> Self {
        self.dome = Some(Controlled::new(dome));
        self
    }

    pub fn with_filter_wheel(mut self, wheel: Arc<dyn FilterWheel>) -> Self {
        self.filter_wheel = Some(Controlled::new(wheel));
        self
    }

    pub fn with_focuser(mut self, focuser: Arc<dyn Focuser>) -> Self {
        self.focuser = Some(Controlled::new(focuser));
        self
    }

    pub fn with_observing_conditions(mut self, station: Arc<dyn ObservingConditions>) -> Self {
        self.observing_conditions = Some(Controlled::new(station));
        self
    }

    pub fn with_rotator(mut self, rotator: Arc<dyn Rotator>) -> Self {
        self.rotator = Some(Controlled::new(rotator));
        self
    }

    pub fn with_safety_monitor(mut self, monitor: Arc<dyn SafetyMonitor>) -> Self {
        self.safety_monitors.push(Controlled::new(monitor));
        self
    }

    pub fn with_switch(mut self, switch: Arc<dyn Switch>) -> Self {
        self.switches.push(Controlled::new(switch));
        self
    }

    pub fn with_telescope(mut self, mount: Arc<dyn Mount>) -> Self {
        self.telescope = Some(Controlled::new(mount));
        self
    }

    pub fn with_autofocus(mut self, autofocus: Arc<dyn Autofocus>) -> Self {
        self.autofocus = Some(autofocus);
        self
    }

    pub fn with_fwhm(mut self, estimator: Arc<dyn FwhmEstimator>) -> Self {
        self.fwhm = Some(estimator);
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn Solver>) -> Self {
        self.solvers.push(solver);
        self
    }
}

/// Borrow an installed device or report it missing
pub fn require<'a, T: ?Sized>(slot: &'a Option<Controlled<T>>, what: &str) -> Result<&'a Controlled<T>> {
    slot.as_ref().ok_or_else(|| ObservatoryError::missing(what))
}

/// Fail unless the device reports itself connected
pub async fn ensure_connected<T: Device + ?Sized>(handle: &Controlled<T>, what: &str) -> Result<()> {
    if handle.device().connected().await? {
        Ok(())
    } else {
        Err(ObservatoryError::NotConnected(what.to_string()))
    }
}

fn clamp_field(field: &str, value: f64, min: f64, max: f64) -> f64 {
    let clamped = if value.is_nan() { min } else { value.clamp(min, max) };
    if clamped != value {
        tracing::warn!("{} = {} is out of range, using {}", field, value, clamped);
    }
    clamped
}

fn wrap_longitude(value: f64) -> f64 {
    let wrapped = (value + 180.0).rem_euclid(360.0) - 180.0;
    // keep +180 rather than folding it onto -180
    let wrapped = if wrapped == -180.0 && value > 0.0 { 180.0 } else { wrapped };
    if wrapped != value {
        tracing::warn!("site.longitude = {} wrapped to {}", value, wrapped);
    }
    wrapped
}

/// Clamp every tunable into its physical domain
fn sanitize(mut config: ObservatoryConfig) -> ObservatoryConfig {
    let site = &mut config.site;
    site.latitude = clamp_field("site.latitude", site.latitude, -90.0, 90.0);
    site.longitude = wrap_longitude(site.longitude);
    site.elevation = clamp_field("site.elevation", site.elevation, 0.0, f64::MAX);
    site.diameter = clamp_field("site.diameter", site.diameter, 0.0, f64::MAX);
    site.focal_length = clamp_field("site.focal_length", site.focal_length, 0.0, f64::MAX);

    let camera = &mut config.camera;
    camera.cooler_setpoint = camera
        .cooler_setpoint
        .map(|t| clamp_field("camera.cooler_setpoint", t, -273.15, f64::MAX));
    camera.cooler_tolerance = clamp_field("camera.cooler_tolerance", camera.cooler_tolerance, 0.0, f64::MAX);
    camera.max_dimension = camera.max_dimension.map(|d| {
        if d == 0 {
            tracing::warn!("camera.max_dimension = 0 is out of range, using 1");
        }
        d.max(1)
    });

    let panel = &mut config.cover_calibrator;
    panel.alt = clamp_field("cover_calibrator.alt", panel.alt, 0.0, 90.0);
    panel.az = clamp_field("cover_calibrator.az", panel.az, 0.0, 360.0);

    config.focuser.max_error = clamp_field("focuser.max_error", config.focuser.max_error, 0.0, f64::MAX);

    let scope = &mut config.telescope;
    scope.min_altitude = clamp_field("telescope.min_altitude", scope.min_altitude, 0.0, 90.0);
    scope.settle_time = clamp_field("telescope.settle_time", scope.settle_time, 0.0, f64::MAX);

    let wheel = &mut config.filter_wheel;
    wheel.focus_offsets.resize(wheel.filters.len(), 0);

    config
}

const SHUTTER_UNKNOWN: u8 = 0;
const SHUTTER_DARK: u8 = 1;
const SHUTTER_LIGHT: u8 = 2;

/// Configuration mirror plus device handles, shared by every controller
#[derive(Debug)]
pub struct ObservatoryState {
    devices: Devices,
    config: RwLock<ObservatoryConfig>,
    sky: Arc<dyn SkyModel>,
    last_shutter: AtomicU8,
    focus_offset: AtomicI32,
    /// Set by shutdown; foreground operations refuse to run until reset
    safed: AtomicBool,
}

impl ObservatoryState {
    pub fn new(devices: Devices, config: ObservatoryConfig) -> Self {
        Self::with_sky_model(devices, config, Arc::new(MeanSkyModel))
    }

    pub fn with_sky_model(devices: Devices, config: ObservatoryConfig, sky: Arc<dyn SkyModel>) -> Self {
        Self {
            devices,
            config: RwLock::new(sanitize(config)),
            sky,
            last_shutter: AtomicU8::new(SHUTTER_UNKNOWN),
            focus_offset: AtomicI32::new(0),
            safed: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ObservatoryConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ObservatoryConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    pub fn sky(&self) -> &dyn SkyModel {
        self.sky.as_ref()
    }

    /// Copy of the whole configuration mirror
    pub fn config(&self) -> ObservatoryConfig {
        self.read().clone()
    }

    pub fn save_config(&self, path: &Path) -> std::result::Result<(), ConfigError> {
        let config = self.config();
        config.save(path)?;
        tracing::info!("Saved observatory config to {}", path.display());
        Ok(())
    }

    // ---- getters ----

    pub fn site(&self) -> Site {
        let config = self.read();
        Site {
            latitude: config.site.latitude,
            longitude: config.site.longitude,
            elevation: config.site.elevation,
        }
    }

    pub fn site_name(&self) -> String {
        self.read().site.name.clone()
    }

    pub fn focal_length(&self) -> f64 {
        self.read().site.focal_length
    }

    pub fn min_altitude(&self) -> f64 {
        self.read().telescope.min_altitude
    }

    pub fn settle_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.read().telescope.settle_time).unwrap_or(Duration::MAX)
    }

    pub fn cooler_setpoint(&self) -> Option<f64> {
        self.read().camera.cooler_setpoint
    }

    pub fn cooler_tolerance(&self) -> f64 {
        self.read().camera.cooler_tolerance
    }

    pub fn max_dimension(&self) -> Option<u32> {
        self.read().camera.max_dimension
    }

    /// Mount (altitude, azimuth) that points at the flat panel
    pub fn cover_calibrator_position(&self) -> (f64, f64) {
        let config = self.read();
        (config.cover_calibrator.alt, config.cover_calibrator.az)
    }

    pub fn focuser_max_error(&self) -> f64 {
        self.read().focuser.max_error
    }

    pub fn filters(&self) -> Vec<String> {
        self.read().filter_wheel.filters.clone()
    }

    pub fn filter_index(&self, filter: &str) -> Option<usize> {
        self.read().filter_wheel.filters.iter().position(|f| f == filter)
    }

    pub fn focus_offset(&self, filter: &str) -> Option<i32> {
        let config = self.read();
        let wheel = &config.filter_wheel;
        let index = wheel.filters.iter().position(|f| f == filter)?;
        Some(wheel.focus_offsets.get(index).copied().unwrap_or(0))
    }

    pub fn rotator_limits(&self) -> (Option<f64>, Option<f64>) {
        let config = self.read();
        (config.rotator.min_angle, config.rotator.max_angle)
    }

    pub fn rotator_reverse(&self) -> bool {
        self.read().rotator.reverse
    }

    // ---- setters ----

    pub fn set_latitude(&self, latitude: f64) {
        self.write().site.latitude = clamp_field("site.latitude", latitude, -90.0, 90.0);
    }

    pub fn set_longitude(&self, longitude: f64) {
        self.write().site.longitude = wrap_longitude(longitude);
    }

    pub fn set_elevation(&self, elevation: f64) {
        self.write().site.elevation = clamp_field("site.elevation", elevation, 0.0, f64::MAX);
    }

    pub fn set_diameter(&self, diameter: f64) {
        self.write().site.diameter = clamp_field("site.diameter", diameter, 0.0, f64::MAX);
    }

    pub fn set_focal_length(&self, focal_length: f64) {
        self.write().site.focal_length = clamp_field("site.focal_length", focal_length, 0.0, f64::MAX);
    }

    pub fn set_min_altitude(&self, min_altitude: f64) {
        self.write().telescope.min_altitude = clamp_field("telescope.min_altitude", min_altitude, 0.0, 90.0);
    }

    pub fn set_settle_time(&self, seconds: f64) {
        self.write().telescope.settle_time = clamp_field("telescope.settle_time", seconds, 0.0, f64::MAX);
    }

    pub fn set_cooler_setpoint(&self, setpoint: Option<f64>) {
        self.write().camera.cooler_setpoint =
            setpoint.map(|t| clamp_field("camera.cooler_setpoint", t, -273.15, f64::MAX));
    }

    pub fn set_cooler_tolerance(&self, tolerance: f64) {
        self.write().camera.cooler_tolerance = clamp_field("camera.cooler_tolerance", tolerance, 0.0, f64::MAX);
    }

    pub fn set_max_dimension(&self, max_dimension: Option<u32>) {
        self.write().camera.max_dimension = max_dimension.map(|d| d.max(1));
    }

    pub fn set_cover_calibrator_position(&self, alt: f64, az: f64) {
        let mut config = self.write();
        config.cover_calibrator.alt = clamp_field("cover_calibrator.alt", alt, 0.0, 90.0);
        config.cover_calibrator.az = clamp_field("cover_calibrator.az", az, 0.0, 360.0);
    }

    pub fn set_focuser_max_error(&self, max_error: f64) {
        self.write().focuser.max_error = clamp_field("focuser.max_error", max_error, 0.0, f64::MAX);
    }

    /// Replace the filter list; offsets of filters that keep their name survive
    pub fn set_filters(&self, filters: Vec<String>) {
        let mut config = self.write();
        let wheel = &mut config.filter_wheel;
        let offsets = filters
            .iter()
            .map(|name| {
                wheel
                    .filters
                    .iter()
                    .position(|f| f == name)
                    .and_then(|i| wheel.focus_offsets.get(i).copied())
                    .unwrap_or(0)
            })
            .collect();
        wheel.filters = filters;
        wheel.focus_offsets = offsets;
    }

    pub fn set_filter_focus_offset(&self, filter: &str, offset: i32) -> Result<()> {
        let mut config = self.write();
        let wheel = &mut config.filter_wheel;
        let index = wheel
            .filters
            .iter()
            .position(|f| f == filter)
            .ok_or_else(|| ObservatoryError::InvalidArgument(format!("unknown filter {}", filter)))?;
        wheel.focus_offsets[index] = offset;
        Ok(())
    }

    pub fn set_rotator_limits(&self, min_angle: Option<f64>, max_angle: Option<f64>) -> Result<()> {
        if let (Some(min), Some(max)) = (min_angle, max_angle) {
            if min >= max {
                return Err(ObservatoryError::InvalidArgument(format!(
                    "rotator min angle {} is not below max angle {}",
                    min, max
                )));
            }
        }
        let mut config = self.write();
        config.rotator.min_angle = min_angle;
        config.rotator.max_angle = max_angle;
        Ok(())
    }

    pub fn set_rotator_reverse(&self, reverse: bool) {
        self.write().rotator.reverse = reverse;
    }

    // ---- runtime bookkeeping ----

    /// Remember whether the last exposure opened the shutter
    pub fn record_shutter(&self, light: bool) {
        let value = if light { SHUTTER_LIGHT } else { SHUTTER_DARK };
        self.last_shutter.store(value, Ordering::SeqCst);
    }

    pub fn last_shutter_light(&self) -> Option<bool> {
        match self.last_shutter.load(Ordering::SeqCst) {
            SHUTTER_LIGHT => Some(true),
            SHUTTER_DARK => Some(false),
            _ => None,
        }
    }

    /// Latch the observatory into its shut-down state
    pub fn latch_safed(&self) {
        self.safed.store(true, Ordering::SeqCst);
    }

    /// Release the shut-down latch; returns whether it was set
    pub fn clear_safed(&self) -> bool {
        self.safed.swap(false, Ordering::SeqCst)
    }

    pub fn is_safed(&self) -> bool {
        self.safed.load(Ordering::SeqCst)
    }

    /// Fail with [`ObservatoryError::ShutDown`] once shutdown has run
    pub fn ensure_operational(&self) -> Result<()> {
        if self.is_safed() {
            Err(ObservatoryError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Focus offset of the filter currently in the beam
    pub fn current_focus_offset(&self) -> i32 {
        self.focus_offset.load(Ordering::SeqCst)
    }

    pub fn set_current_focus_offset(&self, offset: i32) {
        self.focus_offset.store(offset, Ordering::SeqCst);
    }

    /// Binned pixel scale (x, y) in arcsec/pixel, if a camera and focal length are known
    pub async fn pixel_scale(&self) -> Option<(f64, f64)> {
        let focal_length = self.focal_length();
        if focal_length <= 0.0 {
            return None;
        }
        let camera = self.devices.camera.as_ref()?.device();
        let (px, py) = camera.pixel_size().await.ok()?;
        let (bx, by) = camera.binning().await.unwrap_or((1, 1));
        let plate_scale = ARCSEC_PER_RADIAN / focal_length;
        Some((
            plate_scale * px * 1e-3 * bx as f64,
            plate_scale * py * 1e-3 * by as f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starwatch_devices::sim::SimCamera;

    fn state() -> ObservatoryState {
        ObservatoryState::new(Devices::default(), ObservatoryConfig::default())
    }

    #[test]
    fn test_cooler_setpoint_below_absolute_zero_is_clamped() {
        let state = state();
        state.set_cooler_setpoint(Some(-300.0));
        assert_eq!(state.cooler_setpoint(), Some(-273.15));
        assert_eq!(state.config().camera.cooler_setpoint, Some(-273.15));
    }

    #[test]
    fn test_construction_clamps_config() {
        let mut config = ObservatoryConfig::default();
        config.site.latitude = 95.0;
        config.site.longitude = 190.0;
        config.telescope.min_altitude = -5.0;
        config.cover_calibrator.az = 400.0;
        let state = ObservatoryState::new(Devices::default(), config);
        assert_eq!(state.site().latitude, 90.0);
        assert!((state.site().longitude + 170.0).abs() < 1e-9);
        assert_eq!(state.min_altitude(), 0.0);
        assert_eq!(state.cover_calibrator_position(), (80.0, 360.0));
    }

    #[test]
    fn test_longitude_keeps_180() {
        let state = state();
        state.set_longitude(180.0);
        assert_eq!(state.site().longitude, 180.0);
        state.set_longitude(-181.0);
        assert!((state.site().longitude - 179.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_filters_keeps_known_offsets() {
        let state = state();
        state.set_filters(vec!["L".into(), "R".into()]);
        state.set_filter_focus_offset("R", 40).unwrap();
        state.set_filters(vec!["R".into(), "Ha".into()]);
        assert_eq!(state.focus_offset("R"), Some(40));
        assert_eq!(state.focus_offset("Ha"), Some(0));
        assert_eq!(state.focus_offset("L"), None);
        assert!(state.set_filter_focus_offset("L", 1).is_err());
    }

    #[test]
    fn test_rotator_limits_must_be_ordered() {
        let state = state();
        assert!(state.set_rotator_limits(Some(90.0), Some(-90.0)).is_err());
        state.set_rotator_limits(Some(-90.0), Some(90.0)).unwrap();
        assert_eq!(state.rotator_limits(), (Some(-90.0), Some(90.0)));
    }

    #[tokio::test]
    async fn test_pixel_scale_uses_focal_length_and_binning() {
        let camera = Arc::new(SimCamera::new("cam").with_sensor(100, 100, 9.0));
        let state = ObservatoryState::new(Devices::default().with_camera(camera), ObservatoryConfig::default());
        assert_eq!(state.pixel_scale().await, None);
        state.set_focal_length(1000.0);
        let (x, _) = state.pixel_scale().await.unwrap();
        assert!((x - 206.265 * 9.0 * 1e-3).abs() < 1e-9);
    }

    #[test]
    fn test_safed_latch_blocks_until_cleared() {
        let state = state();
        state.ensure_operational().unwrap();
        state.latch_safed();
        assert!(matches!(state.ensure_operational(), Err(ObservatoryError::ShutDown)));
        assert!(state.clear_safed());
        assert!(!state.clear_safed());
        state.ensure_operational().unwrap();
    }

    #[test]
    fn test_infinite_settle_time_saturates() {
        let state = state();
        state.set_settle_time(f64::INFINITY);
        assert_eq!(state.settle_time(), Duration::MAX);
    }

    #[test]
    fn test_shutter_bookkeeping() {
        let state = state();
        assert_eq!(state.last_shutter_light(), None);
        state.record_shutter(false);
        assert_eq!(state.last_shutter_light(), Some(false));
    }
}
