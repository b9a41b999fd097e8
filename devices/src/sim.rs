//! Simulated devices
//!
//! Every capability trait has an in-process simulator here. Motion completes
//! instantly, exposures complete after their duration on the tokio clock, and
//! each simulator keeps a log of the action commands it received so callers
//! can inspect what an orchestration sequence actually did.

use crate::error::{DeviceError, DeviceResult};
use crate::traits::*;
use crate::wcs::{SolveOptions, WcsSolution};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Connection flag and command log shared by all simulators
#[derive(Debug)]
struct SimCore {
    info: DeviceInfo,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    log: Mutex<Vec<String>>,
}

impl SimCore {
    fn new(name: &str, description: &str) -> Self {
        Self {
            info: DeviceInfo {
                name: name.to_string(),
                description: description.to_string(),
                driver_info: "Starwatch simulator".to_string(),
                driver_version: env!("CARGO_PKG_VERSION").to_string(),
                interface_version: 1,
            },
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    fn set_connected(&self, connected: bool) -> DeviceResult<()> {
        if connected && self.fail_connect.load(Ordering::SeqCst) {
            return Err(DeviceError::Communication {
                device: self.info.name.clone(),
                message: "simulated connection failure".to_string(),
            });
        }
        self.connected.store(connected, Ordering::SeqCst);
        tracing::debug!("[SIM] {} connected={}", self.info.name, connected);
        Ok(())
    }

    /// Record an action command; fails if the device is offline
    fn command(&self, command: impl Into<String>) -> DeviceResult<()> {
        let command = command.into();
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DeviceError::NotConnected(format!(
                "{} ({})",
                self.info.name, command
            )));
        }
        tracing::debug!("[SIM] {}: {}", self.info.name, command);
        lock(&self.log).push(command);
        Ok(())
    }
}

macro_rules! sim_device {
    ($ty:ty) => {
        #[async_trait]
        impl Device for $ty {
            fn info(&self) -> DeviceInfo {
                self.core.info.clone()
            }

            async fn connected(&self) -> DeviceResult<bool> {
                Ok(self.core.connected.load(Ordering::SeqCst))
            }

            async fn set_connected(&self, connected: bool) -> DeviceResult<()> {
                self.core.set_connected(connected)
            }
        }

        impl $ty {
            /// Action commands received so far, oldest first
            pub fn commands(&self) -> Vec<String> {
                lock(&self.core.log).clone()
            }

            /// Make every subsequent connect attempt fail
            pub fn fail_on_connect(&self) {
                self.core.fail_connect.store(true, Ordering::SeqCst);
            }

            pub fn is_connected(&self) -> bool {
                self.core.connected.load(Ordering::SeqCst)
            }
        }
    };
}

// =============================================================================
// MOUNT
// =============================================================================

/// Observable mount state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MountPose {
    pub ra_hours: f64,
    pub dec_degrees: f64,
    pub altitude: f64,
    pub azimuth: f64,
    pub parked: bool,
    pub at_home: bool,
    pub tracking: bool,
    pub rate: Option<TrackingRate>,
}

#[derive(Debug)]
pub struct SimMount {
    core: SimCore,
    caps: MountCapabilities,
    pose: Mutex<MountPose>,
    fail_tracking_rate: AtomicBool,
}

impl SimMount {
    pub fn new(name: &str) -> Self {
        Self {
            core: SimCore::new(name, "Simulated equatorial mount"),
            caps: MountCapabilities {
                can_slew: true,
                can_slew_async: true,
                can_slew_alt_az: true,
                can_slew_alt_az_async: true,
                can_park: true,
                can_unpark: true,
                can_find_home: true,
                can_set_tracking: true,
                can_sync: true,
            },
            pose: Mutex::new(MountPose {
                ra_hours: 0.0,
                dec_degrees: 0.0,
                altitude: 45.0,
                azimuth: 180.0,
                parked: false,
                at_home: false,
                tracking: false,
                rate: None,
            }),
            fail_tracking_rate: AtomicBool::new(false),
        }
    }

    pub fn with_capabilities(mut self, caps: MountCapabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn parked(self) -> Self {
        lock(&self.pose).parked = true;
        self
    }

    /// Make `set_tracking_rate` report a driver error
    pub fn failing_tracking_rate(self) -> Self {
        self.fail_tracking_rate.store(true, Ordering::SeqCst);
        self
    }

    pub fn pose(&self) -> MountPose {
        *lock(&self.pose)
    }

    pub fn set_pointing(&self, ra_hours: f64, dec_degrees: f64) {
        let mut pose = lock(&self.pose);
        pose.ra_hours = ra_hours;
        pose.dec_degrees = dec_degrees;
    }

    fn check_movable(&self, what: &str) -> DeviceResult<()> {
        if lock(&self.pose).parked {
            return Err(DeviceError::InvalidOperation(format!(
                "{}: mount is parked",
                what
            )));
        }
        Ok(())
    }

    fn goto_equatorial(&self, cmd: &str, ra_hours: f64, dec_degrees: f64) -> DeviceResult<()> {
        if !(0.0..24.0).contains(&ra_hours) || !(-90.0..=90.0).contains(&dec_degrees) {
            return Err(DeviceError::InvalidParameter(format!(
                "RA {} / Dec {} out of range",
                ra_hours, dec_degrees
            )));
        }
        self.check_movable(cmd)?;
        self.core
            .command(format!("{} {:.6} {:.6}", cmd, ra_hours, dec_degrees))?;
        let mut pose = lock(&self.pose);
        pose.ra_hours = ra_hours;
        pose.dec_degrees = dec_degrees;
        pose.at_home = false;
        Ok(())
    }

    fn goto_horizontal(&self, cmd: &str, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        self.check_movable(cmd)?;
        self.core
            .command(format!("{} {:.6} {:.6}", cmd, altitude, azimuth))?;
        let mut pose = lock(&self.pose);
        pose.altitude = altitude;
        pose.azimuth = azimuth;
        pose.at_home = false;
        Ok(())
    }
}

sim_device!(SimMount);

#[async_trait]
impl Mount for SimMount {
    fn capabilities(&self) -> MountCapabilities {
        self.caps
    }

    async fn equatorial_system(&self) -> DeviceResult<EquatorialSystem> {
        Ok(EquatorialSystem::J2000)
    }

    async fn right_ascension(&self) -> DeviceResult<f64> {
        Ok(lock(&self.pose).ra_hours)
    }

    async fn declination(&self) -> DeviceResult<f64> {
        Ok(lock(&self.pose).dec_degrees)
    }

    async fn altitude(&self) -> DeviceResult<f64> {
        Ok(lock(&self.pose).altitude)
    }

    async fn azimuth(&self) -> DeviceResult<f64> {
        Ok(lock(&self.pose).azimuth)
    }

    async fn slew_to_coordinates(&self, ra_hours: f64, dec_degrees: f64) -> DeviceResult<()> {
        if !self.caps.can_slew {
            return Err(DeviceError::not_supported("SlewToCoordinates"));
        }
        self.goto_equatorial("slew_to_coordinates", ra_hours, dec_degrees)
    }

    async fn slew_to_coordinates_async(
        &self,
        ra_hours: f64,
        dec_degrees: f64,
    ) -> DeviceResult<()> {
        if !self.caps.can_slew_async {
            return Err(DeviceError::not_supported("SlewToCoordinatesAsync"));
        }
        self.goto_equatorial("slew_to_coordinates_async", ra_hours, dec_degrees)
    }

    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        if !self.caps.can_slew_alt_az {
            return Err(DeviceError::not_supported("SlewToAltAz"));
        }
        self.goto_horizontal("slew_to_alt_az", altitude, azimuth)
    }

    async fn slew_to_alt_az_async(&self, altitude: f64, azimuth: f64) -> DeviceResult<()> {
        if !self.caps.can_slew_alt_az_async {
            return Err(DeviceError::not_supported("SlewToAltAzAsync"));
        }
        self.goto_horizontal("slew_to_alt_az_async", altitude, azimuth)
    }

    async fn is_slewing(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn abort_slew(&self) -> DeviceResult<()> {
        self.core.command("abort_slew")
    }

    async fn at_park(&self) -> DeviceResult<bool> {
        Ok(lock(&self.pose).parked)
    }

    async fn park(&self) -> DeviceResult<()> {
        if !self.caps.can_park {
            return Err(DeviceError::not_supported("Park"));
        }
        self.core.command("park")?;
        let mut pose = lock(&self.pose);
        pose.parked = true;
        pose.tracking = false;
        Ok(())
    }

    async fn unpark(&self) -> DeviceResult<()> {
        if !self.caps.can_unpark {
            return Err(DeviceError::not_supported("Unpark"));
        }
        self.core.command("unpark")?;
        lock(&self.pose).parked = false;
        Ok(())
    }

    async fn at_home(&self) -> DeviceResult<bool> {
        Ok(lock(&self.pose).at_home)
    }

    async fn find_home(&self) -> DeviceResult<()> {
        if !self.caps.can_find_home {
            return Err(DeviceError::not_supported("FindHome"));
        }
        self.check_movable("find_home")?;
        self.core.command("find_home")?;
        lock(&self.pose).at_home = true;
        Ok(())
    }

    async fn tracking(&self) -> DeviceResult<bool> {
        Ok(lock(&self.pose).tracking)
    }

    async fn set_tracking(&self, enabled: bool) -> DeviceResult<()> {
        if !self.caps.can_set_tracking {
            return Err(DeviceError::not_supported("Tracking"));
        }
        self.core.command(format!("set_tracking {}", enabled))?;
        lock(&self.pose).tracking = enabled;
        Ok(())
    }

    async fn set_tracking_rate(&self, rate: TrackingRate) -> DeviceResult<()> {
        if !self.caps.can_set_tracking {
            return Err(DeviceError::not_supported("TrackingRate"));
        }
        if self.fail_tracking_rate.load(Ordering::SeqCst) {
            return Err(DeviceError::driver("tracking rate rejected"));
        }
        self.core.command(format!("set_tracking_rate {:?}", rate))?;
        lock(&self.pose).rate = Some(rate);
        Ok(())
    }

    async fn sync_to_coordinates(&self, ra_hours: f64, dec_degrees: f64) -> DeviceResult<()> {
        if !self.caps.can_sync {
            return Err(DeviceError::not_supported("SyncToCoordinates"));
        }
        self.core
            .command(format!("sync_to_coordinates {:.6} {:.6}", ra_hours, dec_degrees))?;
        self.set_pointing(ra_hours, dec_degrees);
        Ok(())
    }
}

// =============================================================================
// DOME
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomePose {
    pub shutter: ShutterState,
    pub altitude: f64,
    pub azimuth: f64,
    pub slaved: bool,
    pub at_home: bool,
    pub at_park: bool,
}

#[derive(Debug)]
pub struct SimDome {
    core: SimCore,
    caps: DomeCapabilities,
    pose: Mutex<DomePose>,
}

impl SimDome {
    pub fn new(name: &str) -> Self {
        Self {
            core: SimCore::new(name, "Simulated dome"),
            caps: DomeCapabilities {
                can_set_altitude: true,
                can_set_azimuth: true,
                can_set_shutter: true,
                can_slave: true,
                can_sync_azimuth: true,
                can_find_home: true,
                can_park: true,
            },
            pose: Mutex::new(DomePose {
                shutter: ShutterState::Closed,
                altitude: 0.0,
                azimuth: 0.0,
                slaved: false,
                at_home: false,
                at_park: false,
            }),
        }
    }

    pub fn with_capabilities(mut self, caps: DomeCapabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn slaved(self, slaved: bool) -> Self {
        lock(&self.pose).slaved = slaved;
        self
    }

    pub fn parked(self) -> Self {
        lock(&self.pose).at_park = true;
        self
    }

    pub fn pose(&self) -> DomePose {
        *lock(&self.pose)
    }
}

sim_device!(SimDome);

#[async_trait]
impl Dome for SimDome {
    fn capabilities(&self) -> DomeCapabilities {
        self.caps
    }

    async fn altitude(&self) -> DeviceResult<f64> {
        Ok(lock(&self.pose).altitude)
    }

    async fn azimuth(&self) -> DeviceResult<f64> {
        Ok(lock(&self.pose).azimuth)
    }

    async fn shutter_status(&self) -> DeviceResult<ShutterState> {
        Ok(lock(&self.pose).shutter)
    }

    async fn is_slewing(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn slaved(&self) -> DeviceResult<bool> {
        Ok(lock(&self.pose).slaved)
    }

    async fn at_home(&self) -> DeviceResult<bool> {
        Ok(lock(&self.pose).at_home)
    }

    async fn at_park(&self) -> DeviceResult<bool> {
        Ok(lock(&self.pose).at_park)
    }

    async fn open_shutter(&self) -> DeviceResult<()> {
        if !self.caps.can_set_shutter {
            return Err(DeviceError::not_supported("OpenShutter"));
        }
        self.core.command("open_shutter")?;
        lock(&self.pose).shutter = ShutterState::Open;
        Ok(())
    }

    async fn close_shutter(&self) -> DeviceResult<()> {
        if !self.caps.can_set_shutter {
            return Err(DeviceError::not_supported("CloseShutter"));
        }
        self.core.command("close_shutter")?;
        lock(&self.pose).shutter = ShutterState::Closed;
        Ok(())
    }

    async fn slew_to_altitude(&self, altitude: f64) -> DeviceResult<()> {
        if !self.caps.can_set_altitude {
            return Err(DeviceError::not_supported("SlewToAltitude"));
        }
        self.core.command(format!("slew_to_altitude {:.4}", altitude))?;
        let mut pose = lock(&self.pose);
        pose.altitude = altitude;
        pose.at_park = false;
        pose.at_home = false;
        Ok(())
    }

    async fn slew_to_azimuth(&self, azimuth: f64) -> DeviceResult<()> {
        if !self.caps.can_set_azimuth {
            return Err(DeviceError::not_supported("SlewToAzimuth"));
        }
        self.core.command(format!("slew_to_azimuth {:.4}", azimuth))?;
        let mut pose = lock(&self.pose);
        pose.azimuth = azimuth.rem_euclid(360.0);
        pose.at_park = false;
        pose.at_home = false;
        Ok(())
    }

    async fn abort_slew(&self) -> DeviceResult<()> {
        self.core.command("abort_slew")
    }

    async fn park(&self) -> DeviceResult<()> {
        if !self.caps.can_park {
            return Err(DeviceError::not_supported("Park"));
        }
        self.core.command("park")?;
        lock(&self.pose).at_park = true;
        Ok(())
    }

    async fn find_home(&self) -> DeviceResult<()> {
        if !self.caps.can_find_home {
            return Err(DeviceError::not_supported("FindHome"));
        }
        self.core.command("find_home")?;
        let mut pose = lock(&self.pose);
        pose.at_home = true;
        pose.at_park = false;
        Ok(())
    }
}

// =============================================================================
// FOCUSER
// =============================================================================

#[derive(Debug)]
pub struct SimFocuser {
    core: SimCore,
    absolute: bool,
    max_increment: i32,
    max_step: i32,
    position: AtomicI32,
    temperature: Option<f64>,
}

impl SimFocuser {
    pub fn new(name: &str) -> Self {
        Self {
            core: SimCore::new(name, "Simulated focuser"),
            absolute: true,
            max_increment: 50_000,
            max_step: 50_000,
            position: AtomicI32::new(25_000),
            temperature: Some(15.0),
        }
    }

    pub fn relative(mut self) -> Self {
        self.absolute = false;
        self
    }

    pub fn with_limits(mut self, max_increment: i32, max_step: i32) -> Self {
        self.max_increment = max_increment;
        self.max_step = max_step;
        self
    }

    pub fn at(self, position: i32) -> Self {
        self.position.store(position, Ordering::SeqCst);
        self
    }

    pub fn current_position(&self) -> i32 {
        self.position.load(Ordering::SeqCst)
    }
}

sim_device!(SimFocuser);

#[async_trait]
impl Focuser for SimFocuser {
    async fn is_absolute(&self) -> DeviceResult<bool> {
        Ok(self.absolute)
    }

    async fn max_increment(&self) -> DeviceResult<i32> {
        Ok(self.max_increment)
    }

    async fn max_step(&self) -> DeviceResult<i32> {
        Ok(self.max_step)
    }

    async fn position(&self) -> DeviceResult<i32> {
        Ok(self.current_position())
    }

    async fn is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn move_to(&self, position: i32) -> DeviceResult<()> {
        if self.absolute {
            if !(0..=self.max_step).contains(&position) {
                return Err(DeviceError::InvalidParameter(format!(
                    "focuser position {} outside 0..={}",
                    position, self.max_step
                )));
            }
            self.core.command(format!("move_to {}", position))?;
            self.position.store(position, Ordering::SeqCst);
        } else {
            if position.abs() > self.max_increment {
                return Err(DeviceError::InvalidParameter(format!(
                    "focuser offset {} exceeds max increment {}",
                    position, self.max_increment
                )));
            }
            self.core.command(format!("move_by {}", position))?;
            self.position.fetch_add(position, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn halt(&self) -> DeviceResult<()> {
        self.core.command("halt")
    }

    async fn temperature(&self) -> DeviceResult<Option<f64>> {
        Ok(self.temperature)
    }
}

// =============================================================================
// FILTER WHEEL
// =============================================================================

#[derive(Debug)]
pub struct SimFilterWheel {
    core: SimCore,
    names: Vec<String>,
    position: Mutex<Option<usize>>,
}

impl SimFilterWheel {
    pub fn new(name: &str, filters: &[&str]) -> Self {
        Self {
            core: SimCore::new(name, "Simulated filter wheel"),
            names: filters.iter().map(|f| f.to_string()).collect(),
            position: Mutex::new(Some(0)),
        }
    }

    pub fn current_position(&self) -> Option<usize> {
        *lock(&self.position)
    }
}

sim_device!(SimFilterWheel);

#[async_trait]
impl FilterWheel for SimFilterWheel {
    async fn names(&self) -> DeviceResult<Vec<String>> {
        Ok(self.names.clone())
    }

    async fn position(&self) -> DeviceResult<Option<usize>> {
        Ok(self.current_position())
    }

    async fn set_position(&self, position: usize) -> DeviceResult<()> {
        if position >= self.names.len() {
            return Err(DeviceError::InvalidParameter(format!(
                "filter slot {} (wheel has {})",
                position,
                self.names.len()
            )));
        }
        self.core.command(format!("set_position {}", position))?;
        *lock(&self.position) = Some(position);
        Ok(())
    }
}

// =============================================================================
// ROTATOR
// =============================================================================

#[derive(Debug)]
struct RotatorState {
    position: f64,
    mechanical: f64,
    target: f64,
    reverse: bool,
    relative_moves: Vec<f64>,
}

#[derive(Debug)]
pub struct SimRotator {
    core: SimCore,
    state: Mutex<RotatorState>,
}

impl SimRotator {
    pub fn new(name: &str) -> Self {
        Self {
            core: SimCore::new(name, "Simulated field rotator"),
            state: Mutex::new(RotatorState {
                position: 0.0,
                mechanical: 0.0,
                target: 0.0,
                reverse: false,
                relative_moves: Vec::new(),
            }),
        }
    }

    /// Every offset passed to `move_relative`, in order
    pub fn relative_moves(&self) -> Vec<f64> {
        lock(&self.state).relative_moves.clone()
    }

    pub fn current_position(&self) -> f64 {
        lock(&self.state).position
    }
}

sim_device!(SimRotator);

#[async_trait]
impl Rotator for SimRotator {
    fn can_reverse(&self) -> bool {
        true
    }

    async fn position(&self) -> DeviceResult<f64> {
        Ok(lock(&self.state).position)
    }

    async fn mechanical_position(&self) -> DeviceResult<f64> {
        Ok(lock(&self.state).mechanical)
    }

    async fn target_position(&self) -> DeviceResult<f64> {
        Ok(lock(&self.state).target)
    }

    async fn is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn reverse(&self) -> DeviceResult<bool> {
        Ok(lock(&self.state).reverse)
    }

    async fn set_reverse(&self, reverse: bool) -> DeviceResult<()> {
        self.core.command(format!("set_reverse {}", reverse))?;
        lock(&self.state).reverse = reverse;
        Ok(())
    }

    async fn step_size(&self) -> DeviceResult<Option<f64>> {
        Ok(Some(0.01))
    }

    async fn move_relative(&self, delta: f64) -> DeviceResult<()> {
        self.core.command(format!("move_relative {:.6}", delta))?;
        let mut state = lock(&self.state);
        state.position = (state.position + delta).rem_euclid(360.0);
        state.mechanical = (state.mechanical + delta).rem_euclid(360.0);
        state.target = state.position;
        state.relative_moves.push(delta);
        Ok(())
    }

    async fn move_absolute(&self, angle: f64) -> DeviceResult<()> {
        self.core.command(format!("move_absolute {:.6}", angle))?;
        let mut state = lock(&self.state);
        let delta = angle - state.position;
        state.position = angle.rem_euclid(360.0);
        state.mechanical = (state.mechanical + delta).rem_euclid(360.0);
        state.target = state.position;
        Ok(())
    }

    async fn halt(&self) -> DeviceResult<()> {
        self.core.command("halt")
    }
}

// =============================================================================
// COVER CALIBRATOR
// =============================================================================

#[derive(Debug)]
pub struct SimCoverCalibrator {
    core: SimCore,
    has_cover: bool,
    has_calibrator: bool,
    max_brightness: i32,
    state: Mutex<(CoverState, CalibratorState, i32)>,
}

impl SimCoverCalibrator {
    pub fn new(name: &str) -> Self {
        Self {
            core: SimCore::new(name, "Simulated flat panel"),
            has_cover: true,
            has_calibrator: true,
            max_brightness: 255,
            state: Mutex::new((CoverState::Closed, CalibratorState::Off, 0)),
        }
    }

    pub fn without_cover(mut self) -> Self {
        self.has_cover = false;
        self
    }

    pub fn without_calibrator(mut self) -> Self {
        self.has_calibrator = false;
        self
    }

    fn require_cover(&self, what: &str) -> DeviceResult<()> {
        if !self.has_cover {
            return Err(DeviceError::not_supported(what));
        }
        Ok(())
    }

    fn require_calibrator(&self, what: &str) -> DeviceResult<()> {
        if !self.has_calibrator {
            return Err(DeviceError::not_supported(what));
        }
        Ok(())
    }
}

sim_device!(SimCoverCalibrator);

#[async_trait]
impl CoverCalibrator for SimCoverCalibrator {
    async fn cover_state(&self) -> DeviceResult<CoverState> {
        if !self.has_cover {
            return Ok(CoverState::NotPresent);
        }
        Ok(lock(&self.state).0)
    }

    async fn calibrator_state(&self) -> DeviceResult<CalibratorState> {
        if !self.has_calibrator {
            return Ok(CalibratorState::NotPresent);
        }
        Ok(lock(&self.state).1)
    }

    async fn brightness(&self) -> DeviceResult<i32> {
        Ok(lock(&self.state).2)
    }

    async fn max_brightness(&self) -> DeviceResult<i32> {
        Ok(self.max_brightness)
    }

    async fn open_cover(&self) -> DeviceResult<()> {
        self.require_cover("OpenCover")?;
        self.core.command("open_cover")?;
        lock(&self.state).0 = CoverState::Open;
        Ok(())
    }

    async fn close_cover(&self) -> DeviceResult<()> {
        self.require_cover("CloseCover")?;
        self.core.command("close_cover")?;
        lock(&self.state).0 = CoverState::Closed;
        Ok(())
    }

    async fn halt_cover(&self) -> DeviceResult<()> {
        self.require_cover("HaltCover")?;
        self.core.command("halt_cover")
    }

    async fn calibrator_on(&self, brightness: i32) -> DeviceResult<()> {
        self.require_calibrator("CalibratorOn")?;
        if !(0..=self.max_brightness).contains(&brightness) {
            return Err(DeviceError::InvalidParameter(format!(
                "brightness {} outside 0..={}",
                brightness, self.max_brightness
            )));
        }
        self.core.command(format!("calibrator_on {}", brightness))?;
        let mut state = lock(&self.state);
        state.1 = CalibratorState::Ready;
        state.2 = brightness;
        Ok(())
    }

    async fn calibrator_off(&self) -> DeviceResult<()> {
        self.require_calibrator("CalibratorOff")?;
        self.core.command("calibrator_off")?;
        let mut state = lock(&self.state);
        state.1 = CalibratorState::Off;
        state.2 = 0;
        Ok(())
    }
}

// =============================================================================
// CAMERA
// =============================================================================

/// One exposure the simulated camera was asked to take
#[derive(Debug, Clone, PartialEq)]
pub struct SimExposure {
    pub duration: f64,
    pub light: bool,
    pub binning: (u32, u32),
    pub readout_mode: usize,
}

#[derive(Debug)]
struct Thermal {
    temperature: f64,
    setpoint: f64,
    /// Degrees gained toward the setpoint per temperature read
    step: f64,
}

#[derive(Debug)]
struct ExposureState {
    binning: (u32, u32),
    readout_mode: usize,
    started: Option<(Instant, f64)>,
    taken: Vec<SimExposure>,
}

#[derive(Debug)]
pub struct SimCamera {
    core: SimCore,
    caps: CameraCapabilities,
    sensor: (u32, u32),
    pixel_size: (f64, f64),
    readout_modes: Vec<String>,
    thermal: Mutex<Thermal>,
    exposure: Mutex<ExposureState>,
    fail_exposures_after: Option<usize>,
}

impl SimCamera {
    pub fn new(name: &str) -> Self {
        Self {
            core: SimCore::new(name, "Simulated CCD camera"),
            caps: CameraCapabilities {
                can_abort_exposure: true,
                can_set_ccd_temperature: true,
            },
            sensor: (64, 48),
            pixel_size: (3.76, 3.76),
            readout_modes: vec!["Default".to_string()],
            thermal: Mutex::new(Thermal {
                temperature: 20.0,
                setpoint: 20.0,
                step: 100.0,
            }),
            exposure: Mutex::new(ExposureState {
                binning: (1, 1),
                readout_mode: 0,
                started: None,
                taken: Vec::new(),
            }),
            fail_exposures_after: None,
        }
    }

    pub fn with_capabilities(mut self, caps: CameraCapabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Start `count` exposures, then report a communication error
    pub fn failing_exposures_after(mut self, count: usize) -> Self {
        self.fail_exposures_after = Some(count);
        self
    }

    pub fn with_sensor(mut self, width: u32, height: u32, pixel_um: f64) -> Self {
        self.sensor = (width, height);
        self.pixel_size = (pixel_um, pixel_um);
        self
    }

    pub fn with_readout_modes(mut self, modes: &[&str]) -> Self {
        self.readout_modes = modes.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Sensor starts at `temperature` and moves `step` degrees toward the
    /// setpoint on every read
    pub fn with_thermal(self, temperature: f64, step: f64) -> Self {
        {
            let mut thermal = lock(&self.thermal);
            thermal.temperature = temperature;
            thermal.step = step;
        }
        self
    }

    pub fn exposures(&self) -> Vec<SimExposure> {
        lock(&self.exposure).taken.clone()
    }

    pub fn setpoint(&self) -> f64 {
        lock(&self.thermal).setpoint
    }
}

fn synthetic_frame(width: u32, height: u32) -> Vec<u16> {
    let mut rng = rand::thread_rng();
    (0..(width as usize * height as usize))
        .map(|_| 1000 + rng.gen_range(0..64u16))
        .collect()
}

sim_device!(SimCamera);

#[async_trait]
impl Camera for SimCamera {
    fn capabilities(&self) -> CameraCapabilities {
        self.caps
    }

    async fn sensor_size(&self) -> DeviceResult<(u32, u32)> {
        Ok(self.sensor)
    }

    async fn pixel_size(&self) -> DeviceResult<(f64, f64)> {
        Ok(self.pixel_size)
    }

    async fn binning(&self) -> DeviceResult<(u32, u32)> {
        Ok(lock(&self.exposure).binning)
    }

    async fn set_binning(&self, bin_x: u32, bin_y: u32) -> DeviceResult<()> {
        if bin_x == 0 || bin_y == 0 || bin_x > 4 || bin_y > 4 {
            return Err(DeviceError::InvalidParameter(format!(
                "binning {}x{}",
                bin_x, bin_y
            )));
        }
        self.core.command(format!("set_binning {}x{}", bin_x, bin_y))?;
        lock(&self.exposure).binning = (bin_x, bin_y);
        Ok(())
    }

    async fn readout_modes(&self) -> DeviceResult<Vec<String>> {
        Ok(self.readout_modes.clone())
    }

    async fn readout_mode(&self) -> DeviceResult<usize> {
        Ok(lock(&self.exposure).readout_mode)
    }

    async fn set_readout_mode(&self, mode: usize) -> DeviceResult<()> {
        if mode >= self.readout_modes.len() {
            return Err(DeviceError::InvalidParameter(format!(
                "readout mode {}",
                mode
            )));
        }
        self.core.command(format!("set_readout_mode {}", mode))?;
        lock(&self.exposure).readout_mode = mode;
        Ok(())
    }

    async fn ccd_temperature(&self) -> DeviceResult<f64> {
        let mut thermal = lock(&self.thermal);
        if self.caps.can_set_ccd_temperature {
            let gap = thermal.setpoint - thermal.temperature;
            thermal.temperature += gap.clamp(-thermal.step, thermal.step);
        }
        Ok(thermal.temperature)
    }

    async fn set_ccd_temperature(&self, setpoint: f64) -> DeviceResult<()> {
        if !self.caps.can_set_ccd_temperature {
            return Err(DeviceError::not_supported("SetCCDTemperature"));
        }
        self.core.command(format!("set_ccd_temperature {:.2}", setpoint))?;
        lock(&self.thermal).setpoint = setpoint;
        Ok(())
    }

    async fn start_exposure(&self, duration_secs: f64, light: bool) -> DeviceResult<()> {
        if duration_secs < 0.0 {
            return Err(DeviceError::InvalidParameter(format!(
                "exposure {}s",
                duration_secs
            )));
        }
        let taken = lock(&self.exposure).taken.len();
        if self.fail_exposures_after.is_some_and(|limit| taken >= limit) {
            return Err(DeviceError::Communication {
                device: self.core.info.name.clone(),
                message: "camera stopped responding".to_string(),
            });
        }
        self.core
            .command(format!("start_exposure {:.4} {}", duration_secs, light))?;
        let mut exposure = lock(&self.exposure);
        let record = SimExposure {
            duration: duration_secs,
            light,
            binning: exposure.binning,
            readout_mode: exposure.readout_mode,
        };
        exposure.taken.push(record);
        exposure.started = Some((Instant::now(), duration_secs));
        Ok(())
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        if !self.caps.can_abort_exposure {
            return Err(DeviceError::not_supported("AbortExposure"));
        }
        self.core.command("abort_exposure")?;
        lock(&self.exposure).started = None;
        Ok(())
    }

    async fn image_ready(&self) -> DeviceResult<bool> {
        Ok(match lock(&self.exposure).started {
            Some((start, duration)) => start.elapsed() >= Duration::from_secs_f64(duration),
            None => false,
        })
    }

    async fn image_array(&self) -> DeviceResult<ImageArray> {
        if !self.image_ready().await? {
            return Err(DeviceError::InvalidOperation("no image ready".to_string()));
        }
        let (bin_x, bin_y) = lock(&self.exposure).binning;
        let width = self.sensor.0 / bin_x;
        let height = self.sensor.1 / bin_y;
        Ok(ImageArray {
            width,
            height,
            data: synthetic_frame(width, height),
        })
    }
}

// =============================================================================
// SAFETY / SWITCH / WEATHER
// =============================================================================

/// Safety monitor replaying a scripted sequence of readings; the last
/// reading repeats once the script runs out
#[derive(Debug)]
pub struct SimSafetyMonitor {
    core: SimCore,
    script: Mutex<VecDeque<DeviceResult<bool>>>,
    last: Mutex<DeviceResult<bool>>,
    reads: AtomicUsize,
}

impl SimSafetyMonitor {
    pub fn always_safe(name: &str) -> Self {
        Self::scripted(name, Vec::new())
    }

    pub fn scripted(name: &str, readings: Vec<DeviceResult<bool>>) -> Self {
        Self {
            core: SimCore::new(name, "Simulated safety monitor"),
            script: Mutex::new(readings.into()),
            last: Mutex::new(Ok(true)),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Replace the current reading
    pub fn set_safe(&self, safe: bool) {
        lock(&self.script).clear();
        *lock(&self.last) = Ok(safe);
    }
}

sim_device!(SimSafetyMonitor);

#[async_trait]
impl SafetyMonitor for SimSafetyMonitor {
    async fn is_safe(&self) -> DeviceResult<bool> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        let mut last = lock(&self.last);
        if let Some(reading) = next {
            *last = reading;
        }
        last.clone()
    }
}

#[derive(Debug)]
pub struct SimSwitch {
    core: SimCore,
    channels: Mutex<Vec<(String, bool)>>,
}

impl SimSwitch {
    pub fn new(name: &str, channels: &[&str]) -> Self {
        Self {
            core: SimCore::new(name, "Simulated switch"),
            channels: Mutex::new(channels.iter().map(|c| (c.to_string(), false)).collect()),
        }
    }

    fn channel<T>(&self, index: usize, f: impl FnOnce(&mut (String, bool)) -> T) -> DeviceResult<T> {
        let mut channels = lock(&self.channels);
        let len = channels.len();
        channels
            .get_mut(index)
            .map(f)
            .ok_or_else(|| DeviceError::InvalidParameter(format!("switch {} of {}", index, len)))
    }
}

sim_device!(SimSwitch);

#[async_trait]
impl Switch for SimSwitch {
    async fn max_switch(&self) -> DeviceResult<usize> {
        Ok(lock(&self.channels).len())
    }

    async fn switch_name(&self, index: usize) -> DeviceResult<String> {
        self.channel(index, |c| c.0.clone())
    }

    async fn get_switch(&self, index: usize) -> DeviceResult<bool> {
        self.channel(index, |c| c.1)
    }

    async fn set_switch(&self, index: usize, state: bool) -> DeviceResult<()> {
        self.core.command(format!("set_switch {} {}", index, state))?;
        self.channel(index, |c| c.1 = state)
    }
}

#[derive(Debug)]
pub struct SimObservingConditions {
    core: SimCore,
    reading: Mutex<ConditionsReading>,
    refreshes: AtomicUsize,
    fail_after: Option<usize>,
}

impl SimObservingConditions {
    pub fn new(name: &str) -> Self {
        Self {
            core: SimCore::new(name, "Simulated weather station"),
            reading: Mutex::new(ConditionsReading {
                temperature: Some(12.0),
                humidity: Some(55.0),
                pressure: Some(1013.0),
                dew_point: Some(3.5),
                wind_speed: Some(2.0),
                wind_direction: Some(270.0),
                cloud_cover: Some(0.0),
                sky_quality: Some(21.2),
                rain_rate: Some(0.0),
            }),
            refreshes: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    /// Refresh succeeds `count` times, then reports a communication error
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

sim_device!(SimObservingConditions);

#[async_trait]
impl ObservingConditions for SimObservingConditions {
    async fn refresh(&self) -> DeviceResult<()> {
        let done = self.refreshes.load(Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| done >= limit) {
            return Err(DeviceError::Communication {
                device: self.core.info.name.clone(),
                message: "station stopped responding".to_string(),
            });
        }
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.core.command("refresh")
    }

    async fn reading(&self) -> DeviceResult<ConditionsReading> {
        Ok(lock(&self.reading).clone())
    }
}

// =============================================================================
// SOFTWARE CAPABILITIES
// =============================================================================

/// What a simulated solver answers
#[derive(Debug, Clone)]
pub enum SolverScript {
    Solution(WcsSolution),
    NoMatch,
    Fail,
}

#[derive(Debug)]
pub struct SimSolver {
    name: String,
    script: Mutex<SolverScript>,
    calls: AtomicUsize,
    last_options: Mutex<Option<SolveOptions>>,
}

impl SimSolver {
    pub fn new(name: &str, script: SolverScript) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        }
    }

    pub fn set_script(&self, script: SolverScript) {
        *lock(&self.script) = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<SolveOptions> {
        lock(&self.last_options).clone()
    }
}

#[async_trait]
impl Solver for SimSolver {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn solve(
        &self,
        image_path: &Path,
        options: &SolveOptions,
    ) -> DeviceResult<Option<WcsSolution>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_options) = Some(options.clone());
        tracing::debug!("[SIM] {} solving {}", self.name, image_path.display());
        match &*lock(&self.script) {
            SolverScript::Solution(wcs) => Ok(Some(*wcs)),
            SolverScript::NoMatch => Ok(None),
            SolverScript::Fail => Err(DeviceError::driver("solver crashed")),
        }
    }
}

#[derive(Debug)]
pub struct SimAutofocus {
    result: i32,
    runs: Mutex<Vec<f64>>,
}

impl SimAutofocus {
    pub fn new(result: i32) -> Self {
        Self {
            result,
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Exposure time of each run
    pub fn runs(&self) -> Vec<f64> {
        lock(&self.runs).clone()
    }
}

#[async_trait]
impl Autofocus for SimAutofocus {
    fn name(&self) -> String {
        "Simulated autofocus".to_string()
    }

    async fn run(&self, exposure_secs: f64) -> DeviceResult<i32> {
        lock(&self.runs).push(exposure_secs);
        Ok(self.result)
    }
}

/// FWHM source either fixed or derived from a focuser's distance to best focus
#[derive(Debug)]
pub enum SimFwhmEstimator {
    Fixed(Option<f64>),
    Parabolic {
        focuser: Arc<SimFocuser>,
        best_focus: i32,
        min_fwhm: f64,
        curvature: f64,
    },
}

#[async_trait]
impl FwhmEstimator for SimFwhmEstimator {
    async fn median_fwhm(&self, _image_path: &Path) -> DeviceResult<Option<f64>> {
        Ok(match self {
            Self::Fixed(value) => *value,
            Self::Parabolic {
                focuser,
                best_focus,
                min_fwhm,
                curvature,
            } => {
                let offset = (focuser.current_position() - best_focus) as f64;
                Some(min_fwhm + curvature * offset * offset)
            }
        })
    }
}
