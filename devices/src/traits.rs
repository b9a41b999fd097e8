//! Device Capability Traits
//!
//! Defines the interface every subsystem driver must implement. The
//! orchestration layer only talks to hardware through these traits, so a
//! driver is registered by implementing the trait for its role rather than by
//! any runtime inspection.
//!
//! All methods take `&self`: drivers are shared behind `Arc` between the
//! foreground sequence and the background loops and keep their own interior
//! state.

use crate::error::DeviceResult;
use crate::wcs::{SolveOptions, WcsSolution};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;

/// Static identity of a driver, used for header snapshots and logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub description: String,
    pub driver_info: String,
    pub driver_version: String,
    pub interface_version: i32,
}

impl DeviceInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Common interface for all connectable devices
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Driver identity
    fn info(&self) -> DeviceInfo;

    /// Check if the device is connected
    async fn connected(&self) -> DeviceResult<bool>;

    /// Connect or disconnect the device
    async fn set_connected(&self, connected: bool) -> DeviceResult<()>;
}

// =============================================================================
// MOUNT
// =============================================================================

/// Tracking rate for mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingRate {
    Sidereal = 0,
    Lunar = 1,
    Solar = 2,
    King = 3,
}

/// Equatorial coordinate system the mount reports and accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquatorialSystem {
    Other,
    Topocentric,
    J2000,
    J2050,
    B1950,
}

/// What the mount is able to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountCapabilities {
    pub can_slew: bool,
    pub can_slew_async: bool,
    pub can_slew_alt_az: bool,
    pub can_slew_alt_az_async: bool,
    pub can_park: bool,
    pub can_unpark: bool,
    pub can_find_home: bool,
    pub can_set_tracking: bool,
    pub can_sync: bool,
}

/// Mount/telescope device interface
#[async_trait]
pub trait Mount: Device {
    fn capabilities(&self) -> MountCapabilities;

    async fn equatorial_system(&self) -> DeviceResult<EquatorialSystem>;

    /// Current right ascension in hours, in the mount's equatorial system
    async fn right_ascension(&self) -> DeviceResult<f64>;

    /// Current declination in degrees, in the mount's equatorial system
    async fn declination(&self) -> DeviceResult<f64>;

    async fn altitude(&self) -> DeviceResult<f64>;

    async fn azimuth(&self) -> DeviceResult<f64>;

    /// Slew to coordinates and return once the slew is complete
    async fn slew_to_coordinates(&self, ra_hours: f64, dec_degrees: f64) -> DeviceResult<()>;

    /// Start a slew to coordinates and return immediately
    async fn slew_to_coordinates_async(&self, ra_hours: f64, dec_degrees: f64)
        -> DeviceResult<()>;

    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64) -> DeviceResult<()>;

    async fn slew_to_alt_az_async(&self, altitude: f64, azimuth: f64) -> DeviceResult<()>;

    async fn is_slewing(&self) -> DeviceResult<bool>;

    async fn abort_slew(&self) -> DeviceResult<()>;

    async fn at_park(&self) -> DeviceResult<bool>;

    async fn park(&self) -> DeviceResult<()>;

    async fn unpark(&self) -> DeviceResult<()>;

    async fn at_home(&self) -> DeviceResult<bool>;

    async fn find_home(&self) -> DeviceResult<()>;

    async fn tracking(&self) -> DeviceResult<bool>;

    async fn set_tracking(&self, enabled: bool) -> DeviceResult<()>;

    async fn set_tracking_rate(&self, rate: TrackingRate) -> DeviceResult<()>;

    /// Sync the mount's pointing model to the given coordinates
    async fn sync_to_coordinates(&self, ra_hours: f64, dec_degrees: f64) -> DeviceResult<()>;
}

// =============================================================================
// DOME
// =============================================================================

/// Shutter state for dome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomeCapabilities {
    pub can_set_altitude: bool,
    pub can_set_azimuth: bool,
    pub can_set_shutter: bool,
    pub can_slave: bool,
    pub can_sync_azimuth: bool,
    pub can_find_home: bool,
    pub can_park: bool,
}

/// Dome device interface
#[async_trait]
pub trait Dome: Device {
    fn capabilities(&self) -> DomeCapabilities;

    async fn altitude(&self) -> DeviceResult<f64>;

    async fn azimuth(&self) -> DeviceResult<f64>;

    async fn shutter_status(&self) -> DeviceResult<ShutterState>;

    async fn is_slewing(&self) -> DeviceResult<bool>;

    /// True when the dome follows the mount on its own
    async fn slaved(&self) -> DeviceResult<bool>;

    async fn at_home(&self) -> DeviceResult<bool>;

    async fn at_park(&self) -> DeviceResult<bool>;

    async fn open_shutter(&self) -> DeviceResult<()>;

    async fn close_shutter(&self) -> DeviceResult<()>;

    async fn slew_to_altitude(&self, altitude: f64) -> DeviceResult<()>;

    async fn slew_to_azimuth(&self, azimuth: f64) -> DeviceResult<()>;

    async fn abort_slew(&self) -> DeviceResult<()>;

    async fn park(&self) -> DeviceResult<()>;

    async fn find_home(&self) -> DeviceResult<()>;
}

// =============================================================================
// FOCUSER / FILTER WHEEL / ROTATOR
// =============================================================================

/// Focuser device interface
#[async_trait]
pub trait Focuser: Device {
    /// Absolute focusers take a target step in `move_to`, relative ones an offset
    async fn is_absolute(&self) -> DeviceResult<bool>;

    async fn max_increment(&self) -> DeviceResult<i32>;

    async fn max_step(&self) -> DeviceResult<i32>;

    async fn position(&self) -> DeviceResult<i32>;

    async fn is_moving(&self) -> DeviceResult<bool>;

    async fn move_to(&self, position: i32) -> DeviceResult<()>;

    async fn halt(&self) -> DeviceResult<()>;

    async fn temperature(&self) -> DeviceResult<Option<f64>>;
}

/// Filter wheel device interface (0-indexed slots)
#[async_trait]
pub trait FilterWheel: Device {
    async fn names(&self) -> DeviceResult<Vec<String>>;

    /// `None` while the wheel is moving
    async fn position(&self) -> DeviceResult<Option<usize>>;

    async fn set_position(&self, position: usize) -> DeviceResult<()>;
}

/// Rotator device interface (angles in degrees)
#[async_trait]
pub trait Rotator: Device {
    fn can_reverse(&self) -> bool;

    async fn position(&self) -> DeviceResult<f64>;

    async fn mechanical_position(&self) -> DeviceResult<f64>;

    async fn target_position(&self) -> DeviceResult<f64>;

    async fn is_moving(&self) -> DeviceResult<bool>;

    async fn reverse(&self) -> DeviceResult<bool>;

    async fn set_reverse(&self, reverse: bool) -> DeviceResult<()>;

    async fn step_size(&self) -> DeviceResult<Option<f64>>;

    async fn move_relative(&self, delta: f64) -> DeviceResult<()>;

    async fn move_absolute(&self, angle: f64) -> DeviceResult<()>;

    async fn halt(&self) -> DeviceResult<()>;
}

// =============================================================================
// COVER CALIBRATOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverState {
    NotPresent,
    Closed,
    Moving,
    Open,
    Unknown,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibratorState {
    NotPresent,
    Off,
    NotReady,
    Ready,
    Unknown,
    Error,
}

/// Flat panel / dust cover device interface
#[async_trait]
pub trait CoverCalibrator: Device {
    async fn cover_state(&self) -> DeviceResult<CoverState>;

    async fn calibrator_state(&self) -> DeviceResult<CalibratorState>;

    async fn brightness(&self) -> DeviceResult<i32>;

    async fn max_brightness(&self) -> DeviceResult<i32>;

    async fn open_cover(&self) -> DeviceResult<()>;

    async fn close_cover(&self) -> DeviceResult<()>;

    async fn halt_cover(&self) -> DeviceResult<()>;

    async fn calibrator_on(&self, brightness: i32) -> DeviceResult<()>;

    async fn calibrator_off(&self) -> DeviceResult<()>;
}

// =============================================================================
// CAMERA
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraCapabilities {
    pub can_abort_exposure: bool,
    pub can_set_ccd_temperature: bool,
}

/// Raw frame read out from the sensor
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

impl ImageArray {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }
}

/// Camera device interface
#[async_trait]
pub trait Camera: Device {
    fn capabilities(&self) -> CameraCapabilities;

    /// Unbinned sensor size in pixels
    async fn sensor_size(&self) -> DeviceResult<(u32, u32)>;

    /// Pixel pitch in microns
    async fn pixel_size(&self) -> DeviceResult<(f64, f64)>;

    async fn binning(&self) -> DeviceResult<(u32, u32)>;

    async fn set_binning(&self, bin_x: u32, bin_y: u32) -> DeviceResult<()>;

    async fn readout_modes(&self) -> DeviceResult<Vec<String>>;

    async fn readout_mode(&self) -> DeviceResult<usize>;

    async fn set_readout_mode(&self, mode: usize) -> DeviceResult<()>;

    async fn ccd_temperature(&self) -> DeviceResult<f64>;

    async fn set_ccd_temperature(&self, setpoint: f64) -> DeviceResult<()>;

    /// Start an exposure; `light` false keeps the shutter closed
    async fn start_exposure(&self, duration_secs: f64, light: bool) -> DeviceResult<()>;

    async fn abort_exposure(&self) -> DeviceResult<()>;

    async fn image_ready(&self) -> DeviceResult<bool>;

    async fn image_array(&self) -> DeviceResult<ImageArray>;
}

// =============================================================================
// SAFETY / SWITCH / WEATHER
// =============================================================================

/// Safety interlock (weather, roof, power) reporting a single boolean
#[async_trait]
pub trait SafetyMonitor: Device {
    async fn is_safe(&self) -> DeviceResult<bool>;
}

/// Multi-channel switch device
#[async_trait]
pub trait Switch: Device {
    async fn max_switch(&self) -> DeviceResult<usize>;

    async fn switch_name(&self, index: usize) -> DeviceResult<String>;

    async fn get_switch(&self, index: usize) -> DeviceResult<bool>;

    async fn set_switch(&self, index: usize, state: bool) -> DeviceResult<()>;
}

/// One sample of environmental sensors; fields the station lacks are `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionsReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub dew_point: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub sky_quality: Option<f64>,
    pub rain_rate: Option<f64>,
}

/// Weather station interface
#[async_trait]
pub trait ObservingConditions: Device {
    /// Ask the station to take a fresh sample
    async fn refresh(&self) -> DeviceResult<()>;

    async fn reading(&self) -> DeviceResult<ConditionsReading>;
}

// =============================================================================
// SOFTWARE CAPABILITIES
// =============================================================================

/// Plate-solving engine
#[async_trait]
pub trait Solver: Send + Sync + Debug {
    fn name(&self) -> String;

    /// Solve a saved frame. `Ok(None)` means the engine ran but found no match.
    async fn solve(&self, image_path: &Path, options: &SolveOptions)
        -> DeviceResult<Option<WcsSolution>>;
}

/// External autofocus routine
#[async_trait]
pub trait Autofocus: Send + Sync + Debug {
    fn name(&self) -> String;

    /// Run a full focus cycle and return the chosen focuser position
    async fn run(&self, exposure_secs: f64) -> DeviceResult<i32>;
}

/// Source extraction used by the built-in focus routine
#[async_trait]
pub trait FwhmEstimator: Send + Sync + Debug {
    /// Median FWHM in pixels of the sources in a saved frame, `None` if no sources
    async fn median_fwhm(&self, image_path: &Path) -> DeviceResult<Option<f64>>;
}
