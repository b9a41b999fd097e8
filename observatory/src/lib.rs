//! Starwatch observatory orchestration
//!
//! Coordinates independently controlled subsystems (mount, dome, camera,
//! focuser, filter wheel, rotator, cover calibrator, safety monitors,
//! switches and plate solvers) into one observatory that can run an imaging
//! session unattended.

pub mod calibration;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod focus;
pub mod frames;
pub mod header;
pub mod loops;
pub mod observatory;
pub mod recenter;
pub mod registry;
pub mod sky;
pub mod slew;
pub mod state;

pub use calibration::{
    CalibrationJob, CalibrationReport, CalibrationSequencer, CalibrationStep, DarksJob, FinalPosition, FlatsJob,
    OutputFolder,
};
pub use config::{DriverSpec, ObservatoryConfig, Transport};
pub use connection::ConnectionManager;
pub use control::{Controlled, SequenceReport, StepOutcome, StepRecord};
pub use error::{ConfigError, ObservatoryError, Result};
pub use focus::{AutofocusOutcome, AutofocusRequest, FocusController, FocusQuality};
pub use frames::{FitsSink, FrameRecorder, FrameType, ImageSink, SaveOptions, SavedFrame};
pub use loops::{BackgroundLoops, FailureCallback, LoopKind, LoopStatus};
pub use observatory::Observatory;
pub use recenter::{RecenterOutcome, RecenterRequest, Recenterer};
pub use registry::{DriverRegistry, RoleRegistry, SIMULATOR};
pub use sky::{MeanSkyModel, Site, SkyModel, SkyTarget};
pub use slew::{SlewCoordinator, SlewPhase, SlewReport, SlewRequest};
pub use state::{Devices, ObservatoryState};
