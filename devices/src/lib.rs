//! Starwatch device capabilities
//!
//! Typed async traits for every subsystem an observatory can host, the
//! plate-solve data model shared with solver engines, and in-process
//! simulators used for dry runs and tests.

pub mod error;
pub mod sim;
pub mod traits;
pub mod wcs;

pub use error::{DeviceError, DeviceResult};
pub use traits::*;
pub use wcs::{AngleUnit, SolveOptions, WcsSolution};
