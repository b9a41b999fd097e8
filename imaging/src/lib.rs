//! Image persistence for Starwatch frames

pub mod fits;

pub use fits::{calculate_airmass, read_header, write_fits, CardValue, FitsError, FitsHeader};
