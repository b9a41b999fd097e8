//! Sky coordinates and the sidereal-time model
//!
//! Only what the orchestration layer needs to aim hardware: sidereal time,
//! hour angle and the horizontal/equatorial transform for a site. No
//! precession, nutation or refraction.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fmt::Debug;

/// Where a slew should point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkyTarget {
    Equatorial { ra_hours: f64, dec_deg: f64 },
    Horizontal { alt_deg: f64, az_deg: f64 },
}

/// Observer location
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Site {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

/// Coordinate transforms the controllers depend on
pub trait SkyModel: Send + Sync + Debug {
    /// Local sidereal time in hours
    fn local_sidereal_time(&self, site: &Site, time: DateTime<Utc>) -> f64;

    /// (altitude, azimuth) in degrees, azimuth measured north through east
    fn to_horizontal(&self, site: &Site, ra_hours: f64, dec_deg: f64, time: DateTime<Utc>) -> (f64, f64);

    /// (ra_hours, dec_deg)
    fn to_equatorial(&self, site: &Site, alt_deg: f64, az_deg: f64, time: DateTime<Utc>) -> (f64, f64);

    /// Hour angle in hours, normalised to (-12, 12]
    fn hour_angle(&self, site: &Site, ra_hours: f64, time: DateTime<Utc>) -> f64 {
        let ha = (self.local_sidereal_time(site, time) - ra_hours).rem_euclid(24.0);
        if ha > 12.0 {
            ha - 24.0
        } else {
            ha
        }
    }
}

/// Calculate Julian Day from a chrono DateTime
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let (y, m) = if dt.month() <= 2 {
        (dt.year() - 1, dt.month() + 12)
    } else {
        (dt.year(), dt.month())
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + dt.day() as f64
        + b as f64
        - 1524.5;

    let seconds = dt.num_seconds_from_midnight() as f64 + dt.nanosecond() as f64 * 1e-9;
    jd + seconds / 86_400.0
}

/// Local mean sidereal time in hours for a longitude in degrees (east positive)
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - 2451545.0) / 36525.0;

    // Greenwich Mean Sidereal Time in degrees
    let gmst = 280.46061837 + 360.98564736629 * (jd - 2451545.0) + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    (gmst + longitude).rem_euclid(360.0) / 15.0
}

/// Mean sidereal time, spherical transforms, no refraction
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSkyModel;

impl SkyModel for MeanSkyModel {
    fn local_sidereal_time(&self, site: &Site, time: DateTime<Utc>) -> f64 {
        local_sidereal_time(julian_day(&time), site.longitude)
    }

    fn to_horizontal(&self, site: &Site, ra_hours: f64, dec_deg: f64, time: DateTime<Utc>) -> (f64, f64) {
        let ha = (self.local_sidereal_time(site, time) - ra_hours) * 15.0;
        let (h, dec, lat) = (ha.to_radians(), dec_deg.to_radians(), site.latitude.to_radians());

        let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * h.cos();
        let alt = sin_alt.clamp(-1.0, 1.0).asin();
        let az = (-h.sin() * dec.cos()).atan2(dec.sin() * lat.cos() - dec.cos() * lat.sin() * h.cos());

        (alt.to_degrees(), az.to_degrees().rem_euclid(360.0))
    }

    fn to_equatorial(&self, site: &Site, alt_deg: f64, az_deg: f64, time: DateTime<Utc>) -> (f64, f64) {
        let (alt, az, lat) = (alt_deg.to_radians(), az_deg.to_radians(), site.latitude.to_radians());

        let sin_dec = alt.sin() * lat.sin() + alt.cos() * lat.cos() * az.cos();
        let dec = sin_dec.clamp(-1.0, 1.0).asin();
        let h = (-az.sin() * alt.cos()).atan2(alt.sin() * lat.cos() - alt.cos() * lat.sin() * az.cos());

        let ra = (self.local_sidereal_time(site, time) - h.to_degrees() / 15.0).rem_euclid(24.0);
        (ra, dec.to_degrees())
    }
}
