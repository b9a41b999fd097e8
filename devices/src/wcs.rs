//! Plate-solve results and request options
//!
//! A solution is a gnomonic (TAN) projection described by a reference sky
//! position, a reference pixel and a CD matrix. Pixel coordinates are
//! 0-based, x along columns and y along rows.

use serde::{Deserialize, Serialize};

/// Angle units a solver should assume for the pointing hint header keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AngleUnit {
    Hour,
    Deg,
}

/// Options passed to every solver call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOptions {
    /// Header key holding the pointing RA hint
    pub ra_key: String,
    /// Header key holding the pointing Dec hint
    pub dec_key: String,
    pub ra_unit: AngleUnit,
    pub dec_unit: AngleUnit,
    pub timeout_secs: f64,
    /// Expected pixel scale in arcsec/pixel
    pub scale_estimate: Option<f64>,
    /// Fractional tolerance on `scale_estimate`
    pub scale_error: f64,
    pub parity: i32,
    /// Place the reference pixel at the image centre
    pub crpix_center: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            ra_key: "TELRAIC".to_string(),
            dec_key: "TELDECIC".to_string(),
            ra_unit: AngleUnit::Hour,
            dec_unit: AngleUnit::Deg,
            timeout_secs: 60.0,
            scale_estimate: None,
            scale_error: 0.1,
            parity: 1,
            crpix_center: true,
        }
    }
}

impl SolveOptions {
    pub fn with_scale_estimate(mut self, arcsec_per_pixel: f64) -> Self {
        self.scale_estimate = Some(arcsec_per_pixel);
        self
    }
}

/// Astrometric solution for one frame (all angles in degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WcsSolution {
    pub crval_ra: f64,
    pub crval_dec: f64,
    pub crpix_x: f64,
    pub crpix_y: f64,
    pub cd1_1: f64,
    pub cd1_2: f64,
    pub cd2_1: f64,
    pub cd2_2: f64,
}

impl WcsSolution {
    /// Build a solution from a centre position, pixel scale and field rotation
    ///
    /// # Arguments
    /// * `ra_deg`, `dec_deg` - Sky position of the reference pixel
    /// * `crpix` - Reference pixel (x, y)
    /// * `scale_arcsec` - Pixel scale in arcseconds per pixel
    /// * `rotation_deg` - Field rotation
    pub fn from_scale_rotation(
        ra_deg: f64,
        dec_deg: f64,
        crpix: (f64, f64),
        scale_arcsec: f64,
        rotation_deg: f64,
    ) -> Self {
        let scale = scale_arcsec / 3600.0;
        let (sin_rot, cos_rot) = rotation_deg.to_radians().sin_cos();
        Self {
            crval_ra: ra_deg,
            crval_dec: dec_deg,
            crpix_x: crpix.0,
            crpix_y: crpix.1,
            // RA increases to the left
            cd1_1: -scale * cos_rot,
            cd1_2: scale * sin_rot,
            cd2_1: scale * sin_rot,
            cd2_2: scale * cos_rot,
        }
    }

    /// Mean pixel scale in arcsec/pixel
    pub fn pixel_scale(&self) -> f64 {
        (self.cd1_1 * self.cd2_2 - self.cd1_2 * self.cd2_1).abs().sqrt() * 3600.0
    }

    /// Sky position (ra, dec) in degrees of a pixel
    pub fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.crpix_x;
        let dy = y - self.crpix_y;
        let xi = (self.cd1_1 * dx + self.cd1_2 * dy).to_radians();
        let eta = (self.cd2_1 * dx + self.cd2_2 * dy).to_radians();

        let ra0 = self.crval_ra.to_radians();
        let dec0 = self.crval_dec.to_radians();
        let denom = dec0.cos() - eta * dec0.sin();
        let ra = ra0 + xi.atan2(denom);
        let dec = (dec0.sin() + eta * dec0.cos()).atan2((xi * xi + denom * denom).sqrt());

        (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }

    /// Pixel position of a sky position, `None` if it projects behind the
    /// tangent plane or the CD matrix is singular
    pub fn world_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        let ra0 = self.crval_ra.to_radians();
        let dec0 = self.crval_dec.to_radians();
        let ra = ra_deg.to_radians();
        let dec = dec_deg.to_radians();
        let dra = ra - ra0;

        let cos_c = dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * dra.cos();
        if cos_c <= 0.0 {
            return None;
        }
        let xi = (dec.cos() * dra.sin() / cos_c).to_degrees();
        let eta = ((dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * dra.cos()) / cos_c).to_degrees();

        let det = self.cd1_1 * self.cd2_2 - self.cd1_2 * self.cd2_1;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let dx = (self.cd2_2 * xi - self.cd1_2 * eta) / det;
        let dy = (-self.cd2_1 * xi + self.cd1_1 * eta) / det;
        Some((self.crpix_x + dx, self.crpix_y + dy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution() -> WcsSolution {
        WcsSolution::from_scale_rotation(150.0, 30.0, (512.0, 384.0), 1.2, 15.0)
    }

    #[test]
    fn test_reference_pixel_maps_to_crval() {
        let wcs = solution();
        let (ra, dec) = wcs.pixel_to_world(512.0, 384.0);
        assert!((ra - 150.0).abs() < 1e-9);
        assert!((dec - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_projection_inverts() {
        let wcs = solution();
        let (ra, dec) = wcs.pixel_to_world(100.0, 700.0);
        let (x, y) = wcs.world_to_pixel(ra, dec).unwrap();
        assert!((x - 100.0).abs() < 1e-6, "x = {}", x);
        assert!((y - 700.0).abs() < 1e-6, "y = {}", y);
    }

    #[test]
    fn test_ra_increases_to_the_left() {
        let wcs = WcsSolution::from_scale_rotation(10.0, 0.0, (0.0, 0.0), 3600.0, 0.0);
        let (ra, _) = wcs.pixel_to_world(-1.0, 0.0);
        assert!((ra - 11.0).abs() < 1e-3);
    }

    #[test]
    fn test_pixel_scale_round_trip() {
        assert!((solution().pixel_scale() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_far_side_does_not_project() {
        assert!(solution().world_to_pixel(330.0, -30.0).is_none());
    }

    #[test]
    fn test_default_options() {
        let opts = SolveOptions::default().with_scale_estimate(0.8);
        assert_eq!(opts.ra_key, "TELRAIC");
        assert_eq!(opts.ra_unit, AngleUnit::Hour);
        assert_eq!(opts.scale_estimate, Some(0.8));
        assert_eq!(opts.parity, 1);
    }
}
