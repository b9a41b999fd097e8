//! Closed-loop pointing refinement
//!
//! Each attempt slews, images, plate-solves and measures where the requested
//! sky position landed on the detector. The sky-side error at the target
//! pixel is folded back into the next slew until the worst axis is within
//! tolerance.

use crate::error::{ObservatoryError, Result};
use crate::frames::{FrameRecorder, FrameType, SaveOptions};
use crate::slew::{SlewCoordinator, SlewRequest};
use crate::state::{ensure_connected, require, ObservatoryState};
use chrono::Utc;
use starwatch_devices::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct RecenterRequest {
    pub ra_hours: f64,
    pub dec_deg: f64,
    /// Detector pixel (x, y); defaults to the centre of the binned frame
    pub target_pixel: Option<(f64, f64)>,
    /// Declination offset applied to the first slew only
    pub initial_offset_dec_arcsec: f64,
    /// When false, image once, correct once and stop without verifying
    pub check_and_refine: bool,
    pub max_attempts: u32,
    pub tolerance_px: f64,
    pub exposure_secs: f64,
    pub readout: usize,
    /// Directory that receives a copy of every centering frame
    pub save_images: Option<PathBuf>,
    pub sync_mount: bool,
    pub do_initial_slew: bool,
}

impl RecenterRequest {
    pub fn new(ra_hours: f64, dec_deg: f64) -> Self {
        Self {
            ra_hours,
            dec_deg,
            target_pixel: None,
            initial_offset_dec_arcsec: 0.0,
            check_and_refine: true,
            max_attempts: 5,
            tolerance_px: 3.0,
            exposure_secs: 10.0,
            readout: 0,
            save_images: None,
            sync_mount: false,
            do_initial_slew: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecenterOutcome {
    pub centered: bool,
    /// Centering was confirmed by a solved frame
    pub verified: bool,
    pub attempts: u32,
    /// Worst-axis pixel error of the last solved frame
    pub last_error_px: Option<f64>,
    pub synced: bool,
    /// Solved (ra hours, dec degrees) of the detector centre
    pub solved_center: Option<(f64, f64)>,
}

/// Signed difference `a - b` of two right ascensions in degrees, in (-180, 180]
fn ra_difference_deg(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}

struct Measurement {
    error_px: f64,
    /// Sky error (ra degrees, dec degrees) at the target pixel
    sky_error: (f64, f64),
    center: (f64, f64),
}

pub struct Recenterer {
    state: Arc<ObservatoryState>,
    slewer: Arc<SlewCoordinator>,
    frames: Arc<FrameRecorder>,
    scratch_dir: PathBuf,
}

impl Recenterer {
    pub fn new(state: Arc<ObservatoryState>, slewer: Arc<SlewCoordinator>, frames: Arc<FrameRecorder>) -> Self {
        Self {
            state,
            slewer,
            frames,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory for the temporary centering frames
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub async fn recenter(&self, request: &RecenterRequest) -> Result<RecenterOutcome> {
        let devices = self.state.devices();
        let camera = require(&devices.camera, "camera")?;
        ensure_connected(camera, "camera").await?;
        if request.max_attempts == 0 {
            return Err(ObservatoryError::InvalidArgument("max_attempts must be at least 1".to_string()));
        }

        let (frame_width, frame_height) = {
            let camera = camera.device();
            let (width, height) = camera.sensor_size().await?;
            let (bin_x, bin_y) = camera.binning().await?;
            (width / bin_x.max(1), height / bin_y.max(1))
        };
        let (target_x, target_y) = request
            .target_pixel
            .unwrap_or((frame_width as f64 / 2.0, frame_height as f64 / 2.0));
        tracing::info!(
            "Placing RA {:.5}h Dec {:.5} on pixel ({:.2}, {:.2})",
            request.ra_hours,
            request.dec_deg,
            target_x,
            target_y
        );

        // single-shot mode images once and re-slews once
        let attempts_allowed = if request.check_and_refine { request.max_attempts } else { 2 };
        let mut working = (request.ra_hours, request.dec_deg);
        let mut outcome = RecenterOutcome {
            centered: false,
            verified: false,
            attempts: 0,
            last_error_px: None,
            synced: false,
            solved_center: None,
        };

        for attempt in 0..attempts_allowed {
            self.state.ensure_operational()?;
            outcome.attempts = attempt + 1;
            if request.check_and_refine {
                tracing::info!("Centering attempt {} of {}", attempt + 1, attempts_allowed);
            }

            if attempt > 0 || request.do_initial_slew {
                let offset = if attempt == 0 { request.initial_offset_dec_arcsec / 3600.0 } else { 0.0 };
                let slew = SlewRequest::equatorial(working.0, working.1 + offset)
                    .with_dome(devices.dome.is_some())
                    .with_rotator(devices.rotator.is_some());
                self.slewer.slew(&slew).await?;
            } else {
                tokio::time::sleep(self.state.settle_time()).await;
                self.state.ensure_operational()?;
            }

            if !request.check_and_refine && attempt > 0 {
                tracing::info!("Single-shot centering complete");
                outcome.centered = true;
                return Ok(outcome);
            }

            let Some(measurement) = self
                .measure(request, attempt, working, (target_x, target_y), (frame_width, frame_height))
                .await?
            else {
                continue;
            };
            outcome.last_error_px = Some(measurement.error_px);
            outcome.solved_center = Some(measurement.center);

            if measurement.error_px <= request.tolerance_px {
                outcome.centered = true;
                outcome.verified = true;
                break;
            }

            tracing::info!("Offsetting next slew by {:.2} px", measurement.error_px);
            working.0 = (working.0 + measurement.sky_error.0 / 15.0).rem_euclid(24.0);
            working.1 = (working.1 + measurement.sky_error.1).clamp(-90.0, 90.0);
        }

        if !outcome.centered {
            tracing::warn!("Target could not be centered after {} attempt(s)", outcome.attempts);
            return Ok(outcome);
        }

        if request.sync_mount {
            self.state.ensure_operational()?;
            if let Some((ra, dec)) = outcome.solved_center {
                outcome.synced = self.sync_mount(ra, dec).await?;
            }
        }
        tracing::info!("Target in position after {} attempt(s)", outcome.attempts);
        Ok(outcome)
    }

    /// Expose, save, solve and measure one centering frame
    async fn measure(
        &self,
        request: &RecenterRequest,
        attempt: u32,
        working: (f64, f64),
        target: (f64, f64),
        frame: (u32, u32),
    ) -> Result<Option<Measurement>> {
        if let Some(camera) = &self.state.devices().camera {
            camera.lease().await.set_readout_mode(request.readout).await?;
        }
        self.frames.expose(request.exposure_secs, true).await?;

        let name = format!("recenter_{}_{}.fts", Utc::now().format("%Y%m%dT%H%M%S%.3f"), attempt + 1);
        let path = self.scratch_dir.join(&name);
        let options = SaveOptions::default().frame_type(FrameType::Light).overwrite();
        self.frames.save_last_image(&path, &options).await?;
        if let Some(dir) = &request.save_images {
            std::fs::create_dir_all(dir)?;
            std::fs::copy(&path, dir.join(&name))?;
            tracing::debug!("Copied centering frame to {}", dir.display());
        }

        let solution = self.frames.solve_frame(&path).await;
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!("Could not remove {}: {}", path.display(), e);
        }
        let Some(wcs) = solution else {
            tracing::warn!("No WCS solution found, skipping this attempt");
            return Ok(None);
        };

        let requested = (request.ra_hours * 15.0, request.dec_deg);
        let Some((obj_x, obj_y)) = wcs.world_to_pixel(requested.0, requested.1) else {
            tracing::warn!("Target does not project onto the solved frame, skipping this attempt");
            return Ok(None);
        };
        let at_target = wcs.pixel_to_world(target.0, target.1);
        let center = wcs.pixel_to_world(frame.0 as f64 / 2.0, frame.1 as f64 / 2.0);

        let dx = obj_x - target.0;
        let dy = obj_y - target.1;
        let sky_error = (ra_difference_deg(requested.0, at_target.0), requested.1 - at_target.1);
        tracing::debug!(
            "Pointing {:.5}h {:.5}: error {:.2}/{:.2} px, {:.2}\"/{:.2}\"",
            working.0,
            working.1,
            dx,
            dy,
            sky_error.0 * 3600.0,
            sky_error.1 * 3600.0
        );

        Ok(Some(Measurement {
            error_px: dx.abs().max(dy.abs()),
            sky_error,
            center: (center.0 / 15.0, center.1),
        }))
    }

    async fn sync_mount(&self, ra_hours: f64, dec_deg: f64) -> Result<bool> {
        let mount = require(&self.state.devices().telescope, "telescope")?;
        let mount = mount.lease().await;
        if !mount.capabilities().can_sync {
            tracing::warn!("Mount cannot sync, leaving pointing model unchanged");
            return Ok(false);
        }
        // an off-centre target pixel biases every later slew by the same offset
        tracing::info!("Syncing mount to solved centre RA {:.5}h Dec {:.5}", ra_hours, dec_deg);
        mount.sync_to_coordinates(ra_hours, dec_deg).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservatoryConfig;
    use crate::frames::FitsSink;
    use crate::loops::BackgroundLoops;
    use crate::state::Devices;
    use starwatch_devices::sim::*;

    struct Rig {
        mount: Arc<SimMount>,
        solver: Arc<SimSolver>,
        state: Arc<ObservatoryState>,
        recenterer: Recenterer,
        _scratch: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let camera = Arc::new(SimCamera::new("cam"));
        let mount = Arc::new(SimMount::new("mount"));
        camera.set_connected(true).await.unwrap();
        mount.set_connected(true).await.unwrap();
        let solver = Arc::new(SimSolver::new("sim", SolverScript::NoMatch));
        let devices = Devices::default()
            .with_camera(camera)
            .with_telescope(mount.clone())
            .with_solver(solver.clone());
        let state = Arc::new(ObservatoryState::new(devices, ObservatoryConfig::default()));
        let loops = Arc::new(BackgroundLoops::new(state.clone()));
        let slewer = Arc::new(SlewCoordinator::new(state.clone(), loops.clone()));
        let frames = Arc::new(FrameRecorder::new(state.clone(), loops, Arc::new(FitsSink)));
        let scratch = tempfile::tempdir().unwrap();
        let recenterer =
            Recenterer::new(state.clone(), slewer, frames).with_scratch_dir(scratch.path().to_path_buf());
        Rig {
            mount,
            solver,
            state,
            recenterer,
            _scratch: scratch,
        }
    }

    /// A position comfortably above the altitude floor right now
    fn high_target(state: &ObservatoryState) -> (f64, f64) {
        state.sky().to_equatorial(&state.site(), 70.0, 180.0, Utc::now())
    }

    fn request(target: (f64, f64)) -> RecenterRequest {
        RecenterRequest {
            exposure_secs: 1.0,
            ..RecenterRequest::new(target.0, target.1)
        }
    }

    #[test]
    fn test_ra_difference_wraps() {
        assert!((ra_difference_deg(1.0, 359.0) - 2.0).abs() < 1e-12);
        assert!((ra_difference_deg(359.0, 1.0) + 2.0).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_offset_exhausts_attempts() {
        let rig = rig().await;
        let target = high_target(&rig.state);
        // target lands 5 px right of the (32, 24) centre on every frame
        rig.solver.set_script(SolverScript::Solution(WcsSolution::from_scale_rotation(
            target.0 * 15.0,
            target.1,
            (37.0, 24.0),
            1.5,
            0.0,
        )));
        let request = RecenterRequest {
            max_attempts: 1,
            sync_mount: true,
            ..request(target)
        };

        let outcome = rig.recenterer.recenter(&request).await.unwrap();
        assert!(!outcome.centered);
        assert_eq!(outcome.attempts, 1);
        assert!((outcome.last_error_px.unwrap() - 5.0).abs() < 1e-6);
        assert!(!outcome.synced);
        assert!(!rig.mount.commands().iter().any(|c| c.starts_with("sync")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_error_centres_first_time() {
        let rig = rig().await;
        let target = high_target(&rig.state);
        rig.solver.set_script(SolverScript::Solution(WcsSolution::from_scale_rotation(
            target.0 * 15.0,
            target.1,
            (32.0, 24.0),
            1.5,
            0.0,
        )));
        let request = RecenterRequest {
            sync_mount: true,
            ..request(target)
        };

        let outcome = rig.recenterer.recenter(&request).await.unwrap();
        assert!(outcome.centered && outcome.verified);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.synced);
        assert_eq!(rig.solver.calls(), 1);
        let (ra, dec) = outcome.solved_center.unwrap();
        assert!((ra - target.0).abs() < 1e-6 && (dec - target.1).abs() < 1e-6);
        assert!(rig.mount.commands().last().unwrap().starts_with("sync_to_coordinates"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolved_frames_do_not_move_the_estimate() {
        let rig = rig().await;
        let target = high_target(&rig.state);
        let request = RecenterRequest {
            max_attempts: 3,
            ..request(target)
        };
        let outcome = rig.recenterer.recenter(&request).await.unwrap();
        assert!(!outcome.centered);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error_px, None);
        let slews: Vec<String> = rig
            .mount
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("slew_to_coordinates"))
            .collect();
        assert_eq!(slews.len(), 3);
        assert!(slews.iter().all(|s| s == &slews[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_reslews_once_without_verifying() {
        let rig = rig().await;
        let target = high_target(&rig.state);
        rig.solver.set_script(SolverScript::Solution(WcsSolution::from_scale_rotation(
            target.0 * 15.0,
            target.1,
            (37.0, 24.0),
            1.5,
            0.0,
        )));
        let request = RecenterRequest {
            check_and_refine: false,
            ..request(target)
        };
        let outcome = rig.recenterer.recenter(&request).await.unwrap();
        assert!(outcome.centered);
        assert!(!outcome.verified);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(rig.solver.calls(), 1);
    }
}
