//! Autofocus and filter focus offsets
//!
//! Without an external autofocus routine the focuser is stepped through a
//! symmetric set of positions around a midpoint, the median star FWHM is
//! measured at each one, and the vertex of a least-squares parabola becomes
//! the new focus.

use crate::control::Controlled;
use crate::error::{ObservatoryError, Result};
use crate::frames::{FrameRecorder, FrameType, SaveOptions};
use crate::slew::{SlewCoordinator, SlewRequest};
use crate::state::{ensure_connected, require, ObservatoryState};
use starwatch_devices::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct AutofocusRequest {
    pub exposure_secs: f64,
    pub midpoint: i32,
    pub steps: usize,
    pub step_size: i32,
    /// Skip the slew to zenith
    pub use_current_pointing: bool,
}

impl Default for AutofocusRequest {
    fn default() -> Self {
        Self {
            exposure_secs: 3.0,
            midpoint: 0,
            steps: 5,
            step_size: 500,
            use_current_pointing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FocusQuality {
    /// Vertex of a well-conditioned parabola
    Fitted,
    /// Chosen by an external autofocus routine
    External,
    /// Fit unusable; the best measured position was used
    LowQuality(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutofocusOutcome {
    pub position: i32,
    pub quality: FocusQuality,
    /// (focuser position, median FWHM) per measured frame
    pub samples: Vec<(i32, f64)>,
}

/// `steps` positions evenly spaced over `midpoint ± step_size·steps/2`,
/// rounded to the nearest 100
pub fn focus_positions(midpoint: i32, step_size: i32, steps: usize) -> Vec<i32> {
    let half = step_size as f64 * steps as f64 / 2.0;
    let start = midpoint as f64 - half;
    let stop = midpoint as f64 + half;
    let round = |x: f64| ((x / 100.0).round_ties_even() * 100.0) as i32;
    match steps {
        0 => Vec::new(),
        1 => vec![round(start)],
        n => {
            let delta = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| round(start + delta * i as f64)).collect()
        }
    }
}

/// Least-squares `y = a·x² + b·x + c`, `None` with fewer than three points or
/// a singular normal matrix
pub fn fit_parabola(points: &[(f64, f64)]) -> Option<(f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    // centre x for conditioning, then shift the coefficients back
    let x0 = points.iter().map(|p| p.0).sum::<f64>() / points.len() as f64;
    let mut s = [0.0f64; 5];
    let mut t = [0.0f64; 3];
    for &(x, y) in points {
        let u = x - x0;
        let mut p = 1.0;
        for (k, sk) in s.iter_mut().enumerate() {
            *sk += p;
            if k < 3 {
                t[k] += p * y;
            }
            p *= u;
        }
    }
    // normal equations in (c, b, a)
    let m = [[s[0], s[1], s[2]], [s[1], s[2], s[3]], [s[2], s[3], s[4]]];
    let det = det3(&m);
    if det.abs() <= f64::EPSILON * s[4].abs().max(1.0) {
        return None;
    }
    let solve = |col: usize| {
        let mut r = m;
        for (row, value) in r.iter_mut().zip(t) {
            row[col] = value;
        }
        det3(&r) / det
    };
    let (c, b, a) = (solve(0), solve(1), solve(2));
    Some((a, b - 2.0 * a * x0, a * x0 * x0 - b * x0 + c))
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Vertex of the fitted curve or the reason the fit is unusable
fn fitted_focus(samples: &[(i32, f64)]) -> std::result::Result<i32, String> {
    if samples.len() < 3 {
        return Err(format!("only {} measured point(s)", samples.len()));
    }
    let points: Vec<(f64, f64)> = samples.iter().map(|&(x, y)| (x as f64, y)).collect();
    let Some((a, b, _)) = fit_parabola(&points) else {
        return Err("singular fit".to_string());
    };
    if a <= 0.0 {
        return Err("non-positive curvature".to_string());
    }
    let vertex = -b / (2.0 * a);
    let lo = samples.iter().map(|s| s.0).min().unwrap_or_default() as f64;
    let hi = samples.iter().map(|s| s.0).max().unwrap_or_default() as f64;
    if !(lo..=hi).contains(&vertex) {
        return Err(format!("vertex {:.0} outside sampled range {:.0}..{:.0}", vertex, lo, hi));
    }
    Ok(vertex.round() as i32)
}

pub struct FocusController {
    state: Arc<ObservatoryState>,
    slewer: Arc<SlewCoordinator>,
    frames: Arc<FrameRecorder>,
    scratch_dir: PathBuf,
}

impl FocusController {
    pub fn new(state: Arc<ObservatoryState>, slewer: Arc<SlewCoordinator>, frames: Arc<FrameRecorder>) -> Self {
        Self {
            state,
            slewer,
            frames,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub async fn run_autofocus(&self, request: &AutofocusRequest) -> Result<AutofocusOutcome> {
        self.state.ensure_operational()?;
        let devices = self.state.devices();
        if let Some(autofocus) = &devices.autofocus {
            tracing::info!("Running autofocus with {}", autofocus.name());
            let position = autofocus.run(request.exposure_secs).await?;
            tracing::info!("Autofocus chose position {}", position);
            return Ok(AutofocusOutcome {
                position,
                quality: FocusQuality::External,
                samples: Vec::new(),
            });
        }

        let focuser = require(&devices.focuser, "focuser")?;
        ensure_connected(focuser, "focuser").await?;
        let Some(estimator) = &devices.fwhm else {
            return Err(ObservatoryError::missing("fwhm estimator"));
        };

        if !request.use_current_pointing {
            tracing::info!("Slewing to zenith for autofocus");
            let slew = SlewRequest::horizontal(90.0, 0.0)
                .with_dome(devices.dome.is_some())
                .with_rotator(devices.rotator.is_some());
            self.slewer.slew(&slew).await?;
        }

        let positions = focus_positions(request.midpoint, request.step_size, request.steps);
        tracing::info!("Autofocus sampling {:?}", positions);
        let absolute = focuser.device().is_absolute().await?;
        // a relative focuser is assumed to start at the midpoint
        let mut at = request.midpoint;
        let scratch = self.scratch_dir.join("autofocus.fts");
        let options = SaveOptions::default().frame_type(FrameType::Light).overwrite();
        let mut samples = Vec::new();

        for &position in &positions {
            self.move_focuser(focuser, absolute, &mut at, position).await?;
            self.frames.expose(request.exposure_secs, true).await?;
            self.frames.save_last_image(&scratch, &options).await?;
            match estimator.median_fwhm(&scratch).await? {
                Some(fwhm) => {
                    tracing::info!("FWHM at {} = {:.2} px", position, fwhm);
                    samples.push((position, fwhm));
                }
                None => tracing::warn!("No sources measured at {}", position),
            }
        }
        if let Err(e) = std::fs::remove_file(&scratch) {
            tracing::debug!("Could not remove {}: {}", scratch.display(), e);
        }

        let (position, quality) = match fitted_focus(&samples) {
            Ok(vertex) => (vertex, FocusQuality::Fitted),
            Err(reason) => {
                let best = samples
                    .iter()
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|s| s.0)
                    .unwrap_or(request.midpoint);
                tracing::warn!("Focus fit unusable ({}), using best measured position {}", reason, best);
                (best, FocusQuality::LowQuality(reason))
            }
        };

        self.move_focuser(focuser, absolute, &mut at, position).await?;
        tracing::info!("Autofocus complete at {}", position);
        Ok(AutofocusOutcome {
            position,
            quality,
            samples,
        })
    }

    async fn move_focuser(
        &self,
        focuser: &Controlled<dyn Focuser>,
        absolute: bool,
        at: &mut i32,
        target: i32,
    ) -> Result<()> {
        let focuser = focuser.lease().await;
        self.state.ensure_operational()?;
        if absolute {
            focuser.move_to(target).await?;
        } else if target != *at {
            focuser.move_to(target - *at).await?;
        }
        *at = target;
        while focuser.is_moving().await? {
            self.state.ensure_operational()?;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        if absolute {
            let reached = focuser.position().await?;
            if (reached - target).abs() as f64 > self.state.focuser_max_error() {
                tracing::warn!("Focuser stopped at {} instead of {}", reached, target);
            }
        }
        Ok(())
    }

    /// Select a filter and shift focus by the change in filter focus offset
    pub async fn set_filter_with_offset(&self, filter: &str) -> Result<()> {
        self.state.ensure_operational()?;
        let devices = self.state.devices();
        let Some(slot) = self.state.filter_index(filter) else {
            return Err(ObservatoryError::InvalidArgument(format!("unknown filter {}", filter)));
        };
        let wheel = require(&devices.filter_wheel, "filter wheel")?;
        ensure_connected(wheel, "filter wheel").await?;
        {
            let wheel = wheel.lease().await;
            tracing::info!("Selecting filter {} (slot {})", filter, slot);
            wheel.set_position(slot).await?;
            while wheel.position().await? != Some(slot) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        let Some(focuser) = &devices.focuser else {
            tracing::warn!("No focuser installed, skipping filter focus offset");
            return Ok(());
        };
        ensure_connected(focuser, "focuser").await?;
        let offset = self.state.focus_offset(filter).unwrap_or(0);
        let delta = offset - self.state.current_focus_offset();
        if delta == 0 {
            return Ok(());
        }

        let focuser = focuser.lease().await;
        let max_increment = focuser.max_increment().await?;
        if delta.abs() >= max_increment {
            return Err(ObservatoryError::InvalidArgument(format!(
                "focus offset change {} exceeds max increment {}",
                delta, max_increment
            )));
        }
        if focuser.is_absolute().await? {
            let target = focuser.position().await? + delta;
            let max_step = focuser.max_step().await?;
            if !(0..=max_step).contains(&target) {
                return Err(ObservatoryError::InvalidArgument(format!(
                    "focuser position {} outside 0..={}",
                    target, max_step
                )));
            }
            tracing::info!("Moving focuser to {} for filter {}", target, filter);
            focuser.move_to(target).await?;
        } else {
            tracing::info!("Moving focuser by {} for filter {}", delta, filter);
            focuser.move_to(delta).await?;
        }
        while focuser.is_moving().await? {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.state.set_current_focus_offset(offset);
        Ok(())
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

    async fn controller(devices: Devices, config: ObservatoryConfig) -> (FocusController, tempfile::TempDir) {
        let state = Arc::new(ObservatoryState::new(devices, config));
        let loops = Arc::new(BackgroundLoops::new(state.clone()));
        let slewer = Arc::new(SlewCoordinator::new(state.clone(), loops.clone()));
        let frames = Arc::new(FrameRecorder::new(state.clone(), loops, Arc::new(FitsSink)));
        let scratch = tempfile::tempdir().unwrap();
        let controller = FocusController::new(state, slewer, frames).with_scratch_dir(scratch.path().to_path_buf());
        (controller, scratch)
    }

    async fn focus_rig(curvature: f64, min_fwhm: f64) -> (Arc<SimFocuser>, FocusController, tempfile::TempDir) {
        let camera = Arc::new(SimCamera::new("cam"));
        let focuser = Arc::new(SimFocuser::new("focuser"));
        camera.set_connected(true).await.unwrap();
        focuser.set_connected(true).await.unwrap();
        let estimator = Arc::new(SimFwhmEstimator::Parabolic {
            focuser: focuser.clone(),
            best_focus: 25_300,
            min_fwhm,
            curvature,
        });
        let devices = Devices::default()
            .with_camera(camera)
            .with_focuser(focuser.clone())
            .with_fwhm(estimator);
        let (controller, scratch) = controller(devices, ObservatoryConfig::default()).await;
        (focuser, controller, scratch)
    }

    fn around(midpoint: i32) -> AutofocusRequest {
        AutofocusRequest {
            midpoint,
            use_current_pointing: true,
            exposure_secs: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_focus_positions_round_to_hundreds() {
        assert_eq!(focus_positions(0, 500, 5), vec![-1200, -600, 0, 600, 1200]);
        assert_eq!(focus_positions(25_000, 500, 5), vec![23_800, 24_400, 25_000, 25_600, 26_200]);
        assert_eq!(focus_positions(1000, 500, 1), vec![800]);
        assert!(focus_positions(1000, 500, 0).is_empty());
    }

    #[test]
    fn test_fit_parabola_recovers_coefficients() {
        let points: Vec<(f64, f64)> = [-2.0, -1.0, 0.0, 1.0, 3.0]
            .iter()
            .map(|&x| (x, 2.0 * x * x - 3.0 * x + 1.0))
            .collect();
        let (a, b, c) = fit_parabola(&points).unwrap();
        assert!((a - 2.0).abs() < 1e-9);
        assert!((b + 3.0).abs() < 1e-9);
        assert!((c - 1.0).abs() < 1e-9);
        assert!(fit_parabola(&points[..2]).is_none());
        assert!(fit_parabola(&[(1.0, 1.0), (1.0, 2.0), (1.0, 3.0)]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_builtin_autofocus_finds_vertex() {
        let (focuser, controller, _scratch) = focus_rig(1e-6, 2.0).await;
        let outcome = controller.run_autofocus(&around(25_000)).await.unwrap();
        assert_eq!(outcome.quality, FocusQuality::Fitted);
        assert_eq!(outcome.samples.len(), 5);
        assert!((outcome.position - 25_300).abs() <= 1);
        assert_eq!(focuser.current_position(), outcome.position);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inverted_curve_uses_best_sample() {
        let (focuser, controller, _scratch) = focus_rig(-1e-6, 5.0).await;
        let outcome = controller.run_autofocus(&around(25_000)).await.unwrap();
        assert_eq!(outcome.quality, FocusQuality::LowQuality("non-positive curvature".to_string()));
        assert_eq!(outcome.position, 23_800);
        assert_eq!(focuser.current_position(), 23_800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shut_down_observatory_does_not_focus() {
        let (focuser, controller, _scratch) = focus_rig(1e-6, 2.0).await;
        controller.state.latch_safed();
        assert!(matches!(
            controller.run_autofocus(&around(25_000)).await,
            Err(ObservatoryError::ShutDown)
        ));
        assert!(focuser.commands().is_empty());
    }

    #[tokio::test]
    async fn test_external_autofocus_delegates() {
        let autofocus = Arc::new(SimAutofocus::new(12_345));
        let (controller, _scratch) =
            controller(Devices::default().with_autofocus(autofocus.clone()), ObservatoryConfig::default()).await;
        let outcome = controller.run_autofocus(&AutofocusRequest::default()).await.unwrap();
        assert_eq!(outcome.position, 12_345);
        assert_eq!(outcome.quality, FocusQuality::External);
        assert_eq!(autofocus.runs(), vec![3.0]);
    }

    #[tokio::test]
    async fn test_missing_focuser() {
        let (controller, _scratch) = controller(Devices::default(), ObservatoryConfig::default()).await;
        assert!(matches!(
            controller.run_autofocus(&AutofocusRequest::default()).await,
            Err(ObservatoryError::MissingDevice(_))
        ));
    }

    async fn offset_rig(focuser: SimFocuser) -> (Arc<SimFocuser>, Arc<SimFilterWheel>, FocusController, tempfile::TempDir) {
        let focuser = Arc::new(focuser);
        let wheel = Arc::new(SimFilterWheel::new("wheel", &["R", "G"]));
        focuser.set_connected(true).await.unwrap();
        wheel.set_connected(true).await.unwrap();
        let mut config = ObservatoryConfig::default();
        config.filter_wheel.filters = vec!["R".to_string(), "G".to_string()];
        config.filter_wheel.focus_offsets = vec![0, 150];
        let devices = Devices::default().with_focuser(focuser.clone()).with_filter_wheel(wheel.clone());
        let (controller, scratch) = controller(devices, config).await;
        (focuser, wheel, controller, scratch)
    }

    #[tokio::test]
    async fn test_filter_offset_applies_difference() {
        let (focuser, wheel, controller, _scratch) = offset_rig(SimFocuser::new("focuser")).await;
        controller.set_filter_with_offset("G").await.unwrap();
        assert_eq!(wheel.current_position(), Some(1));
        assert_eq!(focuser.current_position(), 25_150);
        controller.set_filter_with_offset("R").await.unwrap();
        assert_eq!(focuser.current_position(), 25_000);
        assert!(controller.set_filter_with_offset("Ha").await.is_err());
    }

    #[tokio::test]
    async fn test_filter_offset_respects_max_increment() {
        let (focuser, _wheel, controller, _scratch) =
            offset_rig(SimFocuser::new("focuser").relative().with_limits(100, 50_000)).await;
        assert!(matches!(
            controller.set_filter_with_offset("G").await,
            Err(ObservatoryError::InvalidArgument(_))
        ));
        assert_eq!(focuser.current_position(), 25_000);
    }
}
