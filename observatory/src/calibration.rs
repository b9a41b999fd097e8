//! Flat and dark calibration sequences

use crate::control::{best_effort, Controlled, SequenceReport};
use crate::error::{ObservatoryError, Result};
use crate::frames::{FrameRecorder, FrameType, SaveOptions};
use crate::state::{ensure_connected, require, ObservatoryState};
use chrono::Utc;
use starwatch_devices::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_THERMAL_POLL: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the mount is left after flats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalPosition {
    #[default]
    NoChange,
    Home,
    Park,
}

/// Sub-folder of the save path that receives the frames
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputFolder {
    #[default]
    SavePath,
    /// `Flats_%Y-%m-%d_%H-%M-%S` or `Darks_%Y-%m-%d_%H-%M-%S`
    Timestamped,
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatsJob {
    /// Exposure per configured filter; zero skips the filter
    pub filter_exposure: Vec<f64>,
    /// Calibrator brightness per filter, maximum brightness when absent
    pub filter_brightness: Option<Vec<i32>>,
    pub readouts: Vec<usize>,
    pub binnings: Vec<(u32, u32)>,
    pub repeat: u32,
    pub save_path: PathBuf,
    pub folder: OutputFolder,
    pub home_telescope: bool,
    pub final_position: FinalPosition,
}

impl FlatsJob {
    pub fn new(filter_exposure: Vec<f64>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            filter_exposure,
            filter_brightness: None,
            readouts: vec![0],
            binnings: vec![(1, 1)],
            repeat: 10,
            save_path: save_path.into(),
            folder: OutputFolder::SavePath,
            home_telescope: false,
            final_position: FinalPosition::NoChange,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DarksJob {
    pub exposures: Vec<f64>,
    pub readouts: Vec<usize>,
    pub binnings: Vec<(u32, u32)>,
    pub repeat: u32,
    pub save_path: PathBuf,
    pub folder: OutputFolder,
}

impl DarksJob {
    pub fn new(exposures: Vec<f64>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            exposures,
            readouts: vec![0],
            binnings: vec![(1, 1)],
            repeat: 10,
            save_path: save_path.into(),
            folder: OutputFolder::SavePath,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationJob {
    Flats(FlatsJob),
    Darks(DarksJob),
}

/// One planned calibration frame
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationStep {
    pub frame_type: FrameType,
    /// Filter wheel slot and name, flats only
    pub filter: Option<(usize, String)>,
    pub exposure: f64,
    pub readout: usize,
    pub binning: (u32, u32),
    pub index: u32,
}

impl CalibrationStep {
    /// File name for this frame given the readout mode's display name
    pub fn file_name(&self, readout_name: &str) -> String {
        let readout: String = readout_name.chars().filter(|c| !c.is_whitespace()).collect();
        let (bx, by) = self.binning;
        match &self.filter {
            Some((_, filter)) => format!(
                "flat_{}_{}x{}_{:.4}s_{}_{}.fts",
                filter, bx, by, self.exposure, readout, self.index
            ),
            None => format!("dark_{}_{}x{}_{:.4}s_{}.fts", readout, bx, by, self.exposure, self.index),
        }
    }
}

/// Every frame of a flats job, in filter × readout × binning × repeat order
pub fn plan_flats(job: &FlatsJob, filters: &[String]) -> Vec<CalibrationStep> {
    let mut steps = Vec::new();
    for (slot, (filter, &exposure)) in filters.iter().zip(&job.filter_exposure).enumerate() {
        if exposure == 0.0 {
            continue;
        }
        for &readout in &job.readouts {
            for &binning in &job.binnings {
                for index in 0..job.repeat {
                    steps.push(CalibrationStep {
                        frame_type: FrameType::Flat,
                        filter: Some((slot, filter.clone())),
                        exposure,
                        readout,
                        binning,
                        index,
                    });
                }
            }
        }
    }
    steps
}

/// Every frame of a darks job, in exposure × readout × binning × repeat order
pub fn plan_darks(job: &DarksJob) -> Vec<CalibrationStep> {
    let mut steps = Vec::new();
    for &exposure in &job.exposures {
        for &readout in &job.readouts {
            for &binning in &job.binnings {
                for index in 0..job.repeat {
                    steps.push(CalibrationStep {
                        frame_type: FrameType::Dark,
                        filter: None,
                        exposure,
                        readout,
                        binning,
                        index,
                    });
                }
            }
        }
    }
    steps
}

fn output_dir(save_path: &Path, folder: &OutputFolder, prefix: &str) -> Result<PathBuf> {
    let dir = match folder {
        OutputFolder::SavePath => save_path.to_path_buf(),
        OutputFolder::Timestamped => {
            save_path.join(format!("{}_{}", prefix, Utc::now().format("%Y-%m-%d_%H-%M-%S")))
        }
        OutputFolder::Named(name) => save_path.join(name),
    };
    std::fs::create_dir_all(&dir)?;
    tracing::debug!("Writing calibration frames to {}", dir.display());
    Ok(dir)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationReport {
    pub folder: PathBuf,
    pub frames: Vec<PathBuf>,
}

pub struct CalibrationSequencer {
    state: Arc<ObservatoryState>,
    frames: Arc<FrameRecorder>,
    thermal_poll: Duration,
}

impl CalibrationSequencer {
    pub fn new(state: Arc<ObservatoryState>, frames: Arc<FrameRecorder>) -> Self {
        Self {
            state,
            frames,
            thermal_poll: DEFAULT_THERMAL_POLL,
        }
    }

    pub fn with_thermal_poll(mut self, interval: Duration) -> Self {
        self.thermal_poll = interval;
        self
    }

    pub async fn run(&self, job: &CalibrationJob) -> Result<CalibrationReport> {
        match job {
            CalibrationJob::Flats(job) => self.take_flats(job).await,
            CalibrationJob::Darks(job) => self.take_darks(job).await,
        }
    }

    pub async fn take_flats(&self, job: &FlatsJob) -> Result<CalibrationReport> {
        tracing::info!("Taking flat frames");
        self.state.ensure_operational()?;
        let devices = self.state.devices();
        let wheel = require(&devices.filter_wheel, "filter wheel")?;
        let panel = require(&devices.cover_calibrator, "cover calibrator")?;
        let camera = require(&devices.camera, "camera")?;
        ensure_connected(camera, "camera").await?;

        let filters = self.state.filters();
        if job.filter_exposure.len() != filters.len() {
            return Err(ObservatoryError::InvalidArgument(format!(
                "{} flat exposures for {} filters",
                job.filter_exposure.len(),
                filters.len()
            )));
        }
        if let Some(brightness) = &job.filter_brightness {
            if brightness.len() != filters.len() {
                return Err(ObservatoryError::InvalidArgument(format!(
                    "{} calibrator brightnesses for {} filters",
                    brightness.len(),
                    filters.len()
                )));
            }
        }

        let folder = output_dir(&job.save_path, &job.folder, "Flats")?;
        self.point_at_panel(job.home_telescope).await?;

        let has_cover = panel.device().cover_state().await? != CoverState::NotPresent;
        let has_calibrator = panel.device().calibrator_state().await? != CalibratorState::NotPresent;
        let max_brightness = if has_calibrator {
            panel.device().max_brightness().await?
        } else {
            0
        };

        let mut report = CalibrationReport {
            folder: folder.clone(),
            frames: Vec::new(),
        };
        let steps = plan_flats(job, &filters);
        let total = steps.len();
        let taken = async {
            if has_cover {
                tracing::info!("Opening cover");
                panel.lease().await.open_cover().await?;
            }
            self.command_cooler(camera).await?;
            for (n, step) in steps.iter().enumerate() {
                self.state.ensure_operational()?;
                let readout_name = self.configure_camera(camera, step).await?;
                self.wait_for_cooler(camera).await?;
                if let Some((slot, name)) = &step.filter {
                    self.select_filter(wheel, *slot).await?;
                    if has_calibrator {
                        let brightness = job
                            .filter_brightness
                            .as_ref()
                            .and_then(|b| b.get(*slot).copied())
                            .unwrap_or(max_brightness);
                        tracing::debug!("Calibrator brightness {} for {}", brightness, name);
                        self.state.ensure_operational()?;
                        panel.lease().await.calibrator_on(brightness).await?;
                    }
                }
                let path = folder.join(step.file_name(&readout_name));
                self.frames.expose(step.exposure, true).await?;
                self.frames
                    .save_last_image(&path, &SaveOptions::default().frame_type(FrameType::Flat))
                    .await?;
                tracing::info!("Flat {} of {} complete", n + 1, total);
                report.frames.push(path);
            }
            Ok::<(), ObservatoryError>(())
        }
        .await;

        self.close_panel(panel, has_calibrator, has_cover).await;
        if let Err(e) = taken {
            tracing::error!("Flats stopped after {} of {} frame(s): {}", report.frames.len(), total, e);
            return Err(e);
        }
        self.state.ensure_operational()?;
        self.final_position(job.final_position).await?;
        tracing::info!("Flats complete");
        Ok(report)
    }

    pub async fn take_darks(&self, job: &DarksJob) -> Result<CalibrationReport> {
        tracing::info!("Taking dark frames");
        self.state.ensure_operational()?;
        let camera = require(&self.state.devices().camera, "camera")?;
        ensure_connected(camera, "camera").await?;
        let folder = output_dir(&job.save_path, &job.folder, "Darks")?;
        self.command_cooler(camera).await?;

        let mut report = CalibrationReport {
            folder: folder.clone(),
            frames: Vec::new(),
        };
        let steps = plan_darks(job);
        let total = steps.len();
        for (n, step) in steps.iter().enumerate() {
            self.state.ensure_operational()?;
            let readout_name = self.configure_camera(camera, step).await?;
            self.wait_for_cooler(camera).await?;
            let path = folder.join(step.file_name(&readout_name));
            tracing::info!("Starting {:.4}s dark exposure", step.exposure);
            self.frames.expose(step.exposure, false).await?;
            self.frames
                .save_last_image(&path, &SaveOptions::default().frame_type(FrameType::Dark))
                .await?;
            tracing::info!("Dark {} of {} complete", n + 1, total);
            report.frames.push(path);
        }
        tracing::info!("Darks complete");
        Ok(report)
    }

    /// Apply readout mode and binning, returning the readout mode's name
    async fn configure_camera(&self, camera: &Controlled<dyn Camera>, step: &CalibrationStep) -> Result<String> {
        let camera = camera.lease().await;
        let modes = camera.readout_modes().await?;
        let Some(name) = modes.get(step.readout).cloned() else {
            return Err(ObservatoryError::InvalidArgument(format!(
                "readout mode {} (camera has {})",
                step.readout,
                modes.len()
            )));
        };
        if camera.readout_mode().await? != step.readout {
            camera.set_readout_mode(step.readout).await?;
        }
        if camera.binning().await? != step.binning {
            camera.set_binning(step.binning.0, step.binning.1).await?;
        }
        Ok(name)
    }

    async fn command_cooler(&self, camera: &Controlled<dyn Camera>) -> Result<()> {
        let Some(setpoint) = self.state.cooler_setpoint() else {
            return Ok(());
        };
        let camera = camera.lease().await;
        if camera.capabilities().can_set_ccd_temperature {
            camera.set_ccd_temperature(setpoint).await?;
        }
        Ok(())
    }

    /// Block until the sensor is within tolerance of the cooler setpoint
    async fn wait_for_cooler(&self, camera: &Controlled<dyn Camera>) -> Result<()> {
        let Some(setpoint) = self.state.cooler_setpoint() else {
            return Ok(());
        };
        let camera = camera.device();
        if !camera.capabilities().can_set_ccd_temperature {
            return Ok(());
        }
        let limit = setpoint + self.state.cooler_tolerance();
        loop {
            self.state.ensure_operational()?;
            let temperature = camera.ccd_temperature().await?;
            if temperature <= limit {
                return Ok(());
            }
            tracing::warn!(
                "Sensor at {:.2} C, waiting {:?} for setpoint {:.2} C",
                temperature,
                self.thermal_poll,
                setpoint
            );
            tokio::time::sleep(self.thermal_poll).await;
        }
    }

    /// Calibrator off and cover closed, however the run ended
    async fn close_panel(&self, panel: &Controlled<dyn CoverCalibrator>, has_calibrator: bool, has_cover: bool) {
        let panel = panel.lease().await;
        let mut teardown = SequenceReport::default();
        if has_calibrator {
            tracing::info!("Turning calibrator off");
            best_effort(&mut teardown, "calibrator off", panel.calibrator_off()).await;
        }
        if has_cover {
            tracing::info!("Closing cover");
            best_effort(&mut teardown, "close cover", panel.close_cover()).await;
        }
        if !teardown.is_clean() {
            tracing::error!("Flat panel left in an unknown state: {:?}", teardown.failures());
        }
    }

    async fn select_filter(&self, wheel: &Controlled<dyn FilterWheel>, slot: usize) -> Result<()> {
        let wheel = wheel.lease().await;
        if wheel.position().await? == Some(slot) {
            return Ok(());
        }
        wheel.set_position(slot).await?;
        while wheel.position().await? != Some(slot) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Point the telescope at the flat panel with tracking off
    async fn point_at_panel(&self, home_first: bool) -> Result<()> {
        let Some(mount) = &self.state.devices().telescope else {
            tracing::warn!("No telescope installed, assuming it already faces the panel");
            return Ok(());
        };
        ensure_connected(mount, "telescope").await?;
        let mount = mount.lease().await;
        let caps = mount.capabilities();
        if home_first && caps.can_find_home {
            tracing::info!("Homing telescope");
            mount.find_home().await?;
        }

        let (alt, az) = self.state.cover_calibrator_position();
        tracing::info!("Pointing at cover calibrator (alt {:.2} az {:.2})", alt, az);
        if caps.can_slew_alt_az {
            mount.slew_to_alt_az(alt, az).await?;
        } else if caps.can_slew {
            let (ra, dec) = self.state.sky().to_equatorial(&self.state.site(), alt, az, Utc::now());
            mount.slew_to_coordinates(ra, dec).await?;
        } else {
            return Err(ObservatoryError::CannotSlew);
        }
        while mount.is_slewing().await? {
            self.state.ensure_operational()?;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        if caps.can_set_tracking {
            mount.set_tracking(false).await?;
        }
        Ok(())
    }

    async fn final_position(&self, position: FinalPosition) -> Result<()> {
        let Some(mount) = &self.state.devices().telescope else {
            return Ok(());
        };
        let mount = mount.lease().await;
        let caps = mount.capabilities();
        match position {
            FinalPosition::NoChange => {}
            FinalPosition::Home if caps.can_find_home => {
                tracing::info!("Homing telescope");
                mount.find_home().await?;
            }
            FinalPosition::Park if caps.can_park => {
                tracing::info!("Parking telescope");
                mount.park().await?;
            }
            other => tracing::warn!("Telescope cannot reach final position {:?}", other),
        }
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
    use starwatch_imaging::read_header;

    struct Rig {
        camera: Arc<SimCamera>,
        mount: Arc<SimMount>,
        panel: Arc<SimCoverCalibrator>,
        wheel: Arc<SimFilterWheel>,
        sequencer: CalibrationSequencer,
    }

    async fn rig(camera: SimCamera, config: ObservatoryConfig) -> Rig {
        let camera = Arc::new(camera.with_readout_modes(&["High Gain", "Low Gain"]));
        let mount = Arc::new(SimMount::new("mount"));
        let panel = Arc::new(SimCoverCalibrator::new("panel"));
        let wheel = Arc::new(SimFilterWheel::new("wheel", &["R", "G"]));
        camera.set_connected(true).await.unwrap();
        mount.set_connected(true).await.unwrap();
        panel.set_connected(true).await.unwrap();
        wheel.set_connected(true).await.unwrap();
        let devices = Devices::default()
            .with_camera(camera.clone())
            .with_telescope(mount.clone())
            .with_cover_calibrator(panel.clone())
            .with_filter_wheel(wheel.clone());
        let state = Arc::new(ObservatoryState::new(devices, config));
        let loops = Arc::new(BackgroundLoops::new(state.clone()));
        let frames = Arc::new(FrameRecorder::new(state.clone(), loops, Arc::new(FitsSink)));
        Rig {
            camera,
            mount,
            panel,
            wheel,
            sequencer: CalibrationSequencer::new(state, frames),
        }
    }

    fn two_filters() -> ObservatoryConfig {
        let mut config = ObservatoryConfig::default();
        config.filter_wheel.filters = vec!["R".to_string(), "G".to_string()];
        config
    }

    #[test]
    fn test_file_names() {
        let flat = CalibrationStep {
            frame_type: FrameType::Flat,
            filter: Some((0, "R".to_string())),
            exposure: 1.5,
            readout: 0,
            binning: (2, 2),
            index: 3,
        };
        assert_eq!(flat.file_name("High Gain"), "flat_R_2x2_1.5000s_HighGain_3.fts");
        let dark = CalibrationStep {
            filter: None,
            frame_type: FrameType::Dark,
            ..flat
        };
        assert_eq!(dark.file_name("High Gain"), "dark_HighGain_2x2_1.5000s_3.fts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flats_skip_zero_exposure_filter() {
        let rig = rig(SimCamera::new("cam"), two_filters()).await;
        let dir = tempfile::tempdir().unwrap();
        let mut job = FlatsJob::new(vec![0.0, 2.0], dir.path());
        job.binnings = vec![(1, 1), (2, 2)];
        job.readouts = vec![0, 1];
        job.repeat = 2;
        job.final_position = FinalPosition::Park;

        let report = rig.sequencer.take_flats(&job).await.unwrap();

        assert_eq!(report.frames.len(), 8);
        assert!(report
            .frames
            .iter()
            .all(|p| p.file_name().unwrap().to_string_lossy().starts_with("flat_G_")));
        assert_eq!(rig.camera.exposures().len(), 8);
        assert_eq!(rig.wheel.current_position(), Some(1));
        let header = read_header(&report.frames[0]).unwrap();
        assert_eq!(header.get_str("FRAMETYP"), Some("Flat"));

        let panel = rig.panel.commands();
        assert_eq!(panel.first().map(String::as_str), Some("open_cover"));
        assert!(panel.contains(&"calibrator_on 255".to_string()));
        assert_eq!(&panel[panel.len() - 2..], &["calibrator_off".to_string(), "close_cover".to_string()]);

        let pose = rig.mount.pose();
        assert!(!pose.tracking);
        assert!(pose.parked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flat_still_darkens_and_closes_panel() {
        let rig = rig(SimCamera::new("cam").failing_exposures_after(3), two_filters()).await;
        let dir = tempfile::tempdir().unwrap();
        let mut job = FlatsJob::new(vec![1.0, 2.0], dir.path());
        job.repeat = 2;
        job.final_position = FinalPosition::Park;

        let err = rig.sequencer.take_flats(&job).await.unwrap_err();
        assert!(matches!(err, ObservatoryError::Device(DeviceError::Communication { .. })));
        assert_eq!(rig.camera.exposures().len(), 3);

        let panel = rig.panel.commands();
        assert!(panel.contains(&"calibrator_on 255".to_string()));
        assert_eq!(&panel[panel.len() - 2..], &["calibrator_off".to_string(), "close_cover".to_string()]);
        // a failed run does not go on to the final position
        assert!(!rig.mount.pose().parked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shut_down_observatory_takes_no_calibration_frames() {
        let rig = rig(SimCamera::new("cam"), two_filters()).await;
        let dir = tempfile::tempdir().unwrap();
        rig.sequencer.state.latch_safed();
        assert!(matches!(
            rig.sequencer.take_flats(&FlatsJob::new(vec![1.0, 1.0], dir.path())).await,
            Err(ObservatoryError::ShutDown)
        ));
        assert!(matches!(
            rig.sequencer.take_darks(&DarksJob::new(vec![1.0], dir.path())).await,
            Err(ObservatoryError::ShutDown)
        ));
        assert!(rig.camera.exposures().is_empty());
        assert!(rig.mount.commands().is_empty());
        assert!(rig.panel.commands().is_empty());
    }

    #[tokio::test]
    async fn test_flats_reject_mismatched_exposures() {
        let rig = rig(SimCamera::new("cam"), two_filters()).await;
        let dir = tempfile::tempdir().unwrap();
        let job = FlatsJob::new(vec![1.0], dir.path());
        assert!(matches!(
            rig.sequencer.take_flats(&job).await,
            Err(ObservatoryError::InvalidArgument(_))
        ));
        assert!(rig.camera.exposures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_darks_wait_for_cooler() {
        let mut config = ObservatoryConfig::default();
        config.camera.cooler_setpoint = Some(-10.0);
        config.camera.cooler_tolerance = 1.0;
        let rig = rig(SimCamera::new("cam").with_thermal(20.0, 5.0), config).await;
        let dir = tempfile::tempdir().unwrap();
        let mut job = DarksJob::new(vec![0.5, 1.0], dir.path());
        job.repeat = 1;
        job.folder = OutputFolder::Timestamped;

        let started = tokio::time::Instant::now();
        let report = rig.sequencer.take_darks(&job).await.unwrap();

        // five 10 s waits while the sensor cools from 20 C in 5 C steps
        assert!(started.elapsed() >= Duration::from_secs(50));
        assert_eq!(rig.camera.setpoint(), -10.0);
        assert!(report
            .folder
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("Darks_"));
        let names: Vec<String> = report
            .frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["dark_HighGain_1x1_0.5000s_0.fts", "dark_HighGain_1x1_1.0000s_0.fts"]
        );
        assert!(rig.camera.exposures().iter().all(|e| !e.light));
    }
}
