//! The assembled observatory
//!
//! [`Observatory`] wires every controller to one shared
//! [`ObservatoryState`] and exposes the operator-level operations.

use crate::calibration::{CalibrationJob, CalibrationReport, CalibrationSequencer, DarksJob, FlatsJob};
use crate::config::ObservatoryConfig;
use crate::connection::ConnectionManager;
use crate::control::SequenceReport;
use crate::error::{ObservatoryError, Result};
use crate::focus::{AutofocusOutcome, AutofocusRequest, FocusController};
use crate::frames::{FitsSink, FrameRecorder, ImageSink, SaveOptions, SavedFrame};
use crate::loops::{BackgroundLoops, FailureCallback, LoopStatus};
use crate::recenter::{RecenterOutcome, RecenterRequest, Recenterer};
use crate::registry::DriverRegistry;
use crate::slew::{SlewCoordinator, SlewReport, SlewRequest};
use crate::state::{Devices, ObservatoryState};
use starwatch_devices::{Camera, WcsSolution};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct Observatory {
    state: Arc<ObservatoryState>,
    loops: Arc<BackgroundLoops>,
    connection: Arc<ConnectionManager>,
    slewer: Arc<SlewCoordinator>,
    frames: Arc<FrameRecorder>,
    recenterer: Recenterer,
    calibration: CalibrationSequencer,
    focus: FocusController,
}

impl Observatory {
    pub fn new(devices: Devices, config: ObservatoryConfig) -> Self {
        Self::with_sink(devices, config, Arc::new(FitsSink))
    }

    pub fn with_sink(devices: Devices, config: ObservatoryConfig, sink: Arc<dyn ImageSink>) -> Self {
        let state = Arc::new(ObservatoryState::new(devices, config));
        let loops = Arc::new(BackgroundLoops::new(state.clone()));
        let connection = Arc::new(ConnectionManager::new(state.clone(), loops.clone()));
        let slewer = Arc::new(SlewCoordinator::new(state.clone(), loops.clone()));
        let frames = Arc::new(FrameRecorder::new(state.clone(), loops.clone(), sink));
        Self {
            recenterer: Recenterer::new(state.clone(), slewer.clone(), frames.clone()),
            calibration: CalibrationSequencer::new(state.clone(), frames.clone()),
            focus: FocusController::new(state.clone(), slewer.clone(), frames.clone()),
            state,
            loops,
            connection,
            slewer,
            frames,
        }
    }

    /// Resolve every configured driver through `registry`
    pub fn from_config(config: ObservatoryConfig, registry: &DriverRegistry) -> Result<Self> {
        config.validate()?;
        let mut devices = Devices::default();
        if let Some(camera) = registry.camera.build(&config.camera.device)? {
            devices = devices.with_camera(camera);
        }
        if let Some(panel) = registry.cover_calibrator.build(&config.cover_calibrator.device)? {
            devices = devices.with_cover_calibrator(panel);
        }
        if let Some(dome) = registry.dome.build(&config.dome)? {
            devices = devices.with_dome(dome);
        }
        if let Some(wheel) = registry.filter_wheel.build(&config.filter_wheel.device)? {
            devices = devices.with_filter_wheel(wheel);
        }
        if let Some(focuser) = registry.focuser.build(&config.focuser.device)? {
            devices = devices.with_focuser(focuser);
        }
        if let Some(station) = registry.observing_conditions.build(&config.observing_conditions)? {
            devices = devices.with_observing_conditions(station);
        }
        if let Some(rotator) = registry.rotator.build(&config.rotator.device)? {
            devices = devices.with_rotator(rotator);
        }
        for monitor in registry.safety_monitor.build_all(&config.safety_monitor)? {
            devices = devices.with_safety_monitor(monitor);
        }
        for switch in registry.switch.build_all(&config.switch)? {
            devices = devices.with_switch(switch);
        }
        if let Some(mount) = registry.telescope.build(&config.telescope.device)? {
            devices = devices.with_telescope(mount);
        }
        if let Some(autofocus) = registry.autofocus.build(&config.autofocus)? {
            devices = devices.with_autofocus(autofocus);
        }
        if let Some(estimator) = registry.fwhm.build(&config.fwhm)? {
            devices = devices.with_fwhm(estimator);
        }
        for solver in registry.wcs.build_all(&config.wcs)? {
            devices = devices.with_solver(solver);
        }
        tracing::info!("Observatory {} assembled", config.site.name);
        Ok(Self::new(devices, config))
    }

    pub fn from_config_file(path: &Path, registry: &DriverRegistry) -> Result<Self> {
        tracing::debug!("Loading configuration from {}", path.display());
        Self::from_config(ObservatoryConfig::load(path)?, registry)
    }

    pub fn state(&self) -> &Arc<ObservatoryState> {
        &self.state
    }

    pub fn save_config(&self, path: &Path) -> Result<()> {
        Ok(self.state.save_config(path)?)
    }

    /// Set the largest allowed image side; the sensor must fit inside it
    pub async fn set_max_dimension(&self, max_dimension: Option<u32>) -> Result<()> {
        if let (Some(limit), Some(camera)) = (max_dimension, &self.state.devices().camera) {
            let (width, height) = camera.device().sensor_size().await?;
            if width.max(height) > limit {
                return Err(ObservatoryError::InvalidArgument(format!(
                    "max dimension {} is smaller than the {}x{} sensor",
                    limit, width, height
                )));
            }
        }
        self.state.set_max_dimension(max_dimension);
        Ok(())
    }

    // connection

    pub async fn connect_all(&self) -> SequenceReport {
        self.connection.connect_all().await
    }

    pub async fn disconnect_all(&self) -> SequenceReport {
        self.connection.disconnect_all().await
    }

    /// Safe every subsystem; operations then fail until [`Observatory::reset_safety`]
    pub async fn shutdown(&self) -> SequenceReport {
        self.connection.shutdown().await
    }

    /// Release the latch left by [`Observatory::shutdown`]; returns whether it was set
    pub fn reset_safety(&self) -> bool {
        let was_safed = self.state.clear_safed();
        if was_safed {
            tracing::warn!("Safety latch reset by operator");
        }
        was_safed
    }

    // pointing

    pub async fn slew(&self, request: &SlewRequest) -> Result<SlewReport> {
        self.slewer.slew(request).await
    }

    pub async fn slew_to_coordinates(&self, ra_hours: f64, dec_deg: f64) -> Result<SlewReport> {
        let devices = self.state.devices();
        let request = SlewRequest::equatorial(ra_hours, dec_deg)
            .with_dome(devices.dome.is_some())
            .with_rotator(devices.rotator.is_some());
        self.slewer.slew(&request).await
    }

    pub async fn recenter(&self, request: &RecenterRequest) -> Result<RecenterOutcome> {
        self.recenterer.recenter(request).await
    }

    // background loops

    pub async fn loop_status(&self) -> LoopStatus {
        self.loops.status().await
    }

    pub async fn start_observing_conditions(&self, interval: Duration) -> Result<bool> {
        self.loops.start_observing_conditions(interval).await
    }

    pub async fn stop_observing_conditions(&self) -> bool {
        self.loops.stop_observing_conditions().await
    }

    /// Poll the safety monitors and shut the observatory down when one trips
    pub async fn start_safety_monitor(&self, interval: Duration) -> Result<bool> {
        let connection = self.connection.clone();
        let on_fail: FailureCallback = Arc::new(move || {
            let connection = connection.clone();
            Box::pin(async move {
                connection.shutdown().await;
            })
        });
        self.loops.start_safety_monitor(on_fail, interval).await
    }

    pub async fn start_safety_monitor_with(&self, on_fail: FailureCallback, interval: Duration) -> Result<bool> {
        self.loops.start_safety_monitor(on_fail, interval).await
    }

    pub async fn stop_safety_monitor(&self) -> bool {
        self.loops.stop_safety_monitor().await
    }

    pub async fn start_derotation(&self, interval: Duration) -> Result<bool> {
        self.loops.start_derotation(interval).await
    }

    pub async fn stop_derotation(&self) -> bool {
        self.loops.stop_derotation().await
    }

    // imaging

    pub async fn expose(&self, duration_secs: f64, light: bool) -> Result<()> {
        self.frames.expose(duration_secs, light).await
    }

    pub async fn save_last_image(&self, path: &Path, options: &SaveOptions) -> Result<SavedFrame> {
        self.frames.save_last_image(path, options).await
    }

    pub async fn solve(&self, path: &Path) -> Option<WcsSolution> {
        self.frames.solve_frame(path).await
    }

    pub async fn run_calibration(&self, job: &CalibrationJob) -> Result<CalibrationReport> {
        self.calibration.run(job).await
    }

    pub async fn take_flats(&self, job: &FlatsJob) -> Result<CalibrationReport> {
        self.calibration.take_flats(job).await
    }

    pub async fn take_darks(&self, job: &DarksJob) -> Result<CalibrationReport> {
        self.calibration.take_darks(job).await
    }

    pub async fn run_autofocus(&self, request: &AutofocusRequest) -> Result<AutofocusOutcome> {
        self.focus.run_autofocus(request).await
    }

    pub async fn set_filter_with_offset(&self, filter: &str) -> Result<()> {
        self.focus.set_filter_with_offset(filter).await
    }

    /// Stop every background loop; call before dropping the observatory
    pub async fn close(&self) {
        self.loops.stop_all().await;
        tracing::info!("Observatory closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverSpec;
    use crate::error::ConfigError;
    use crate::recenter::RecenterRequest;
    use crate::registry::SIMULATOR;
    use starwatch_devices::sim::{SimCamera, SimMount, SimSafetyMonitor, SimSolver, SolverScript};

    fn simulated_config() -> ObservatoryConfig {
        let mut config = ObservatoryConfig::default();
        config.camera.device = DriverSpec::driver(SIMULATOR);
        config.telescope.device = DriverSpec::driver(SIMULATOR);
        config.dome = DriverSpec::driver(SIMULATOR);
        config.safety_monitor = vec![DriverSpec::driver(SIMULATOR).with_kwarg("name", "roof")];
        config
    }

    #[tokio::test]
    async fn test_from_config_builds_installed_roles() {
        let observatory = Observatory::from_config(simulated_config(), &DriverRegistry::with_simulators()).unwrap();
        let devices = observatory.state().devices();
        assert!(devices.camera.is_some());
        assert!(devices.telescope.is_some());
        assert!(devices.dome.is_some());
        assert!(devices.focuser.is_none());
        assert_eq!(devices.safety_monitors.len(), 1);

        let report = observatory.connect_all().await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_unknown_driver_is_fatal() {
        let mut config = simulated_config();
        config.focuser.device = DriverSpec::driver("nonexistent");
        assert!(matches!(
            Observatory::from_config(config, &DriverRegistry::with_simulators()),
            Err(ObservatoryError::Config(ConfigError::UnknownDriver { .. }))
        ));
    }

    #[tokio::test]
    async fn test_max_dimension_must_fit_sensor() {
        let observatory = Observatory::from_config(simulated_config(), &DriverRegistry::with_simulators()).unwrap();
        assert!(observatory.set_max_dimension(Some(16)).await.is_err());
        observatory.set_max_dimension(Some(4096)).await.unwrap();
        assert_eq!(observatory.state().max_dimension(), Some(4096));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_reading_shuts_down() {
        let monitor = Arc::new(SimSafetyMonitor::always_safe("roof"));
        let mount = Arc::new(SimMount::new("mount"));
        let devices = Devices::default()
            .with_safety_monitor(monitor.clone())
            .with_telescope(mount.clone());
        let observatory = Observatory::new(devices, ObservatoryConfig::default());
        observatory.connect_all().await;

        assert!(observatory.start_safety_monitor(Duration::from_secs(1)).await.unwrap());
        monitor.set_safe(false);
        for _ in 0..50 {
            if !observatory.loop_status().await.safety_monitor {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(!observatory.loop_status().await.safety_monitor);
        assert!(mount.pose().parked);
        observatory.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_running_recenter() {
        let camera = Arc::new(SimCamera::new("cam"));
        let mount = Arc::new(SimMount::new("mount"));
        let solver = Arc::new(SimSolver::new("sim", SolverScript::NoMatch));
        let devices = Devices::default()
            .with_camera(camera)
            .with_telescope(mount.clone())
            .with_solver(solver);
        let observatory = Arc::new(Observatory::new(devices, ObservatoryConfig::default()));
        observatory.connect_all().await;
        let state = observatory.state();
        let target = state
            .sky()
            .to_equatorial(&state.site(), 70.0, 180.0, chrono::Utc::now());
        let request = RecenterRequest {
            max_attempts: 3,
            exposure_secs: 1.0,
            ..RecenterRequest::new(target.0, target.1)
        };

        let running = {
            let observatory = observatory.clone();
            tokio::spawn(async move { observatory.recenter(&request).await })
        };
        // the first slew is settling and holds the mount lease
        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = observatory.shutdown().await;
        assert!(report.is_clean(), "{:?}", report.failures());
        assert!(mount.pose().parked);

        let result = running.await.unwrap();
        assert!(matches!(result, Err(ObservatoryError::ShutDown)), "{:?}", result);
        let pose = mount.pose();
        assert!(pose.parked);
        assert!(!pose.tracking);
        let commands = mount.commands();
        let park = commands.iter().rposition(|c| c == "park").unwrap();
        assert_eq!(park, commands.len() - 1, "{:?}", commands);

        assert!(matches!(
            observatory.slew_to_coordinates(target.0, target.1).await,
            Err(ObservatoryError::ShutDown)
        ));
        assert!(mount.pose().parked);
        assert!(observatory.reset_safety());
        observatory.slew_to_coordinates(target.0, target.1).await.unwrap();
        assert!(!mount.pose().parked);
        observatory.close().await;
    }
}
