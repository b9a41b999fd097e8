//! Exposures, saved frames and plate solving

use crate::error::{ObservatoryError, Result};
use crate::header;
use crate::loops::BackgroundLoops;
use crate::state::{ensure_connected, require, ObservatoryState};
use chrono::{DateTime, Utc};
use starwatch_devices::*;
use starwatch_imaging::{write_fits, FitsHeader};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extra time allowed past the exposure length for readout and download
const READOUT_ALLOWANCE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Light,
    Dark,
    Flat,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Light => "Light",
            FrameType::Dark => "Dark",
            FrameType::Flat => "Flat",
        }
    }
}

/// Destination for read-out frames
pub trait ImageSink: Send + Sync + Debug {
    fn write(&self, path: &Path, image: &ImageArray, header: &FitsHeader) -> Result<()>;
}

/// Writes 16-bit FITS files
#[derive(Debug, Default, Clone, Copy)]
pub struct FitsSink;

impl ImageSink for FitsSink {
    fn write(&self, path: &Path, image: &ImageArray, header: &FitsHeader) -> Result<()> {
        write_fits(path, image.width, image.height, &image.data, header)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Overrides the type inferred from the last shutter command
    pub frame_type: Option<FrameType>,
    pub do_wcs: bool,
    pub overwrite: bool,
    /// Cards merged over the status snapshot
    pub custom: FitsHeader,
}

impl SaveOptions {
    pub fn frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    pub fn with_wcs(mut self) -> Self {
        self.do_wcs = true;
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedFrame {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub wcs: Option<WcsSolution>,
}

#[derive(Debug, Clone, Copy)]
struct ExposureRecord {
    started: DateTime<Utc>,
    duration: f64,
}

pub struct FrameRecorder {
    state: Arc<ObservatoryState>,
    loops: Arc<BackgroundLoops>,
    sink: Arc<dyn ImageSink>,
    last_exposure: Mutex<Option<ExposureRecord>>,
}

impl FrameRecorder {
    pub fn new(state: Arc<ObservatoryState>, loops: Arc<BackgroundLoops>, sink: Arc<dyn ImageSink>) -> Self {
        Self {
            state,
            loops,
            sink,
            last_exposure: Mutex::new(None),
        }
    }

    /// Take an exposure and wait until the image is ready
    pub async fn expose(&self, duration_secs: f64, light: bool) -> Result<()> {
        self.state.ensure_operational()?;
        let exposure = Duration::try_from_secs_f64(duration_secs.max(0.0)).map_err(|_| {
            ObservatoryError::InvalidArgument(format!("exposure time {} s is not representable", duration_secs))
        })?;
        let camera = require(&self.state.devices().camera, "camera")?;
        ensure_connected(camera, "camera").await?;
        let camera = camera.lease().await;
        self.state.ensure_operational()?;

        tracing::info!("Exposing {:.3}s ({})", duration_secs, if light { "light" } else { "dark" });
        let started = Utc::now();
        camera.start_exposure(duration_secs, light).await?;
        self.state.record_shutter(light);
        *self.last_exposure.lock().unwrap_or_else(|e| e.into_inner()) = Some(ExposureRecord {
            started,
            duration: duration_secs,
        });

        let limit = exposure.saturating_add(READOUT_ALLOWANCE);
        let wait = async {
            while !camera.image_ready().await? {
                self.state.ensure_operational()?;
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok::<(), ObservatoryError>(())
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(result) => result?,
            Err(_) => return Err(DeviceError::timeout("exposure readout", limit).into()),
        }
        tracing::debug!("Exposure ready");
        Ok(())
    }

    /// Read out the last image and write it with a full status header
    pub async fn save_last_image(&self, path: &Path, options: &SaveOptions) -> Result<SavedFrame> {
        if path.exists() && !options.overwrite {
            return Err(ObservatoryError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        let camera = require(&self.state.devices().camera, "camera")?;
        let image = camera.device().image_array().await?;
        if image.is_empty() {
            return Err(ObservatoryError::InvalidArgument("camera returned an empty image".to_string()));
        }

        let mut header = header::snapshot(&self.state, self.loops.status().await).await;
        let frame_type = options.frame_type.unwrap_or(match self.state.last_shutter_light() {
            Some(false) => FrameType::Dark,
            _ => FrameType::Light,
        });
        header.set("FRAMETYP", frame_type.as_str(), "Frame type");
        let record = *self.last_exposure.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = record {
            header.set(
                "DATE-OBS",
                record.started.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                "UTC start of exposure",
            );
            header.set("EXPTIME", record.duration, "Exposure time [s]");
        }
        header.extend(options.custom.clone());

        self.sink.write(path, &image, &header)?;
        tracing::info!("Saved {} frame to {}", frame_type.as_str(), path.display());

        let wcs = if options.do_wcs {
            let solution = self.solve_frame(path).await;
            if let Some(wcs) = &solution {
                wcs_cards(wcs, &mut header);
                self.sink.write(path, &image, &header)?;
            }
            solution
        } else {
            None
        };

        Ok(SavedFrame {
            path: path.to_path_buf(),
            width: image.width,
            height: image.height,
            wcs,
        })
    }

    /// Try each solver in order; errors count as no solution
    pub async fn solve_frame(&self, path: &Path) -> Option<WcsSolution> {
        let solvers = &self.state.devices().solvers;
        if solvers.is_empty() {
            tracing::warn!("No plate solver installed");
            return None;
        }
        let mut options = SolveOptions::default();
        if let Some((scale, _)) = self.state.pixel_scale().await {
            options = options.with_scale_estimate(scale);
        }
        for solver in solvers {
            tracing::info!("Solving {} with {}", path.display(), solver.name());
            match solver.solve(path, &options).await {
                Ok(Some(solution)) => return Some(solution),
                Ok(None) => tracing::info!("{} found no solution", solver.name()),
                Err(e) => tracing::warn!("{} failed: {}", solver.name(), e),
            }
        }
        None
    }
}

fn wcs_cards(wcs: &WcsSolution, header: &mut FitsHeader) {
    header.set("CTYPE1", "RA---TAN", "Gnomonic projection");
    header.set("CTYPE2", "DEC--TAN", "Gnomonic projection");
    header.set("CRVAL1", wcs.crval_ra, "Reference RA [deg]");
    header.set("CRVAL2", wcs.crval_dec, "Reference Dec [deg]");
    // FITS pixels are 1-based
    header.set("CRPIX1", wcs.crpix_x + 1.0, "Reference pixel x");
    header.set("CRPIX2", wcs.crpix_y + 1.0, "Reference pixel y");
    header.set("CD1_1", wcs.cd1_1, "");
    header.set("CD1_2", wcs.cd1_2, "");
    header.set("CD2_1", wcs.cd2_1, "");
    header.set("CD2_2", wcs.cd2_2, "");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservatoryConfig;
    use crate::state::Devices;
    use starwatch_devices::sim::*;
    use starwatch_imaging::read_header;

    fn recorder(devices: Devices) -> FrameRecorder {
        let state = Arc::new(ObservatoryState::new(devices, ObservatoryConfig::default()));
        let loops = Arc::new(BackgroundLoops::new(state.clone()));
        FrameRecorder::new(state, loops, Arc::new(FitsSink))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dark_frame_type_follows_shutter() {
        let camera = Arc::new(SimCamera::new("cam"));
        camera.set_connected(true).await.unwrap();
        let recorder = recorder(Devices::default().with_camera(camera.clone()));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dark.fts");

        recorder.expose(2.0, false).await.unwrap();
        let saved = recorder.save_last_image(&path, &SaveOptions::default()).await.unwrap();

        assert_eq!((saved.width, saved.height), (64, 48));
        let header = read_header(&path).unwrap();
        assert_eq!(header.get_str("FRAMETYP"), Some("Dark"));
        assert_eq!(header.get_f64("EXPTIME"), Some(2.0));
        assert_eq!(header.get_bool("CAMCON"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_to_overwrite() {
        let camera = Arc::new(SimCamera::new("cam"));
        camera.set_connected(true).await.unwrap();
        let recorder = recorder(Devices::default().with_camera(camera));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fts");
        recorder.expose(0.5, true).await.unwrap();
        recorder.save_last_image(&path, &SaveOptions::default()).await.unwrap();
        assert!(recorder.save_last_image(&path, &SaveOptions::default()).await.is_err());
        recorder
            .save_last_image(&path, &SaveOptions::default().frame_type(FrameType::Flat).overwrite())
            .await
            .unwrap();
        assert_eq!(read_header(&path).unwrap().get_str("FRAMETYP"), Some("Flat"));
    }

    #[tokio::test]
    async fn test_expose_requires_connected_camera() {
        let camera = Arc::new(SimCamera::new("cam"));
        let recorder = recorder(Devices::default().with_camera(camera));
        assert!(matches!(
            recorder.expose(1.0, true).await,
            Err(ObservatoryError::NotConnected(_))
        ));
        let empty = recorder_without_camera();
        assert!(matches!(
            empty.expose(1.0, true).await,
            Err(ObservatoryError::MissingDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_exposure_is_rejected() {
        let camera = Arc::new(SimCamera::new("cam"));
        camera.set_connected(true).await.unwrap();
        let recorder = recorder(Devices::default().with_camera(camera.clone()));
        assert!(matches!(
            recorder.expose(f64::INFINITY, true).await,
            Err(ObservatoryError::InvalidArgument(_))
        ));
        assert!(camera.exposures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_latch_ends_exposure_wait() {
        let camera = Arc::new(SimCamera::new("cam"));
        camera.set_connected(true).await.unwrap();
        let recorder = Arc::new(recorder(Devices::default().with_camera(camera.clone())));

        recorder.state.latch_safed();
        assert!(matches!(recorder.expose(1.0, true).await, Err(ObservatoryError::ShutDown)));
        assert!(camera.exposures().is_empty());
        recorder.state.clear_safed();

        let running = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.expose(100.0, true).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        recorder.state.latch_safed();
        let started = tokio::time::Instant::now();
        let result = running.await.unwrap();
        assert!(matches!(result, Err(ObservatoryError::ShutDown)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    fn recorder_without_camera() -> FrameRecorder {
        recorder(Devices::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_solvers_tried_in_order() {
        let camera = Arc::new(SimCamera::new("cam"));
        camera.set_connected(true).await.unwrap();
        let failing = Arc::new(SimSolver::new("broken", SolverScript::Fail));
        let wcs = WcsSolution::from_scale_rotation(10.0, 20.0, (32.0, 24.0), 1.5, 0.0);
        let working = Arc::new(SimSolver::new("good", SolverScript::Solution(wcs)));
        let recorder = recorder(
            Devices::default()
                .with_camera(camera)
                .with_solver(failing.clone())
                .with_solver(working.clone()),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("light.fts");
        recorder.expose(1.0, true).await.unwrap();
        let saved = recorder
            .save_last_image(&path, &SaveOptions::default().with_wcs())
            .await
            .unwrap();
        assert_eq!(saved.wcs, Some(wcs));
        assert_eq!((failing.calls(), working.calls()), (1, 1));
        assert_eq!(read_header(&path).unwrap().get_f64("CRVAL1"), Some(10.0));
    }
}
