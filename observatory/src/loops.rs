//! Background control loops
//!
//! Three independent workers: weather refresh, safety interlock polling and
//! field derotation. Each kind has one slot holding at most one running
//! worker together with the sender half of its cancellation signal.

use crate::control::Controlled;
use crate::error::{ObservatoryError, Result};
use crate::state::{require, ObservatoryState};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use starwatch_devices::{Device, Mount, ObservingConditions, Rotator, SafetyMonitor};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Earth's sidereal rotation rate in rad/s
pub const SIDEREAL_RATE: f64 = 7.292115855306589e-5;

pub const DEFAULT_CONDITIONS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SAFETY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DEROTATION_INTERVAL: Duration = Duration::from_millis(50);

/// Invoked once when a safety monitor reports unsafe
pub type FailureCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    ObservingConditions,
    SafetyMonitor,
    Derotation,
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopKind::ObservingConditions => write!(f, "observing conditions"),
            LoopKind::SafetyMonitor => write!(f, "safety monitor"),
            LoopKind::Derotation => write!(f, "derotation"),
        }
    }
}

/// Which loops are running right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStatus {
    pub observing_conditions: bool,
    pub safety_monitor: bool,
    pub derotation: bool,
}

struct LoopHandle {
    cancel: watch::Sender<bool>,
    worker: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

struct LoopSlot {
    kind: LoopKind,
    handle: Mutex<Option<LoopHandle>>,
}

impl LoopSlot {
    fn new(kind: LoopKind) -> Self {
        Self {
            kind,
            handle: Mutex::new(None),
        }
    }

    async fn start<F, Fut>(&self, spawn: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.worker.is_finished() {
                tracing::warn!("{} loop already running since {}", self.kind, handle.started_at);
                return false;
            }
            tracing::debug!("Reaping finished {} loop", self.kind);
        }
        let (cancel, signal) = watch::channel(false);
        let worker = tokio::spawn(spawn(signal));
        *slot = Some(LoopHandle {
            cancel,
            worker,
            started_at: Utc::now(),
        });
        tracing::info!("Started {} loop", self.kind);
        true
    }

    async fn stop(&self) -> bool {
        let Some(handle) = self.handle.lock().await.take() else {
            tracing::warn!("{} loop is not running", self.kind);
            return false;
        };
        let was_running = !handle.worker.is_finished();
        let _ = handle.cancel.send(true);
        if let Err(e) = handle.worker.await {
            tracing::warn!("{} loop worker failed: {}", self.kind, e);
        }
        if was_running {
            tracing::info!("Stopped {} loop", self.kind);
        } else {
            tracing::warn!("{} loop had already ended", self.kind);
        }
        was_running
    }

    async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.worker.is_finished())
    }
}

/// Sleep for `duration` unless cancelled first; true means cancelled
async fn wait_or_cancel(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *cancel.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *cancel.borrow(),
        changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
    }
}

/// Field-rotation increment in degrees over `interval_secs` for an
/// alt-az mounted rotator, `None` too close to the zenith
pub fn derotation_increment(alt_deg: f64, az_deg: f64, latitude: f64, interval_secs: f64) -> Option<f64> {
    let cos_alt = alt_deg.to_radians().cos();
    if cos_alt.abs() < 1e-6 {
        return None;
    }
    let rate = az_deg.to_radians().cos() * latitude.to_radians().cos() / cos_alt;
    Some((-rate * SIDEREAL_RATE * interval_secs).to_degrees())
}

pub struct BackgroundLoops {
    state: Arc<ObservatoryState>,
    conditions: LoopSlot,
    safety: LoopSlot,
    derotation: LoopSlot,
}

impl BackgroundLoops {
    pub fn new(state: Arc<ObservatoryState>) -> Self {
        Self {
            state,
            conditions: LoopSlot::new(LoopKind::ObservingConditions),
            safety: LoopSlot::new(LoopKind::SafetyMonitor),
            derotation: LoopSlot::new(LoopKind::Derotation),
        }
    }

    fn slot(&self, kind: LoopKind) -> &LoopSlot {
        match kind {
            LoopKind::ObservingConditions => &self.conditions,
            LoopKind::SafetyMonitor => &self.safety,
            LoopKind::Derotation => &self.derotation,
        }
    }

    pub async fn is_running(&self, kind: LoopKind) -> bool {
        self.slot(kind).is_running().await
    }

    pub async fn status(&self) -> LoopStatus {
        LoopStatus {
            observing_conditions: self.conditions.is_running().await,
            safety_monitor: self.safety.is_running().await,
            derotation: self.derotation.is_running().await,
        }
    }

    /// Refresh the weather station every `interval` until stopped or it errors
    pub async fn start_observing_conditions(&self, interval: Duration) -> Result<bool> {
        let station = require(&self.state.devices().observing_conditions, "observing conditions")?.clone();
        Ok(self
            .conditions
            .start(move |mut cancel| async move {
                loop {
                    if let Err(e) = station.lease().await.refresh().await {
                        tracing::warn!("Observing conditions refresh failed, stopping loop: {}", e);
                        break;
                    }
                    if wait_or_cancel(&mut cancel, interval).await {
                        break;
                    }
                }
            })
            .await)
    }

    pub async fn stop_observing_conditions(&self) -> bool {
        self.conditions.stop().await
    }

    /// Poll every safety monitor; the first unsafe reading (or read error)
    /// runs `on_fail` once and ends the loop
    pub async fn start_safety_monitor(&self, on_fail: FailureCallback, interval: Duration) -> Result<bool> {
        let monitors = self.state.devices().safety_monitors.clone();
        if monitors.is_empty() {
            return Err(ObservatoryError::missing("safety monitor"));
        }
        Ok(self
            .safety
            .start(move |mut cancel| async move {
                loop {
                    let mut tripped = None;
                    for monitor in &monitors {
                        let name = monitor.device().info().name;
                        match monitor.device().is_safe().await {
                            Ok(true) => {}
                            Ok(false) => {
                                tripped = Some(format!("{} reports unsafe", name));
                                break;
                            }
                            Err(e) => {
                                tripped = Some(format!("{} could not be read: {}", name, e));
                                break;
                            }
                        }
                    }
                    if let Some(reason) = tripped {
                        tracing::error!("Safety interlock tripped: {}", reason);
                        on_fail().await;
                        break;
                    }
                    if wait_or_cancel(&mut cancel, interval).await {
                        break;
                    }
                }
            })
            .await)
    }

    pub async fn stop_safety_monitor(&self) -> bool {
        self.safety.stop().await
    }

    /// Counter-rotate the field for the mount's current pointing
    pub async fn start_derotation(&self, interval: Duration) -> Result<bool> {
        self.state.ensure_operational()?;
        let devices = self.state.devices();
        let mount: Controlled<dyn Mount> = require(&devices.telescope, "telescope")?.clone();
        let rotator: Controlled<dyn Rotator> = require(&devices.rotator, "rotator")?.clone();
        if self.derotation.is_running().await {
            tracing::warn!("derotation loop already running");
            return Ok(false);
        }
        let ra_hours = mount.device().right_ascension().await?;
        let dec_deg = mount.device().declination().await?;
        tracing::info!("Derotating for RA {:.4}h Dec {:.4}", ra_hours, dec_deg);
        let state = self.state.clone();

        Ok(self
            .derotation
            .start(move |mut cancel| async move {
                let step = interval.as_secs_f64();
                loop {
                    let started = Instant::now();
                    let site = state.site();
                    let when = Utc::now() + chrono::Duration::milliseconds(interval.as_millis() as i64);
                    let (alt, az) = state.sky().to_horizontal(&site, ra_hours, dec_deg, when);
                    match derotation_increment(alt, az, site.latitude, step) {
                        Some(delta) => {
                            if *cancel.borrow() {
                                break;
                            }
                            let lease = rotator.lease().await;
                            if let Err(e) = lease.move_relative(delta).await {
                                tracing::warn!("Derotation move failed, stopping loop: {}", e);
                                break;
                            }
                        }
                        None => tracing::debug!("Skipping derotation step at the zenith"),
                    }
                    let remaining = interval.saturating_sub(started.elapsed());
                    if wait_or_cancel(&mut cancel, remaining).await {
                        break;
                    }
                }
            })
            .await)
    }

    pub async fn stop_derotation(&self) -> bool {
        self.derotation.stop().await
    }

    pub async fn stop_all(&self) {
        for kind in [LoopKind::Derotation, LoopKind::ObservingConditions, LoopKind::SafetyMonitor] {
            let slot = self.slot(kind);
            if slot.handle.lock().await.is_some() {
                slot.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservatoryConfig;
    use crate::state::Devices;
    use starwatch_devices::sim::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn connected<T: Device + ?Sized>(device: &T) {
        device.set_connected(true).await.unwrap();
    }

    fn counting_callback() -> (FailureCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback: FailureCallback = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        (callback, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_and_stop_unstarted() {
        let station = Arc::new(SimObservingConditions::new("wx"));
        connected(station.as_ref()).await;
        let state = Arc::new(ObservatoryState::new(
            Devices::default().with_observing_conditions(station.clone()),
            ObservatoryConfig::default(),
        ));
        let loops = BackgroundLoops::new(state);

        assert!(!loops.stop_observing_conditions().await);
        assert!(loops.start_observing_conditions(Duration::from_secs(1)).await.unwrap());
        assert!(!loops.start_observing_conditions(Duration::from_secs(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(loops.is_running(LoopKind::ObservingConditions).await);
        assert!(loops.stop_observing_conditions().await);
        assert!(!loops.is_running(LoopKind::ObservingConditions).await);
        // one worker: refreshes at t=0, 1, 2
        assert_eq!(station.refreshes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conditions_loop_ends_on_error_and_restarts() {
        let station = Arc::new(SimObservingConditions::new("wx").failing_after(2));
        connected(station.as_ref()).await;
        let state = Arc::new(ObservatoryState::new(
            Devices::default().with_observing_conditions(station.clone()),
            ObservatoryConfig::default(),
        ));
        let loops = BackgroundLoops::new(state);
        loops.start_observing_conditions(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!loops.is_running(LoopKind::ObservingConditions).await);
        assert!(loops.start_observing_conditions(Duration::from_secs(1)).await.unwrap());
        loops.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_trips_once() {
        let monitor = Arc::new(SimSafetyMonitor::scripted(
            "roof",
            vec![Ok(true), Ok(true), Ok(false)],
        ));
        connected(monitor.as_ref()).await;
        let state = Arc::new(ObservatoryState::new(
            Devices::default().with_safety_monitor(monitor.clone()),
            ObservatoryConfig::default(),
        ));
        let loops = BackgroundLoops::new(state);
        let (callback, count) = counting_callback();

        assert!(loops.start_safety_monitor(callback, Duration::from_secs(1)).await.unwrap());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.reads(), 3);
        assert!(!loops.is_running(LoopKind::SafetyMonitor).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_read_error_counts_as_unsafe() {
        let monitor = Arc::new(SimSafetyMonitor::scripted(
            "roof",
            vec![Err(starwatch_devices::DeviceError::driver("offline"))],
        ));
        let state = Arc::new(ObservatoryState::new(
            Devices::default().with_safety_monitor(monitor),
            ObservatoryConfig::default(),
        ));
        let loops = BackgroundLoops::new(state);
        let (callback, count) = counting_callback();
        loops.start_safety_monitor(callback, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_devices() {
        let state = Arc::new(ObservatoryState::new(Devices::default(), ObservatoryConfig::default()));
        let loops = BackgroundLoops::new(state);
        let (callback, _) = counting_callback();
        assert!(matches!(
            loops.start_safety_monitor(callback, Duration::from_secs(1)).await,
            Err(ObservatoryError::MissingDevice(_))
        ));
        assert!(matches!(
            loops.start_derotation(DEFAULT_DEROTATION_INTERVAL).await,
            Err(ObservatoryError::MissingDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_derotation_moves_rotator_until_stopped() {
        let mount = Arc::new(SimMount::new("mount"));
        let rotator = Arc::new(SimRotator::new("rot"));
        connected(mount.as_ref()).await;
        connected(rotator.as_ref()).await;
        mount.set_pointing(5.0, 20.0);
        let mut config = ObservatoryConfig::default();
        config.site.latitude = 35.0;
        let state = Arc::new(ObservatoryState::new(
            Devices::default()
                .with_telescope(mount.clone())
                .with_rotator(rotator.clone()),
            config,
        ));
        let loops = BackgroundLoops::new(state);

        assert!(loops.start_derotation(Duration::from_secs(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(loops.stop_derotation().await);
        let moves = rotator.relative_moves().len();
        assert!(moves >= 3, "got {} moves", moves);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rotator.relative_moves().len(), moves);
    }

    #[test]
    fn test_derotation_increment() {
        assert!(derotation_increment(90.0, 0.0, 40.0, 1.0).is_none());
        // due south on the horizon at the equator: cos(180) * 1 / 1
        let delta = derotation_increment(0.0, 180.0, 0.0, 1.0).unwrap();
        assert!((delta - SIDEREAL_RATE.to_degrees()).abs() < 1e-12);
    }
}
