//! Bulk connect, disconnect and emergency shutdown
//!
//! Every step is isolated: a device that fails is logged and recorded in the
//! [`SequenceReport`], and the sequence carries on with the next one.

use crate::control::{best_effort, Controlled, SequenceReport, StepOutcome};
use crate::loops::BackgroundLoops;
use crate::state::ObservatoryState;
use futures::future::BoxFuture;
use starwatch_devices::*;
use std::sync::Arc;
use std::time::Duration;

/// How long shutdown waits for a busy command lease before overriding it
const LEASE_OVERRIDE_WAIT: Duration = Duration::from_secs(2);

/// Upper bound on the shutter-closing dark exposure
const DARK_READY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConnectionManager {
    state: Arc<ObservatoryState>,
    loops: Arc<BackgroundLoops>,
}

fn toggle<T: Device + ?Sized + 'static>(
    handle: &Controlled<T>,
    connected: bool,
) -> BoxFuture<'static, DeviceResult<()>> {
    let device = handle.device().clone();
    Box::pin(async move { device.set_connected(connected).await })
}

impl ConnectionManager {
    pub fn new(state: Arc<ObservatoryState>, loops: Arc<BackgroundLoops>) -> Self {
        Self { state, loops }
    }

    /// Connection steps in the fixed order: camera, cover calibrator, dome,
    /// filter wheel, focuser, observing conditions, rotator, safety
    /// monitors, switches, telescope
    fn steps(&self, connected: bool) -> Vec<(String, BoxFuture<'static, DeviceResult<()>>)> {
        let devices = self.state.devices();
        let mut steps = Vec::new();

        macro_rules! single {
            ($slot:ident, $label:expr) => {
                if let Some(handle) = &devices.$slot {
                    steps.push(($label.to_string(), toggle(handle, connected)));
                }
            };
        }

        single!(camera, "camera");
        single!(cover_calibrator, "cover calibrator");
        single!(dome, "dome");
        single!(filter_wheel, "filter wheel");
        single!(focuser, "focuser");
        single!(observing_conditions, "observing conditions");
        single!(rotator, "rotator");
        for (i, monitor) in devices.safety_monitors.iter().enumerate() {
            steps.push((format!("safety monitor {}", i), toggle(monitor, connected)));
        }
        for (i, switch) in devices.switches.iter().enumerate() {
            steps.push((format!("switch {}", i), toggle(switch, connected)));
        }
        single!(telescope, "telescope");
        steps
    }

    pub async fn connect_all(&self) -> SequenceReport {
        tracing::info!("Connecting all devices");
        let mut report = SequenceReport::default();
        for (step, fut) in self.steps(true) {
            best_effort(&mut report, &format!("connect {}", step), fut).await;
        }

        if let Some(rotator) = &self.state.devices().rotator {
            let reverse = self.state.rotator_reverse();
            if reverse && rotator.device().can_reverse() {
                let lease = rotator.lease().await;
                best_effort(&mut report, "apply rotator reverse", lease.set_reverse(true)).await;
            }
        }

        if !report.is_clean() {
            tracing::warn!("{} device(s) failed to connect", report.failures().len());
        }
        report
    }

    pub async fn disconnect_all(&self) -> SequenceReport {
        tracing::info!("Disconnecting all devices");
        let mut report = SequenceReport::default();
        for (step, fut) in self.steps(false) {
            best_effort(&mut report, &format!("disconnect {}", step), fut).await;
        }
        report
    }

    /// Put every subsystem in a safe state
    ///
    /// Latches the observatory first so that foreground operations still
    /// holding a lease stop at their next checkpoint instead of undoing the
    /// park. The latch stays set until [`ObservatoryState::clear_safed`].
    pub async fn shutdown(&self) -> SequenceReport {
        tracing::error!("Shutting down the observatory");
        self.state.latch_safed();
        let mut report = SequenceReport::default();
        let devices = self.state.devices();

        if self.loops.stop_derotation().await {
            report.push("stop derotation", StepOutcome::Done);
        }

        if let Some(camera) = &devices.camera {
            let camera = camera.lease_within(LEASE_OVERRIDE_WAIT, "camera").await;
            if camera.capabilities().can_abort_exposure {
                best_effort(&mut report, "camera abort exposure", camera.abort_exposure()).await;
            } else {
                report.skip("camera abort exposure", "not supported");
            }
            let close_shutter = async {
                camera.start_exposure(0.0, false).await?;
                self.state.record_shutter(false);
                let poll = async {
                    while !camera.image_ready().await? {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Ok::<(), DeviceError>(())
                };
                match tokio::time::timeout(DARK_READY_TIMEOUT, poll).await {
                    Ok(result) => result,
                    Err(_) => Err(DeviceError::timeout("shutter-closing dark", DARK_READY_TIMEOUT)),
                }
            };
            best_effort(&mut report, "camera close shutter", close_shutter).await;
        }

        if let Some(panel) = &devices.cover_calibrator {
            let panel = panel.lease_within(LEASE_OVERRIDE_WAIT, "cover calibrator").await;
            match panel.calibrator_state().await {
                Ok(CalibratorState::NotPresent) => report.skip("calibrator off", "no calibrator"),
                _ => best_effort(&mut report, "calibrator off", panel.calibrator_off()).await,
            }
            match panel.cover_state().await {
                Ok(CoverState::NotPresent) => report.skip("close cover", "no cover"),
                _ => {
                    best_effort(&mut report, "halt cover", panel.halt_cover()).await;
                    best_effort(&mut report, "close cover", panel.close_cover()).await;
                }
            }
        }

        if let Some(dome) = &devices.dome {
            let dome = dome.lease_within(LEASE_OVERRIDE_WAIT, "dome").await;
            let caps = dome.capabilities();
            best_effort(&mut report, "dome abort slew", dome.abort_slew()).await;
            if caps.can_park {
                best_effort(&mut report, "dome park", dome.park()).await;
            } else {
                report.skip("dome park", "not supported");
            }
            if caps.can_set_shutter {
                best_effort(&mut report, "dome close shutter", dome.close_shutter()).await;
            } else {
                report.skip("dome close shutter", "not supported");
            }
        }

        if let Some(focuser) = &devices.focuser {
            let focuser = focuser.lease_within(LEASE_OVERRIDE_WAIT, "focuser").await;
            best_effort(&mut report, "focuser halt", focuser.halt()).await;
        }

        if let Some(rotator) = &devices.rotator {
            let rotator = rotator.lease_within(LEASE_OVERRIDE_WAIT, "rotator").await;
            best_effort(&mut report, "rotator halt", rotator.halt()).await;
        }

        if let Some(mount) = &devices.telescope {
            let mount = mount.lease_within(LEASE_OVERRIDE_WAIT, "telescope").await;
            let caps = mount.capabilities();
            best_effort(&mut report, "telescope abort slew", mount.abort_slew()).await;
            best_effort(&mut report, "telescope tracking off", mount.set_tracking(false)).await;
            if caps.can_park {
                best_effort(&mut report, "telescope park", mount.park()).await;
            } else if caps.can_find_home {
                best_effort(&mut report, "telescope find home", mount.find_home()).await;
            } else {
                report.skip("telescope park", "cannot park or home");
            }
        }

        if report.is_clean() {
            tracing::info!("Shutdown complete");
        } else {
            tracing::warn!("Shutdown finished with {} failed step(s)", report.failures().len());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservatoryConfig;
    use crate::state::Devices;
    use starwatch_devices::sim::*;

    struct Rig {
        camera: Arc<SimCamera>,
        dome: Arc<SimDome>,
        mount: Arc<SimMount>,
        panel: Arc<SimCoverCalibrator>,
        monitor: Arc<SimSafetyMonitor>,
        rotator: Arc<SimRotator>,
        manager: ConnectionManager,
    }

    fn rig(config: ObservatoryConfig) -> Rig {
        let camera = Arc::new(SimCamera::new("cam"));
        let dome = Arc::new(SimDome::new("dome"));
        let mount = Arc::new(SimMount::new("mount"));
        let panel = Arc::new(SimCoverCalibrator::new("panel").without_cover());
        let monitor = Arc::new(SimSafetyMonitor::always_safe("roof"));
        let rotator = Arc::new(SimRotator::new("rot"));
        let devices = Devices::default()
            .with_camera(camera.clone())
            .with_dome(dome.clone())
            .with_telescope(mount.clone())
            .with_cover_calibrator(panel.clone())
            .with_safety_monitor(monitor.clone())
            .with_rotator(rotator.clone());
        let state = Arc::new(ObservatoryState::new(devices, config));
        let loops = Arc::new(BackgroundLoops::new(state.clone()));
        Rig {
            camera,
            dome,
            mount,
            panel,
            monitor,
            rotator,
            manager: ConnectionManager::new(state, loops),
        }
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_isolates_failure() {
        let rig = rig(ObservatoryConfig::default());
        rig.dome.fail_on_connect();

        let report = rig.manager.connect_all().await;
        assert_eq!(report.failures().len(), 1);
        assert!(matches!(report.outcome("connect dome"), Some(StepOutcome::Failed(_))));
        assert!(rig.camera.is_connected());
        assert!(rig.mount.is_connected());
        assert!(rig.monitor.is_connected());

        let report = rig.manager.disconnect_all().await;
        assert!(report.is_clean());
        for connected in [
            rig.camera.is_connected(),
            rig.dome.is_connected(),
            rig.mount.is_connected(),
            rig.panel.is_connected(),
            rig.monitor.is_connected(),
            rig.rotator.is_connected(),
        ] {
            assert!(!connected);
        }
    }

    #[tokio::test]
    async fn test_connect_order_ends_with_telescope() {
        let rig = rig(ObservatoryConfig::default());
        let report = rig.manager.connect_all().await;
        let names: Vec<&str> = report.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "connect camera",
                "connect cover calibrator",
                "connect dome",
                "connect rotator",
                "connect safety monitor 0",
                "connect telescope",
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_applies_rotator_reverse() {
        let mut config = ObservatoryConfig::default();
        config.rotator.reverse = true;
        let rig = rig(config);
        rig.manager.connect_all().await;
        assert_eq!(rig.rotator.commands(), vec!["set_reverse true"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_safes_everything() {
        let rig = rig(ObservatoryConfig::default());
        rig.manager.connect_all().await;
        rig.mount.slew_to_coordinates(3.0, 10.0).await.unwrap();
        rig.mount.set_tracking(true).await.unwrap();

        let report = rig.manager.shutdown().await;

        assert!(report.is_clean(), "{:?}", report.failures());
        let pose = rig.mount.pose();
        assert!(pose.parked);
        assert!(!pose.tracking);
        assert_eq!(rig.dome.pose().shutter, ShutterState::Closed);
        assert!(rig.dome.pose().at_park);
        let exposures = rig.camera.exposures();
        assert_eq!(exposures.len(), 1);
        assert!(!exposures[0].light);
        assert_eq!(report.outcome("close cover"), Some(&StepOutcome::Skipped("no cover".into())));
        assert!(rig.panel.commands().contains(&"calibrator_off".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_overrides_stuck_lease() {
        let rig = rig(ObservatoryConfig::default());
        rig.manager.connect_all().await;
        let held = rig.manager.state.devices().telescope.as_ref().unwrap().lease().await;
        let report = rig.manager.shutdown().await;
        drop(held);
        assert!(rig.mount.pose().parked);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_latch_survives_reconnect() {
        let rig = rig(ObservatoryConfig::default());
        rig.manager.connect_all().await;
        assert!(!rig.manager.state.is_safed());
        rig.manager.shutdown().await;
        assert!(rig.manager.state.is_safed());
        rig.manager.connect_all().await;
        assert!(rig.manager.state.is_safed());
    }

    #[tokio::test]
    async fn test_shutdown_continues_past_disconnected_devices() {
        let rig = rig(ObservatoryConfig::default());
        let report = rig.manager.shutdown().await;
        assert!(!report.is_clean());
        // every installed subsystem was still attempted
        assert!(report.outcome("telescope park").is_some());
        assert!(report.outcome("dome close shutter").is_some());
    }
}
