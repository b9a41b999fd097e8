//! Coordinated slews of mount, dome and rotator
//!
//! A slew walks through [`SlewPhase`]s in order and records each one it
//! visits. Validation happens before any command is sent, so a rejected
//! request leaves every device untouched.

use crate::control::Controlled;
use crate::error::{ObservatoryError, Result};
use crate::loops::BackgroundLoops;
use crate::sky::SkyTarget;
use crate::state::{ensure_connected, require, ObservatoryState};
use chrono::Utc;
use starwatch_devices::*;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlewPhase {
    Validating,
    Unparking,
    Homing,
    Slewing,
    Settling,
    TrackingSet,
    Done,
    Rejected,
}

/// What to point at and which subsystems follow
#[derive(Debug, Clone, PartialEq)]
pub struct SlewRequest {
    pub target: SkyTarget,
    pub control_dome: bool,
    pub control_rotator: bool,
    pub home_first: bool,
    pub wait_for_slew: bool,
    pub track: bool,
}

impl SlewRequest {
    pub fn equatorial(ra_hours: f64, dec_deg: f64) -> Self {
        Self::new(SkyTarget::Equatorial { ra_hours, dec_deg })
    }

    pub fn horizontal(alt_deg: f64, az_deg: f64) -> Self {
        Self::new(SkyTarget::Horizontal { alt_deg, az_deg })
    }

    fn new(target: SkyTarget) -> Self {
        Self {
            target,
            control_dome: false,
            control_rotator: false,
            home_first: false,
            wait_for_slew: true,
            track: true,
        }
    }

    pub fn with_dome(mut self, control: bool) -> Self {
        self.control_dome = control;
        self
    }

    pub fn with_rotator(mut self, control: bool) -> Self {
        self.control_rotator = control;
        self
    }

    pub fn home_first(mut self) -> Self {
        self.home_first = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait_for_slew = false;
        self
    }

    pub fn without_tracking(mut self) -> Self {
        self.track = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlewReport {
    pub phases: Vec<SlewPhase>,
    pub altitude: f64,
    pub azimuth: f64,
    pub ra_hours: f64,
    pub dec_deg: f64,
    /// Rotator motion was skipped because the target angle hit a limit
    pub rotator_downgraded: bool,
}

/// Normalise an angle in degrees to (-180, 180]
fn normalize_angle(angle: f64) -> f64 {
    let a = angle.rem_euclid(360.0);
    if a > 180.0 {
        a - 360.0
    } else {
        a
    }
}

pub struct SlewCoordinator {
    state: Arc<ObservatoryState>,
    loops: Arc<BackgroundLoops>,
}

impl SlewCoordinator {
    pub fn new(state: Arc<ObservatoryState>, loops: Arc<BackgroundLoops>) -> Self {
        Self { state, loops }
    }

    /// Both coordinate forms of a target at the current time
    fn resolve(&self, target: SkyTarget) -> (f64, f64, f64, f64) {
        let site = self.state.site();
        let now = Utc::now();
        match target {
            SkyTarget::Equatorial { ra_hours, dec_deg } => {
                let (alt, az) = self.state.sky().to_horizontal(&site, ra_hours, dec_deg, now);
                (ra_hours, dec_deg, alt, az)
            }
            SkyTarget::Horizontal { alt_deg, az_deg } => {
                let (ra, dec) = self.state.sky().to_equatorial(&site, alt_deg, az_deg, now);
                (ra, dec, alt_deg, az_deg)
            }
        }
    }

    /// Run a coordinated slew
    pub async fn slew(&self, request: &SlewRequest) -> Result<SlewReport> {
        let devices = self.state.devices();
        let mut phases = vec![SlewPhase::Validating];

        let mount = match self.validate(request).await {
            Ok(mount) => mount,
            Err(e) => {
                phases.push(SlewPhase::Rejected);
                tracing::warn!("Slew rejected ({:?}): {}", phases, e);
                return Err(e);
            }
        };
        let (ra_hours, dec_deg, altitude, azimuth) = self.resolve(request.target);
        tracing::info!(
            "Slewing to RA {:.4}h Dec {:.4} (alt {:.2} az {:.2})",
            ra_hours,
            dec_deg,
            altitude,
            azimuth
        );

        let rotator = match (&devices.rotator, request.control_rotator) {
            (Some(rotator), true) => {
                self.loops.stop_derotation().await;
                Some(rotator)
            }
            _ => None,
        };

        let mount = mount.lease().await;
        let rotator_lease = match rotator {
            Some(rotator) => Some(rotator.lease().await),
            None => None,
        };
        let caps = mount.capabilities();
        // shutdown may have run while this slew waited for the leases
        self.state.ensure_operational()?;

        if caps.can_park && mount.at_park().await? {
            phases.push(SlewPhase::Unparking);
            tracing::info!("Unparking mount");
            mount.unpark().await?;
        }

        if request.home_first {
            if caps.can_find_home {
                phases.push(SlewPhase::Homing);
                tracing::info!("Homing mount before slew");
                mount.find_home().await?;
            } else {
                tracing::warn!("Mount cannot find home, slewing without homing");
            }
        }

        phases.push(SlewPhase::Slewing);
        self.state.ensure_operational()?;
        if caps.can_slew_async {
            mount.slew_to_coordinates_async(ra_hours, dec_deg).await?;
        } else if caps.can_slew {
            mount.slew_to_coordinates(ra_hours, dec_deg).await?;
        } else if caps.can_slew_alt_az_async {
            mount.slew_to_alt_az_async(altitude, azimuth).await?;
        } else if caps.can_slew_alt_az {
            mount.slew_to_alt_az(altitude, azimuth).await?;
        } else {
            return Err(ObservatoryError::CannotSlew);
        }

        let dome = match (&devices.dome, request.control_dome) {
            (Some(dome), true) => {
                self.command_dome(dome, altitude, azimuth).await?;
                Some(dome)
            }
            _ => None,
        };

        let mut rotator_downgraded = false;
        if let Some(rotator) = &rotator_lease {
            let hour_angle = self.state.sky().hour_angle(&self.state.site(), ra_hours, Utc::now());
            let angle = normalize_angle(hour_angle * 15.0);
            let (min, max) = self.state.rotator_limits();
            let blocked = min.is_some_and(|m| angle <= m) || max.is_some_and(|m| angle >= m);
            if blocked {
                tracing::warn!(
                    "Rotator angle {:.2} is outside limits {:?}..{:?}, leaving rotator in place",
                    angle,
                    min,
                    max
                );
                rotator_downgraded = true;
            } else {
                rotator.move_absolute(angle).await?;
            }
        }

        if request.wait_for_slew {
            loop {
                self.state.ensure_operational()?;
                let mut moving = mount.is_slewing().await?;
                if let Some(dome) = dome {
                    moving |= dome.device().is_slewing().await?;
                }
                if let Some(rotator) = &rotator_lease {
                    moving |= rotator.is_moving().await?;
                }
                if !moving {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }

            phases.push(SlewPhase::Settling);
            let settle = self.state.settle_time();
            tracing::debug!("Settling for {:?}", settle);
            tokio::time::sleep(settle).await;
        }

        self.state.ensure_operational()?;
        if request.track {
            if caps.can_set_tracking {
                if let Err(e) = mount.set_tracking_rate(TrackingRate::Sidereal).await {
                    tracing::warn!("Could not set sidereal tracking rate: {}", e);
                }
                mount.set_tracking(true).await?;
                phases.push(SlewPhase::TrackingSet);
            } else {
                tracing::warn!("Mount cannot set tracking, leaving tracking unchanged");
            }
        }

        phases.push(SlewPhase::Done);
        tracing::info!("Slew complete");
        Ok(SlewReport {
            phases,
            altitude,
            azimuth,
            ra_hours,
            dec_deg,
            rotator_downgraded,
        })
    }

    async fn validate(&self, request: &SlewRequest) -> Result<&Controlled<dyn Mount>> {
        self.state.ensure_operational()?;
        let mount = require(&self.state.devices().telescope, "telescope")?;
        ensure_connected(mount, "telescope").await?;
        let (_, _, altitude, _) = self.resolve(request.target);
        let minimum = self.state.min_altitude();
        if altitude <= minimum {
            return Err(ObservatoryError::BelowMinimumAltitude { altitude, minimum });
        }
        Ok(mount)
    }

    async fn command_dome(&self, dome: &Controlled<dyn Dome>, altitude: f64, azimuth: f64) -> Result<()> {
        let dome = dome.lease().await;
        let caps = dome.capabilities();

        if caps.can_set_shutter && dome.shutter_status().await? != ShutterState::Open {
            tracing::info!("Opening dome shutter");
            dome.open_shutter().await?;
            if caps.can_find_home {
                dome.find_home().await?;
            }
        }
        if caps.can_park && dome.at_park().await? && caps.can_find_home {
            tracing::info!("Unparking dome by homing");
            dome.find_home().await?;
        }
        if dome.slaved().await? {
            tracing::debug!("Dome is slaved, not commanding position");
            return Ok(());
        }
        if caps.can_set_altitude {
            dome.slew_to_altitude(altitude).await?;
        }
        if caps.can_set_azimuth {
            dome.slew_to_azimuth(azimuth).await?;
        }
        Ok(())
    }
}
