//! Header snapshot of the whole observatory
//!
//! Each installed subsystem contributes a block of cards. A subsystem that is
//! offline only reports its connection card, and any value that cannot be
//! read is written as undefined rather than failing the snapshot.

use crate::loops::LoopStatus;
use crate::state::ObservatoryState;
use chrono::Utc;
use starwatch_devices::*;
use starwatch_imaging::{calculate_airmass, CardValue, FitsHeader};

fn value<T: Into<CardValue>>(result: DeviceResult<T>) -> CardValue {
    result.ok().into()
}

/// Hours as "HH MM SS.SS"
pub fn format_hms(hours: f64) -> String {
    let total = (hours.rem_euclid(24.0) * 3600.0 * 100.0).round() as i64;
    let (h, rem) = (total / 360_000, total % 360_000);
    let (m, cs) = (rem / 6000, rem % 6000);
    format!("{:02} {:02} {:02}.{:02}", h % 24, m, cs / 100, cs % 100)
}

/// Degrees as "+DD MM SS.S"
pub fn format_dms(degrees: f64) -> String {
    let sign = if degrees < 0.0 { '-' } else { '+' };
    let total = (degrees.abs() * 3600.0 * 10.0).round() as i64;
    let (d, rem) = (total / 36_000, total % 36_000);
    let (m, ds) = (rem / 600, rem % 600);
    format!("{}{:02} {:02} {:02}.{}", sign, d, m, ds / 10, ds % 10)
}

async fn is_connected<T: Device + ?Sized>(device: &T) -> bool {
    device.connected().await.unwrap_or(false)
}

async fn observatory_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let config = state.config();
    let site = &config.site;
    header.set("OBSNAME", site.name.as_str(), "Observatory name");
    header.set("OBSINSTN", site.instrument_name.as_str(), "Instrument name");
    header.set("OBSINSTD", site.instrument_description.as_str(), "Instrument description");
    header.set("OBSLAT", site.latitude, "Observatory latitude [deg]");
    header.set("OBSLONG", site.longitude, "Observatory longitude [deg]");
    header.set("OBSELEV", site.elevation, "Observatory elevation [m]");
    header.set("OBSDIA", site.diameter, "Observatory diameter [m]");
    header.set("OBSFL", site.focal_length, "Observatory focal length [mm]");
    let scale = state.pixel_scale().await;
    header.set("XPIXSCAL", scale.map(|s| s.0), "Observatory x-pixel scale [arcsec/px]");
    header.set("YPIXSCAL", scale.map(|s| s.1), "Observatory y-pixel scale [arcsec/px]");
}

async fn camera_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(camera) = &state.devices().camera else {
        return;
    };
    let camera = camera.device();
    let connected = is_connected(camera.as_ref()).await;
    header.set("CAMCON", connected, "Camera connected");
    if !connected {
        return;
    }
    let info = camera.info();
    let binning = camera.binning().await;
    let readout = camera.readout_mode().await;
    let modes = camera.readout_modes().await.unwrap_or_default();
    let readout_name = readout.as_ref().ok().and_then(|i| modes.get(*i).cloned());

    header.set("CAMNAME", info.name.as_str(), "Camera name");
    header.set("CAMDRV", info.driver_info.as_str(), "Camera driver");
    header.set("CAMDRVER", info.driver_version.as_str(), "Camera driver version");
    header.set("XBINNING", binning.as_ref().ok().map(|b| b.0), "Binning factor in x");
    header.set("YBINNING", binning.as_ref().ok().map(|b| b.1), "Binning factor in y");
    header.set("READOUTM", value(readout), "Readout mode index");
    header.set("READOUT", readout_name, "Readout mode name");
    header.set("CCD-TEMP", value(camera.ccd_temperature().await), "CCD temperature [C]");
    header.set("SET-TEMP", state.cooler_setpoint(), "CCD temperature setpoint [C]");
    if let Ok((w, h)) = camera.sensor_size().await {
        header.set("WIDTH", w, "Sensor width [px]");
        header.set("HEIGHT", h, "Sensor height [px]");
    }
    if let Ok((px, py)) = camera.pixel_size().await {
        header.set("XPIXSIZE", px, "Pixel width [um]");
        header.set("YPIXSIZE", py, "Pixel height [um]");
    }
}

async fn telescope_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(mount) = &state.devices().telescope else {
        return;
    };
    let mount = mount.device();
    let connected = is_connected(mount.as_ref()).await;
    header.set("TELCONN", connected, "Telescope connected");
    if !connected {
        return;
    }
    header.set("TELNAME", mount.info().name.as_str(), "Telescope name");
    header.set("TELHOME", value(mount.at_home().await), "Is telescope at home position");
    header.set("TELPARK", value(mount.at_park().await), "Is telescope at park position");
    header.set("TELALT", value(mount.altitude().await), "Telescope altitude [deg]");
    header.set("TELAZ", value(mount.azimuth().await), "Telescope azimuth [deg]");
    header.set("TELTRACK", value(mount.tracking().await), "Is telescope tracking");
    header.set("TELSLEW", value(mount.is_slewing().await), "Is telescope slewing");

    let (Ok(ra), Ok(dec)) = (mount.right_ascension().await, mount.declination().await) else {
        return;
    };
    header.set("TELRA", ra, "Telescope RA [hours]");
    header.set("TELDEC", dec, "Telescope Dec [deg]");
    header.set("TELRAIC", format_hms(ra), "Telescope RA [hms]");
    header.set("TELDECIC", format_dms(dec), "Telescope Dec [dms]");

    let site = state.site();
    let now = Utc::now();
    let (alt, az) = state.sky().to_horizontal(&site, ra, dec, now);
    let ha = state.sky().hour_angle(&site, ra, now);
    header.set("OBJCTALT", alt, "Object altitude [deg]");
    header.set("OBJCTAZ", az, "Object azimuth [deg]");
    header.set("OBJCTHA", ha, "Object hour angle [hours]");
    header.set("TELLST", state.sky().local_sidereal_time(&site, now), "Local sidereal time [hours]");
    let airmass = (alt > 0.0).then(|| calculate_airmass(alt));
    header.set("AIRMASS", airmass, "Airmass");
}

async fn cover_calibrator_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(panel) = &state.devices().cover_calibrator else {
        return;
    };
    let panel = panel.device();
    let connected = is_connected(panel.as_ref()).await;
    header.set("CCALCONN", connected, "Cover calibrator connected");
    if !connected {
        return;
    }
    let calibrator = panel.calibrator_state().await.map(|s| format!("{:?}", s));
    let cover = panel.cover_state().await.map(|s| format!("{:?}", s));
    header.set("CALSTATE", value(calibrator), "Calibrator state");
    header.set("COVSTATE", value(cover), "Cover state");
    header.set("BRIGHT", value(panel.brightness().await), "Calibrator brightness");
}

async fn dome_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(dome) = &state.devices().dome else {
        return;
    };
    let dome = dome.device();
    let connected = is_connected(dome.as_ref()).await;
    header.set("DOMECONN", connected, "Dome connected");
    if !connected {
        return;
    }
    let shutter = dome.shutter_status().await.map(|s| format!("{:?}", s));
    header.set("DOMENAME", dome.info().name.as_str(), "Dome name");
    header.set("DOMEALT", value(dome.altitude().await), "Dome altitude [deg]");
    header.set("DOMEAZ", value(dome.azimuth().await), "Dome azimuth [deg]");
    header.set("DOMESHUT", value(shutter), "Dome shutter status");
    header.set("DOMESLEW", value(dome.is_slewing().await), "Is dome slewing");
    header.set("DOMESLAV", value(dome.slaved().await), "Is dome slaved to telescope");
    header.set("DOMEHOME", value(dome.at_home().await), "Is dome at home position");
    header.set("DOMEPARK", value(dome.at_park().await), "Is dome at park position");
}

async fn filter_wheel_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(wheel) = &state.devices().filter_wheel else {
        return;
    };
    let wheel = wheel.device();
    let connected = is_connected(wheel.as_ref()).await;
    header.set("FWCONN", connected, "Filter wheel connected");
    if !connected {
        return;
    }
    let position = wheel.position().await.ok().flatten();
    let filter = position.and_then(|p| state.filters().get(p).cloned());
    header.set("FWPOS", position, "Filter wheel position");
    header.set("FILTER", filter, "Filter name");
    header.set("FOCOFFCG", state.current_focus_offset(), "Filter focus offset applied");
}

async fn focuser_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(focuser) = &state.devices().focuser else {
        return;
    };
    let focuser = focuser.device();
    let connected = is_connected(focuser.as_ref()).await;
    header.set("FOCCONN", connected, "Focuser connected");
    if !connected {
        return;
    }
    header.set("FOCPOS", value(focuser.position().await), "Focuser position");
    header.set("FOCMOV", value(focuser.is_moving().await), "Is focuser moving");
    let temperature = focuser.temperature().await.ok().flatten();
    header.set("FOCTEMP", temperature, "Focuser temperature [C]");
}

async fn observing_conditions_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(station) = &state.devices().observing_conditions else {
        return;
    };
    let station = station.device();
    let connected = is_connected(station.as_ref()).await;
    header.set("WXCONN", connected, "Observing conditions connected");
    if !connected {
        return;
    }
    let reading = station.reading().await.unwrap_or_default();
    header.set("WXTEMP", reading.temperature, "Ambient temperature [C]");
    header.set("WXHUM", reading.humidity, "Relative humidity [%]");
    header.set("WXPRES", reading.pressure, "Atmospheric pressure [hPa]");
    header.set("WXDEW", reading.dew_point, "Dew point [C]");
    header.set("WXWIND", reading.wind_speed, "Wind speed [m/s]");
    header.set("WXWINDIR", reading.wind_direction, "Wind direction [deg]");
    header.set("WXCLD", reading.cloud_cover, "Cloud cover [%]");
    header.set("WXSKY", reading.sky_quality, "Sky quality [mag/arcsec^2]");
    header.set("WXRAIN", reading.rain_rate, "Rain rate [mm/hr]");
}

async fn rotator_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let Some(rotator) = &state.devices().rotator else {
        return;
    };
    let rotator = rotator.device();
    let connected = is_connected(rotator.as_ref()).await;
    header.set("ROTCONN", connected, "Rotator connected");
    if !connected {
        return;
    }
    header.set("ROTPOS", value(rotator.position().await), "Rotator position [deg]");
    header.set("ROTMECHP", value(rotator.mechanical_position().await), "Rotator mechanical position [deg]");
    header.set("ROTTARGP", value(rotator.target_position().await), "Rotator target position [deg]");
    header.set("ROTMOV", value(rotator.is_moving().await), "Is rotator moving");
    header.set("ROTREVSE", value(rotator.reverse().await), "Is rotator reversed");
}

async fn safety_monitor_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    for (i, monitor) in state.devices().safety_monitors.iter().enumerate() {
        let monitor = monitor.device();
        let connected = is_connected(monitor.as_ref()).await;
        header.set(&format!("SM{}CONN", i), connected, "Safety monitor connected");
        if !connected {
            continue;
        }
        header.set(&format!("SM{}NAME", i), monitor.info().name.as_str(), "Safety monitor name");
        header.set(&format!("SM{}ISSAF", i), value(monitor.is_safe().await), "Safety monitor safe");
    }
}

async fn switch_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    for (i, switch) in state.devices().switches.iter().enumerate() {
        let switch = switch.device();
        let connected = is_connected(switch.as_ref()).await;
        header.set(&format!("SW{}CONN", i), connected, "Switch connected");
        if !connected {
            continue;
        }
        header.set(&format!("SW{}NAME", i), switch.info().name.as_str(), "Switch name");
        let channels = switch.max_switch().await.unwrap_or(0);
        for j in 0..channels.min(10) {
            let name = switch.switch_name(j).await.unwrap_or_else(|_| format!("switch {}", j));
            header.set(&format!("SW{}SW{}", i, j), value(switch.get_switch(j).await), &name);
        }
    }
}

fn thread_cards(status: LoopStatus, header: &mut FitsHeader) {
    header.set("DEROTATE", status.derotation, "Is derotation thread active");
    header.set("OCTHREAD", status.observing_conditions, "Is observing conditions thread active");
    header.set("SMTHREAD", status.safety_monitor, "Is safety monitor thread active");
}

fn software_cards(state: &ObservatoryState, header: &mut FitsHeader) {
    let devices = state.devices();
    header.set("SWCREATE", "Starwatch", "Software used to create file");
    header.set("SWVERSIO", env!("CARGO_PKG_VERSION"), "Version of software used to create file");
    header.set("ROWORDER", "TOP-DOWN", "Row order of image");
    let solvers: Vec<String> = devices.solvers.iter().map(|s| s.name()).collect();
    let solvers = (!solvers.is_empty()).then(|| solvers.join(","));
    header.set("WCSDRV", solvers, "WCS driver");
    header.set("AUTOFDRV", devices.autofocus.as_ref().map(|a| a.name()), "Autofocus driver");
}

/// Build the full status header
pub async fn snapshot(state: &ObservatoryState, loops: LoopStatus) -> FitsHeader {
    let mut header = FitsHeader::new();
    software_cards(state, &mut header);
    observatory_cards(state, &mut header).await;
    camera_cards(state, &mut header).await;
    telescope_cards(state, &mut header).await;
    cover_calibrator_cards(state, &mut header).await;
    dome_cards(state, &mut header).await;
    filter_wheel_cards(state, &mut header).await;
    focuser_cards(state, &mut header).await;
    observing_conditions_cards(state, &mut header).await;
    rotator_cards(state, &mut header).await;
    safety_monitor_cards(state, &mut header).await;
    switch_cards(state, &mut header).await;
    thread_cards(loops, &mut header);
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservatoryConfig;
    use crate::state::Devices;
    use starwatch_devices::sim::*;
    use std::sync::Arc;

    #[test]
    fn test_sexagesimal() {
        assert_eq!(format_hms(12.5), "12 30 00.00");
        assert_eq!(format_hms(23.999_999_999), "00 00 00.00");
        assert_eq!(format_dms(-45.5), "-45 30 00.0");
        assert_eq!(format_dms(7.25), "+07 15 00.0");
    }

    #[tokio::test]
    async fn test_snapshot_reports_offline_and_online_devices() {
        let mount = Arc::new(SimMount::new("mount"));
        let dome = Arc::new(SimDome::new("dome"));
        let monitor = Arc::new(SimSafetyMonitor::always_safe("roof"));
        mount.set_connected(true).await.unwrap();
        monitor.set_connected(true).await.unwrap();
        mount.set_pointing(6.0, -30.0);
        let state = ObservatoryState::new(
            Devices::default()
                .with_telescope(mount)
                .with_dome(dome)
                .with_safety_monitor(monitor),
            ObservatoryConfig::default(),
        );

        let header = snapshot(&state, LoopStatus::default()).await;

        assert_eq!(header.get_str("OBSNAME"), Some("Starwatch Site"));
        assert_eq!(header.get_bool("TELCONN"), Some(true));
        assert_eq!(header.get_str("TELRAIC"), Some("06 00 00.00"));
        assert_eq!(header.get_str("TELDECIC"), Some("-30 00 00.0"));
        assert_eq!(header.get_bool("DOMECONN"), Some(false));
        assert!(header.get("DOMEAZ").is_none());
        assert_eq!(header.get_bool("SM0ISSAF"), Some(true));
        assert_eq!(header.get_bool("DEROTATE"), Some(false));
        assert_eq!(header.get("XPIXSCAL"), Some(&CardValue::Undefined));
        assert!(header.get("CAMCON").is_none());
    }
}
