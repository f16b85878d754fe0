//! Process-wide environment handling

use anyhow::Result;

use crate::training::device::VISIBLE_DEVICE_VARS;

/// Restrict which GPUs the runtime may use
///
/// Sets every variable in [`VISIBLE_DEVICE_VARS`] to `devices`. Must run
/// before any device is initialised.
pub fn apply_visible_devices(devices: &str) -> Result<()> {
    let devices = devices.trim();
    if devices.is_empty() {
        anyhow::bail!("Visible device list is empty");
    }
    if !devices
        .split(',')
        .all(|d| !d.trim().is_empty() && d.trim().chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
    {
        anyhow::bail!("Invalid visible device list: {}", devices);
    }

    for var in VISIBLE_DEVICE_VARS {
        tracing::debug!("Setting {}={}", var, devices);
        std::env::set_var(var, devices);
    }
    Ok(())
}
