//! Startup sequencing: read the fleet once, announce it, then schedule it

use agent_lib::{gateway::Gateway, registry::DeviceRegistry, schedule::Scheduler, Device};
use anyhow::{Context, Result};
use tracing::{info, warn};

/// Read every registered device, one interval bucket at a time
///
/// The returned list is the single view of the fleet used for both gateway
/// announcements and scheduling. Anything registered afterwards is left to
/// the reconciler.
pub async fn read_fleet(registry: &dyn DeviceRegistry) -> Result<Vec<Device>> {
    let intervals = registry
        .list_distinct_intervals()
        .await
        .context("failed to list probe intervals")?;

    let mut devices = Vec::new();
    for interval_secs in intervals {
        let bucket = registry
            .list_by_interval(interval_secs)
            .await
            .with_context(|| format!("failed to load {interval_secs}s bucket"))?;
        devices.extend(bucket);
    }
    Ok(devices)
}

/// Announce the totals device and every device in `devices`
///
/// On failure the devices announced so far are disconnected again.
pub async fn connect_fleet(
    gateway: &dyn Gateway,
    totals_device: &str,
    profile: &str,
    devices: &[Device],
) -> Result<Vec<String>> {
    let mut connected = Vec::with_capacity(devices.len() + 1);
    let names = std::iter::once(totals_device).chain(devices.iter().map(|d| d.name.as_str()));

    for name in names {
        if let Err(err) = gateway.connect_device(name, profile).await {
            disconnect_fleet(gateway, &connected).await;
            return Err(err).with_context(|| format!("failed to connect device {name}"));
        }
        connected.push(name.to_string());
    }

    info!(devices = devices.len(), "Devices connected on gateway");
    Ok(connected)
}

pub async fn disconnect_fleet(gateway: &dyn Gateway, names: &[String]) {
    for name in names {
        if let Err(err) = gateway.disconnect_device(name).await {
            warn!(device = %name, error = %err, "Failed to disconnect device");
        }
    }
}

/// Put `devices` into their buckets and start one driver per interval
///
/// Returns the number of drivers started.
pub async fn load_schedule(
    scheduler: &Scheduler,
    registry: &dyn DeviceRegistry,
    devices: Vec<Device>,
) -> Result<usize> {
    // the loaded state already reflects any pending out-of-band edits
    let cleared = registry
        .clear_dirty(&devices)
        .await
        .context("failed to clear dirty markers")?;
    if cleared > 0 {
        info!(cleared, "Pending registry edits applied at startup");
    }

    Ok(scheduler.load(devices).await)
}
