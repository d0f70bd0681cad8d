//! Registry inspection and out-of-band edits

use agent_lib::{check_interval, registry::DeviceRegistry, Device};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    color_pending, format_interval, format_last_seen, print_info, print_json, print_success,
    print_table, OutputFormat,
};

/// Row for the devices table
#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Identifier")]
    id: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Interval")]
    interval: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Last seen")]
    last_seen: String,
}

#[derive(Serialize)]
struct DeviceJson<'a> {
    id: &'a str,
    name: &'a str,
    address: &'a str,
    interval_secs: u64,
    prev_interval_secs: u64,
    pending: bool,
    last_seen: Option<String>,
}

/// List registered devices, optionally only one interval bucket
pub async fn list_devices(
    registry: &dyn DeviceRegistry,
    interval: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let devices = match interval {
        Some(secs) => registry.list_by_interval(secs).await,
        None => registry.list_all().await,
    }
    .context("Failed to list devices")?;

    match format {
        OutputFormat::Json => {
            let rows: Vec<DeviceJson> = devices
                .iter()
                .map(|d| DeviceJson {
                    id: &d.id,
                    name: &d.name,
                    address: &d.address,
                    interval_secs: d.interval_secs,
                    prev_interval_secs: d.prev_interval_secs,
                    pending: d.dirty,
                    last_seen: d.last_seen.map(|at| at.to_rfc3339()),
                })
                .collect();
            print_json(&rows);
        }
        OutputFormat::Table => {
            let now = Utc::now();
            let rows: Vec<DeviceRow> = devices.iter().map(|d| device_row(d, now)).collect();
            if rows.is_empty() {
                print_info("No devices registered");
                return Ok(());
            }
            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            println!("\nTotal: {} devices", devices.len());
        }
    }
    Ok(())
}

fn device_row(device: &Device, now: chrono::DateTime<Utc>) -> DeviceRow {
    let interval = if device.dirty && device.prev_interval_secs != device.interval_secs {
        format!(
            "{} → {}",
            format_interval(device.prev_interval_secs),
            format_interval(device.interval_secs)
        )
    } else {
        format_interval(device.interval_secs)
    };
    DeviceRow {
        name: device.name.clone(),
        id: device.id.clone(),
        address: device.address.clone(),
        interval,
        change: color_pending(device.dirty),
        last_seen: format_last_seen(device.last_seen, now),
    }
}

#[derive(Serialize, Tabled)]
struct IntervalChange {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Previous")]
    previous_secs: u64,
    #[tabled(rename = "Current")]
    interval_secs: u64,
}

/// Change a device's probe interval directly in the registry
pub async fn set_interval(
    registry: &dyn DeviceRegistry,
    name: &str,
    seconds: u64,
    format: OutputFormat,
) -> Result<()> {
    if let Err(reason) = check_interval(seconds) {
        bail!(reason);
    }
    let device = find(registry, name).await?;
    let updated = registry
        .update_interval(&device.id, seconds)
        .await
        .with_context(|| format!("Failed to update interval for {}", name))?;

    let change = IntervalChange {
        name: updated.name,
        previous_secs: updated.prev_interval_secs,
        interval_secs: updated.interval_secs,
    };
    match format {
        OutputFormat::Json => print_json(&change),
        OutputFormat::Table => {
            print_table(std::slice::from_ref(&change), format);
            print_success(&format!(
                "{} now probed every {}; the running agent applies it on its next reconciliation pass",
                change.name.cyan(),
                format_interval(change.interval_secs)
            ));
        }
    }
    Ok(())
}

/// Remove a device from the registry
pub async fn delete_device(
    registry: &dyn DeviceRegistry,
    name: &str,
    format: OutputFormat,
) -> Result<()> {
    let device = find(registry, name).await?;
    registry
        .delete(&device.id)
        .await
        .with_context(|| format!("Failed to delete {}", name))?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({"deleted": device.id, "name": device.name})),
        OutputFormat::Table => {
            print_success(&format!("Deleted {} ({})", device.name.cyan(), device.id));
            print_info("A running agent keeps probing it until restart; use the delete_device command for a live removal");
        }
    }
    Ok(())
}

async fn find(registry: &dyn DeviceRegistry, name: &str) -> Result<Device> {
    match registry
        .get_by_name(name)
        .await
        .with_context(|| format!("Failed to look up {}", name))?
    {
        Some(device) => Ok(device),
        None => bail!("no device named {:?}", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_lib::{registry::MemoryRegistry, NewDevice, MAX_INTERVAL_SECS};

    fn registry() -> MemoryRegistry {
        MemoryRegistry::with_devices(vec![
            NewDevice::new("cam-1", "Lobby", "10.0.0.1"),
            NewDevice::new("cam-2", "Dock", "10.0.0.2").with_interval(30),
        ])
    }

    #[tokio::test]
    async fn test_set_interval_marks_device_pending() {
        let registry = registry();
        set_interval(&registry, "Lobby", 15, OutputFormat::Json)
            .await
            .unwrap();

        let device = registry.get_by_id("cam-1").await.unwrap().unwrap();
        assert_eq!(device.interval_secs, 15);
        assert_eq!(device.prev_interval_secs, 60);
        assert!(device.dirty);
    }

    #[tokio::test]
    async fn test_set_interval_rejects_zero_and_unknown() {
        let registry = registry();
        assert!(set_interval(&registry, "Lobby", 0, OutputFormat::Json)
            .await
            .is_err());
        assert!(set_interval(&registry, "Attic", 30, OutputFormat::Json)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_set_interval_rejects_oversized_value() {
        let registry = registry();
        for seconds in [MAX_INTERVAL_SECS + 1, u64::MAX] {
            assert!(set_interval(&registry, "Lobby", seconds, OutputFormat::Json)
                .await
                .is_err());
        }
        let device = registry.get_by_id("cam-1").await.unwrap().unwrap();
        assert_eq!(device.interval_secs, 60);
        assert!(!device.dirty);
    }

    #[tokio::test]
    async fn test_delete_device_by_name() {
        let registry = registry();
        delete_device(&registry, "Dock", OutputFormat::Json)
            .await
            .unwrap();
        assert!(registry.get_by_id("cam-2").await.unwrap().is_none());
        assert!(delete_device(&registry, "Dock", OutputFormat::Json)
            .await
            .is_err());
    }

    #[test]
    fn test_device_row_shows_pending_change() {
        colored::control::set_override(false);
        let mut device = Device {
            id: "cam-1".into(),
            name: "Lobby".into(),
            address: "10.0.0.1".into(),
            interval_secs: 30,
            prev_interval_secs: 60,
            dirty: true,
            last_seen: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        let row = device_row(&device, Utc::now());
        assert_eq!(row.interval, "1m → 30s");
        assert_eq!(row.change, "pending");

        device.dirty = false;
        assert_eq!(device_row(&device, Utc::now()).interval, "30s");
    }
}
