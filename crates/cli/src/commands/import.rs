//! Bulk device provisioning from CSV device lists
//!
//! Device lists are exported from the site survey spreadsheet: the display
//! name sits in column 0, the identifier in column 2 and the address in a
//! configurable column. Header rows carry the literal `UUID` in the
//! identifier column.

use std::io::Read;
use std::path::Path;

use agent_lib::{check_interval, registry::DeviceRegistry, NewDevice, RegistryError};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use tabled::Tabled;
use thiserror::Error;

use crate::output::{print_info, print_json, print_success, print_table, print_warning, OutputFormat};

const NAME_COLUMN: usize = 0;
const ID_COLUMN: usize = 2;
const HEADER_MARKER: &str = "UUID";

/// One device described by a CSV row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvDevice {
    pub name: String,
    pub id: String,
    pub address: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("line {line}: missing column {column}")]
    MissingColumn { line: u64, column: usize },

    #[error("line {line}: empty {field}")]
    Empty { line: u64, field: &'static str },

    #[error("line {line}: {message}")]
    Malformed { line: u64, message: String },
}

/// Rows of a device list, split into usable devices and rejected rows
#[derive(Debug, Default)]
pub struct DeviceList {
    pub devices: Vec<CsvDevice>,
    pub rejected: Vec<RowError>,
}

/// Parse a headerless device list
pub fn parse_device_list(input: impl Read, address_column: usize) -> DeviceList {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut list = DeviceList::default();
    for (index, record) in reader.records().enumerate() {
        let line = index as u64 + 1;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                list.rejected.push(RowError::Malformed {
                    line,
                    message: err.to_string(),
                });
                continue;
            }
        };

        if record.get(ID_COLUMN).map(str::trim) == Some(HEADER_MARKER) {
            continue;
        }
        // blank spacer rows
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }

        match device_from_record(&record, line, address_column) {
            Ok(device) => list.devices.push(device),
            Err(err) => list.rejected.push(err),
        }
    }
    list
}

fn device_from_record(
    record: &csv::StringRecord,
    line: u64,
    address_column: usize,
) -> Result<CsvDevice, RowError> {
    let cell = |column: usize, field: &'static str| -> Result<String, RowError> {
        let value = record
            .get(column)
            .ok_or(RowError::MissingColumn { line, column })?
            .trim();
        if value.is_empty() {
            return Err(RowError::Empty { line, field });
        }
        Ok(value.to_string())
    };

    Ok(CsvDevice {
        name: cell(NAME_COLUMN, "name")?,
        id: cell(ID_COLUMN, "identifier")?,
        address: cell(address_column, "address")?,
    })
}

fn read_device_list(path: &Path, address_column: usize) -> Result<DeviceList> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open device list {}", path.display()))?;
    Ok(parse_device_list(file, address_column))
}

#[derive(Debug, Serialize, Tabled)]
struct ImportRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Identifier")]
    id: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Result")]
    result: String,
}

/// Create every listed device as a pending out-of-band edit
pub async fn import_devices(
    registry: &dyn DeviceRegistry,
    path: &Path,
    address_column: usize,
    interval_secs: u64,
    format: OutputFormat,
) -> Result<()> {
    if let Err(reason) = check_interval(interval_secs) {
        bail!(reason);
    }
    let list = read_device_list(path, address_column)?;
    for rejected in &list.rejected {
        print_warning(&format!("Skipping row: {rejected}"));
    }

    let mut rows = Vec::with_capacity(list.devices.len());
    let mut created = 0;
    for device in list.devices {
        let new_device = NewDevice::new(&device.id, &device.name, &device.address)
            .with_interval(interval_secs);
        let result = match new_device.validate() {
            Err(reason) => format!("invalid: {reason}"),
            Ok(()) => match registry.create(new_device, true).await {
                Ok(_) => {
                    created += 1;
                    "created".to_string()
                }
                Err(RegistryError::Conflict(reason)) => format!("skipped: {reason}"),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to import device {}", device.name))
                }
            },
        };
        rows.push(ImportRow {
            name: device.name,
            id: device.id,
            address: device.address,
            result,
        });
    }

    print_table(&rows, format);
    if matches!(format, OutputFormat::Table) {
        print_success(&format!("Imported {} of {} devices", created, rows.len()));
        print_info("A running agent picks new devices up on its next reconciliation pass");
    }
    Ok(())
}

/// Entry written for devices the registry does not know yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDevice {
    pub name: String,
    pub id: String,
    pub ip: String,
    pub ping_period: u64,
}

/// Report listed devices whose name is not registered and save them as JSON
pub async fn missing_devices(
    registry: &dyn DeviceRegistry,
    path: &Path,
    address_column: usize,
    interval_secs: u64,
    output: &Path,
    format: OutputFormat,
) -> Result<()> {
    let list = read_device_list(path, address_column)?;
    for rejected in &list.rejected {
        print_warning(&format!("Skipping row: {rejected}"));
    }

    let mut missing = Vec::new();
    for device in list.devices {
        if registry.get_by_name(&device.name).await?.is_none() {
            missing.push(MissingDevice {
                name: device.name,
                id: device.id,
                ip: device.address,
                ping_period: interval_secs,
            });
        }
    }

    let json = serde_json::to_string_pretty(&missing).context("Failed to encode missing devices")?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    match format {
        OutputFormat::Json => print_json(&missing),
        OutputFormat::Table => {
            for device in &missing {
                println!("{}  {}  {}", device.name, device.id, device.ip);
            }
            print_info(&format!(
                "{} unregistered devices written to {}",
                missing.len(),
                output.display()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SURVEY: &str = "\
Title,Zone,UUID,Model,IP,Spare IP
Lobby,North,cam-1,X1,10.0.0.1,10.1.0.1
Dock,South,cam-2,X1,10.0.0.2,10.1.0.2
";

    #[test]
    fn test_header_rows_are_skipped() {
        let list = parse_device_list(SURVEY.as_bytes(), 4);
        assert!(list.rejected.is_empty());
        assert_eq!(
            list.devices,
            vec![
                CsvDevice {
                    name: "Lobby".into(),
                    id: "cam-1".into(),
                    address: "10.0.0.1".into(),
                },
                CsvDevice {
                    name: "Dock".into(),
                    id: "cam-2".into(),
                    address: "10.0.0.2".into(),
                },
            ]
        );
    }

    #[test]
    fn test_address_column_is_configurable() {
        let list = parse_device_list(SURVEY.as_bytes(), 5);
        assert_eq!(list.devices[0].address, "10.1.0.1");
    }

    #[test]
    fn test_short_and_blank_rows() {
        let input = "Gate,East,cam-3\n,,,,\nYard,West,,X2,10.0.0.4\n";
        let list = parse_device_list(input.as_bytes(), 4);
        assert!(list.devices.is_empty());
        assert_eq!(
            list.rejected,
            vec![
                RowError::MissingColumn { line: 1, column: 4 },
                RowError::Empty {
                    line: 3,
                    field: "identifier",
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_import_creates_pending_devices_and_skips_conflicts() {
        use agent_lib::registry::MemoryRegistry;

        let registry = MemoryRegistry::with_devices(vec![NewDevice::new("cam-9", "Dock", "10.0.0.9")]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.csv");
        std::fs::write(&path, SURVEY).unwrap();

        import_devices(&registry, &path, 4, 30, OutputFormat::Json)
            .await
            .unwrap();

        let lobby = registry.get_by_id("cam-1").await.unwrap().unwrap();
        assert!(lobby.dirty);
        assert_eq!(lobby.interval_secs, 30);
        // name already taken by cam-9
        assert!(registry.get_by_id("cam-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_writes_unregistered_devices() {
        use agent_lib::registry::MemoryRegistry;

        let registry = MemoryRegistry::with_devices(vec![NewDevice::new("cam-1", "Lobby", "10.0.0.1")]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.csv");
        let output = dir.path().join("data.json");
        std::fs::write(&path, SURVEY).unwrap();

        missing_devices(&registry, &path, 4, 60, &output, OutputFormat::Json)
            .await
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(
            written,
            serde_json::json!([
                {"name": "Dock", "id": "cam-2", "ip": "10.0.0.2", "ping_period": 60}
            ])
        );
    }
}
