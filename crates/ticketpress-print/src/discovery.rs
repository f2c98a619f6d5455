// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer discovery: raw-socket printers on the local network via mDNS, BLE
// printers advertising a known print service, plus USB and Bluetooth printers
// bound to device nodes on this host.
//
// Network receipt printers advertise `_pdl-datastream._tcp.local.` (the
// JetDirect service, port 9100). Resolved services are converted into
// `DiscoveredPrinter` values that can be turned into printer profiles.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ticketpress_core::error::{Result, TicketpressError};
use ticketpress_core::types::{ConnectionParams, PrinterProfile, TransportKind};

use crate::transport::ble;

/// mDNS service type for raw TCP printers.
const RAW_SERVICE: &str = "_pdl-datastream._tcp.local.";

/// Default browse duration before the initial snapshot is returned.
pub const DEFAULT_BROWSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Where the usblp driver creates printer nodes.
const USB_DEVICE_DIR: &str = "/dev/usb";

/// Where RFCOMM serial bindings appear.
const RFCOMM_DEVICE_DIR: &str = "/dev";

/// A printer found on the network or attached to this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPrinter {
    pub name: String,
    pub connection: ConnectionParams,
    pub make_and_model: Option<String>,
}

impl DiscoveredPrinter {
    pub fn transport_kind(&self) -> TransportKind {
        self.connection.kind()
    }

    /// A profile for this printer with transport defaults.
    pub fn to_profile(&self, id: impl Into<String>) -> PrinterProfile {
        PrinterProfile::new(id, &self.name, self.connection.clone())
    }
}

type PrinterMap = Arc<Mutex<HashMap<String, DiscoveredPrinter>>>;

/// Network discovery engine using mDNS-SD.
///
/// Wraps an `mdns-sd` `ServiceDaemon` that browses for raw-socket printers.
/// Discovered printers are accumulated in a map keyed by their full service
/// name so that duplicate events are deduplicated automatically.
pub struct PrinterDiscovery {
    daemon: ServiceDaemon,
    printers: PrinterMap,
    browsing: bool,
}

impl PrinterDiscovery {
    /// Create a new discovery engine. Spawns the mDNS daemon thread but does
    /// not start browsing.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| TicketpressError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
        Ok(Self {
            daemon,
            printers: Arc::new(Mutex::new(HashMap::new())),
            browsing: false,
        })
    }

    /// Start browsing. Returns immediately; results accumulate in the
    /// background and are read with [`printers`](Self::printers).
    pub fn start(&mut self) -> Result<()> {
        if self.browsing {
            debug!("printer discovery already running");
            return Ok(());
        }

        let receiver = self
            .daemon
            .browse(RAW_SERVICE)
            .map_err(|e| TicketpressError::Discovery(format!("browse {RAW_SERVICE}: {e}")))?;

        let printers = Arc::clone(&self.printers);
        std::thread::Builder::new()
            .name("mdns-raw-printers".into())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        ServiceEvent::ServiceResolved(info) => {
                            let fullname = info.get_fullname().to_owned();
                            match service_info_to_printer(&info) {
                                Ok(printer) => {
                                    info!(
                                        name = %printer.name,
                                        endpoint = %printer.connection.endpoint(),
                                        "printer resolved"
                                    );
                                    lock(&printers).insert(fullname, printer);
                                }
                                Err(e) => {
                                    warn!(fullname = %fullname, error = %e, "unusable printer service");
                                }
                            }
                        }
                        ServiceEvent::ServiceRemoved(stype, fullname) => {
                            info!(service_type = %stype, name = %fullname, "printer removed");
                            lock(&printers).remove(&fullname);
                        }
                        ServiceEvent::SearchStopped(stype) => {
                            debug!(service_type = %stype, "mDNS search stopped");
                            break;
                        }
                        other => debug!(event = ?other, "mDNS event"),
                    }
                }
            })
            .map_err(|e| TicketpressError::Discovery(format!("spawn mDNS listener: {e}")))?;

        self.browsing = true;
        info!("mDNS printer discovery started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.browsing {
            return Ok(());
        }
        self.daemon
            .stop_browse(RAW_SERVICE)
            .map_err(|e| TicketpressError::Discovery(format!("stop browse {RAW_SERVICE}: {e}")))?;
        self.browsing = false;
        info!("mDNS printer discovery stopped");
        Ok(())
    }

    /// Shut down the mDNS daemon. The instance cannot be reused afterwards.
    pub fn shutdown(self) -> Result<()> {
        let _status_rx = self
            .daemon
            .shutdown()
            .map_err(|e| TicketpressError::Discovery(format!("daemon shutdown: {e}")))?;
        debug!("mDNS daemon shut down");
        Ok(())
    }

    /// Snapshot of the printers found so far.
    pub fn printers(&self) -> Vec<DiscoveredPrinter> {
        lock(&self.printers).values().cloned().collect()
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }
}

fn lock(map: &PrinterMap) -> std::sync::MutexGuard<'_, HashMap<String, DiscoveredPrinter>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Browse the network for `timeout`, then return what was found together with
/// any locally attached device printers.
///
/// mDNS being unavailable (no multicast interface, sandbox) is not an error;
/// the local scan still runs.
pub async fn discover(timeout: Duration) -> Vec<DiscoveredPrinter> {
    let mut found = scan_device_nodes(Path::new(USB_DEVICE_DIR), Path::new(RFCOMM_DEVICE_DIR));

    let network = PrinterDiscovery::new().and_then(|mut d| d.start().map(|()| d));
    // BLE scanning and mDNS browsing share the same window.
    let (ble, ()) = tokio::join!(ble::scan(timeout), tokio::time::sleep(timeout));
    found.extend(ble);

    match network {
        Ok(mut discovery) => {
            found.extend(discovery.printers());
            if let Err(e) = discovery.stop() {
                debug!(error = %e, "stopping discovery");
            }
            if let Err(e) = discovery.shutdown() {
                debug!(error = %e, "shutting down discovery");
            }
        }
        Err(e) => warn!(error = %e, "network discovery unavailable"),
    }

    info!(count = found.len(), "printer discovery finished");
    found
}

/// List `lp*` nodes in `usb_dir` and `rfcomm*` nodes in `rfcomm_dir`.
pub fn scan_device_nodes(usb_dir: &Path, rfcomm_dir: &Path) -> Vec<DiscoveredPrinter> {
    let mut found = Vec::new();

    for path in entries_with_prefix(usb_dir, "lp") {
        found.push(DiscoveredPrinter {
            name: format!("USB printer {}", file_name(&path)),
            connection: ConnectionParams::Usb { device_path: path },
            make_and_model: None,
        });
    }

    for path in entries_with_prefix(rfcomm_dir, "rfcomm") {
        found.push(DiscoveredPrinter {
            name: format!("Bluetooth printer {}", file_name(&path)),
            // The bound address is not visible from the node itself.
            connection: ConnectionParams::Bluetooth {
                address: String::new(),
                device_path: path,
            },
            make_and_model: None,
        });
    }

    found
}

fn entries_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| file_name(path).starts_with(prefix))
        .collect();
    paths.sort();
    paths
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Convert a resolved `ServiceInfo` into a `DiscoveredPrinter`.
///
/// TXT keys commonly found on raw-socket printers:
///   - `ty`      — make and model
///   - `product` — model in parentheses, e.g. `(TM-T88VI)`
fn service_info_to_printer(info: &ServiceInfo) -> Result<DiscoveredPrinter> {
    let fullname = info.get_fullname().to_owned();

    // Prefer IPv4 for wider printer compatibility.
    let ip: IpAddr = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied()
        .ok_or_else(|| TicketpressError::Discovery(format!("no address for service {fullname}")))?;

    let make_and_model = info
        .get_property_val_str("ty")
        .or_else(|| info.get_property_val_str("product"))
        .map(clean_model);

    Ok(DiscoveredPrinter {
        name: instance_name(&fullname),
        connection: ConnectionParams::Network {
            host: ip.to_string(),
            port: info.get_port(),
        },
        make_and_model,
    })
}

/// `"Gate 1._pdl-datastream._tcp.local."` -> `"Gate 1"`
fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(RAW_SERVICE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn clean_model(raw: &str) -> String {
    raw.trim().trim_start_matches('(').trim_end_matches(')').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_service_type() {
        assert_eq!(instance_name("Gate 1._pdl-datastream._tcp.local."), "Gate 1");
        assert_eq!(instance_name("odd-name"), "odd-name");
    }

    #[test]
    fn product_parentheses_are_removed() {
        assert_eq!(clean_model("(TM-T88VI)"), "TM-T88VI");
    }

    #[test]
    fn device_scan_finds_printer_nodes() {
        let usb = tempfile::tempdir().expect("tempdir");
        let dev = tempfile::tempdir().expect("tempdir");
        std::fs::write(usb.path().join("lp0"), b"").expect("lp0");
        std::fs::write(usb.path().join("hiddev0"), b"").expect("hiddev0");
        std::fs::write(dev.path().join("rfcomm0"), b"").expect("rfcomm0");
        std::fs::write(dev.path().join("ttyS0"), b"").expect("ttyS0");

        let found = scan_device_nodes(usb.path(), dev.path());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].transport_kind(), TransportKind::Usb);
        assert_eq!(found[1].transport_kind(), TransportKind::Bluetooth);
        assert_eq!(found[0].name, "USB printer lp0");
    }

    #[test]
    fn missing_device_dirs_are_empty() {
        let found = scan_device_nodes(Path::new("/nonexistent/a"), Path::new("/nonexistent/b"));
        assert!(found.is_empty());
    }

    #[test]
    fn discovered_bluetooth_printer_gets_portable_defaults() {
        let printer = DiscoveredPrinter {
            name: "Handheld".into(),
            connection: ConnectionParams::Bluetooth {
                address: String::new(),
                device_path: "/dev/rfcomm0".into(),
            },
            make_and_model: None,
        };
        let profile = printer.to_profile("bt-1");
        assert_eq!(profile.capabilities.line_width, 32);
        assert!(!profile.settings.cut_paper);
    }
}
