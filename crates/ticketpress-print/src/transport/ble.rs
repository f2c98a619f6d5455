// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bluetooth Low Energy transport for portable receipt printers.
//
// Opening the link scans for the printer's address, connects, runs GATT
// service discovery and picks the characteristic that accepts print data.
// Every write is one GATT write of at most 20 bytes (the default ATT MTU of
// 23 less the 3-byte header). Splitting is the connection manager's job, so
// a larger write is refused rather than silently truncated.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ticketpress_core::error::{ConnectionError, TransmissionError};
use ticketpress_core::types::{ConnectionParams, PrinterReadiness, TransportKind};

use super::Transport;
use crate::discovery::DiscoveredPrinter;

/// Largest GATT write without MTU negotiation.
pub const BLE_MAX_PAYLOAD: usize = 20;

/// How often the adapter's peripheral list is checked while scanning.
const SCAN_POLL: Duration = Duration::from_millis(250);

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB | ((short as u128) << 96))
}

/// Service and write characteristic pairs used by common thermal printers.
pub const KNOWN_PRINT_SERVICES: &[(Uuid, Uuid)] = &[
    (short_uuid(0x18F0), short_uuid(0x2AF1)),
    (short_uuid(0xFF00), short_uuid(0xFF02)),
    (short_uuid(0xAE30), short_uuid(0xAE01)),
    (short_uuid(0xFFE0), short_uuid(0xFFE1)),
];

/// What service discovery reported about one characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub write: bool,
    pub write_without_response: bool,
}

impl GattCharacteristic {
    fn writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

impl From<&Characteristic> for GattCharacteristic {
    fn from(c: &Characteristic) -> Self {
        Self {
            service: c.service_uuid,
            uuid: c.uuid,
            write: c.properties.contains(CharPropFlags::WRITE),
            write_without_response: c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        }
    }
}

/// Index of the characteristic print data should go to.
///
/// A configured UUID wins if it is writable. Otherwise a known printer
/// service is preferred, then any characteristic that takes writes without
/// response, then any writable one.
pub fn select_write_characteristic(
    chars: &[GattCharacteristic],
    preferred: Option<Uuid>,
) -> Option<usize> {
    if let Some(wanted) = preferred {
        if let Some(i) = writable_where(chars, |c| c.uuid == wanted) {
            return Some(i);
        }
        warn!(characteristic = %wanted, "configured characteristic not writable, choosing another");
    }
    KNOWN_PRINT_SERVICES
        .iter()
        .find_map(|(service, uuid)| writable_where(chars, |c| c.service == *service && c.uuid == *uuid))
        .or_else(|| writable_where(chars, |c| c.write_without_response))
        .or_else(|| writable_where(chars, |_| true))
}

fn writable_where(
    chars: &[GattCharacteristic],
    pred: impl Fn(&GattCharacteristic) -> bool,
) -> Option<usize> {
    chars.iter().position(|c| c.writable() && pred(c))
}

fn open_error(endpoint: &str, e: btleplug::Error) -> ConnectionError {
    let message = format!("{endpoint}: {e}");
    match e {
        btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied(message),
        btleplug::Error::TimedOut(_) => ConnectionError::Timeout(message),
        _ => ConnectionError::NotFound(message),
    }
}

fn write_error(endpoint: &str, e: btleplug::Error) -> TransmissionError {
    let message = format!("{endpoint}: {e}");
    match e {
        btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => {
            TransmissionError::link_lost(message)
        }
        _ => TransmissionError::new(message),
    }
}

struct BleLink {
    peripheral: Peripheral,
    target: Characteristic,
    write_type: WriteType,
}

pub struct BleTransport {
    address: String,
    preferred: Option<Uuid>,
    connect_timeout: Duration,
    link: Option<BleLink>,
}

impl BleTransport {
    pub fn new(address: String, preferred: Option<Uuid>, connect_timeout: Duration) -> Self {
        Self {
            address,
            preferred,
            connect_timeout,
            link: None,
        }
    }

    async fn establish(&self) -> Result<BleLink, ConnectionError> {
        let endpoint = self.endpoint();
        let adapter = first_adapter()
            .await
            .map_err(|e| open_error(&endpoint, e))?
            .ok_or_else(|| ConnectionError::NotFound(format!("{endpoint}: no Bluetooth adapter")))?;

        let peripheral = find_peripheral(&adapter, &self.address, self.connect_timeout)
            .await
            .map_err(|e| open_error(&endpoint, e))?
            .ok_or_else(|| ConnectionError::NotFound(format!("{endpoint}: not advertising")))?;

        let setup = async {
            peripheral.connect().await?;
            peripheral.discover_services().await
        };
        tokio::time::timeout(self.connect_timeout, setup)
            .await
            .map_err(|_| ConnectionError::Timeout(format!("{endpoint}: GATT connect")))?
            .map_err(|e| open_error(&endpoint, e))?;

        let mut chars: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();
        let summary: Vec<GattCharacteristic> = chars.iter().map(GattCharacteristic::from).collect();
        let Some(index) = select_write_characteristic(&summary, self.preferred) else {
            if let Err(e) = peripheral.disconnect().await {
                debug!(printer = %endpoint, error = %e, "disconnect after failed discovery");
            }
            return Err(ConnectionError::NotFound(format!(
                "{endpoint}: no writable GATT characteristic"
            )));
        };
        let write_type = if summary[index].write_without_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        let target = chars.swap_remove(index);

        Ok(BleLink {
            peripheral,
            target,
            write_type,
        })
    }
}

async fn first_adapter() -> btleplug::Result<Option<Adapter>> {
    let manager = Manager::new().await?;
    Ok(manager.adapters().await?.into_iter().next())
}

/// Scan until a peripheral with `address` shows up or `window` runs out.
async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    window: Duration,
) -> btleplug::Result<Option<Peripheral>> {
    adapter.start_scan(ScanFilter::default()).await?;
    let search = async {
        loop {
            for peripheral in adapter.peripherals().await? {
                if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                    return Ok::<_, btleplug::Error>(peripheral);
                }
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    };
    let found = tokio::time::timeout(window, search).await;
    if let Err(e) = adapter.stop_scan().await {
        debug!(error = %e, "stopping BLE scan");
    }
    match found {
        Ok(found) => found.map(Some),
        Err(_) => Ok(None),
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn endpoint(&self) -> String {
        format!("{} (BLE)", self.address)
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.close().await;
        let link = self.establish().await?;
        info!(
            printer = %self.endpoint(),
            service = %link.target.service_uuid,
            characteristic = %link.target.uuid,
            "BLE printer connected"
        );
        self.link = Some(link);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransmissionError> {
        let endpoint = self.endpoint();
        if bytes.len() > BLE_MAX_PAYLOAD {
            return Err(TransmissionError::new(format!(
                "{endpoint}: {} bytes exceed the {BLE_MAX_PAYLOAD}-byte GATT write",
                bytes.len()
            )));
        }
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| TransmissionError::link_lost(format!("{endpoint} is not connected")))?;
        link.peripheral
            .write(&link.target, bytes, link.write_type)
            .await
            .map_err(|e| write_error(&endpoint, e))
    }

    /// Portable BLE printers do not answer DLE EOT over GATT.
    async fn query_status(&mut self) -> Option<PrinterReadiness> {
        None
    }

    async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            match link.peripheral.disconnect().await {
                Ok(()) => debug!(printer = %self.address, "BLE link closed"),
                Err(e) => debug!(printer = %self.address, error = %e, "BLE disconnect failed"),
            }
        }
    }

    fn max_payload(&self) -> Option<usize> {
        Some(BLE_MAX_PAYLOAD)
    }
}

/// Scan for `window` and report peripherals advertising a known print
/// service. No adapter, or no permission to use it, yields nothing.
pub async fn scan(window: Duration) -> Vec<DiscoveredPrinter> {
    match scan_inner(window).await {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, "BLE discovery unavailable");
            Vec::new()
        }
    }
}

async fn scan_inner(window: Duration) -> btleplug::Result<Vec<DiscoveredPrinter>> {
    let Some(adapter) = first_adapter().await? else {
        debug!("no Bluetooth adapter, skipping BLE scan");
        return Ok(Vec::new());
    };
    let filter = ScanFilter {
        services: KNOWN_PRINT_SERVICES.iter().map(|(service, _)| *service).collect(),
    };
    adapter.start_scan(filter).await?;
    tokio::time::sleep(window).await;
    let peripherals = adapter.peripherals().await?;
    if let Err(e) = adapter.stop_scan().await {
        debug!(error = %e, "stopping BLE scan");
    }

    let mut found = Vec::new();
    for peripheral in peripherals {
        let address = peripheral.address().to_string();
        let name = peripheral
            .properties()
            .await?
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| format!("BLE printer {address}"));
        found.push(DiscoveredPrinter {
            name,
            connection: ConnectionParams::Ble {
                address,
                write_characteristic: None,
            },
            make_and_model: None,
        });
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic(service: u16, uuid: u16, write: bool, without_response: bool) -> GattCharacteristic {
        GattCharacteristic {
            service: short_uuid(service),
            uuid: short_uuid(uuid),
            write,
            write_without_response: without_response,
        }
    }

    #[test]
    fn short_uuids_expand_onto_the_base_uuid() {
        assert_eq!(
            short_uuid(0x2AF1).to_string(),
            "00002af1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn known_print_characteristic_is_preferred() {
        let chars = [
            characteristic(0x180A, 0x2A29, false, false),
            characteristic(0x1234, 0x5678, false, true),
            characteristic(0x18F0, 0x2AF1, true, true),
        ];
        assert_eq!(select_write_characteristic(&chars, None), Some(2));
    }

    #[test]
    fn configured_characteristic_wins() {
        let chars = [
            characteristic(0x18F0, 0x2AF1, true, true),
            characteristic(0xABCD, 0xABCE, true, false),
        ];
        assert_eq!(
            select_write_characteristic(&chars, Some(short_uuid(0xABCE))),
            Some(1)
        );
    }

    #[test]
    fn unwritable_configured_characteristic_falls_back() {
        let chars = [
            characteristic(0x180A, 0x2A29, false, false),
            characteristic(0xFF00, 0xFF02, false, true),
        ];
        assert_eq!(
            select_write_characteristic(&chars, Some(short_uuid(0x2A29))),
            Some(1)
        );
    }

    #[test]
    fn unknown_printer_prefers_write_without_response() {
        let chars = [
            characteristic(0x1111, 0x2222, true, false),
            characteristic(0x1111, 0x3333, false, true),
        ];
        assert_eq!(select_write_characteristic(&chars, None), Some(1));

        let only_acknowledged = [characteristic(0x1111, 0x2222, true, false)];
        assert_eq!(select_write_characteristic(&only_acknowledged, None), Some(0));
    }

    #[test]
    fn read_only_device_has_no_target() {
        let chars = [characteristic(0x180A, 0x2A29, false, false)];
        assert_eq!(select_write_characteristic(&chars, None), None);
        assert_eq!(select_write_characteristic(&[], None), None);
    }

    #[tokio::test]
    async fn payload_limit_and_unknown_readiness() {
        let mut t = BleTransport::new("AA:BB:CC:DD:EE:FF".into(), None, Duration::from_secs(1));
        assert_eq!(t.max_payload(), Some(BLE_MAX_PAYLOAD));
        assert_eq!(t.kind(), TransportKind::Ble);
        assert_eq!(t.query_status().await, None);

        let err = t.write(&[0u8; 21]).await.expect_err("too large");
        assert!(!err.link_lost);
        let err = t.write(&[0u8; 20]).await.expect_err("not connected");
        assert!(err.link_lost);
    }

    #[test]
    fn dropped_device_is_link_lost() {
        assert!(write_error("printer", btleplug::Error::NotConnected).link_lost);
        assert!(!write_error("printer", btleplug::Error::NotSupported("x".into())).link_lost);
        assert!(matches!(
            open_error("printer", btleplug::Error::PermissionDenied),
            ConnectionError::PermissionDenied(_)
        ));
    }
}
