// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bluetooth transport for portable receipt printers.
//
// The printer is paired and bound to an RFCOMM serial node (`/dev/rfcomm0`)
// outside the engine. Portable printers have tiny receive buffers, so the
// link advertises a small payload limit and the connection manager paces
// chunks accordingly. They rarely answer DLE EOT, so readiness is unknown.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use ticketpress_core::error::{ConnectionError, TransmissionError};
use ticketpress_core::types::{PrinterReadiness, TransportKind};

use super::{Transport, open_error, write_error};

/// Bytes per write most portable printers accept without dropping data.
pub const BLUETOOTH_MAX_PAYLOAD: usize = 20;

pub struct BluetoothTransport {
    address: String,
    device_path: PathBuf,
    port: Option<File>,
    connect_timeout: Duration,
}

impl BluetoothTransport {
    pub fn new(address: String, device_path: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            address,
            device_path,
            port: None,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for BluetoothTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn endpoint(&self) -> String {
        format!("{} ({})", self.address, self.device_path.display())
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.port = None;
        let endpoint = self.endpoint();
        // Opening an RFCOMM node blocks until the radio link is up.
        let port = tokio::time::timeout(
            self.connect_timeout,
            OpenOptions::new().write(true).open(&self.device_path),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(format!("pairing link to {endpoint}")))?
        .map_err(|e| open_error(&endpoint, e))?;

        info!(printer = %endpoint, "Bluetooth printer connected");
        self.port = Some(port);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransmissionError> {
        let endpoint = self.endpoint();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransmissionError::link_lost(format!("{endpoint} is not connected")))?;
        port.write_all(bytes)
            .await
            .map_err(|e| write_error(&endpoint, e))?;
        port.flush().await.map_err(|e| write_error(&endpoint, e))?;
        Ok(())
    }

    async fn query_status(&mut self) -> Option<PrinterReadiness> {
        None
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(printer = %self.address, "Bluetooth link closed");
        }
    }

    fn max_payload(&self) -> Option<usize> {
        Some(BLUETOOTH_MAX_PAYLOAD)
    }
}
