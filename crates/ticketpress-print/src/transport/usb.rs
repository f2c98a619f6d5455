// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// USB printer-class transport.
//
// The kernel's usblp driver exposes each receipt printer as a character
// device (`/dev/usb/lp0`, ...). Writes go straight to the bulk-out endpoint
// and DLE EOT replies come back on reads.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use ticketpress_core::error::{ConnectionError, TransmissionError};
use ticketpress_core::types::{PrinterReadiness, TransportKind};

use super::{Transport, open_error, query_realtime_status, write_error};

pub struct UsbTransport {
    device_path: PathBuf,
    file: Option<File>,
    connect_timeout: Duration,
    status_timeout: Duration,
}

impl UsbTransport {
    pub fn new(device_path: PathBuf, connect_timeout: Duration, status_timeout: Duration) -> Self {
        Self {
            device_path,
            file: None,
            connect_timeout,
            status_timeout,
        }
    }
}

#[async_trait]
impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn endpoint(&self) -> String {
        self.device_path.display().to_string()
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.file = None;
        let endpoint = self.endpoint();
        let file = tokio::time::timeout(
            self.connect_timeout,
            OpenOptions::new().read(true).write(true).open(&self.device_path),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(format!("opening {endpoint}")))?
        .map_err(|e| open_error(&endpoint, e))?;

        info!(device = %endpoint, "USB printer opened");
        self.file = Some(file);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransmissionError> {
        let endpoint = self.endpoint();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransmissionError::link_lost(format!("{endpoint} is not open")))?;
        file.write_all(bytes)
            .await
            .map_err(|e| write_error(&endpoint, e))?;
        file.flush().await.map_err(|e| write_error(&endpoint, e))?;
        debug!(device = %endpoint, len = bytes.len(), "USB write complete");
        Ok(())
    }

    async fn query_status(&mut self) -> Option<PrinterReadiness> {
        let timeout = self.status_timeout;
        let file = self.file.as_mut()?;
        query_realtime_status(file, timeout).await
    }

    async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
            debug!(device = %self.device_path.display(), "USB printer closed");
        }
    }
}
