// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer transports: a uniform open/write/status/close contract over USB,
// Bluetooth (RFCOMM and BLE GATT) and raw TCP links.
//
// Transports move bytes and nothing else. They never look inside the ESC/POS
// stream, never retry, and never split writes; chunking and pacing belong to
// the connection manager.

pub mod ble;
pub mod bluetooth;
#[cfg(test)]
pub mod mock;
pub mod network;
pub mod usb;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use ticketpress_core::error::{ConnectionError, TransmissionError};
use ticketpress_core::types::{ConnectionParams, PrinterProfile, PrinterReadiness, TransportKind};

pub use ble::BleTransport;
pub use bluetooth::BluetoothTransport;
pub use network::NetworkTransport;
pub use usb::UsbTransport;

/// One physical link to one printer.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Where the transport points, for logs.
    fn endpoint(&self) -> String;

    /// Establish the link. Calling `open` on an open transport reopens it.
    async fn open(&mut self) -> Result<(), ConnectionError>;

    /// Deliver every byte or fail.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransmissionError>;

    /// Ask the device for its real-time status. `None` means unknown.
    async fn query_status(&mut self) -> Option<PrinterReadiness>;

    /// Drop the link. Safe to call on a closed transport.
    async fn close(&mut self);

    /// Largest write the link accepts, if it has a limit of its own.
    fn max_payload(&self) -> Option<usize> {
        None
    }
}

/// Builds a transport for a profile's connection parameters.
pub trait TransportFactory: Send + Sync {
    fn create(&self, profile: &PrinterProfile) -> Box<dyn Transport>;
}

/// Factory for the real device transports.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    pub connect_timeout: Duration,
    pub status_timeout: Duration,
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_millis(500),
        }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, profile: &PrinterProfile) -> Box<dyn Transport> {
        match &profile.connection {
            ConnectionParams::Usb { device_path } => Box::new(UsbTransport::new(
                device_path.clone(),
                self.connect_timeout,
                self.status_timeout,
            )),
            ConnectionParams::Bluetooth {
                address,
                device_path,
            } => Box::new(BluetoothTransport::new(
                address.clone(),
                device_path.clone(),
                self.connect_timeout,
            )),
            ConnectionParams::Ble {
                address,
                write_characteristic,
            } => Box::new(BleTransport::new(
                address.clone(),
                *write_characteristic,
                self.connect_timeout,
            )),
            ConnectionParams::Network { host, port } => Box::new(NetworkTransport::new(
                host.clone(),
                *port,
                self.connect_timeout,
                self.status_timeout,
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping shared by the device transports
// ---------------------------------------------------------------------------

/// Map an error from opening a link.
pub(crate) fn open_error(endpoint: &str, e: io::Error) -> ConnectionError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => ConnectionError::PermissionDenied(format!("{endpoint}: {e}")),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ConnectionError::Timeout(format!("{endpoint}: {e}"))
        }
        _ => ConnectionError::NotFound(format!("{endpoint}: {e}")),
    }
}

/// Map an error from a write. Errors meaning "the other end is gone" are
/// flagged as a lost link so the connection manager can reconnect.
pub(crate) fn write_error(endpoint: &str, e: io::Error) -> TransmissionError {
    let message = format!("{endpoint}: {e}");
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotFound => TransmissionError::link_lost(message),
        _ => TransmissionError::new(message),
    }
}

// ---------------------------------------------------------------------------
// Real-time status (DLE EOT n)
// ---------------------------------------------------------------------------

const DLE: u8 = 0x10;
const EOT: u8 = 0x04;

/// Status bytes always have bit 1 and bit 4 set, bits 0 and 7 clear.
fn is_status_byte(b: u8) -> bool {
    b & 0x93 == 0x12
}

/// Decode the four DLE EOT replies (printer, offline cause, error, paper
/// sensor) into a readiness snapshot.
pub fn decode_status(printer: u8, offline: u8, error: u8, paper: u8) -> Option<PrinterReadiness> {
    if ![printer, offline, error, paper].into_iter().all(is_status_byte) {
        return None;
    }
    Some(PrinterReadiness {
        online: printer & 0x08 == 0,
        cover_open: offline & 0x04 != 0,
        paper_out: offline & 0x20 != 0 || paper & 0x60 != 0,
        paper_near_end: paper & 0x0C != 0,
        paper_jam: error & 0x08 != 0,
    })
}

/// Send DLE EOT 1..=4 and read one reply byte each. Any timeout, I/O error or
/// malformed byte yields `None`.
pub(crate) async fn query_realtime_status<S>(stream: &mut S, timeout: Duration) -> Option<PrinterReadiness>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut replies = [0u8; 4];
    for (i, reply) in replies.iter_mut().enumerate() {
        let n = i as u8 + 1;
        let exchange = async {
            stream.write_all(&[DLE, EOT, n]).await?;
            stream.flush().await?;
            stream.read_u8().await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(b)) => *reply = b,
            Ok(Err(e)) => {
                debug!(error = %e, n, "status query failed");
                return None;
            }
            Err(_) => {
                debug!(n, "status query timed out");
                return None;
            }
        }
    }
    decode_status(replies[0], replies[1], replies[2], replies[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_status_bytes_decode_online() {
        let r = decode_status(0x12, 0x12, 0x12, 0x12).expect("valid bytes");
        assert!(r.online);
        assert_eq!(r.fault(), None);
    }

    #[test]
    fn paper_end_and_cover_bits_decode() {
        let r = decode_status(0x1A, 0x16, 0x12, 0x72).expect("valid bytes");
        assert!(!r.online);
        assert!(r.cover_open);
        assert!(r.paper_out);
    }

    #[test]
    fn autocutter_error_reads_as_jam() {
        let r = decode_status(0x12, 0x12, 0x1A, 0x12).expect("valid bytes");
        assert!(r.paper_jam);
    }

    #[test]
    fn garbage_bytes_are_unknown() {
        assert_eq!(decode_status(0xFF, 0x12, 0x12, 0x12), None);
    }

    #[test]
    fn broken_pipe_is_link_lost() {
        let e = write_error("lp0", io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(e.link_lost);
        let e = write_error("lp0", io::Error::other("buffer full"));
        assert!(!e.link_lost);
    }

    #[test]
    fn permission_denied_maps_through() {
        let e = open_error("/dev/usb/lp0", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(e, ConnectionError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn realtime_status_over_duplex() {
        let (mut client, mut printer) = tokio::io::duplex(64);
        let device = tokio::spawn(async move {
            let mut cmd = [0u8; 3];
            for reply in [0x12u8, 0x12, 0x12, 0x7E] {
                printer.read_exact(&mut cmd).await.expect("read command");
                assert_eq!(&cmd[..2], &[DLE, EOT]);
                printer.write_all(&[reply]).await.expect("reply");
            }
        });
        let r = query_realtime_status(&mut client, Duration::from_secs(1))
            .await
            .expect("status");
        assert!(r.paper_out);
        assert!(r.paper_near_end);
        device.await.expect("device task");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_is_unknown() {
        let (mut client, _printer) = tokio::io::duplex(64);
        assert_eq!(
            query_realtime_status(&mut client, Duration::from_millis(100)).await,
            None
        );
    }
}
