// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw TCP transport (JetDirect, port 9100).
//
// Open a socket and stream ESC/POS bytes. The same socket carries DLE EOT
// status replies back from the printer.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use ticketpress_core::error::{ConnectionError, TransmissionError};
use ticketpress_core::types::{PrinterReadiness, TransportKind};

use super::{Transport, open_error, query_realtime_status, write_error};

pub struct NetworkTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    status_timeout: Duration,
}

impl NetworkTransport {
    pub fn new(host: String, port: u16, connect_timeout: Duration, status_timeout: Duration) -> Self {
        Self {
            host,
            port,
            stream: None,
            connect_timeout,
            status_timeout,
        }
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.close().await;
        let addr = self.endpoint();
        info!(addr = %addr, "connecting via raw TCP");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ConnectionError::Timeout(format!(
                    "raw TCP connection to {addr} timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| match e.kind() {
                // A refused or unroutable socket means nothing is listening there.
                io::ErrorKind::ConnectionRefused | io::ErrorKind::HostUnreachable => {
                    ConnectionError::NotFound(format!("{addr}: {e}"))
                }
                _ => open_error(&addr, e),
            })?;

        // Receipt jobs are small; don't let Nagle sit on the tail of a ticket.
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransmissionError> {
        let addr = self.endpoint();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransmissionError::link_lost(format!("{addr} is not connected")))?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| write_error(&addr, e))?;
        stream.flush().await.map_err(|e| write_error(&addr, e))?;
        debug!(addr = %addr, len = bytes.len(), "raw TCP write complete");
        Ok(())
    }

    async fn query_status(&mut self) -> Option<PrinterReadiness> {
        let timeout = self.status_timeout;
        let stream = self.stream.as_mut()?;
        query_realtime_status(stream, timeout).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(addr = %self.endpoint(), "raw TCP connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn transport(port: u16) -> NetworkTransport {
        NetworkTransport::new(
            "127.0.0.1".into(),
            port,
            Duration::from_secs(1),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn bytes_arrive_at_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.expect("read");
            received
        });

        let mut t = transport(port);
        t.open().await.expect("connect");
        t.write(b"\x1b@ticket").await.expect("write");
        t.close().await;

        assert_eq!(server.await.expect("server"), b"\x1b@ticket");
    }

    #[tokio::test]
    async fn refused_connection_is_not_found() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let mut t = transport(port);
        assert!(matches!(t.open().await, Err(ConnectionError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_reply_is_decoded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut cmd = [0u8; 3];
            for reply in [0x12u8, 0x16, 0x12, 0x12] {
                socket.read_exact(&mut cmd).await.expect("command");
                socket.write_all(&[reply]).await.expect("reply");
            }
        });

        let mut t = transport(port);
        t.open().await.expect("connect");
        let readiness = t.query_status().await.expect("status");
        assert!(readiness.online);
        assert!(readiness.cover_open);
    }

    #[tokio::test]
    async fn silent_printer_status_is_unknown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut t = transport(port);
        t.open().await.expect("connect");
        assert_eq!(t.query_status().await, None);
    }
}
