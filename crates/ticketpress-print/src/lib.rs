// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ticketpress Print — ESC/POS ticket encoding, USB/Bluetooth/network
// transports, connection management, the durable print job queue and
// printer health diagnostics. Domain types live in `ticketpress-core`.

pub mod connection;
pub mod diagnostics;
pub mod discovery;
pub mod encoder;
pub mod events;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;

pub use connection::ConnectionManager;
pub use diagnostics::{DiagnosticReport, DiagnosticsMonitor, generate_help_summary};
pub use discovery::{DiscoveredPrinter, PrinterDiscovery};
pub use encoder::{EncodedTicket, TicketEncoder, encode};
pub use events::{ConnectionEvent, EventBus, HealthEvent, JobEvent, Subscription};
pub use queue::{CancelOutcome, PrintQueue, QueueConfig};
pub use registry::PrinterRegistry;
pub use service::{PrintService, ServiceEvents};
pub use store::JobStore;
