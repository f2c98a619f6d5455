// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Ticketpress print pipeline.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a printer profile, chosen by whoever configures the printer
/// (e.g. `"gate-1"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Ticket payload
// ---------------------------------------------------------------------------

/// A parking fee in minor currency units (e.g. paise, cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub amount_minor: i64,
    /// Printed in front of the amount, e.g. `"Rs."`.
    pub currency: String,
}

impl Fee {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
        }
    }

    /// `Rs. 150.00` style rendering.
    pub fn display(&self) -> String {
        let sign = if self.amount_minor < 0 { "-" } else { "" };
        let abs = self.amount_minor.unsigned_abs();
        format!("{} {sign}{}.{:02}", self.currency, abs / 100, abs % 100)
    }
}

/// Vehicle details printed on a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    /// Registration number, always upper case.
    pub number: String,
    /// Vehicle class, e.g. "4 Wheeler", "Trailer".
    pub kind: String,
    /// Transport company the vehicle belongs to.
    pub transport_name: String,
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
}

impl VehicleInfo {
    pub fn new(number: &str, kind: impl Into<String>, transport_name: impl Into<String>) -> Self {
        Self {
            number: number.trim().to_uppercase(),
            kind: kind.into(),
            transport_name: transport_name.into(),
            driver_name: None,
            driver_phone: None,
        }
    }
}

/// A finalized parking ticket handed to the pipeline for printing.
///
/// Tickets are immutable once submitted; the queue stores a copy inside the
/// job so later edits by the supplier never change what gets printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub business_name: String,
    pub business_address: Option<String>,
    pub business_phone: Option<String>,
    pub ticket_number: String,
    pub serial: u64,
    pub vehicle: VehicleInfo,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub fee: Option<Fee>,
    pub payment_status: Option<String>,
    pub payment_type: Option<String>,
    pub notes: Option<String>,
    /// Operator who issued the ticket.
    pub issued_by: Option<String>,
    /// Data encoded into a QR block (usually a lookup URL or the ticket number).
    pub qr_payload: Option<String>,
}

impl Ticket {
    pub fn new(
        business_name: impl Into<String>,
        ticket_number: impl Into<String>,
        serial: u64,
        vehicle: VehicleInfo,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            business_name: business_name.into(),
            business_address: None,
            business_phone: None,
            ticket_number: ticket_number.into(),
            serial,
            vehicle,
            entry_time,
            exit_time: None,
            fee: None,
            payment_status: None,
            payment_type: None,
            notes: None,
            issued_by: None,
            qr_payload: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Scheduling tier. Ordering is `Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    #[default]
    Normal,
    High,
    Urgent,
}

/// Lifecycle states of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for its printer's worker.
    Queued,
    /// Bytes are being delivered to the printer.
    Printing,
    /// Last attempt failed; waiting for the backoff delay to elapse.
    Retrying,
    /// All copies were delivered.
    Completed,
    /// Gave up — see the job's last error.
    Failed,
    /// Cancelled while waiting. A printing job only gets here by way of
    /// Retrying.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Failed -> Queued` is the manual retry path. There is no edge out of
    /// Printing to Cancelled: an attempt always ends Completed, Retrying or
    /// Failed first.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Printing)
                | (Queued, Cancelled)
                | (Printing, Completed)
                | (Printing, Retrying)
                | (Printing, Failed)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
                | (Failed, Queued)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Printing => "printing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Structured error category recorded on failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Encoding,
    Connection,
    Transmission,
    PrinterFault,
    Queue,
}

/// Physical printer conditions reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    Offline,
    PaperJam,
    OutOfPaper,
    CoverOpen,
}

impl FaultKind {
    /// Faults that only a person standing at the printer can clear.
    pub fn requires_intervention(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::PaperJam => "paper jam",
            Self::OutOfPaper => "out of paper",
            Self::CoverOpen => "cover open",
        };
        f.write_str(s)
    }
}

/// The error recorded on a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub category: ErrorCategory,
    pub message: String,
    pub fault: Option<FaultKind>,
    /// The job is parked until someone fixes the printer and retries it.
    pub requires_intervention: bool,
}

/// A print job as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub ticket: Ticket,
    /// Target printer, resolved and frozen at submission.
    pub printer_id: ProfileId,
    pub priority: Priority,
    pub copies: u32,
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<JobError>,
    /// Submission order; FIFO tie-breaker within a priority tier.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Not-before timestamp while the job is `Retrying`.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Cancel requested while `Printing`; applied when the attempt resolves.
    pub cancel_requested: bool,
    /// SHA-256 hex digest of the encoded ticket from the first attempt.
    pub payload_digest: Option<String>,
}

impl PrintJob {
    pub fn new(
        ticket: Ticket,
        printer_id: ProfileId,
        priority: Priority,
        copies: u32,
        max_attempts: u32,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            ticket,
            printer_id,
            priority,
            copies,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            last_error: None,
            seq,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            completed_at: None,
            next_attempt_at: None,
            cancel_requested: false,
            payload_digest: None,
        }
    }
}

/// Snapshot counts reported by `queue_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Jobs waiting to print, including those in backoff.
    pub queued: usize,
    pub printing: usize,
    pub failed: usize,
}

impl QueueStatus {
    /// The counter a job in `status` is counted under, if any.
    pub fn counter_mut(&mut self, status: JobStatus) -> Option<&mut usize> {
        match status {
            JobStatus::Queued | JobStatus::Retrying => Some(&mut self.queued),
            JobStatus::Printing => Some(&mut self.printing),
            JobStatus::Failed => Some(&mut self.failed),
            JobStatus::Completed | JobStatus::Cancelled => None,
        }
    }

    /// Account for one job moving from `from` to `to`.
    pub fn record_transition(&mut self, from: JobStatus, to: JobStatus) {
        if let Some(n) = self.counter_mut(from) {
            *n = n.saturating_sub(1);
        }
        if let Some(n) = self.counter_mut(to) {
            *n += 1;
        }
    }
}

/// Filters for `print_history`. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub statuses: Vec<JobStatus>,
    pub printer_id: Option<ProfileId>,
    pub ticket_number: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Printer profiles
// ---------------------------------------------------------------------------

/// Physical link used to reach a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Usb,
    Bluetooth,
    Ble,
    Network,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Usb => "usb",
            Self::Bluetooth => "bluetooth",
            Self::Ble => "ble",
            Self::Network => "network",
        };
        f.write_str(s)
    }
}

/// Default raw TCP port for network receipt printers (JetDirect).
pub const RAW_PRINT_PORT: u16 = 9100;

/// Transport-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParams {
    /// USB printer-class device node, e.g. `/dev/usb/lp0`.
    Usb { device_path: PathBuf },
    /// Bluetooth Classic printer bound to a serial device node (e.g. `/dev/rfcomm0`).
    Bluetooth { address: String, device_path: PathBuf },
    /// Bluetooth Low Energy printer written through a GATT characteristic.
    /// Without `write_characteristic` one is picked during service discovery.
    Ble {
        address: String,
        #[serde(default)]
        write_characteristic: Option<Uuid>,
    },
    /// Raw TCP socket.
    Network {
        host: String,
        #[serde(default = "default_raw_port")]
        port: u16,
    },
}

fn default_raw_port() -> u16 {
    RAW_PRINT_PORT
}

impl ConnectionParams {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Usb { .. } => TransportKind::Usb,
            Self::Bluetooth { .. } => TransportKind::Bluetooth,
            Self::Ble { .. } => TransportKind::Ble,
            Self::Network { .. } => TransportKind::Network,
        }
    }

    /// Short human-readable endpoint for logs and reports.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Usb { device_path } => device_path.display().to_string(),
            Self::Bluetooth {
                address,
                device_path,
            } => format!("{address} ({})", device_path.display()),
            Self::Ble { address, .. } => format!("{address} (BLE)"),
            Self::Network { host, port } => format!("{host}:{port}"),
        }
    }
}

/// Printer control command sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandSet {
    /// Full ESC/POS (Epson TM and compatibles).
    EscPos,
    /// Cut-down ESC/POS found on portable Bluetooth printers: no cutter,
    /// no QR, no underline.
    EscPosBasic,
}

impl CommandSet {
    pub fn default_features(self) -> &'static [Feature] {
        match self {
            Self::EscPos => &[
                Feature::Bold,
                Feature::Underline,
                Feature::Alignment,
                Feature::FontScale,
                Feature::Cut,
                Feature::QrCode,
            ],
            Self::EscPosBasic => &[Feature::Bold, Feature::Alignment, Feature::FontScale],
        }
    }
}

/// Formatting features the encoder may need from a command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    Bold,
    Underline,
    Alignment,
    FontScale,
    Cut,
    QrCode,
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bold => "bold",
            Self::Underline => "underline",
            Self::Alignment => "alignment",
            Self::FontScale => "font scaling",
            Self::Cut => "paper cut",
            Self::QrCode => "QR code",
        };
        f.write_str(s)
    }
}

/// What a printer declares it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Characters per line at normal font size (32 on 58mm, 48 on 80mm).
    pub line_width: usize,
    pub command_set: CommandSet,
    /// Overrides the command set's default feature list when present.
    #[serde(default)]
    pub features: Option<Vec<Feature>>,
    /// Largest payload the link accepts per write.
    #[serde(default)]
    pub max_chunk_size: Option<usize>,
    /// Pause between chunks, in milliseconds.
    #[serde(default)]
    pub chunk_delay_ms: u64,
}

impl Capabilities {
    pub fn escpos(line_width: usize) -> Self {
        Self {
            line_width,
            command_set: CommandSet::EscPos,
            features: None,
            max_chunk_size: None,
            chunk_delay_ms: 0,
        }
    }

    pub fn supports(&self, feature: Feature) -> bool {
        match &self.features {
            Some(list) => list.contains(&feature),
            None => self.command_set.default_features().contains(&feature),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::escpos(48)
    }
}

/// Per-printer defaults applied when encoding a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintSettings {
    pub cut_paper: bool,
    pub print_qr: bool,
    pub footer: Option<String>,
    /// Blank lines fed before the cut.
    pub feed_lines: u8,
}

impl Default for PrintSettings {
    fn default() -> Self {
        Self {
            cut_paper: true,
            print_qr: true,
            footer: Some("Thank you. Drive safely.".into()),
            feed_lines: 3,
        }
    }
}

/// A configured printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterProfile {
    pub id: ProfileId,
    pub name: String,
    pub connection: ConnectionParams,
    pub capabilities: Capabilities,
    pub settings: PrintSettings,
    pub active: bool,
    pub is_default: bool,
    pub auto_reconnect: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrinterProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, connection: ConnectionParams) -> Self {
        let now = Utc::now();
        let capabilities = match connection.kind() {
            TransportKind::Bluetooth | TransportKind::Ble => Capabilities {
                line_width: 32,
                command_set: CommandSet::EscPosBasic,
                features: None,
                max_chunk_size: Some(20),
                chunk_delay_ms: 20,
            },
            _ => Capabilities::default(),
        };
        let settings = match connection.kind() {
            TransportKind::Bluetooth | TransportKind::Ble => PrintSettings {
                cut_paper: false,
                print_qr: false,
                ..PrintSettings::default()
            },
            _ => PrintSettings::default(),
        };
        Self {
            id: ProfileId(id.into()),
            name: name.into(),
            connection,
            capabilities,
            settings,
            active: true,
            is_default: false,
            auto_reconnect: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.connection.kind()
    }
}

// ---------------------------------------------------------------------------
// Connection / readiness
// ---------------------------------------------------------------------------

/// Connection lifecycle as tracked by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, nothing in flight.
    Idle,
    /// Connected, transmitting.
    Busy,
    /// Unrecoverable transport error; cleared by `disconnect` or a new `connect`.
    Faulted,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

/// Device-reported readiness, decoded from real-time status bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterReadiness {
    pub online: bool,
    pub paper_out: bool,
    pub paper_near_end: bool,
    pub cover_open: bool,
    pub paper_jam: bool,
}

impl PrinterReadiness {
    /// The most severe fault, if any. Jams outrank paper, paper outranks cover.
    pub fn fault(&self) -> Option<FaultKind> {
        if self.paper_jam {
            Some(FaultKind::PaperJam)
        } else if self.paper_out {
            Some(FaultKind::OutOfPaper)
        } else if self.cover_open {
            Some(FaultKind::CoverOpen)
        } else if !self.online {
            Some(FaultKind::Offline)
        } else {
            None
        }
    }
}

/// Result of `ConnectionManager::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub connection: ConnectionState,
    /// `None` when the link cannot report readiness.
    pub readiness: Option<PrinterReadiness>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_urgent_highest() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
    }

    #[test]
    fn cancelled_only_reachable_before_completion() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn printing_job_is_never_cancelled_directly() {
        assert!(!JobStatus::Printing.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Printing.can_transition_to(JobStatus::Retrying));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn queue_counts_follow_transitions() {
        let mut counts = QueueStatus {
            queued: 1,
            ..Default::default()
        };
        counts.record_transition(JobStatus::Queued, JobStatus::Printing);
        assert_eq!(counts.printing, 1);
        counts.record_transition(JobStatus::Printing, JobStatus::Retrying);
        assert_eq!((counts.queued, counts.printing), (1, 0));
        counts.record_transition(JobStatus::Retrying, JobStatus::Cancelled);
        assert_eq!(counts, QueueStatus::default());
    }

    #[test]
    fn vehicle_number_is_upper_cased() {
        let v = VehicleInfo::new(" ka01ab1234 ", "4 Wheeler", "Acme Logistics");
        assert_eq!(v.number, "KA01AB1234");
    }

    #[test]
    fn fee_display_uses_minor_units() {
        assert_eq!(Fee::new(15_000, "Rs.").display(), "Rs. 150.00");
        assert_eq!(Fee::new(5, "$").display(), "$ 0.05");
    }

    #[test]
    fn basic_command_set_has_no_cutter() {
        let caps = Capabilities {
            command_set: CommandSet::EscPosBasic,
            ..Capabilities::default()
        };
        assert!(!caps.supports(Feature::Cut));
        assert!(caps.supports(Feature::Bold));
    }

    #[test]
    fn explicit_feature_list_overrides_command_set() {
        let caps = Capabilities {
            features: Some(vec![Feature::Bold]),
            ..Capabilities::default()
        };
        assert!(!caps.supports(Feature::QrCode));
    }

    #[test]
    fn readiness_fault_prefers_jam() {
        let r = PrinterReadiness {
            online: false,
            paper_out: true,
            paper_jam: true,
            ..Default::default()
        };
        assert_eq!(r.fault(), Some(FaultKind::PaperJam));
        let ok = PrinterReadiness {
            online: true,
            ..Default::default()
        };
        assert_eq!(ok.fault(), None);
    }

    #[test]
    fn bluetooth_profiles_default_to_small_chunks() {
        let p = PrinterProfile::new(
            "bt",
            "Handheld",
            ConnectionParams::Bluetooth {
                address: "00:11:22:33:44:55".into(),
                device_path: "/dev/rfcomm0".into(),
            },
        );
        assert_eq!(p.capabilities.max_chunk_size, Some(20));
        assert_eq!(p.transport_kind(), TransportKind::Bluetooth);
    }

    #[test]
    fn ble_profiles_parse_without_a_characteristic() {
        let params: ConnectionParams =
            serde_json::from_str(r#"{"kind":"ble","address":"AA:BB:CC:DD:EE:FF"}"#).expect("parse");
        assert_eq!(
            params,
            ConnectionParams::Ble {
                address: "AA:BB:CC:DD:EE:FF".into(),
                write_characteristic: None,
            }
        );
        assert_eq!(params.endpoint(), "AA:BB:CC:DD:EE:FF (BLE)");

        let p = PrinterProfile::new("ble", "Handheld", params);
        assert_eq!(p.transport_kind(), TransportKind::Ble);
        assert_eq!(p.capabilities.max_chunk_size, Some(20));
        assert!(!p.settings.cut_paper);
    }
}
