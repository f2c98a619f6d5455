// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer health monitoring and step-by-step diagnostics.
//
// The monitor periodically probes every active printer, classifies what it
// finds and maps each fault to a recovery action. It never tries to fix
// anything itself: paper and jams need a person, everything else is left to
// the queue's retry policy.
//
// `test_printer` runs profile -> connection -> readiness -> test print,
// stopping at the first failing step with guidance on what to do.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ticketpress_core::error::ConnectionError;
use ticketpress_core::guidance::guidance_for;
use ticketpress_core::types::{
    ConnectionState, FaultKind, PrinterProfile, PrinterReadiness, PrinterStatus, ProfileId,
    Ticket, VehicleInfo,
};
use ticketpress_core::TicketpressError;

use crate::connection::ConnectionManager;
use crate::encoder::TicketEncoder;
use crate::events::{EventBus, HealthEvent};
use crate::queue::{SharedRegistry, lock_registry};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultClass {
    Offline,
    PaperJam,
    OutOfPaper,
    CoverOpen,
    /// The link itself misbehaves: refused access, garbled status, dropped writes.
    CommunicationError,
}

impl From<FaultKind> for FaultClass {
    fn from(kind: FaultKind) -> Self {
        match kind {
            FaultKind::Offline => Self::Offline,
            FaultKind::PaperJam => Self::PaperJam,
            FaultKind::OutOfPaper => Self::OutOfPaper,
            FaultKind::CoverOpen => Self::CoverOpen,
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::PaperJam => "paper jam",
            Self::OutOfPaper => "out of paper",
            Self::CoverOpen => "cover open",
            Self::CommunicationError => "communication error",
        })
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Healthy,
    /// Connected, but the link cannot report device status.
    Unknown,
    Fault(FaultClass),
}

impl Classification {
    pub fn fault(self) -> Option<FaultClass> {
        match self {
            Self::Fault(class) => Some(class),
            _ => None,
        }
    }
}

/// What the caller should do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    AutoRetryWithDelay(Duration),
    BlockUntilManualIntervention,
}

pub fn recovery_for(class: FaultClass, retry_delay: Duration) -> RecoveryAction {
    match class {
        FaultClass::Offline | FaultClass::CommunicationError => {
            RecoveryAction::AutoRetryWithDelay(retry_delay)
        }
        FaultClass::PaperJam | FaultClass::OutOfPaper | FaultClass::CoverOpen => {
            RecoveryAction::BlockUntilManualIntervention
        }
    }
}

/// Classify a connection status snapshot.
pub fn classify_status(status: &PrinterStatus) -> Classification {
    match status.connection {
        ConnectionState::Faulted => Classification::Fault(FaultClass::CommunicationError),
        ConnectionState::Disconnected | ConnectionState::Connecting => {
            Classification::Fault(FaultClass::Offline)
        }
        ConnectionState::Idle | ConnectionState::Busy => match status.readiness {
            Some(readiness) => readiness
                .fault()
                .map(|kind| Classification::Fault(kind.into()))
                .unwrap_or(Classification::Healthy),
            None => Classification::Unknown,
        },
    }
}

/// Classify a failed connection attempt.
pub fn classify_connect_error(err: &ConnectionError) -> Classification {
    match err {
        ConnectionError::NotFound(_) | ConnectionError::Timeout(_) => {
            Classification::Fault(FaultClass::Offline)
        }
        ConnectionError::PermissionDenied(_) | ConnectionError::NotConnected(_) => {
            Classification::Fault(FaultClass::CommunicationError)
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Latest probe result for one printer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub profile: ProfileId,
    pub classification: Classification,
    /// `None` when healthy or unknown.
    pub action: Option<RecoveryAction>,
    pub readiness: Option<PrinterReadiness>,
    pub probed_at: DateTime<Utc>,
}

pub struct DiagnosticsMonitor {
    registry: SharedRegistry,
    connections: Arc<ConnectionManager>,
    events: EventBus<HealthEvent>,
    retry_delay: Duration,
    latest: Mutex<HashMap<ProfileId, ProbeResult>>,
}

impl DiagnosticsMonitor {
    pub fn new(
        registry: SharedRegistry,
        connections: Arc<ConnectionManager>,
        events: EventBus<HealthEvent>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            registry,
            connections,
            events,
            retry_delay,
            latest: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus<HealthEvent> {
        &self.events
    }

    /// Probe every active printer once, all printers at the same time.
    pub async fn probe_all(&self) -> Vec<ProbeResult> {
        let profiles = match lock_registry(&self.registry).list(true) {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(error = %e, "cannot list printers for health probe");
                return Vec::new();
            }
        };

        let mut probes = JoinSet::new();
        for profile in profiles {
            let connections = Arc::clone(&self.connections);
            probes.spawn(check(connections, profile, self.retry_delay));
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(Some(result)) => {
                    self.record(result.clone());
                    results.push(result);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "health probe task failed"),
            }
        }
        results.sort_by(|a, b| a.profile.cmp(&b.profile));
        results
    }

    /// Probe one printer and record the result.
    ///
    /// Returns `None` while the printer is busy sending; the previous result
    /// stands.
    pub async fn probe(&self, profile: &PrinterProfile) -> Option<ProbeResult> {
        let result = check(Arc::clone(&self.connections), profile.clone(), self.retry_delay).await?;
        self.record(result.clone());
        Some(result)
    }

    fn record(&self, result: ProbeResult) {
        let previous = {
            let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            latest
                .insert(result.profile.clone(), result.clone())
                .map(|prev| prev.classification)
        };
        if previous == Some(result.classification) {
            return;
        }

        match result.classification.fault() {
            Some(class) => warn!(printer = %result.profile, fault = %class, "printer needs attention"),
            None => info!(printer = %result.profile, classification = ?result.classification, "printer health changed"),
        }
        self.events.emit(HealthEvent {
            profile: result.profile,
            previous,
            current: result.classification,
        });
    }

    pub fn latest(&self, id: &ProfileId) -> Option<ProbeResult> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<ProbeResult> {
        let mut all: Vec<ProbeResult> = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.profile.cmp(&b.profile));
        all
    }

    /// Probe on a fixed interval until the handle is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let results = self.probe_all().await;
                debug!(printers = results.len(), "health probe finished");
            }
        })
    }

    /// Run the step-by-step printer check.
    pub async fn test_printer(&self, id: &ProfileId) -> DiagnosticReport {
        let mut report = DiagnosticReport {
            profile: id.clone(),
            printer: None,
            steps: Vec::new(),
            failed_step: None,
            summary: String::new(),
            generated_at: Utc::now(),
        };

        // Step 1: profile
        let lookup = lock_registry(&self.registry).get(id);
        let profile = match lookup {
            Ok(Some(profile)) if profile.active => {
                report.push(StepResult::pass(
                    "Printer Profile",
                    format!("Found \"{}\" ({})", profile.name, profile.connection.endpoint()),
                ));
                profile
            }
            Ok(Some(profile)) => {
                return report.fail(
                    StepResult::fail(
                        "Printer Profile",
                        format!("Printer \"{}\" is deactivated.", profile.name),
                        "Reactivate the printer before testing it.",
                    ),
                    "Printer is switched off in the settings.",
                );
            }
            Ok(None) => {
                return report.fail(
                    StepResult::fail(
                        "Printer Profile",
                        format!("No printer is configured with id \"{id}\"."),
                        "Add the printer or check the id in the configuration.",
                    ),
                    "Printer not configured.",
                );
            }
            Err(e) => {
                return report.fail(
                    StepResult::fail(
                        "Printer Profile",
                        format!("Could not read printer settings: {e}"),
                        "Check that the database file is readable.",
                    ),
                    "Printer settings unavailable.",
                );
            }
        };
        report.printer = Some(PrinterInfo {
            name: profile.name.clone(),
            endpoint: profile.connection.endpoint(),
            transport: format!("{:?}", profile.transport_kind()),
        });

        // Step 2: connection
        if let Err(e) = self.connections.connect(&profile).await {
            let fix = match e {
                ConnectionError::NotFound(_) => {
                    "Check the printer is switched on and its cable, pairing or IP address is right."
                }
                ConnectionError::PermissionDenied(_) => {
                    "Give the service access to the device (for example the lp or dialout group)."
                }
                ConnectionError::Timeout(_) => {
                    "The printer did not answer in time. Check power and the network or Bluetooth range."
                }
                ConnectionError::NotConnected(_) => "Try the test again.",
            };
            return report.fail(
                StepResult::fail("Connection", e.to_string(), fix),
                "Printer could not be reached.",
            );
        }
        report.push(StepResult::pass("Connection", "Link established."));

        // Step 3: readiness
        let status = self.connections.status(&profile.id).await;
        match status.readiness.and_then(|r| r.fault()) {
            Some(kind) => {
                let guidance = guidance_for(&TicketpressError::PrinterFault(kind).to_job_error());
                return report.fail(
                    StepResult::fail("Printer Ready", guidance.message, guidance.suggestion),
                    format!("Printer reports {}.", FaultClass::from(kind)),
                );
            }
            None => {
                let detail = if status.readiness.is_some() {
                    "Printer reports ready."
                } else {
                    "Printer does not report status over this link; skipped."
                };
                report.push(StepResult::pass("Printer Ready", detail));
            }
        }

        // Step 4: test print
        let ticket = test_ticket(&profile);
        let sent = match TicketEncoder::new(&profile.capabilities, &profile.settings).encode(&ticket) {
            Ok(encoded) => self.connections.send(&profile.id, encoded.as_bytes()).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            let guidance = guidance_for(&e.to_job_error());
            return report.fail(
                StepResult::fail("Test Print", e.to_string(), guidance.suggestion),
                "Test ticket couldn't be sent.",
            );
        }
        report.push(StepResult::pass("Test Print", "Test ticket sent."));

        report.summary = "Everything looks good! The printer is ready.".into();
        info!(printer = %profile.id, "printer test passed");
        report
    }
}

/// Connect to `profile` and classify what it reports.
async fn check(
    connections: Arc<ConnectionManager>,
    profile: PrinterProfile,
    retry_delay: Duration,
) -> Option<ProbeResult> {
    if connections.state(&profile.id) == ConnectionState::Busy {
        debug!(printer = %profile.id, "printer busy, skipping probe");
        return None;
    }

    let (classification, readiness) = match connections.connect(&profile).await {
        Ok(()) => {
            let status = connections.status(&profile.id).await;
            if status.connection == ConnectionState::Busy {
                return None;
            }
            (classify_status(&status), status.readiness)
        }
        Err(e) => (classify_connect_error(&e), None),
    };

    Some(ProbeResult {
        profile: profile.id,
        classification,
        action: classification.fault().map(|class| recovery_for(class, retry_delay)),
        readiness,
        probed_at: Utc::now(),
    })
}

fn test_ticket(profile: &PrinterProfile) -> Ticket {
    let mut ticket = Ticket::new(
        "PRINTER TEST",
        "TEST",
        0,
        VehicleInfo::new("TEST", "-", "-"),
        Utc::now(),
    );
    ticket.notes = Some(format!("Test page for {}", profile.name));
    ticket
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StepResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    /// What to do if the step failed.
    pub fix: Option<String>,
}

impl StepResult {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
            fix: None,
        }
    }

    fn fail(name: &str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
            fix: Some(fix.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrinterInfo {
    pub name: String,
    pub endpoint: String,
    pub transport: String,
}

#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub profile: ProfileId,
    pub printer: Option<PrinterInfo>,
    pub steps: Vec<StepResult>,
    /// Index into `steps` of the step that failed.
    pub failed_step: Option<usize>,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.failed_step.is_none()
    }

    fn push(&mut self, step: StepResult) {
        self.steps.push(step);
    }

    fn fail(mut self, step: StepResult, summary: impl Into<String>) -> Self {
        warn!(printer = %self.profile, step = %step.name, detail = %step.detail, "printer test failed");
        self.failed_step = Some(self.steps.len());
        self.steps.push(step);
        self.summary = summary.into();
        self
    }
}

/// Plain-text report to hand to whoever looks after the printer.
pub fn generate_help_summary(report: &DiagnosticReport) -> String {
    let date = report.generated_at.format("%d %b %Y, %H:%M UTC");
    let mut text = format!("Ticket Printer Report\nDate: {date}\nPrinter id: {}\n", report.profile);

    if let Some(printer) = &report.printer {
        text.push_str(&format!("Name: {}\n", printer.name));
        text.push_str(&format!("Connection: {} ({})\n", printer.endpoint, printer.transport));
    }
    text.push('\n');

    for (i, step) in report.steps.iter().enumerate() {
        let mark = if step.passed { "ok" } else { "FAILED" };
        text.push_str(&format!("{}. {} [{mark}] {}\n", i + 1, step.name, step.detail));
    }
    text.push('\n');

    match report.failed_step.and_then(|i| report.steps.get(i).map(|s| (i, s))) {
        Some((i, step)) => {
            text.push_str(&format!("FAILED AT: Step {} - {}\n", i + 1, step.name));
            if let Some(fix) = &step.fix {
                text.push_str(&format!("What to do: {fix}\n"));
            }
        }
        None => text.push_str("All checks passed. Printer is working.\n"),
    }
    text
}
