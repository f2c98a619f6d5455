// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Plain-language guidance for failed print jobs.
//
// Every stored `JobError` maps to a short message and a concrete next step
// that the attendant at the booth can follow. Presentation layers decide how
// to render it; this module only picks the words.

use crate::types::{ErrorCategory, FaultKind, JobError};

/// How the failure should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Link blip or busy printer — the queue retries on its own.
    Transient,
    /// Someone has to do something at the printer (paper, jam, cover).
    ActionRequired,
    /// Retrying will not help without changing the ticket or printer setup.
    Permanent,
}

/// A human-readable explanation of a job error.
#[derive(Debug, Clone)]
pub struct Guidance {
    /// Plain summary (shown as a heading).
    pub message: String,
    /// What to try next.
    pub suggestion: String,
    /// Whether the queue retries this automatically.
    pub retriable: bool,
    pub severity: Severity,
}

/// Explain a job error for the person operating the printer.
pub fn guidance_for(err: &JobError) -> Guidance {
    match err.category {
        ErrorCategory::PrinterFault => fault_guidance(err.fault.unwrap_or(FaultKind::Offline)),

        ErrorCategory::Encoding => Guidance {
            message: "This ticket can't be printed on this printer.".into(),
            suggestion: format!(
                "Check the printer's settings or send the ticket to another printer. ({})",
                err.message
            ),
            retriable: false,
            severity: Severity::Permanent,
        },

        ErrorCategory::Connection => connection_guidance(&err.message),

        ErrorCategory::Transmission => Guidance {
            message: "The ticket didn't reach the printer completely.".into(),
            suggestion: "We'll print it again from the start. Tear off any partial ticket.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        ErrorCategory::Queue => Guidance {
            message: "The print request was not accepted.".into(),
            suggestion: format!("Check the job and printer selection. ({})", err.message),
            retriable: false,
            severity: Severity::Permanent,
        },
    }
}

fn connection_guidance(detail: &str) -> Guidance {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("permission denied") {
        Guidance {
            message: "We're not allowed to use this printer.".into(),
            suggestion: "Ask an administrator to grant access to the printer device.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        }
    } else if lower.contains("timed out") {
        Guidance {
            message: "The printer didn't answer in time.".into(),
            suggestion: "Check it's switched on and in range. We'll keep trying.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else {
        Guidance {
            message: "We can't find the printer.".into(),
            suggestion: "Check the cable, Bluetooth pairing or network connection. We'll keep trying.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    }
}

fn fault_guidance(kind: FaultKind) -> Guidance {
    match kind {
        FaultKind::Offline => Guidance {
            message: "The printer is offline.".into(),
            suggestion: "Turn it off and on again. We'll retry automatically.".into(),
            retriable: true,
            severity: Severity::Transient,
        },
        FaultKind::OutOfPaper => Guidance {
            message: "The printer is out of paper.".into(),
            suggestion: "Load a new paper roll, then press Retry.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },
        FaultKind::PaperJam => Guidance {
            message: "Paper is stuck in the printer.".into(),
            suggestion: "Open the cover, remove the jammed paper, close it, then press Retry.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },
        FaultKind::CoverOpen => Guidance {
            message: "The printer cover is open.".into(),
            suggestion: "Close the cover firmly, then press Retry.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_error(category: ErrorCategory, message: &str, fault: Option<FaultKind>) -> JobError {
        JobError {
            category,
            message: message.into(),
            fault,
            requires_intervention: fault.is_some_and(FaultKind::requires_intervention),
        }
    }

    #[test]
    fn out_of_paper_is_action_required() {
        let g = guidance_for(&job_error(
            ErrorCategory::PrinterFault,
            "printer fault: out of paper",
            Some(FaultKind::OutOfPaper),
        ));
        assert_eq!(g.severity, Severity::ActionRequired);
        assert!(!g.retriable);
    }

    #[test]
    fn transmission_is_transient() {
        let g = guidance_for(&job_error(ErrorCategory::Transmission, "broken pipe", None));
        assert_eq!(g.severity, Severity::Transient);
        assert!(g.retriable);
    }

    #[test]
    fn permission_denied_needs_admin() {
        let g = guidance_for(&job_error(
            ErrorCategory::Connection,
            "connection failed: permission denied: /dev/usb/lp0",
            None,
        ));
        assert_eq!(g.severity, Severity::ActionRequired);
    }

    #[test]
    fn encoding_is_permanent() {
        let g = guidance_for(&job_error(ErrorCategory::Encoding, "QR code unsupported", None));
        assert_eq!(g.severity, Severity::Permanent);
        assert!(g.suggestion.contains("QR code"));
    }
}
