// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Ticketpress.

use thiserror::Error;

use crate::types::{
    CommandSet, ErrorCategory, FaultKind, Feature, JobError, JobId, JobStatus, ProfileId,
};

/// Deterministic failures turning a ticket into printer bytes. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("{feature} is not supported by the {command_set:?} command set")]
    UnsupportedFeature {
        feature: Feature,
        command_set: CommandSet,
    },

    #[error("field `{field}` is {len} characters wide, at most {max} fit")]
    OversizedField {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid printer capabilities: {0}")]
    InvalidCapabilities(String),
}

/// Failures establishing a session with a printer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("printer not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("printer {0} is not connected")]
    NotConnected(ProfileId),
}

/// A byte delivery that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transmission failed: {message}")]
pub struct TransmissionError {
    pub message: String,
    /// The link dropped (broken pipe, reset, device gone) rather than
    /// rejecting a single write.
    pub link_lost: bool,
}

impl TransmissionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            link_lost: false,
        }
    }

    pub fn link_lost(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            link_lost: true,
        }
    }
}

/// Invalid requests against the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("no job with id {0}")]
    JobNotFound(JobId),

    #[error("job {0} is already cancelled")]
    AlreadyCancelled(JobId),

    #[error("job {id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} has used all of its attempts")]
    RetryLimitReached(JobId),

    #[error("copies must be between 1 and {max}, got {requested}")]
    InvalidCopies { requested: u32, max: u32 },

    #[error("printer {0} is deactivated")]
    PrinterInactive(ProfileId),

    #[error("no printer given and no default printer configured")]
    NoDefaultPrinter,

    #[error("the print queue has shut down")]
    ShutDown,
}

/// Printer profile registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no printer profile with id {0}")]
    NotFound(ProfileId),

    #[error("printer profile {0} already exists")]
    Duplicate(ProfileId),

    #[error("printer profile {id} is still referenced by {jobs} job(s)")]
    InUse { id: ProfileId, jobs: usize },
}

/// Top-level error type for all Ticketpress operations.
#[derive(Debug, Error)]
pub enum TicketpressError {
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transmission(#[from] TransmissionError),

    #[error("printer fault: {0}")]
    PrinterFault(FaultKind),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TicketpressError {
    /// Category recorded on a job when this error ends an attempt.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Encoding(_) => ErrorCategory::Encoding,
            Self::Connection(_) => ErrorCategory::Connection,
            Self::PrinterFault(_) => ErrorCategory::PrinterFault,
            Self::Queue(_) | Self::Registry(_) => ErrorCategory::Queue,
            Self::Transmission(_)
            | Self::Config(_)
            | Self::Discovery(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorCategory::Transmission,
        }
    }

    /// Snapshot of this error for storing on a job.
    pub fn to_job_error(&self) -> JobError {
        let fault = match self {
            Self::PrinterFault(kind) => Some(*kind),
            _ => None,
        };
        JobError {
            category: self.category(),
            message: self.to_string(),
            fault,
            requires_intervention: fault.is_some_and(FaultKind::requires_intervention),
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TicketpressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paper_out_requires_intervention() {
        let err = TicketpressError::PrinterFault(FaultKind::OutOfPaper).to_job_error();
        assert_eq!(err.category, ErrorCategory::PrinterFault);
        assert!(err.requires_intervention);
        assert_eq!(err.fault, Some(FaultKind::OutOfPaper));
    }

    #[test]
    fn offline_fault_does_not_require_intervention() {
        let err = TicketpressError::PrinterFault(FaultKind::Offline).to_job_error();
        assert!(!err.requires_intervention);
    }

    #[test]
    fn transmission_error_message_is_kept() {
        let err: TicketpressError = TransmissionError::link_lost("broken pipe").into();
        let job_err = err.to_job_error();
        assert_eq!(job_err.category, ErrorCategory::Transmission);
        assert!(job_err.message.contains("broken pipe"));
    }

    #[test]
    fn encoding_error_names_feature() {
        let err = EncodingError::UnsupportedFeature {
            feature: Feature::QrCode,
            command_set: CommandSet::EscPosBasic,
        };
        assert!(err.to_string().contains("QR code"));
    }
}
