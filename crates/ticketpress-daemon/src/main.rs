// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ticketpressd — runs the print queue and health monitor until Ctrl-C.
//
// Configuration comes from the JSON file named by the first argument or by
// TICKETPRESS_CONFIG; without either the defaults are used.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info, warn};

use ticketpress_core::EngineConfig;
use ticketpress_core::config::CONFIG_ENV;
use ticketpress_core::error::Result;
use ticketpress_core::guidance::{Severity, guidance_for};
use ticketpress_print::diagnostics::Classification;
use ticketpress_print::{ConnectionEvent, JobEvent, PrintService, ServiceEvents};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ticketpressd failed");
            ExitCode::FAILURE
        }
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

async fn run() -> Result<()> {
    let config = match config_path() {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            EngineConfig::load(&path)?
        }
        None => {
            info!("no configuration file given, using defaults");
            EngineConfig::default()
        }
    };

    let events = ServiceEvents::default();
    spawn_event_logger(&events);
    let service = PrintService::open_with(config, events)?;
    let printers = service.printers(true)?;
    info!(printers = printers.len(), "Ticketpress starting");
    if printers.is_empty() {
        warn!("no active printers configured; jobs cannot be submitted");
    }

    service.start_monitor();

    let status = service.queue_status().await?;
    info!(
        queued = status.queued,
        printing = status.printing,
        failed = status.failed,
        "queue ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C");
    }
    info!("shutting down");
    service.shutdown().await
}

/// Log queue, connection and health events as they happen, including those
/// from startup recovery.
fn spawn_event_logger(events: &ServiceEvents) {
    let mut jobs = events.jobs.subscribe();
    tokio::spawn(async move {
        while let Some(event) = jobs.recv().await {
            match event {
                JobEvent::Failed { job, error } => {
                    let guidance = guidance_for(&error);
                    let detail = serde_json::to_string(&error).unwrap_or_default();
                    match guidance.severity {
                        Severity::ActionRequired => warn!(
                            job_id = %job.id,
                            printer = %job.printer_id,
                            suggestion = %guidance.suggestion,
                            "{}",
                            guidance.message
                        ),
                        _ => error!(
                            job_id = %job.id,
                            printer = %job.printer_id,
                            error = %detail,
                            suggestion = %guidance.suggestion,
                            "{}",
                            guidance.message
                        ),
                    }
                }
                JobEvent::QueueStatusChanged(status) => info!(
                    queued = status.queued,
                    printing = status.printing,
                    failed = status.failed,
                    "queue status"
                ),
                _ => {}
            }
        }
    });

    let mut links = events.connections.subscribe();
    tokio::spawn(async move {
        while let Some(event) = links.recv().await {
            match event {
                ConnectionEvent::ConnectionLost { profile, attempts } => {
                    warn!(printer = %profile, attempts, "printer link lost, giving up on reconnect")
                }
                ConnectionEvent::Faulted { profile, reason } => {
                    warn!(printer = %profile, reason = %reason, "printer connection faulted")
                }
                _ => {}
            }
        }
    });

    let mut health = events.health.subscribe();
    tokio::spawn(async move {
        while let Some(event) = health.recv().await {
            match event.current {
                Classification::Fault(class) => {
                    warn!(printer = %event.profile, fault = %class, "printer fault detected")
                }
                current => info!(printer = %event.profile, ?current, "printer health"),
            }
        }
    });
}
