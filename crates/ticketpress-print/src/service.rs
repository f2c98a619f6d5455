// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: wires the registry, job store, connection manager, queue
// worker and health monitor together and exposes the operations callers use.
//
// Everything here is cheaply cloneable (Arc-wrapped) so the service can be
// moved into tasks freely.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use ticketpress_core::EngineConfig;
use ticketpress_core::error::{RegistryError, Result};
use ticketpress_core::types::{
    HistoryFilter, JobId, PrintJob, PrinterProfile, Priority, ProfileId, QueueStatus, Ticket,
};

use crate::connection::ConnectionManager;
use crate::diagnostics::{DiagnosticReport, DiagnosticsMonitor, ProbeResult};
use crate::discovery::DiscoveredPrinter;
use crate::events::{ConnectionEvent, EventBus, HealthEvent, JobEvent};
use crate::queue::{CancelOutcome, PrintQueue, QueueConfig, SharedRegistry, lock_registry};
use crate::registry::PrinterRegistry;
use crate::store::JobStore;
use crate::transport::{DefaultTransportFactory, TransportFactory};

/// The buses a service publishes on.
///
/// Subscribe before handing them to [`PrintService::open_with`] to see the
/// events of startup recovery.
#[derive(Clone, Default)]
pub struct ServiceEvents {
    pub jobs: EventBus<JobEvent>,
    pub connections: EventBus<ConnectionEvent>,
    pub health: EventBus<HealthEvent>,
}

#[derive(Clone)]
pub struct PrintService {
    config: Arc<EngineConfig>,
    registry: SharedRegistry,
    connections: Arc<ConnectionManager>,
    queue: PrintQueue,
    monitor: Arc<DiagnosticsMonitor>,
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PrintService {
    /// Open the database named in `config`, seed configured printers and start
    /// the queue worker with the real transports.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, ServiceEvents::default())
    }

    /// Like [`open`](Self::open), publishing on `events`.
    pub fn open_with(config: EngineConfig, events: ServiceEvents) -> Result<Self> {
        config.validate()?;
        info!(path = %config.database_path.display(), "opening print service");

        let mut registry = PrinterRegistry::open(&config.database_path)?;
        registry.upsert_from_config(&config.printers)?;
        let store = JobStore::open(&config.database_path)?;
        let factory = Arc::new(DefaultTransportFactory {
            connect_timeout: config.connect_timeout(),
            status_timeout: config.status_timeout(),
        });
        Self::with_parts(config, registry, store, factory, events)
    }

    /// Assemble a service from already-opened parts. Recovery of interrupted
    /// jobs runs here, so its events reach whoever subscribed to `events`
    /// beforehand.
    pub fn with_parts(
        config: EngineConfig,
        registry: PrinterRegistry,
        store: JobStore,
        factory: Arc<dyn TransportFactory>,
        events: ServiceEvents,
    ) -> Result<Self> {
        let registry: SharedRegistry = Arc::new(Mutex::new(registry));
        let connections = Arc::new(ConnectionManager::new(
            factory,
            config.reconnect.clone(),
            events.connections,
        ));
        let queue = PrintQueue::start(
            QueueConfig::from(&config),
            store,
            Arc::clone(&registry),
            Arc::clone(&connections),
            events.jobs,
        )?;
        let monitor = Arc::new(DiagnosticsMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            events.health,
            config.monitor_retry_delay(),
        ));

        Ok(Self {
            config: Arc::new(config),
            registry,
            connections,
            queue,
            monitor,
            monitor_task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- events -------------------------------------------------------------

    pub fn job_events(&self) -> &EventBus<JobEvent> {
        self.queue.events()
    }

    pub fn connection_events(&self) -> &EventBus<ConnectionEvent> {
        self.connections.events()
    }

    pub fn health_events(&self) -> &EventBus<HealthEvent> {
        self.monitor.events()
    }

    // -- jobs ---------------------------------------------------------------

    pub async fn add_job(
        &self,
        ticket: Ticket,
        printer: Option<ProfileId>,
        priority: Priority,
        copies: u32,
    ) -> Result<JobId> {
        self.queue.add_job(ticket, printer, priority, copies).await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<CancelOutcome> {
        self.queue.cancel_job(id).await
    }

    pub async fn retry_job(&self, id: JobId) -> Result<()> {
        self.queue.retry_job(id).await
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.queue.queue_status().await
    }

    pub async fn print_history(&self, filter: HistoryFilter) -> Result<Vec<PrintJob>> {
        self.queue.print_history(filter).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<PrintJob>> {
        self.queue.get_job(id).await
    }

    pub async fn wait_for(&self, id: JobId) -> Result<PrintJob> {
        self.queue.wait_for(id).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.queue.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.queue.resume().await
    }

    // -- printers -----------------------------------------------------------

    pub fn printers(&self, active_only: bool) -> Result<Vec<PrinterProfile>> {
        lock_registry(&self.registry).list(active_only)
    }

    pub fn printer(&self, id: &ProfileId) -> Result<Option<PrinterProfile>> {
        lock_registry(&self.registry).get(id)
    }

    pub fn add_printer(&self, profile: &PrinterProfile) -> Result<()> {
        lock_registry(&self.registry).add(profile)
    }

    /// Changes take effect on the printer's next connection.
    pub fn update_printer(&self, profile: &PrinterProfile) -> Result<()> {
        lock_registry(&self.registry).update(profile)
    }

    pub fn set_default_printer(&self, id: &ProfileId) -> Result<()> {
        lock_registry(&self.registry).set_default(id)
    }

    pub fn deactivate_printer(&self, id: &ProfileId) -> Result<()> {
        lock_registry(&self.registry).deactivate(id)
    }

    pub fn reactivate_printer(&self, id: &ProfileId) -> Result<()> {
        lock_registry(&self.registry).reactivate(id)
    }

    /// Delete a printer that no job refers to and drop its connection.
    pub async fn remove_printer(&self, id: &ProfileId) -> Result<()> {
        let jobs = self.queue.count_referencing(id.clone()).await?;
        if jobs > 0 {
            return Err(RegistryError::InUse {
                id: id.clone(),
                jobs,
            }
            .into());
        }
        lock_registry(&self.registry).remove(id)?;
        self.connections.disconnect(id).await;
        Ok(())
    }

    pub async fn discover(&self, timeout: Duration) -> Vec<DiscoveredPrinter> {
        self.connections.discover(timeout).await
    }

    // -- health -------------------------------------------------------------

    pub async fn test_printer(&self, id: &ProfileId) -> DiagnosticReport {
        self.monitor.test_printer(id).await
    }

    pub async fn probe_printers(&self) -> Vec<ProbeResult> {
        self.monitor.probe_all().await
    }

    pub fn printer_health(&self, id: &ProfileId) -> Option<ProbeResult> {
        self.monitor.latest(id)
    }

    /// Start periodic health probes. Calling it again restarts the timer.
    pub fn start_monitor(&self) {
        let interval = self.config.monitor_interval();
        let handle = Arc::clone(&self.monitor).spawn(interval);
        let previous = self
            .monitor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "health monitor started");
    }

    pub fn stop_monitor(&self) {
        let task = self
            .monitor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!("health monitor stopped");
        }
    }

    /// Stop probing, let in-flight prints finish, then close every link.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_monitor();
        if let Err(e) = self.queue.shutdown().await {
            warn!(error = %e, "queue already stopped");
        }
        self.connections.disconnect_all().await;
        info!("print service stopped");
        Ok(())
    }
}
