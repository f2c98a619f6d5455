// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection manager: one live session per printer profile.
//
// Each profile owns a slot holding its transport behind an async mutex. A
// send holds that mutex for every chunk of every copy, so two jobs can never
// interleave bytes on the same printer. Dropped links are re-established in
// the background with capped exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use ticketpress_core::config::ReconnectPolicy;
use ticketpress_core::error::{ConnectionError, Result, TransmissionError};
use ticketpress_core::types::{
    Capabilities, ConnectionState, PrinterProfile, PrinterStatus, ProfileId,
};

use crate::discovery::{self, DiscoveredPrinter};
use crate::events::{ConnectionEvent, EventBus};
use crate::transport::{Transport, TransportFactory};

struct Slot {
    state: Mutex<ConnectionState>,
    link: tokio::sync::Mutex<Link>,
}

impl Slot {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

struct Link {
    profile: PrinterProfile,
    transport: Box<dyn Transport>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Link {
    fn stop_reconnecting(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    slots: Mutex<HashMap<ProfileId, Arc<Slot>>>,
    events: EventBus<ConnectionEvent>,
    reconnect: ReconnectPolicy,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        reconnect: ReconnectPolicy,
        events: EventBus<ConnectionEvent>,
    ) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
            events,
            reconnect,
        }
    }

    pub fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.events
    }

    fn existing(&self, id: &ProfileId) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn slot_for(&self, profile: &PrinterProfile) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(profile.id.clone()).or_insert_with(|| {
            Arc::new(Slot {
                state: Mutex::new(ConnectionState::Disconnected),
                link: tokio::sync::Mutex::new(Link {
                    profile: profile.clone(),
                    transport: self.factory.create(profile),
                    reconnect_task: None,
                }),
            })
        }))
    }

    /// Open a session for `profile`. A no-op when already connected.
    ///
    /// A changed connection target replaces the transport. A background
    /// reconnect keeps running through failed attempts here, so its budget
    /// still runs out and `ConnectionLost` is still reported; it is only
    /// stopped once this call gets the link back.
    #[instrument(skip_all, fields(printer = %profile.id))]
    pub async fn connect(&self, profile: &PrinterProfile) -> std::result::Result<(), ConnectionError> {
        let slot = self.slot_for(profile);
        let mut link = slot.link.lock().await;

        if link.profile.connection != profile.connection {
            debug!("connection target changed, replacing transport");
            link.stop_reconnecting();
            link.transport.close().await;
            link.transport = self.factory.create(profile);
            slot.set_state(ConnectionState::Disconnected);
        }
        link.profile = profile.clone();

        if slot.state().is_connected() {
            return Ok(());
        }

        slot.set_state(ConnectionState::Connecting);
        match link.transport.open().await {
            Ok(()) => {
                link.stop_reconnecting();
                slot.set_state(ConnectionState::Idle);
                info!(endpoint = %link.transport.endpoint(), "printer connected");
                self.events.emit(ConnectionEvent::Connected(profile.id.clone()));
                Ok(())
            }
            Err(e) => {
                if matches!(e, ConnectionError::PermissionDenied(_)) {
                    slot.set_state(ConnectionState::Faulted);
                    self.events.emit(ConnectionEvent::Faulted {
                        profile: profile.id.clone(),
                        reason: e.to_string(),
                    });
                } else {
                    slot.set_state(ConnectionState::Disconnected);
                }
                warn!(error = %e, "printer connection failed");
                Err(e)
            }
        }
    }

    /// Deliver one payload.
    pub async fn send(&self, id: &ProfileId, bytes: &[u8]) -> Result<()> {
        self.send_copies(id, bytes, 1).await
    }

    /// Deliver `copies` back-to-back copies of a payload without letting any
    /// other send in between.
    ///
    /// Payloads are split to the link's chunk size and paced by the profile's
    /// chunk delay (never after the final chunk).
    #[instrument(skip(self, bytes), fields(printer = %id, len = bytes.len()))]
    pub async fn send_copies(&self, id: &ProfileId, bytes: &[u8], copies: u32) -> Result<()> {
        let slot = self
            .existing(id)
            .ok_or_else(|| ConnectionError::NotConnected(id.clone()))?;
        let mut link = slot.link.lock().await;
        if !slot.state().is_connected() {
            return Err(ConnectionError::NotConnected(id.clone()).into());
        }

        slot.set_state(ConnectionState::Busy);
        let chunk = chunk_size(&link.profile.capabilities, link.transport.max_payload());
        let delay = Duration::from_millis(link.profile.capabilities.chunk_delay_ms);

        for copy in 1..=copies {
            if let Err(e) = write_chunked(link.transport.as_mut(), bytes, chunk, delay).await {
                warn!(copy, copies, error = %e, "send failed");
                self.handle_write_failure(&slot, &mut link, &e).await;
                return Err(e.into());
            }
            debug!(copy, copies, "copy delivered");
        }

        slot.set_state(ConnectionState::Idle);
        Ok(())
    }

    async fn handle_write_failure(&self, slot: &Arc<Slot>, link: &mut Link, e: &TransmissionError) {
        let id = link.profile.id.clone();
        link.transport.close().await;

        if !e.link_lost {
            slot.set_state(ConnectionState::Faulted);
            self.events.emit(ConnectionEvent::Faulted {
                profile: id,
                reason: e.message.clone(),
            });
            return;
        }

        slot.set_state(ConnectionState::Disconnected);
        self.events.emit(ConnectionEvent::Disconnected {
            profile: id.clone(),
            reason: e.message.clone(),
        });
        if link.profile.auto_reconnect && self.reconnect.max_attempts > 0 {
            link.stop_reconnecting();
            link.reconnect_task = Some(spawn_reconnect(
                Arc::clone(slot),
                id,
                self.reconnect.clone(),
                self.events.clone(),
            ));
        }
    }

    /// Close the session. Safe to call on a disconnected printer.
    pub async fn disconnect(&self, id: &ProfileId) {
        let Some(slot) = self.existing(id) else {
            return;
        };
        let mut link = slot.link.lock().await;
        link.stop_reconnecting();
        link.transport.close().await;
        if slot.state() != ConnectionState::Disconnected {
            slot.set_state(ConnectionState::Disconnected);
            info!(printer = %id, "printer disconnected");
            self.events.emit(ConnectionEvent::Disconnected {
                profile: id.clone(),
                reason: "disconnect requested".into(),
            });
        }
    }

    /// Close every session.
    pub async fn disconnect_all(&self) {
        let ids: Vec<ProfileId> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    pub fn state(&self, id: &ProfileId) -> ConnectionState {
        self.existing(id)
            .map(|slot| slot.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Connection state plus device readiness where the link can report it.
    ///
    /// A printer that is mid-send reports `Busy` with unknown readiness rather
    /// than waiting for the send to finish.
    pub async fn status(&self, id: &ProfileId) -> PrinterStatus {
        let Some(slot) = self.existing(id) else {
            return PrinterStatus {
                connection: ConnectionState::Disconnected,
                readiness: None,
            };
        };
        let state = slot.state();
        if state != ConnectionState::Idle {
            return PrinterStatus {
                connection: state,
                readiness: None,
            };
        }
        let mut link = slot.link.lock().await;
        let readiness = link.transport.query_status().await;
        PrinterStatus {
            connection: slot.state(),
            readiness,
        }
    }

    /// Enumerate reachable printers.
    pub async fn discover(&self, timeout: Duration) -> Vec<DiscoveredPrinter> {
        discovery::discover(timeout).await
    }
}

fn spawn_reconnect(
    slot: Arc<Slot>,
    id: ProfileId,
    policy: ReconnectPolicy,
    events: EventBus<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for attempt in 0..policy.max_attempts {
            tokio::time::sleep(policy.delay(attempt)).await;
            let mut link = slot.link.lock().await;
            if slot.state() != ConnectionState::Disconnected {
                return;
            }
            slot.set_state(ConnectionState::Connecting);
            match link.transport.open().await {
                Ok(()) => {
                    slot.set_state(ConnectionState::Idle);
                    info!(printer = %id, attempt = attempt + 1, "printer reconnected");
                    events.emit(ConnectionEvent::Reconnected(id));
                    return;
                }
                Err(e) => {
                    slot.set_state(ConnectionState::Disconnected);
                    debug!(printer = %id, attempt = attempt + 1, error = %e, "reconnect failed");
                }
            }
        }
        warn!(printer = %id, attempts = policy.max_attempts, "giving up on reconnect");
        events.emit(ConnectionEvent::ConnectionLost {
            profile: id,
            attempts: policy.max_attempts,
        });
    })
}

/// Smallest of the profile's declared chunk size and the link's own limit.
fn chunk_size(caps: &Capabilities, link_limit: Option<usize>) -> Option<usize> {
    [caps.max_chunk_size, link_limit]
        .into_iter()
        .flatten()
        .filter(|&n| n > 0)
        .min()
}

async fn write_chunked(
    transport: &mut dyn Transport,
    bytes: &[u8],
    chunk: Option<usize>,
    delay: Duration,
) -> std::result::Result<(), TransmissionError> {
    let size = chunk.unwrap_or(bytes.len()).max(1);
    let mut chunks = bytes.chunks(size).peekable();
    while let Some(piece) = chunks.next() {
        transport.write(piece).await?;
        if chunks.peek().is_some() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(())
}
