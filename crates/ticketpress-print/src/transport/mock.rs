// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scriptable in-memory transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use ticketpress_core::error::{ConnectionError, TransmissionError};
use ticketpress_core::types::{PrinterProfile, PrinterReadiness, ProfileId, TransportKind};

use super::{Transport, TransportFactory};

/// One recorded call to `write`.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub at: Instant,
    pub bytes: Vec<u8>,
    pub ok: bool,
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Consumed one per `open`; empty means success.
    pub open_results: VecDeque<Result<(), ConnectionError>>,
    /// Consumed one per `write`; empty means success.
    pub write_results: VecDeque<Result<(), TransmissionError>>,
    /// Used for every write once `write_results` is drained.
    pub fail_every_write: Option<TransmissionError>,
    pub readiness: Option<PrinterReadiness>,
    pub open_delay: Duration,
    pub write_delay: Duration,
    pub max_payload: Option<usize>,
    pub writes: Vec<WriteRecord>,
    pub opens: u32,
    pub closes: u32,
    pub in_flight: usize,
    pub max_in_flight: usize,
}

/// Handle shared between a test and the transports it hands out.
#[derive(Debug, Clone, Default)]
pub struct MockPrinter {
    state: Arc<Mutex<MockState>>,
}

impl MockPrinter {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn transport(&self, kind: TransportKind) -> MockTransport {
        MockTransport {
            kind,
            printer: self.clone(),
            open: false,
        }
    }

    pub fn script_writes(&self, results: impl IntoIterator<Item = Result<(), TransmissionError>>) {
        self.state().write_results.extend(results);
    }

    pub fn script_opens(&self, results: impl IntoIterator<Item = Result<(), ConnectionError>>) {
        self.state().open_results.extend(results);
    }

    pub fn fail_every_write(&self, err: Option<TransmissionError>) {
        self.state().fail_every_write = err;
    }

    pub fn set_readiness(&self, readiness: Option<PrinterReadiness>) {
        self.state().readiness = readiness;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.state().open_delay = delay;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state().write_delay = delay;
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    /// Concatenated bytes of successful writes.
    pub fn delivered(&self) -> Vec<u8> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.ok)
            .flat_map(|w| w.bytes.iter().copied())
            .collect()
    }

    pub fn opens(&self) -> u32 {
        self.state().opens
    }
}

pub struct MockTransport {
    kind: TransportKind,
    printer: MockPrinter,
    open: bool,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        format!("mock-{}", self.kind)
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        let delay = self.printer.state().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = {
            let mut state = self.printer.state();
            state.opens += 1;
            state.open_results.pop_front().unwrap_or(Ok(()))
        };
        self.open = result.is_ok();
        result
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransmissionError> {
        if !self.open {
            return Err(TransmissionError::link_lost("mock link closed"));
        }
        let delay = {
            let mut state = self.printer.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.write_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.printer.state();
        state.in_flight -= 1;
        let result = match state.write_results.pop_front() {
            Some(result) => result,
            None => match &state.fail_every_write {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
        };
        state.writes.push(WriteRecord {
            at: Instant::now(),
            bytes: bytes.to_vec(),
            ok: result.is_ok(),
        });
        if matches!(&result, Err(e) if e.link_lost) {
            self.open = false;
        }
        result
    }

    async fn query_status(&mut self) -> Option<PrinterReadiness> {
        self.printer.state().readiness
    }

    async fn close(&mut self) {
        if self.open {
            self.printer.state().closes += 1;
        }
        self.open = false;
    }

    fn max_payload(&self) -> Option<usize> {
        self.printer.state().max_payload
    }
}

/// Hands out mock transports, one shared [`MockPrinter`] per profile.
#[derive(Debug, Default)]
pub struct MockFactory {
    printers: Mutex<HashMap<ProfileId, MockPrinter>>,
}

impl MockFactory {
    pub fn printer(&self, id: &str) -> MockPrinter {
        self.printers
            .lock()
            .expect("mock factory poisoned")
            .entry(ProfileId::from(id))
            .or_default()
            .clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, profile: &PrinterProfile) -> Box<dyn Transport> {
        let printer = self.printer(profile.id.as_str());
        Box::new(printer.transport(profile.transport_kind()))
    }
}
