//! Card reader driver: the caller-facing side of the terminal link.
//!
//! Owns one transport and one codec for its whole lifetime. A charge is a
//! short series of protocol sessions (`IDL`, `VRP`, `FIN`, `IDL`) run under
//! a single guard: the terminal handles one operation at a time, so a second
//! caller's bytes would corrupt the first caller's flow.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::vtk::protocol::*;
use crate::vtk::protocols;
use crate::vtk::session::{Exchange, Session, SessionLimits, SessionReport};
use crate::vtk::transport::{self, VtkTransport};

const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Link state
// ---------------------------------------------------------------------------

/// State shared by successive sessions; only touched under the guard.
struct LinkState {
    /// Used when the terminal does not report its own counter.
    next_operation: u32,
    /// The last session may have left bytes on the link.
    dirty: bool,
}

impl LinkState {
    /// Adopt the terminal's last operation number from its `IDL` reply.
    /// The local counter stays in use for terminals that omit it.
    fn note_terminal_operation(&mut self, idle: Option<&Message>) {
        let reported = idle
            .and_then(|m| m.number(param::OPERATION))
            .and_then(|last| u32::try_from(last).ok());
        match reported {
            Some(last) => self.next_operation = last.wrapping_add(1).max(1),
            None => debug!("Terminal did not report its operation number"),
        }
    }

    fn take_operation(&mut self) -> u32 {
        let operation = self.next_operation;
        self.next_operation = operation.wrapping_add(1).max(1);
        operation
    }
}

// ---------------------------------------------------------------------------
// Card reader
// ---------------------------------------------------------------------------

/// Driver for one VTK terminal.
pub struct CardReader {
    transport: Box<dyn VtkTransport>,
    codec: Box<dyn Codec>,
    limits: SessionLimits,
    drain_window: Duration,
    link: Mutex<LinkState>,
}

impl CardReader {
    pub fn new(transport: Box<dyn VtkTransport>, codec: Box<dyn Codec>) -> Self {
        Self {
            transport,
            codec,
            limits: SessionLimits::default(),
            drain_window: DEFAULT_DRAIN_WINDOW,
            link: Mutex::new(LinkState {
                next_operation: 1,
                dirty: false,
            }),
        }
    }

    /// Connect to the terminal described by `config`.
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let codec = protocols::create_codec(&config.protocol, config.max_response_bytes)?;
        let transport =
            transport::open_transport(&config.host, &config.port, config.connect_timeout())?;
        Ok(Self::new(transport, codec)
            .with_limits(config.session_limits())
            .with_drain_window(config.drain_window()))
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_drain_window(mut self, drain_window: Duration) -> Self {
        self.drain_window = drain_window;
        self
    }

    pub fn description(&self) -> String {
        format!("{} via {}", self.codec.name(), self.transport.description())
    }

    /// Charge `main_amount.decimal_amount` of the ISO 4217 currency
    /// `currency_code`, waiting at most `timeout` for the terminal.
    ///
    /// Runs the terminal's payment flow: `IDL` announces the charge and
    /// yields the terminal's last operation number, `VRP` charges under the
    /// next number and `FIN` confirms the vend. A closing `IDL` returns the
    /// terminal to its idle screen.
    ///
    /// Never retries: a timed-out or failed charge may still have been
    /// processed by the terminal, so retrying is the caller's decision.
    pub fn request_money(
        &self,
        currency_code: u16,
        main_amount: u64,
        decimal_amount: u64,
        timeout: Duration,
    ) -> Result<ChargeReceipt, DriverError> {
        self.request_money_for(currency_code, main_amount, decimal_amount, None, timeout)
    }

    /// Like [`request_money`](Self::request_money) with product metadata
    /// shown on the terminal.
    pub fn request_money_for(
        &self,
        currency_code: u16,
        main_amount: u64,
        decimal_amount: u64,
        product: Option<Product>,
        timeout: Duration,
    ) -> Result<ChargeReceipt, DriverError> {
        let deadline = deadline_after(timeout)?;
        let started_at = Utc::now().to_rfc3339();

        let mut link = self.lock_link();
        let mut request =
            MoneyRequest::new(currency_code, main_amount, decimal_amount, 0, deadline)?;
        if let Some(product) = product {
            request = request.with_product(product);
        }

        info!(
            "Charging {} minor units of {} on {}",
            request.amount_minor(),
            request.currency(),
            self.transport.description()
        );
        let idle = self.run_session(&mut link, &Exchange::Announce(request.clone()))?;
        link.note_terminal_operation(idle.as_ref());
        let operation = link.take_operation();
        let request = request
            .with_operation(operation)
            .with_deadline(vend_deadline(deadline, idle.as_ref()));

        let result = self
            .run_session(&mut link, &Exchange::Charge(request.clone()))
            .and_then(|_| {
                let finish = request.clone().with_deadline(deadline);
                self.run_session(&mut link, &Exchange::Finish(finish))
            });
        self.close_flow(&mut link, deadline);
        result?;

        Ok(ChargeReceipt {
            operation,
            currency: request.currency().code(),
            amount_minor: request.amount_minor(),
            started_at,
            completed_at: Utc::now().to_rfc3339(),
        })
    }

    /// Idle round-trip: succeeds when the terminal answers `IDL`.
    pub fn ping(&self, timeout: Duration) -> Result<(), DriverError> {
        let deadline = deadline_after(timeout)?;
        let mut link = self.lock_link();
        let idle = self.run_session(&mut link, &Exchange::Ping { deadline })?;
        link.note_terminal_operation(idle.as_ref());
        Ok(())
    }

    fn lock_link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the terminal to idle after a charge. Best effort: the outcome
    /// of the charge is already decided.
    fn close_flow(&self, link: &mut LinkState, deadline: Instant) {
        if link.dirty || Instant::now() >= deadline {
            return;
        }
        if let Err(e) = self.run_session(link, &Exchange::Ping { deadline }) {
            debug!("Closing IDL not acknowledged: {e}");
        }
    }

    /// Run one session while the caller holds the link guard. Returns the
    /// terminal's reply when the outcome is a success.
    fn run_session(
        &self,
        link: &mut LinkState,
        exchange: &Exchange,
    ) -> Result<Option<Message>, DriverError> {
        if link.dirty {
            let discarded = transport::drain(self.transport.as_ref(), self.drain_window)?;
            if discarded > 0 {
                warn!("Discarded {discarded} stale bytes before new session");
            }
            link.dirty = false;
        }

        let SessionReport {
            outcome,
            trailing,
            response,
            ..
        } = Session::new(self.transport.as_ref(), self.codec.as_ref(), self.limits).run(exchange)?;
        link.dirty = outcome.leaves_link_dirty() || trailing > 0;
        outcome.into_result().map(|()| response)
    }
}

/// The charge deadline, shortened to the operation timeout the terminal
/// advertised in its `IDL` reply.
fn vend_deadline(deadline: Instant, idle: Option<&Message>) -> Instant {
    idle.and_then(|m| m.number(param::OPERATION_TIMEOUT))
        .filter(|secs| *secs > 0)
        .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)))
        .map_or(deadline, |terminal| terminal.min(deadline))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
