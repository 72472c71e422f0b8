//! Protocol session: one request, one response, one outcome.
//!
//! A session encodes the request, writes it, then accumulates inbound bytes
//! until the codec yields a frame, the codec rejects the bytes, the
//! accumulation ceiling is hit or the deadline passes. Reads are issued in
//! slices no longer than the poll interval so the deadline is honoured even
//! when the terminal stays silent. Sessions never retry.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::CodecError;
use crate::vtk::protocol::*;
use crate::vtk::transport::VtkTransport;

const READ_CHUNK: usize = 256;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 4096;

const DEFAULT_DECLINE_REASON: &str = "declined by terminal";
const AMOUNT_MISMATCH: &str = "amount-mismatch";
const FINISH_UNCONFIRMED: &str = "finish-unconfirmed";

/// What a session asks the terminal to do.
///
/// A charge is three exchanges: `Announce` fetches the terminal's operation
/// number, `Charge` asks for the money and `Finish` confirms the vend.
#[derive(Debug, Clone)]
pub enum Exchange {
    /// Idle round-trip announcing a pending charge.
    Announce(MoneyRequest),
    /// Charge a validated amount.
    Charge(MoneyRequest),
    /// Confirm an approved charge.
    Finish(MoneyRequest),
    /// Idle round-trip to check the terminal answers.
    Ping { deadline: Instant },
}

impl Exchange {
    pub fn deadline(&self) -> Instant {
        match self {
            Exchange::Announce(request)
            | Exchange::Charge(request)
            | Exchange::Finish(request) => request.deadline(),
            Exchange::Ping { deadline } => *deadline,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Exchange::Charge(_) => MSG_VEND,
            Exchange::Finish(_) => MSG_FINISH,
            Exchange::Announce(_) | Exchange::Ping { .. } => MSG_IDLE,
        }
    }
}

/// Bounds on a single session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Most bytes accumulated while waiting for one frame.
    pub max_response_bytes: usize,
    /// Longest single blocking read.
    pub poll_interval: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: ResponseOutcome,
    /// Bytes received after the response frame. They belong to no request.
    pub trailing: usize,
    pub elapsed: Duration,
    /// The decoded response, when one arrived.
    pub response: Option<Message>,
}

enum State {
    Sending,
    AwaitingResponse,
    Interpreting(Message),
    Done(ResponseOutcome),
}

/// A single-use exchange over a borrowed transport.
pub struct Session<'a> {
    transport: &'a dyn VtkTransport,
    codec: &'a dyn Codec,
    limits: SessionLimits,
    buffer: Vec<u8>,
    trailing: usize,
    response: Option<Message>,
}

impl<'a> Session<'a> {
    pub fn new(
        transport: &'a dyn VtkTransport,
        codec: &'a dyn Codec,
        limits: SessionLimits,
    ) -> Self {
        Self {
            transport,
            codec,
            limits,
            buffer: Vec::with_capacity(READ_CHUNK),
            trailing: 0,
            response: None,
        }
    }

    /// Drive the exchange to its outcome. Encoding failures surface before
    /// any byte is written.
    pub fn run(mut self, exchange: &Exchange) -> Result<SessionReport, CodecError> {
        let started = Instant::now();
        let request = match exchange {
            Exchange::Announce(request) => self.codec.encode_announce(request)?,
            Exchange::Charge(request) => self.codec.encode_request(request)?,
            Exchange::Finish(request) => self.codec.encode_finish(request)?,
            Exchange::Ping { .. } => self.codec.encode_ping()?,
        };

        let mut state = State::Sending;
        loop {
            state = match state {
                State::Sending => self.send(&request),
                State::AwaitingResponse => self.await_response(exchange.deadline()),
                State::Interpreting(message) => {
                    let outcome = interpret(exchange, &message, &self.buffer);
                    self.response = Some(message);
                    State::Done(outcome)
                }
                State::Done(outcome) => {
                    let elapsed = started.elapsed();
                    if outcome.is_approved() {
                        info!(
                            "{} session via {} approved in {elapsed:?}",
                            exchange.label(),
                            self.transport.description()
                        );
                    } else {
                        warn!(
                            "{} session via {} ended {} after {elapsed:?}",
                            exchange.label(),
                            self.transport.description(),
                            outcome.label()
                        );
                    }
                    return Ok(SessionReport {
                        outcome,
                        trailing: self.trailing,
                        elapsed,
                        response: self.response,
                    });
                }
            };
        }
    }

    fn send(&self, request: &[u8]) -> State {
        match self.transport.write_bytes(request) {
            Ok(_) => State::AwaitingResponse,
            Err(cause) => State::Done(ResponseOutcome::TransportFailure { cause }),
        }
    }

    fn await_response(&mut self, deadline: Instant) -> State {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let now = Instant::now();
            if now >= deadline {
                if !self.buffer.is_empty() {
                    debug!("Deadline hit with {} partial bytes", self.buffer.len());
                }
                return State::Done(ResponseOutcome::TimedOut);
            }
            let wait = (deadline - now).min(self.limits.poll_interval);

            let n = match self.transport.read_bytes(&mut chunk, wait) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(cause) => return State::Done(ResponseOutcome::TransportFailure { cause }),
            };
            self.buffer.extend_from_slice(&chunk[..n]);

            // The ceiling only applies to bytes that have not formed a frame
            match self.codec.try_decode_response(&self.buffer) {
                Decoded::Incomplete if self.buffer.len() > self.limits.max_response_bytes => {
                    warn!(
                        "Response exceeded {} byte ceiling",
                        self.limits.max_response_bytes
                    );
                    return State::Done(ResponseOutcome::Malformed {
                        raw: std::mem::take(&mut self.buffer),
                    });
                }
                Decoded::Incomplete => continue,
                Decoded::Frame { message, consumed } => {
                    self.trailing = self.buffer.len() - consumed;
                    self.buffer.truncate(consumed);
                    debug!(
                        "RX frame ({consumed} bytes): {:02X?}\n{}",
                        &self.buffer,
                        message.dump()
                    );
                    return State::Interpreting(message);
                }
                Decoded::Invalid { reason } => {
                    warn!("Undecodable response: {reason}");
                    return State::Done(ResponseOutcome::Malformed {
                        raw: std::mem::take(&mut self.buffer),
                    });
                }
            }
        }
    }
}

/// Map a decoded response to an outcome.
pub fn interpret(exchange: &Exchange, message: &Message, raw: &[u8]) -> ResponseOutcome {
    let Some(name) = message.name() else {
        return ResponseOutcome::Malformed { raw: raw.to_vec() };
    };

    match exchange {
        Exchange::Ping { .. } | Exchange::Announce(_) if name == MSG_IDLE => {
            ResponseOutcome::Approved
        }
        Exchange::Finish(request) if name == MSG_FINISH => {
            if is_foreign_operation(message, request) {
                return ResponseOutcome::Malformed { raw: raw.to_vec() };
            }
            if message.number(param::AMOUNT) == Some(request.amount_minor()) {
                ResponseOutcome::Approved
            } else {
                warn!(
                    "Terminal did not confirm the vend of operation {}",
                    request.operation()
                );
                ResponseOutcome::DeviceError {
                    code: FINISH_UNCONFIRMED.to_string(),
                }
            }
        }
        Exchange::Charge(request) if name == MSG_VEND => {
            if is_foreign_operation(message, request) {
                return ResponseOutcome::Malformed { raw: raw.to_vec() };
            }
            match message.number(param::AMOUNT) {
                Some(amount) if amount == request.amount_minor() => ResponseOutcome::Approved,
                None | Some(0) => ResponseOutcome::Declined {
                    reason: message
                        .text(param::EVENT_NAME)
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| DEFAULT_DECLINE_REASON.to_string()),
                },
                Some(amount) => {
                    warn!(
                        "Terminal confirmed {amount}, requested {}",
                        request.amount_minor()
                    );
                    ResponseOutcome::DeviceError {
                        code: AMOUNT_MISMATCH.to_string(),
                    }
                }
            }
        }
        _ => ResponseOutcome::DeviceError {
            code: message
                .text(param::EVENT_NUMBER)
                .filter(|c| !c.is_empty())
                .unwrap_or(name),
        },
    }
}

fn is_foreign_operation(message: &Message, request: &MoneyRequest) -> bool {
    let echoed_op = message.number(param::OPERATION);
    let foreign = echoed_op.is_some_and(|op| op != u64::from(request.operation()));
    if foreign {
        warn!(
            "Response for operation {:?}, expected {}",
            echoed_op,
            request.operation()
        );
    }
    foreign
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
