//! Scripted in-memory transport for testing without a terminal.
//!
//! Every write is recorded with its timestamp and handed to an optional
//! responder, which schedules reply chunks on the read side. Reads block on
//! a condvar until a chunk is due or the caller's wait runs out, so session
//! timing behaves as it would on a socket.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::vtk::protocol::{param, Decoded, Message, MSG_FINISH, MSG_IDLE, MSG_VEND};
use crate::vtk::protocols::vendotek::{decode_frame, encode_frame, Direction, DEFAULT_MAX_FRAME_LEN};
use crate::vtk::transport::VtkTransport;

/// Bytes the mock makes readable `after` the write that triggered them.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub after: Duration,
    pub bytes: Vec<u8>,
}

impl Chunk {
    pub fn now(bytes: Vec<u8>) -> Self {
        Self {
            after: Duration::ZERO,
            bytes,
        }
    }

    pub fn delayed(after: Duration, bytes: Vec<u8>) -> Self {
        Self { after, bytes }
    }
}

/// Split `bytes` into `pieces` chunks released `gap` apart.
pub fn split_reply(bytes: &[u8], pieces: usize, gap: Duration) -> Vec<Chunk> {
    let size = bytes.len().div_ceil(pieces.max(1)).max(1);
    bytes
        .chunks(size)
        .enumerate()
        .map(|(i, c)| Chunk::delayed(gap * i as u32, c.to_vec()))
        .collect()
}

/// One recorded write.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub at: Instant,
    pub bytes: Vec<u8>,
}

type Responder = Box<dyn Fn(&[u8]) -> Vec<Chunk> + Send + Sync>;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<(Instant, Vec<u8>)>,
    writes: Vec<WriteRecord>,
    read_calls: usize,
}

/// Mock transport driven by a responder closure.
pub struct MockTransport {
    state: Mutex<MockState>,
    ready: Condvar,
    responder: Option<Responder>,
    fail_writes: bool,
    fail_reads: bool,
}

impl MockTransport {
    /// A transport that accepts writes and never answers.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            ready: Condvar::new(),
            responder: None,
            fail_writes: false,
            fail_reads: false,
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Chunk> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Every write fails with a broken pipe.
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Every read fails with a connection reset.
    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Queue bytes that are readable immediately, as if left over from an
    /// earlier exchange.
    pub fn push_inbound(&self, bytes: Vec<u8>) {
        let mut state = self.lock();
        state.inbound.push_back((Instant::now(), bytes));
        self.ready.notify_all();
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl VtkTransport for MockTransport {
    fn write_bytes(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.fail_writes {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        let at = Instant::now();
        let replies = self
            .responder
            .as_ref()
            .map(|r| r(data))
            .unwrap_or_default();

        let mut state = self.lock();
        state.writes.push(WriteRecord {
            at,
            bytes: data.to_vec(),
        });
        for chunk in replies {
            state.inbound.push_back((at + chunk.after, chunk.bytes));
        }
        self.ready.notify_all();
        Ok(data.len())
    }

    fn read_bytes(&self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError> {
        let now = Instant::now();
        let deadline = now.checked_add(wait).unwrap_or(now + Duration::from_secs(3600));
        let mut state = self.lock();
        state.read_calls += 1;
        if self.fail_reads {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "mock read failure",
            )));
        }

        loop {
            let now = Instant::now();
            let due = state.inbound.front().map(|(ready_at, _)| *ready_at);
            match due {
                Some(ready_at) if ready_at <= now => {
                    let Some((ready_at, mut bytes)) = state.inbound.pop_front() else {
                        return Ok(0);
                    };
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        bytes.drain(..n);
                        state.inbound.push_front((ready_at, bytes));
                    }
                    return Ok(n);
                }
                _ if now >= deadline => return Ok(0),
                _ => {
                    let wake = due.map_or(deadline, |d| d.min(deadline));
                    let (guard, _) = self
                        .ready
                        .wait_timeout(state, wake.saturating_duration_since(now))
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }
    }

    fn description(&self) -> String {
        "Mock".into()
    }
}

// ---------------------------------------------------------------------------
// Scripted terminal
// ---------------------------------------------------------------------------

/// Operation timeout the scripted terminal advertises in `IDL`, seconds.
pub const TERMINAL_OPERATION_TIMEOUT_SECS: u64 = 60;

/// Encode a message as the terminal would send it.
///
/// # Panics
///
/// If the message does not fit in a frame.
pub fn terminal_frame(message: &Message) -> Vec<u8> {
    match encode_frame(message, Direction::FromTerminal) {
        Ok(frame) => frame,
        Err(e) => panic!("terminal fixture cannot be framed: {e}"),
    }
}

/// [`vendotek_terminal_at`] with a terminal whose last operation was 0.
pub fn vendotek_terminal(
    approve_limit: u64,
    decline_reason: &str,
    delay: Duration,
) -> impl Fn(&[u8]) -> Vec<Chunk> + Send + Sync + 'static {
    vendotek_terminal_at(0, approve_limit, decline_reason, delay)
}

/// Responder that behaves like a Vendotek terminal.
///
/// `IDL` is answered with the last operation number and the operation
/// timeout. A `VRP` charge up to `approve_limit` minor units is confirmed
/// with the same operation number and amount; anything larger is answered
/// with amount `0` and `decline_reason` as event name. Either way the `VRP`
/// operation number becomes the last one. `FIN` is echoed.
pub fn vendotek_terminal_at(
    last_operation: u64,
    approve_limit: u64,
    decline_reason: &str,
    delay: Duration,
) -> impl Fn(&[u8]) -> Vec<Chunk> + Send + Sync + 'static {
    let decline_reason = decline_reason.to_string();
    let last_operation = AtomicU64::new(last_operation);
    move |request: &[u8]| {
        let Decoded::Frame { message, .. } =
            decode_frame(request, Direction::ToTerminal, DEFAULT_MAX_FRAME_LEN)
        else {
            return Vec::new();
        };
        let op = message.number(param::OPERATION).unwrap_or(0);
        let amount = message.number(param::AMOUNT).unwrap_or(0);
        let reply = match message.name().as_deref() {
            Some(MSG_IDLE) => Message::named(MSG_IDLE)
                .with_number(param::OPERATION, last_operation.load(Ordering::SeqCst))
                .with_number(param::OPERATION_TIMEOUT, TERMINAL_OPERATION_TIMEOUT_SECS),
            Some(MSG_VEND) => {
                last_operation.store(op, Ordering::SeqCst);
                let base = Message::named(MSG_VEND).with_number(param::OPERATION, op);
                if amount <= approve_limit {
                    base.with_number(param::AMOUNT, amount)
                } else {
                    base.with_number(param::AMOUNT, 0)
                        .with_text(param::EVENT_NAME, &decline_reason)
                }
            }
            Some(MSG_FINISH) => Message::named(MSG_FINISH)
                .with_number(param::OPERATION, op)
                .with_number(param::AMOUNT, amount),
            _ => return Vec::new(),
        };
        vec![Chunk::delayed(delay, terminal_frame(&reply))]
    }
}

/// Names of the messages in `writes`, in order.
pub fn sent_names(writes: &[WriteRecord]) -> Vec<String> {
    writes
        .iter()
        .filter_map(|w| match decode_frame(&w.bytes, Direction::ToTerminal, DEFAULT_MAX_FRAME_LEN) {
            Decoded::Frame { message, .. } => message.name(),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_writes_and_replies() {
        let t = MockTransport::new().with_responder(|_| vec![Chunk::now(b"ok".to_vec())]);
        t.write_bytes(b"hi").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(t.read_bytes(&mut buf, Duration::from_millis(10)).unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
        assert_eq!(t.writes().len(), 1);
        assert_eq!(t.writes()[0].bytes, b"hi");
    }

    #[test]
    fn test_delayed_chunk_not_visible_early() {
        let t = MockTransport::new()
            .with_responder(|_| vec![Chunk::delayed(Duration::from_millis(80), vec![1])]);
        t.write_bytes(b"x").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(t.read_bytes(&mut buf, Duration::from_millis(10)).unwrap(), 0);
        assert_eq!(t.read_bytes(&mut buf, Duration::from_millis(200)).unwrap(), 1);
    }

    #[test]
    fn test_partial_buffer_keeps_remainder() {
        let t = MockTransport::new();
        t.push_inbound(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(t.read_bytes(&mut buf, Duration::ZERO).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        let mut rest = [0u8; 8];
        assert_eq!(t.read_bytes(&mut rest, Duration::ZERO).unwrap(), 3);
        assert_eq!(&rest[..3], &[3, 4, 5]);
    }

    fn reply_to(responder: &dyn Fn(&[u8]) -> Vec<Chunk>, message: Message) -> Message {
        let request = encode_frame(&message, Direction::ToTerminal).unwrap();
        let chunks = responder(&request);
        match decode_frame(&chunks[0].bytes, Direction::FromTerminal, DEFAULT_MAX_FRAME_LEN) {
            Decoded::Frame { message, .. } => message,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_scripted_terminal_tracks_operation_numbers() {
        let terminal = vendotek_terminal_at(41, 5000, "limit", Duration::ZERO);
        let idle = reply_to(&terminal, Message::named(MSG_IDLE));
        assert_eq!(idle.number(param::OPERATION), Some(41));
        assert_eq!(
            idle.number(param::OPERATION_TIMEOUT),
            Some(TERMINAL_OPERATION_TIMEOUT_SECS)
        );

        let vend = reply_to(
            &terminal,
            Message::named(MSG_VEND)
                .with_number(param::OPERATION, 42)
                .with_number(param::AMOUNT, 100),
        );
        assert_eq!(vend.number(param::AMOUNT), Some(100));
        let fin = reply_to(
            &terminal,
            Message::named(MSG_FINISH)
                .with_number(param::OPERATION, 42)
                .with_number(param::AMOUNT, 100),
        );
        assert_eq!(fin.number(param::OPERATION), Some(42));

        let idle = reply_to(&terminal, Message::named(MSG_IDLE));
        assert_eq!(idle.number(param::OPERATION), Some(42));
    }

    #[test]
    #[should_panic(expected = "cannot be framed")]
    fn test_oversized_fixture_fails_loudly() {
        terminal_frame(&Message::named(MSG_FINISH).with_text(param::BANKING_RECEIPT, &"x".repeat(70_000)));
    }

    #[test]
    fn test_split_reply_sizes() {
        let chunks = split_reply(&[0u8; 10], 3, Duration::from_millis(5));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.bytes.len()).sum::<usize>(), 10);
        assert_eq!(chunks[2].after, Duration::from_millis(10));
    }
}
