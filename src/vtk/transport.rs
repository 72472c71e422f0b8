//! Transport layer for VTK terminal communication.
//!
//! Defines the `VtkTransport` trait and the TCP implementation. A TCP link is
//! two independent byte streams: the write half and the read half are held
//! behind separate locks, so a read blocked waiting for the terminal never
//! holds up a write and an error on one direction says nothing about the
//! other.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Smallest wait handed to the socket; a zero read timeout is rejected by std.
const MIN_READ_WAIT: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstract byte-level transport to a VTK terminal.
///
/// No internal buffering: bytes go straight to and come straight from the
/// underlying link.
pub trait VtkTransport: Send + Sync {
    /// Write all of `data`. Returns number of bytes written.
    fn write_bytes(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available into `buf`, waiting at most `wait`.
    ///
    /// `Ok(0)` means nothing arrived in time; the link is still open. A
    /// closed link is reported as `TransportError::Closed`.
    fn read_bytes(&self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError>;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

impl<T: VtkTransport + ?Sized> VtkTransport for Arc<T> {
    fn write_bytes(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write_bytes(data)
    }

    fn read_bytes(&self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError> {
        (**self).read_bytes(buf, wait)
    }

    fn description(&self) -> String {
        (**self).description()
    }
}

// ---------------------------------------------------------------------------
// Network (TCP) transport
// ---------------------------------------------------------------------------

/// TCP transport to a terminal reachable over LAN.
pub struct TcpTransport {
    host: String,
    port: String,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl TcpTransport {
    /// Connect to `host:port` within `connect_timeout`.
    pub fn connect(
        host: &str,
        port: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let addr = format!("{host}:{port}");
        info!("Connecting TCP to {addr}");

        let targets: Vec<_> = addr
            .to_socket_addrs()
            .map_err(|_| TransportError::InvalidAddress(addr.clone()))?
            .collect();
        if targets.is_empty() {
            return Err(TransportError::InvalidAddress(addr));
        }

        let mut last_err = None;
        let mut connected = None;
        for target in &targets {
            match TcpStream::connect_timeout(target, connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!("TCP connect to {target} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        let stream = match (connected, last_err) {
            (Some(stream), _) => stream,
            (None, Some(source)) => return Err(TransportError::Connect { addr, source }),
            (None, None) => return Err(TransportError::InvalidAddress(addr)),
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY not set on {addr}: {e}");
        }
        Self::from_stream(host, port, stream)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(host: &str, port: &str, stream: TcpStream) -> Result<Self, TransportError> {
        let writer = stream.try_clone()?;
        info!("TCP connected to {host}:{port}");
        Ok(Self {
            host: host.to_string(),
            port: port.to_string(),
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    /// Shut down both directions. Further reads and writes fail.
    pub fn shutdown(&self) {
        let stream = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => info!("TCP disconnected from {}:{}", self.host, self.port),
            // Already closed by the peer
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => warn!("TCP shutdown of {}:{} failed: {e}", self.host, self.port),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl VtkTransport for TcpTransport {
    fn write_bytes(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut stream = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        debug!("TCP TX ({} bytes): {:02X?}", data.len(), data);
        stream.write_all(data)?;
        stream.flush()?;
        Ok(data.len())
    }

    fn read_bytes(&self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError> {
        let mut stream = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        stream.set_read_timeout(Some(wait.max(MIN_READ_WAIT)))?;

        match stream.read(buf) {
            Ok(0) => {
                warn!("TCP connection closed by peer");
                Err(TransportError::Closed)
            }
            Ok(n) => {
                debug!("TCP RX ({n} bytes): {:02X?}", &buf[..n]);
                Ok(n)
            }
            Err(ref e)
                if e.kind() == ErrorKind::TimedOut
                    || e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn description(&self) -> String {
        format!("TCP({}:{})", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Factory / helpers
// ---------------------------------------------------------------------------

/// Open a TCP transport to a terminal. No reconnect or backoff policy.
pub fn open_transport(
    host: &str,
    port: &str,
    connect_timeout: Duration,
) -> Result<Box<dyn VtkTransport>, TransportError> {
    Ok(Box::new(TcpTransport::connect(host, port, connect_timeout)?))
}

/// Read and discard whatever the transport yields until it stays quiet for
/// `window`. Returns the number of bytes discarded.
pub fn drain(transport: &dyn VtkTransport, window: Duration) -> Result<usize, TransportError> {
    let mut buf = [0u8; 512];
    let mut discarded = 0;
    let started = Instant::now();
    loop {
        let n = transport.read_bytes(&mut buf, window)?;
        if n == 0 {
            break;
        }
        discarded += n;
        // A terminal that never stops talking cannot hold the driver forever
        if started.elapsed() > window * 10 {
            warn!("Drain of {} gave up after {discarded} bytes", transport.description());
            break;
        }
    }
    Ok(discarded)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
