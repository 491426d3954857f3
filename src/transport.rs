//! The seam between the spooler and physical printers.
//!
//! The spooler only needs to hand a payload to a printer and learn whether
//! the device took it. How the bytes reach the device is up to the
//! [`PrintTransport`] implementation.
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Result of handing one unit to a printer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PrintOutcome {
    /// The device accepted the payload. This says nothing about whether the
    /// label has physically come out yet.
    Ack,
    /// A retryable, unit-scoped problem (device busy, timeout).
    Transient(String),
    /// The printer can't take any more work for this job.
    Fatal(FatalReason),
}

/// Why a job had to be abandoned. Each reason renders as a message plus what
/// the operator should do about it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FatalReason {
    PrinterOffline,
    NetworkTimeout,
    PaperOut,
    InvalidPayload,
    UnknownPrinter(String),
    /// Too many units exhausted their retries for the job to carry on.
    TooManyFailures(usize),
    Other(String),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use FatalReason::*;

        match self {
            PrinterOffline => f.write_str(
                "Printer is offline or not responding. Check printer power \
                 and connection, then retry.",
            ),
            NetworkTimeout => f.write_str(
                "Network connection to print server timed out. Check network \
                 connection and retry.",
            ),
            PaperOut => f.write_str(
                "Printer is out of paper or labels. Load labels into printer \
                 and retry.",
            ),
            InvalidPayload => f.write_str(
                "Invalid label data in template. Contact administrator to fix \
                 template.",
            ),
            UnknownPrinter(name) => write!(
                f,
                "Printer {name:?} is not configured. Add it to the printer \
                 list and retry."
            ),
            TooManyFailures(n) => write!(
                f,
                "{n} labels failed after retries. Check the printer, then \
                 resume the job."
            ),
            Other(msg) => write!(f, "Unknown error: {msg}"),
        }
    }
}

/// What a printer reports about itself before a job starts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrinterState {
    Idle,
    Busy,
    Stopped,
    Unknown,
}

#[async_trait]
pub trait PrintTransport: Send + Sync {
    /// Submits one unit's payload to `printer_ref`.
    async fn print_unit(&self, printer_ref: &str, payload: &[u8])
        -> PrintOutcome;

    /// Queries device state. Transports that can't tell report `Unknown`,
    /// which never blocks a job from starting.
    async fn printer_state(&self, _printer_ref: &str) -> PrinterState {
        PrinterState::Unknown
    }
}

/// Writes each payload to a raw TCP socket, as label printers accept on port
/// 9100. One connection per unit.
#[derive(Clone, Debug)]
pub struct RawSocketTransport {
    printers: HashMap<String, SocketAddr>,
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl RawSocketTransport {
    pub fn new(printers: HashMap<String, SocketAddr>) -> Self {
        Self {
            printers,
            connect_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn send(&self, addr: SocketAddr, payload: &[u8]) -> io::Result<()> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

        stream.write_all(payload).await?;
        stream.flush().await?;
        stream.shutdown().await
    }
}

#[async_trait]
impl PrintTransport for RawSocketTransport {
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    async fn print_unit(
        &self,
        printer_ref: &str,
        payload: &[u8],
    ) -> PrintOutcome {
        let Some(&addr) = self.printers.get(printer_ref) else {
            return PrintOutcome::Fatal(FatalReason::UnknownPrinter(
                printer_ref.to_owned(),
            ));
        };

        match self.send(addr, payload).await {
            Ok(()) => {
                debug!(%addr, "unit accepted");
                PrintOutcome::Ack
            },
            Err(error) => {
                warn!(%addr, %error, "unit not accepted");
                PrintOutcome::Transient(error.to_string())
            },
        }
    }

    #[instrument(skip(self))]
    async fn printer_state(&self, printer_ref: &str) -> PrinterState {
        let Some(&addr) = self.printers.get(printer_ref) else {
            return PrinterState::Unknown;
        };

        match timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => PrinterState::Idle,
            Ok(Err(error)) if error.kind() == io::ErrorKind::ConnectionRefused => {
                warn!(%addr, %error, "printer refused connection");
                PrinterState::Stopped
            },
            Ok(Err(error)) => {
                warn!(%addr, %error, "printer probe failed");
                PrinterState::Unknown
            },
            Err(_) => PrinterState::Unknown,
        }
    }
}
