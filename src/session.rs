//! Serves the line protocol on a single client connection.
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::line_reader::LineReader;
use crate::parser::parse_chunk_header;
use crate::spooler::Spooler;
use crate::types::job::Priority;
use crate::types::protocol::{SpoolCommand, SpoolResponse};
use crate::types::serialisable::WireSerialisable;
use crate::util::bytes_to_human_str;

/// Upper bound on units preallocated for a `submit` before any arrive.
const PREALLOC_UNITS: usize = 1024;

/// Caps on what one `submit` may send, checked while its chunks are read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Limits {
    pub max_unit_size: usize,
    pub max_units: usize,
}

enum Outcome {
    Reply(SpoolResponse),
    /// The stream can't be resynchronised after this reply.
    ReplyAndClose(SpoolResponse),
    Hangup,
}

/// Reads commands from `conn` and answers them in order until the client
/// quits, the stream ends, or `cancel` fires.
pub async fn serve_conn<S>(
    spooler: &Spooler,
    conn: S,
    cancel: CancellationToken,
    limits: Limits,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (r, mut w) = tokio::io::split(conn);
    let mut r: LineReader<_> = r.into();

    loop {
        let line = select!(
           x = r.read_line() => match x? {
                Some(x) => x,
                None => return Ok(()),
           },
           _ = cancel.cancelled() => return Ok(()),
        );

        trace!(line = bytes_to_human_str(&line), "processing command");

        let outcome = match SpoolCommand::try_from(&line as &[u8]) {
            Ok(cmd) => select! {
                x = process(spooler, &mut r, cmd, limits) => x?,
                _ = cancel.cancelled() => return Ok(()),
            },
            Err(error) => Outcome::Reply(error.into()),
        };

        let (resp, close) = match outcome {
            Outcome::Reply(resp) => (resp, false),
            Outcome::ReplyAndClose(resp) => (resp, true),
            Outcome::Hangup => return Ok(()),
        };

        let buf = resp.serialise_wire();
        select! {
            x = w.write_all(&buf) => x?,
            _ = cancel.cancelled() => return Ok(()),
        };
        select! {
            x = w.flush() => x?,
            _ = cancel.cancelled() => return Ok(()),
        };

        if close {
            debug!(?resp, "closing connection after framing error");
            return Ok(());
        }
    }
}

async fn process<R: AsyncRead + Unpin>(
    spooler: &Spooler,
    r: &mut LineReader<R>,
    cmd: SpoolCommand,
    limits: Limits,
) -> io::Result<Outcome> {
    use SpoolResponse::*;

    let resp = match cmd {
        SpoolCommand::Quit => return Ok(Outcome::Hangup),
        SpoolCommand::Submit {
            printer,
            count,
            priority,
        } => {
            return read_submission(
                spooler,
                r,
                &printer,
                count,
                priority.as_deref(),
                limits,
            )
            .await
        },
        SpoolCommand::Status { id } => match spooler.status(&id) {
            Ok(data) => OkStatus { data },
            Err(error) => error.into(),
        },
        SpoolCommand::Cancel { id } => match spooler.cancel(&id) {
            Ok(()) => Cancelled,
            Err(error) => error.into(),
        },
        SpoolCommand::Resume { id } => match spooler.resume(&id) {
            Ok(id) => Resumed { id },
            Err(error) => error.into(),
        },
        SpoolCommand::Stats => OkStats {
            data: spooler.stats(),
        },
    };

    Ok(Outcome::Reply(resp))
}

/// Reads the `count` unit chunks following a `submit` line, then admits the
/// job.
async fn read_submission<R: AsyncRead + Unpin>(
    spooler: &Spooler,
    r: &mut LineReader<R>,
    printer: &[u8],
    count: u32,
    priority: Option<&[u8]>,
    limits: Limits,
) -> io::Result<Outcome> {
    let count = count as usize;
    if count > limits.max_units {
        return Ok(Outcome::ReplyAndClose(SpoolResponse::JobTooBig));
    }
    let mut units = Vec::with_capacity(count.min(PREALLOC_UNITS));

    for _ in 0..count {
        let Some(header) = r.read_line().await? else {
            return Ok(Outcome::Hangup);
        };
        let n_bytes = match parse_chunk_header(&header) {
            Ok(n) => n as usize,
            Err(error) => return Ok(Outcome::ReplyAndClose(error.into())),
        };
        if n_bytes > limits.max_unit_size {
            return Ok(Outcome::ReplyAndClose(SpoolResponse::UnitTooBig));
        }

        let Some(chunk) = r.read_bytes(n_bytes + 2).await? else {
            return Ok(Outcome::Hangup);
        };
        if !chunk.ends_with(b"\r\n") {
            return Ok(Outcome::ReplyAndClose(SpoolResponse::ExpectedCrlf));
        }
        units.push(chunk.slice(..n_bytes));
    }

    let priority = match priority
        .map(|p| String::from_utf8_lossy(p).parse::<Priority>())
        .transpose()
    {
        Ok(priority) => priority,
        Err(error) => return Ok(Outcome::Reply(error.into())),
    };

    let resp = match spooler.submit(
        units,
        &String::from_utf8_lossy(printer),
        priority,
    ) {
        Ok(id) => SpoolResponse::Submitted { id },
        Err(error) => error.into(),
    };

    Ok(Outcome::Reply(resp))
}
