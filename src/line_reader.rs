use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Provides a facility to read CRLF-terminated lines, and fixed-size payload
/// chunks between them, from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but lacks a CRLF.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads the next line, without its CRLF. Returns None at end of stream,
    /// dropping any unterminated tail.
    ///
    /// Cancel-safe: the only await is a `read_buf` on the inner reader, and
    /// whatever it delivered is kept in `buf`.
    ///
    /// A read error is held back until buffered lines have been handed out.
    /// Calling again afterwards retries the read.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Only scan the bytes not yet checked, starting one early so a CR
            // at the end of the previous read can pair with an LF at the start
            // of this one. Lines already buffered are returned before reading
            // again, so pipelined commands come out one per call.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let line =
                    self.buf.split_to(self.maybe_crlf_from + eoc + 2).freeze();
                self.maybe_crlf_from = 0;

                return Ok(Some(line.slice(0..line.len() - 2)));
            } else {
                let n_bytes_read =
                    match self.reader.read_buf(&mut self.buf).await {
                        Ok(n) => n,
                        Err(e) => {
                            self.pending_error = Some(e);
                            0
                        },
                    };

                // One byte before the newly read data, or 0.
                self.maybe_crlf_from =
                    self.buf.len().checked_sub(n_bytes_read + 1).unwrap_or(0);

                // End of stream, or a read error surfaced once the buffered
                // lines are gone.
                if n_bytes_read == 0 {
                    return match self.pending_error.take() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
            }
        }
    }

    /// Reads exactly `n` bytes, regardless of any CRLFs they contain. Used for
    /// unit payloads, which are length-prefixed rather than line-delimited.
    ///
    /// Returns None if the stream ends first, discarding the partial chunk.
    /// Cancel-safe for the same reason as `read_line`.
    pub async fn read_bytes(&mut self, n: usize) -> io::Result<Option<Bytes>> {
        while self.buf.len() < n {
            let n_bytes_read = self.reader.read_buf(&mut self.buf).await?;
            if n_bytes_read == 0 {
                return Ok(None);
            }
        }

        self.maybe_crlf_from = 0;
        Ok(Some(self.buf.split_to(n).freeze()))
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}
