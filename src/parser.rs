//! implements a parser for the spooler's line protocol.
use std::fmt;

use crate::types::job::JobId;
use crate::types::protocol::{SpoolCommand, SpoolResponse};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl From<ParsingError> for SpoolResponse {
    fn from(value: ParsingError) -> Self {
        match value {
            ParsingError::BadFormat => SpoolResponse::BadFormat,
            ParsingError::UnknownCommand => SpoolResponse::UnknownCommand,
        }
    }
}

/// Longest accepted printer name, in bytes.
const MAX_NAME_LEN: usize = 200;

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting a space then a u32.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;
        parse_u32(token)
    }

    /// Consumes from the input, expecting a space then a job id.
    fn expect_next_id(&mut self) -> Result<JobId, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;
        std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ParsingError::BadFormat)
    }

    /// Consumes from the input, expecting a space then a name.
    fn expect_next_name(&mut self) -> Result<Vec<u8>, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;
        let r: Vec<u8> = token.to_vec();

        fn char_is_name_safe(c: u8, is_first: bool) -> bool {
            match c {
                b'a'..=b'z' => true,
                b'A'..=b'Z' => true,
                b'0'..=b'9' => true,
                b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' | b':' => {
                    true
                },
                b'-' => !is_first, // - is only name safe outside first position
                _ => false,
            }
        }

        if r.iter()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(*c, i == 0))
            && r.len() <= MAX_NAME_LEN
        {
            Ok(r)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes a space and a token if there's any input left.
    fn maybe_next_token(&mut self) -> Result<Option<Vec<u8>>, ParsingError> {
        if self.from.is_empty() {
            return Ok(None);
        }

        self.expect_space()?;
        Ok(Some(self.expect_next_token()?.to_vec()))
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

fn parse_u32(token: &[u8]) -> Result<u32, ParsingError> {
    if token.is_empty() {
        return Err(ParsingError::BadFormat);
    }

    let mut r = 0u32;
    for v in token {
        match v {
            b'0'..=b'9' => {
                r = r
                    .checked_mul(10)
                    .ok_or(ParsingError::BadFormat)?
                    .checked_add((*v - b'0') as u32)
                    .ok_or(ParsingError::BadFormat)?
            },
            _ => return Err(ParsingError::BadFormat),
        };
    }

    Ok(r)
}

/// Parses the `<n_bytes>` line that precedes each unit payload of a
/// `submit`.
pub fn parse_chunk_header(line: &[u8]) -> Result<u32, ParsingError> {
    parse_u32(line)
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for SpoolCommand {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use SpoolCommand::*;

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"quit" => Quit,
            b"stats" => Stats,

            // <cmd> <id>
            b"status" => Status {
                id: ps.expect_next_id()?,
            },
            b"cancel" => Cancel {
                id: ps.expect_next_id()?,
            },
            b"resume" => Resume {
                id: ps.expect_next_id()?,
            },

            // <cmd> <printer> <count> [<priority>]
            b"submit" => Submit {
                printer: ps.expect_next_name()?,
                count: ps.expect_next_u32()?,
                priority: ps.maybe_next_token()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}
