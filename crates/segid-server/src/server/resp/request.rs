use crate::server::resp::{
    error::ProtocolError,
    reply::{EXPECTED_INTEGER, NOT_ENOUGH_ARGS, Reply},
};
use bytes::Bytes;
use std::borrow::Cow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest `argc` accepted in a request header.
pub const MAX_ARGUMENTS: i64 = 1024;

/// Largest single argument accepted, in bytes.
pub const MAX_ARGUMENT_LEN: i64 = 512 * 1024;

// `*1024\r\n` and `$524288\r\n` fit comfortably.
const MAX_HEADER_LINE: u64 = 32;

/// A parsed command. `command` is upper-cased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub arguments: Vec<Bytes>,
}

impl Request {
    pub fn new(command: &str, arguments: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        Self {
            command: command.to_ascii_uppercase(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_argument(&self, index: usize) -> bool {
        index < self.arguments.len()
    }

    /// The argument at `index`, or the "not enough arguments" reply.
    pub fn argument(&self, index: usize) -> Result<&Bytes, Reply> {
        self.arguments.get(index).ok_or(NOT_ENOUGH_ARGS)
    }

    pub fn get_string(&self, index: usize) -> Result<Cow<'_, str>, Reply> {
        self.argument(index).map(|arg| String::from_utf8_lossy(arg))
    }

    /// Parses the argument at `index` as a base-10 `i64`.
    pub fn get_int(&self, index: usize) -> Result<i64, Reply> {
        let arg = self.argument(index)?;
        core::str::from_utf8(arg)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(EXPECTED_INTEGER)
    }

    /// `1`, `on`, `yes` and `true` (any case) are true; anything else is
    /// false.
    pub fn get_bool(&self, index: usize) -> Result<bool, Reply> {
        let arg = self.argument(index)?;
        Ok(matches!(
            arg.to_ascii_lowercase().as_slice(),
            b"1" | b"on" | b"yes" | b"true"
        ))
    }
}

/// Reads one request.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly before
/// sending anything.
///
/// # Errors
///
/// Any framing deviation is a [`ProtocolError`]; the connection cannot be
/// resynchronised afterwards.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_HEADER_LINE as usize);
    if read_line(reader, &mut line).await? == 0 {
        return Ok(None);
    }

    let argc = parse_header(&line, b'*', "*<#Arguments>")?;
    if !(1..=MAX_ARGUMENTS).contains(&argc) {
        return Err(ProtocolError::ArgumentCount(argc));
    }

    let command = read_argument(reader, &mut line).await?;
    let mut arguments = Vec::with_capacity(argc as usize - 1);
    for _ in 1..argc {
        arguments.push(read_argument(reader, &mut line).await?);
    }

    Ok(Some(Request {
        command: String::from_utf8_lossy(&command).to_ascii_uppercase(),
        arguments,
    }))
}

async fn read_argument<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<Bytes, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    if read_line(reader, line).await? == 0 {
        return Err(ProtocolError::UnexpectedEof);
    }

    let len = parse_header(line, b'$', "$<ArgumentLength>")?;
    if !(0..=MAX_ARGUMENT_LEN).contains(&len) {
        return Err(ProtocolError::ArgumentLength(len));
    }

    let len = len as usize;
    let mut data = vec![0; len + 2];
    reader.read_exact(&mut data).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(err)
        }
    })?;

    if !data.ends_with(b"\r\n") {
        return Err(ProtocolError::MissingCrlf);
    }
    data.truncate(len);
    Ok(Bytes::from(data))
}

// Reads up to and including `\n`, refusing lines longer than a header can be.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader)
        .take(MAX_HEADER_LINE)
        .read_until(b'\n', line)
        .await?;

    if n > 0 && line.last() != Some(&b'\n') {
        return Err(if n as u64 >= MAX_HEADER_LINE {
            ProtocolError::LineTooLong(MAX_HEADER_LINE as usize)
        } else {
            ProtocolError::UnexpectedEof
        });
    }
    Ok(n)
}

fn parse_header(line: &[u8], marker: u8, expected: &'static str) -> Result<i64, ProtocolError> {
    let Some(body) = line.strip_suffix(b"\r\n") else {
        return Err(ProtocolError::MissingCrlf);
    };
    let Some(digits) = body.strip_prefix(&[marker]) else {
        return Err(ProtocolError::malformed(expected, line));
    };
    core::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::malformed(expected, line))
}
