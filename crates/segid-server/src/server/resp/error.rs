/// Framing failures. Each one ends the connection without a reply.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("malformed request: {got:?} does not match {expected}")]
    Malformed {
        expected: &'static str,
        got: String,
    },

    #[error("malformed request: argument count {0} is out of range")]
    ArgumentCount(i64),

    #[error("malformed request: argument length {0} is out of range")]
    ArgumentLength(i64),

    #[error("malformed request: line should end with CRLF")]
    MissingCrlf,

    #[error("malformed request: line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("connection closed mid-request")]
    UnexpectedEof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(expected: &'static str, line: &[u8]) -> Self {
        Self::Malformed {
            expected,
            got: String::from_utf8_lossy(line).into_owned(),
        }
    }
}
