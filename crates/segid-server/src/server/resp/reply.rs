use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;

pub const METHOD_NOT_SUPPORTED: Reply =
    Reply::error_static("Method is not supported. allow: GET,SET,DEL,EXISTS,SELECT");
pub const NOT_ENOUGH_ARGS: Reply = Reply::error_static("Not enough arguments for the command");
pub const EXPECTED_INTEGER: Reply = Reply::error_static("Expected integer");
pub const EXPECTED_POSITIVE_INTEGER: Reply = Reply::error_static("Expected positive integer");
pub const NO_KEY: Reply = Reply::error_static("no key for set");
pub const OK: Reply = Reply::Status(Cow::Borrowed("OK"));
pub const NIL: Reply = Reply::Bulk(None);

/// A RESP reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// `+<status>\r\n`
    Status(Cow<'static, str>),
    /// `-ERROR <message>\r\n`
    Error(Cow<'static, str>),
    /// `:<n>\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`, or `$-1\r\n` for `None`.
    Bulk(Option<Bytes>),
}

impl Reply {
    const fn error_static(message: &'static str) -> Self {
        Self::Error(Cow::Borrowed(message))
    }

    pub fn error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Error(message.into())
    }

    pub fn bulk_integer(value: i64) -> Self {
        Self::Bulk(Some(Bytes::from(value.to_string())))
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Appends the wire encoding of this reply to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Status(status) => {
                buf.put_u8(b'+');
                put_line(buf, status);
            }
            Self::Error(message) => {
                buf.put_slice(b"-ERROR ");
                put_line(buf, message);
            }
            Self::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Bulk(None) => buf.put_slice(b"$-1\r\n"),
            Self::Bulk(Some(value)) => {
                buf.put_u8(b'$');
                buf.put_slice(value.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(value);
                buf.put_slice(b"\r\n");
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

// Status and error lines cannot carry CR or LF.
fn put_line(buf: &mut BytesMut, text: &str) {
    buf.reserve(text.len() + 2);
    for b in text.bytes() {
        buf.put_u8(if b == b'\r' || b == b'\n' { b' ' } else { b });
    }
    buf.put_slice(b"\r\n");
}
