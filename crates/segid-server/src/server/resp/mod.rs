//! The Redis-protocol command server.
//!
//! Requests are RESP arrays of bulk strings (`*<argc>\r\n` followed by
//! `$<len>\r\n<bytes>\r\n` per argument). Replies use the status, error,
//! integer and bulk types. The supported commands are `GET`, `SET`, `EXISTS`,
//! `DEL` and `SELECT`.

pub mod error;
pub mod handler;
pub mod listener;
pub mod reply;
pub mod request;
