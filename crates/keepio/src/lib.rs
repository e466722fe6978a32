//! `keepio`: line-oriented IO for text-protocol proxying.
//!
//! This crate intentionally avoids tokio-util's codecs and implements just
//! what the proxy needs: CRLF/LF line framing over a per-socket accumulator
//! (`BytesMut::split_to(..).freeze()`, no copying). A lone CR never
//! terminates a line; partial trailing bytes stay buffered until more data
//! or EOF arrives.

pub mod line;

pub use line::LineReader;
