//! Invocation context for echo handlers.
//!
//! A handler answers through its [`Context`]:
//! - `ok` - encode a success reply carrying one value
//! - `error` - encode an error reply; the call site and a backtrace become its debug text
//! - `error_with_debug` - encode an error reply with explicit debug text
//! - `close` - drop the reply; later `ok` / `error` calls do nothing
//!
//! Every answer returns the opaque [`Return`] token, which is the only value
//! a handler can return.
//!
//! # Example
//!
//! ```ignore
//! registry.add_echo("$.user", "sayHello", true, |ctx: &mut Context, name: String| {
//!     if name.is_empty() {
//!         return ctx.error("name is empty");
//!     }
//!     ctx.ok(format!("hello {}", name))
//! })?;
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;

use crate::codec::{Encode, Value};
use crate::error::{RpcError, WireError};
use crate::protocol::{Header, Stream, STREAM_POS_BODY};

/// Token proving a handler answered through its [`Context`].
///
/// It cannot be built outside this crate.
#[derive(Debug)]
#[must_use = "return this from the handler"]
pub struct Return {
    _private: (),
}

impl Return {
    const fn new() -> Self {
        Self { _private: () }
    }
}

/// What the reply stream currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Nothing written yet.
    Pending,
    /// A success reply.
    Ok,
    /// An error reply.
    Error,
    /// The context was closed; the reply is dropped.
    Closed,
}

/// Per-invocation context handed to echo handlers.
pub struct Context {
    reply: Stream,
    status: ReplyStatus,
    depth: u64,
    from: String,
}

impl Context {
    /// Detached context with an empty reply stream.
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::with_reply(Stream::new(), Header::new())
    }

    /// Bind a reply stream and copy the request header onto it.
    pub(crate) fn with_reply(mut reply: Stream, header: Header) -> Self {
        reply.reset();
        reply.set_header(&header);
        Self {
            reply,
            status: ReplyStatus::Pending,
            depth: 0,
            from: String::new(),
        }
    }

    pub(crate) fn bind_caller(&mut self, depth: u64, from: String) {
        self.depth = depth;
        self.from = from;
    }

    /// Call depth carried by the request.
    #[inline]
    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Origin the request came from.
    #[inline]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Header of the request (and of the reply).
    pub fn header(&self) -> Header {
        self.reply.header()
    }

    /// Current reply status.
    #[inline]
    pub fn status(&self) -> ReplyStatus {
        self.status
    }

    /// Whether [`close`](Self::close) was called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status == ReplyStatus::Closed
    }

    /// Drop the reply. Later answers become no-ops.
    pub fn close(&mut self) {
        self.reply.reset();
        self.status = ReplyStatus::Closed;
    }

    /// Answer with a success reply carrying `value`.
    ///
    /// If `value` cannot be encoded, an error reply is sent instead.
    pub fn ok<V: Encode>(&mut self, value: V) -> Return {
        if self.is_closed() {
            return Return::new();
        }
        self.rewind();
        self.reply.write_bool(true);
        match self.reply.write(&value) {
            Ok(()) => self.status = ReplyStatus::Ok,
            Err(e) => {
                self.fail(&format!("rpc reply encode error: {e}"), "");
            }
        }
        Return::new()
    }

    /// Answer with an error reply.
    ///
    /// The debug text is the caller location, followed by a backtrace when
    /// `RUST_BACKTRACE` enables one.
    #[track_caller]
    pub fn error(&mut self, message: impl fmt::Display) -> Return {
        if self.is_closed() {
            return Return::new();
        }
        let location = Location::caller();
        let mut debug = format!("{}:{}", location.file(), location.line());
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            debug.push('\n');
            debug.push_str(&backtrace.to_string());
        }
        self.fail(&message.to_string(), &debug);
        Return::new()
    }

    /// Answer with an error reply and explicit debug text.
    pub fn error_with_debug(
        &mut self,
        message: impl fmt::Display,
        debug: impl fmt::Display,
    ) -> Return {
        self.fail(&message.to_string(), &debug.to_string());
        Return::new()
    }

    /// Write an error reply unless closed.
    pub(crate) fn fail(&mut self, message: &str, debug: &str) {
        if self.is_closed() {
            return;
        }
        self.rewind();
        self.reply.write_bool(false);
        let written = self
            .reply
            .write_string(message)
            .and_then(|_| self.reply.write_string(debug));
        if written.is_err() {
            // oversized texts: keep the reply well formed
            self.rewind();
            self.reply.write_bool(false);
            self.reply.write_string("rpc reply encode error").ok();
            self.reply.write_string("").ok();
        }
        self.status = ReplyStatus::Error;
    }

    #[inline]
    fn rewind(&mut self) {
        self.reply.set_write_pos(STREAM_POS_BODY);
    }

    /// Borrow the reply stream.
    pub fn reply(&self) -> &Stream {
        &self.reply
    }

    /// Take the reply stream and its status.
    pub fn into_reply(self) -> (Stream, ReplyStatus) {
        (self.reply, self.status)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("status", &self.status)
            .field("depth", &self.depth)
            .field("from", &self.from)
            .finish()
    }
}

/// Decode a reply stream into its result value or error.
///
/// The outer `Result` fails when the reply is malformed.
pub fn read_reply(stream: &mut Stream) -> Result<std::result::Result<Value, RpcError>, WireError> {
    stream.set_read_pos(STREAM_POS_BODY)?;
    if stream.read_bool()? {
        return Ok(Ok(stream.read_value()?));
    }
    let message = stream.read_string()?;
    let debug = stream.read_string()?;
    Ok(Err(RpcError::new(message, debug)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(ctx: Context) -> std::result::Result<Value, RpcError> {
        let (mut reply, _) = ctx.into_reply();
        read_reply(&mut reply).unwrap()
    }

    #[test]
    fn test_ok_reply() {
        let mut ctx = Context::new();
        let _ = ctx.ok("hello world");
        assert_eq!(ctx.status(), ReplyStatus::Ok);
        assert_eq!(decode(ctx), Ok(Value::Str("hello world".into())));
    }

    #[test]
    fn test_error_reply_has_location() {
        let mut ctx = Context::new();
        let _ = ctx.error(format_args!("bad input {}", 3));
        let err = decode(ctx).unwrap_err();
        assert_eq!(err.message, "bad input 3");
        assert!(err.debug.starts_with(file!()));
    }

    #[test]
    fn test_last_answer_wins() {
        let mut ctx = Context::new();
        let _ = ctx.error_with_debug("first", "dbg");
        let _ = ctx.ok(7i64);
        assert_eq!(decode(ctx), Ok(Value::Int(7)));
    }

    #[test]
    fn test_close_makes_answers_noops() {
        let mut ctx = Context::new();
        ctx.close();
        let _ = ctx.ok(1u64);
        let _ = ctx.error("ignored");
        assert!(ctx.is_closed());
        assert!(ctx.reply().is_body_empty());
    }

    #[test]
    fn test_header_copied_onto_reply() {
        let mut header = Header::new();
        header.set_client_callback_id(11);
        let mut stale = Stream::new();
        stale.write_i64(99);
        let ctx = Context::with_reply(stale, header);
        assert_eq!(ctx.header().client_callback_id(), 11);
        assert!(ctx.reply().is_body_empty());
    }
}
