//! Request evaluation: decode the request prologue, resolve the echo, run the
//! handler and leave a reply on the reply stream.
//!
//! Request layout after the 16-byte header:
//!
//! ```text
//! string(echo path) ‖ u64(depth) ‖ string(from) ‖ arg*
//! ```

use std::sync::Arc;
use std::time::Instant;

use super::panic::catch_panic;
use crate::codec::Value;
use crate::handler::{format_call, wire_type_name, ArgReader, Context, Echo, Registry, ReplyStatus};
use crate::protocol::{Stream, STREAM_POS_BODY};

/// Error message for a request whose prologue cannot be decoded.
pub const DATA_FORMAT_ERROR: &str = "rpc data format error";

/// Evaluates requests against a frozen [`Registry`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    max_call_depth: u64,
}

impl Dispatcher {
    /// Create a dispatcher refusing requests deeper than `max_call_depth`.
    pub fn new(registry: Arc<Registry>, max_call_depth: u64) -> Self {
        Self {
            registry,
            max_call_depth,
        }
    }

    /// The registry echoes are resolved against.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Maximum accepted call depth.
    pub fn max_call_depth(&self) -> u64 {
        self.max_call_depth
    }

    /// Evaluate the request held by `inbound`, answering on `reply`.
    ///
    /// `reply` is reset and receives the request header first. The returned
    /// stream is the filled reply; its body is empty when the handler closed
    /// its context. `scratch` is reused by dynamic handlers.
    ///
    /// The arguments are handed to the handler as an [`ArgReader`] over
    /// `inbound`, so container arguments share the request bytes.
    pub fn evaluate(&self, mut inbound: Stream, reply: Stream, scratch: &mut Vec<Value>) -> Stream {
        let start = Instant::now();
        let mut ctx = Context::with_reply(reply, inbound.header());

        if inbound.set_read_pos(STREAM_POS_BODY).is_err() {
            ctx.fail(DATA_FORMAT_ERROR, "");
            return ctx.into_reply().0;
        }

        let path = match inbound.read_string() {
            Ok(path) => path,
            Err(_) => {
                ctx.fail(DATA_FORMAT_ERROR, "");
                return ctx.into_reply().0;
            }
        };

        let Some(echo) = self.registry.get_echo(&path) else {
            ctx.fail(&format!("rpc echo path {path} is not mounted"), "");
            return ctx.into_reply().0;
        };

        let depth = match inbound.read_u64() {
            Ok(depth) => depth,
            Err(_) => {
                ctx.fail(DATA_FORMAT_ERROR, "");
                return ctx.into_reply().0;
            }
        };
        if depth > self.max_call_depth {
            ctx.fail(
                &format!(
                    "rpc current call depth ({depth}) is overflow. limit({})",
                    self.max_call_depth
                ),
                "",
            );
            return ctx.into_reply().0;
        }

        let from = match inbound.read_string() {
            Ok(from) => from,
            Err(_) => {
                ctx.fail(DATA_FORMAT_ERROR, "");
                return ctx.into_reply().0;
            }
        };
        ctx.bind_caller(depth, from);

        let args_start = inbound.read_pos();
        let mut args = ArgReader::new(inbound);
        let outcome = catch_panic(|| echo.handler().call(&mut ctx, &mut args, scratch));
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                let message = mismatch_message(echo, args.stream(), args_start);
                ctx.fail(&message, echo.location());
            }
            Err(panic) => {
                scratch.clear();
                tracing::error!(
                    "echo {} panicked: {}\n{}",
                    echo.path(),
                    panic.message,
                    panic.debug
                );
                ctx.fail(
                    &format!(
                        "rpc call {} runtime error: {}",
                        echo.call_string(),
                        panic.message
                    ),
                    &panic.debug,
                );
            }
        }

        let successful = matches!(ctx.status(), ReplyStatus::Ok | ReplyStatus::Closed);
        echo.indicator()
            .count(start.elapsed(), ctx.from(), successful);
        ctx.into_reply().0
    }
}

/// Build the argument mismatch diagnostic from the bytes actually sent.
fn mismatch_message(echo: &Echo, inbound: &Stream, args_start: usize) -> String {
    let limit = inbound.write_pos();
    let mut pos = args_start;
    let mut found = Vec::new();
    while pos < limit {
        match inbound.skip_at(pos) {
            Ok(skip) if pos + skip <= limit => {
                found.push(wire_type_name(inbound.byte_at(pos)));
                pos += skip;
            }
            _ => {
                found.push("<invalid>");
                break;
            }
        }
    }
    format!(
        "rpc echo arguments not match\nCalled: {}\nRequired: {}",
        format_call(echo.path(), found),
        echo.call_string()
    )
}
