//! Handler module - echo registration and invocation.
//!
//! Provides:
//! - [`Registry`] - the service tree mapping echo paths to handlers
//! - [`Context`] - lets handlers answer with a value or an error
//! - [`EchoArg`] / [`IntoEcho`] - the typed handler signature machinery
//!
//! # Example
//!
//! ```
//! use echowire::handler::{Context, Registry};
//!
//! let mut registry = Registry::new(16);
//! let user = registry.add_service("$", "user").unwrap();
//!
//! // Typed echo: the signature is the closure's parameter list
//! registry
//!     .add_echo(&user, "sayHello", true, |ctx: &mut Context, name: String| {
//!         ctx.ok(format!("hello {}", name))
//!     })
//!     .unwrap();
//!
//! // Dynamic echo: kinds are declared one by one
//! registry
//!     .echo(&user, "add")
//!     .arg_i64()
//!     .arg_i64()
//!     .build(|ctx, args| {
//!         let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
//!         ctx.ok(sum)
//!     })
//!     .unwrap();
//!
//! assert_eq!(registry.echo_count(), 2);
//! ```

mod args;
mod context;
mod echo;
mod registry;

pub use args::{fingerprint, wire_type_name, ArgKind, ArgReader, EchoArg};
pub(crate) use args::format_call;
pub use context::{read_reply, Context, ReplyStatus, Return};
pub use echo::{DynamicFn, DynamicHandler, Echo, EchoBuilder, Handler, IntoEcho, TypedHandler};
pub use registry::{EchoInfo, Registry, ROOT_SERVICE};
