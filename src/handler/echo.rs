//! Echo handlers.
//!
//! Two ways to bind a handler:
//!
//! - **Typed**: any `Fn(&mut Context, A1, .., An) -> Return` where every
//!   `Ai` is an [`EchoArg`]. The argument decoder is monomorphised at
//!   registration; no per-call dispatch on kinds.
//! - **Dynamic**: an [`EchoBuilder`] declares the kinds one by one and the
//!   handler receives the decoded arguments as a `&[Value]` slice borrowed
//!   from the worker's scratch buffer.

use std::marker::PhantomData;
use std::sync::Arc;

use super::args::{fingerprint, format_call, ArgKind, ArgReader, EchoArg};
use super::context::{Context, Return};
use super::registry::Registry;
use crate::codec::Value;
use crate::error::{MountError, WireError};
use crate::processor::Indicator;

/// Trait for bound echo handlers.
pub trait Handler: Send + Sync + 'static {
    /// Decode the arguments under the cursor of `args` and run the handler.
    ///
    /// Fails without calling the handler if the arguments do not match the
    /// declared kinds or bytes remain after the last one.
    fn call(
        &self,
        ctx: &mut Context,
        args: &mut ArgReader,
        scratch: &mut Vec<Value>,
    ) -> Result<Return, WireError>;
}

/// Functions that can be mounted as typed echoes.
///
/// Implemented for closures and functions taking `&mut Context` followed by
/// up to eight [`EchoArg`] parameters and returning [`Return`].
pub trait IntoEcho<Args>: Send + Sync + 'static {
    /// Declared argument kinds, in order.
    fn arg_kinds() -> Vec<ArgKind>;

    /// Decode the arguments and invoke.
    fn invoke(&self, ctx: &mut Context, args: &mut ArgReader) -> Result<Return, WireError>;
}

macro_rules! impl_into_echo {
    ($($ty:ident $var:ident),*) => {
        impl<F, $($ty,)*> IntoEcho<($($ty,)*)> for F
        where
            F: Fn(&mut Context, $($ty,)*) -> Return + Send + Sync + 'static,
            $($ty: EchoArg,)*
        {
            fn arg_kinds() -> Vec<ArgKind> {
                vec![$($ty::KIND,)*]
            }

            fn invoke(&self, ctx: &mut Context, args: &mut ArgReader) -> Result<Return, WireError> {
                $(let $var = $ty::read_arg(args)?;)*
                if args.remaining() != 0 {
                    return Err(WireError::TrailingBytes);
                }
                Ok((self)(ctx, $($var,)*))
            }
        }
    };
}

impl_into_echo!();
impl_into_echo!(A1 a1);
impl_into_echo!(A1 a1, A2 a2);
impl_into_echo!(A1 a1, A2 a2, A3 a3);
impl_into_echo!(A1 a1, A2 a2, A3 a3, A4 a4);
impl_into_echo!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
impl_into_echo!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
impl_into_echo!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);
impl_into_echo!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7, A8 a8);

/// Wrapper that binds a typed function as a [`Handler`].
pub struct TypedHandler<F, Args> {
    handler: F,
    _phantom: PhantomData<fn(Args)>,
}

impl<F, Args> TypedHandler<F, Args>
where
    F: IntoEcho<Args>,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Args> Handler for TypedHandler<F, Args>
where
    F: IntoEcho<Args>,
    Args: 'static,
{
    fn call(
        &self,
        ctx: &mut Context,
        args: &mut ArgReader,
        _scratch: &mut Vec<Value>,
    ) -> Result<Return, WireError> {
        self.handler.invoke(ctx, args)
    }
}

/// Boxed function taking decoded arguments as a slice.
pub type DynamicFn = dyn Fn(&mut Context, &[Value]) -> Return + Send + Sync + 'static;

/// Handler whose argument kinds are declared at runtime.
pub struct DynamicHandler {
    kinds: Vec<ArgKind>,
    handler: Box<DynamicFn>,
}

impl DynamicHandler {
    /// Bind `handler` to the given argument kinds.
    pub fn new<F>(kinds: Vec<ArgKind>, handler: F) -> Self
    where
        F: Fn(&mut Context, &[Value]) -> Return + Send + Sync + 'static,
    {
        Self {
            kinds,
            handler: Box::new(handler),
        }
    }
}

impl Handler for DynamicHandler {
    fn call(
        &self,
        ctx: &mut Context,
        args: &mut ArgReader,
        scratch: &mut Vec<Value>,
    ) -> Result<Return, WireError> {
        scratch.clear();
        for kind in &self.kinds {
            scratch.push(kind.read_value(args)?);
        }
        if args.remaining() != 0 {
            return Err(WireError::TrailingBytes);
        }
        let ret = (self.handler)(ctx, scratch);
        scratch.clear();
        Ok(ret)
    }
}

/// A mounted echo.
pub struct Echo {
    path: String,
    export: bool,
    kinds: Vec<ArgKind>,
    fingerprint: String,
    call_string: String,
    location: String,
    typed: bool,
    handler: Box<dyn Handler>,
    indicator: Arc<Indicator>,
}

impl Echo {
    pub(crate) fn new(
        path: String,
        export: bool,
        kinds: Vec<ArgKind>,
        typed: bool,
        handler: Box<dyn Handler>,
        location: String,
        capture_origins: bool,
    ) -> Self {
        let call_string = format_call(&path, kinds.iter().map(|k| k.type_name()));
        Self {
            fingerprint: fingerprint(&kinds),
            call_string,
            path,
            export,
            kinds,
            location,
            typed,
            handler,
            indicator: Arc::new(Indicator::new(capture_origins)),
        }
    }

    /// Full echo path, e.g. `$.user:sayHello`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Echo name (the part after `:`).
    pub fn name(&self) -> &str {
        self.path.rsplit(':').next().unwrap_or(&self.path)
    }

    /// Whether the echo is visible to remote callers listing the registry.
    pub fn is_exported(&self) -> bool {
        self.export
    }

    pub fn arg_kinds(&self) -> &[ArgKind] {
        &self.kinds
    }

    /// Signature fingerprint, e.g. `"SI"`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// `path(ctx, types..) Return`.
    pub fn call_string(&self) -> &str {
        &self.call_string
    }

    /// `file:line` of the registration call.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Whether arguments are decoded by a compiled decoder rather than the
    /// kind-by-kind scratch path.
    pub fn has_fast_path(&self) -> bool {
        self.typed
    }

    /// Performance counters.
    pub fn indicator(&self) -> &Arc<Indicator> {
        &self.indicator
    }

    pub(crate) fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }
}

impl std::fmt::Debug for Echo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Echo")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint)
            .field("export", &self.export)
            .field("location", &self.location)
            .finish()
    }
}

/// Declares a dynamic echo one argument at a time.
///
/// ```ignore
/// registry
///     .echo("$.math", "scale")
///     .arg_f64()
///     .arg_i64()
///     .build(|ctx, args| {
///         let x = args[0].as_f64().unwrap_or_default();
///         let n = args[1].as_i64().unwrap_or_default();
///         ctx.ok(x * n as f64)
///     })?;
/// ```
#[must_use = "call build() to mount the echo"]
pub struct EchoBuilder<'r> {
    registry: &'r mut Registry,
    service: String,
    name: String,
    export: bool,
    kinds: Vec<ArgKind>,
}

impl<'r> EchoBuilder<'r> {
    pub(crate) fn new(registry: &'r mut Registry, service: &str, name: &str) -> Self {
        Self {
            registry,
            service: service.to_string(),
            name: name.to_string(),
            export: true,
            kinds: Vec::new(),
        }
    }

    /// Set whether the echo is exported (default true).
    pub fn export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    /// Declare one more argument.
    pub fn arg(mut self, kind: ArgKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn arg_i64(self) -> Self {
        self.arg(ArgKind::Int)
    }

    pub fn arg_u64(self) -> Self {
        self.arg(ArgKind::Uint)
    }

    pub fn arg_f64(self) -> Self {
        self.arg(ArgKind::Float)
    }

    pub fn arg_bool(self) -> Self {
        self.arg(ArgKind::Bool)
    }

    pub fn arg_string(self) -> Self {
        self.arg(ArgKind::Str)
    }

    pub fn arg_bytes(self) -> Self {
        self.arg(ArgKind::Bytes)
    }

    pub fn arg_array(self) -> Self {
        self.arg(ArgKind::Array)
    }

    pub fn arg_map(self) -> Self {
        self.arg(ArgKind::Map)
    }

    /// Mount the echo. Returns its full path.
    #[track_caller]
    pub fn build<F>(self, handler: F) -> Result<String, MountError>
    where
        F: Fn(&mut Context, &[Value]) -> Return + Send + Sync + 'static,
    {
        let kinds = self.kinds.clone();
        let handler = DynamicHandler::new(self.kinds, handler);
        self.registry.mount_echo(
            &self.service,
            &self.name,
            self.export,
            kinds,
            false,
            Box::new(handler),
            std::panic::Location::caller(),
        )
    }
}
