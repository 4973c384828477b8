//! Call descriptions, the configurable traced-attribute set, and the
//! active-span capability used to resolve parentage.

use opentelemetry::{otel_warn, Context, Key, KeyValue};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use crate::metadata::CallMetadata;

/// Span attribute naming the instrumented framework.
pub const COMPONENT: Key = Key::from_static_str("component");
/// Span attribute carrying the string form of the outgoing metadata.
pub const GRPC_HEADERS: Key = Key::from_static_str("grpc.headers");
/// Span attribute carrying the call's method type.
pub const GRPC_METHOD_TYPE: Key = Key::from_static_str("grpc.method_type");
/// Span attribute carrying the full method name.
pub const GRPC_METHOD_NAME: Key = Key::from_static_str("grpc.method_name");
/// Span attribute carrying the milliseconds remaining until the deadline.
pub const GRPC_DEADLINE_MILLIS: Key = Key::from_static_str("grpc.deadline_millis");

pub(crate) const COMPONENT_VALUE: &str = "grpc";

/// Immutable description of a single call: full method name, the two stream
/// flags, and an optional deadline. Created once per call and read by the
/// span builder and attribute population.
#[derive(Clone, Debug)]
pub struct CallDescriptor {
    method: Cow<'static, str>,
    client_streaming: bool,
    server_streaming: bool,
    deadline: Option<Duration>,
}

impl CallDescriptor {
    fn new(
        method: impl Into<Cow<'static, str>>,
        client_streaming: bool,
        server_streaming: bool,
    ) -> Self {
        CallDescriptor {
            method: method.into(),
            client_streaming,
            server_streaming,
            deadline: None,
        }
    }

    /// Describes a single-request, single-response call.
    pub fn unary(method: impl Into<Cow<'static, str>>) -> Self {
        CallDescriptor::new(method, false, false)
    }

    /// Describes a call streaming its requests.
    pub fn client_streaming(method: impl Into<Cow<'static, str>>) -> Self {
        CallDescriptor::new(method, true, false)
    }

    /// Describes a call streaming its responses.
    pub fn server_streaming(method: impl Into<Cow<'static, str>>) -> Self {
        CallDescriptor::new(method, false, true)
    }

    /// Describes a call streaming in both directions.
    pub fn bidi_streaming(method: impl Into<Cow<'static, str>>) -> Self {
        CallDescriptor::new(method, true, true)
    }

    /// Sets the time remaining until the call's deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The full method name, e.g. `/pkg.Service/Get`.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn method_name(&self) -> Cow<'static, str> {
        self.method.clone()
    }

    /// Whether the request side is a stream.
    pub fn is_client_streaming(&self) -> bool {
        self.client_streaming
    }

    /// Whether the response side is a stream.
    pub fn is_server_streaming(&self) -> bool {
        self.server_streaming
    }

    /// The time remaining until the deadline, if one was set.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// The method type derived from the two stream flags.
    pub fn method_type(&self) -> MethodType {
        match (self.client_streaming, self.server_streaming) {
            (false, false) => MethodType::Unary,
            (true, false) => MethodType::ClientStreaming,
            (false, true) => MethodType::ServerStreaming,
            (true, true) => MethodType::BidiStreaming,
        }
    }
}

/// The four gRPC method shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodType {
    /// Single request, single response.
    Unary,
    /// Streamed requests, single response.
    ClientStreaming,
    /// Single request, streamed responses.
    ServerStreaming,
    /// Streamed in both directions.
    BidiStreaming,
}

impl MethodType {
    /// The canonical string form recorded under [`GRPC_METHOD_TYPE`].
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodType::Unary => "UNARY",
            MethodType::ClientStreaming => "CLIENT_STREAMING",
            MethodType::ServerStreaming => "SERVER_STREAMING",
            MethodType::BidiStreaming => "BIDI_STREAMING",
        }
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional attributes recorded on call spans.
///
/// Unrecognized future variants are reported as a configuration warning and
/// skipped; they never fail the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TracedAttribute {
    /// Record the outgoing metadata under [`GRPC_HEADERS`].
    Headers,
    /// Record the method type under [`GRPC_METHOD_TYPE`].
    MethodType,
    /// Record the full method name under [`GRPC_METHOD_NAME`].
    MethodName,
    /// Record the milliseconds until the deadline under
    /// [`GRPC_DEADLINE_MILLIS`]; absent when the call has no deadline.
    Deadline,
}

pub(crate) fn call_attributes(
    descriptor: &CallDescriptor,
    metadata: &CallMetadata,
    traced: &[TracedAttribute],
) -> Vec<KeyValue> {
    let mut attributes = Vec::with_capacity(traced.len() + 1);
    attributes.push(KeyValue::new(COMPONENT, COMPONENT_VALUE));
    for attribute in traced {
        match attribute {
            TracedAttribute::Headers => {
                attributes.push(KeyValue::new(GRPC_HEADERS, metadata.to_string()));
            }
            TracedAttribute::MethodType => {
                attributes.push(KeyValue::new(
                    GRPC_METHOD_TYPE,
                    descriptor.method_type().as_str(),
                ));
            }
            TracedAttribute::MethodName => {
                attributes.push(KeyValue::new(
                    GRPC_METHOD_NAME,
                    descriptor.method().to_owned(),
                ));
            }
            TracedAttribute::Deadline => {
                if let Some(deadline) = descriptor.deadline() {
                    attributes.push(KeyValue::new(
                        GRPC_DEADLINE_MILLIS,
                        deadline.as_millis() as i64,
                    ));
                }
            }
            #[allow(unreachable_patterns)]
            other => {
                otel_warn!(
                    name: "GrpcInterceptor.UnsupportedTracedAttribute",
                    attribute = format!("{other:?}")
                );
            }
        }
    }
    attributes
}

/// A capability exposing the span currently considered active.
///
/// Used only to resolve the parentage of call-submission spans. Absence of a
/// source, or `None` from one, is valid and yields a root span.
pub trait ActiveSpanSource {
    /// Returns the context holding the active span, if any.
    fn active_context(&self) -> Option<Context>;
}

/// [`ActiveSpanSource`] backed by the current OpenTelemetry context.
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentContext;

impl ActiveSpanSource for CurrentContext {
    fn active_context(&self) -> Option<Context> {
        use opentelemetry::trace::TraceContextExt as _;
        Context::map_current(|cx| cx.has_active_span().then(|| cx.clone()))
    }
}
