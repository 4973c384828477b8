//! Service-side interceptor.
//!
//! One server span is produced per handled invocation, parented to the
//! remote context recovered from the invocation metadata when one is
//! present. Handlers receive a [`ServerContext`] through which they can
//! declare an application-level failure without raising an error.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanBuilder, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_warn, Context, Key, KeyValue};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::call::{call_attributes, ActiveSpanSource, CallDescriptor, TracedAttribute};
use crate::metadata::{extract_span_context, CallMetadata};
use crate::stream::{
    message_attributes, RequestLogStream, TracedResponseStream, MESSAGE_EVENT,
    MESSAGE_TYPE_RECEIVED, MESSAGE_TYPE_SENT,
};

/// Span attribute carrying the caller's IPv4 address.
pub const PEER_IPV4: Key = Key::from_static_str("peer.ipv4");
/// Span attribute carrying the caller's IPv6 address.
pub const PEER_IPV6: Key = Key::from_static_str("peer.ipv6");
/// Span attribute carrying the caller's port.
pub const PEER_PORT: Key = Key::from_static_str("peer.port");

const ERROR_EVENT: &str = "error";
const ERROR_KIND: Key = Key::from_static_str("error.kind");
const ERROR_MESSAGE: Key = Key::from_static_str("message");

struct DeclaredFailure {
    kind: Cow<'static, str>,
    message: Option<String>,
}

/// Per-invocation context handed to service handlers.
///
/// Exposes the invocation span as an [`ActiveSpanSource`], so a handler
/// making outgoing calls of its own can parent them to the server span, and
/// lets the handler declare a non-OK outcome without raising an error.
pub struct ServerContext {
    cx: Context,
    failure: Arc<Mutex<Option<DeclaredFailure>>>,
}

impl ServerContext {
    fn new(cx: Context) -> Self {
        ServerContext {
            cx,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Declares that the invocation completed with a non-OK status code.
    ///
    /// The invocation span is marked failed when it ends, with an `error`
    /// event carrying the declared kind and message. Declaring a failure
    /// does not abort the handler.
    pub fn set_error_status(
        &self,
        kind: impl Into<Cow<'static, str>>,
        message: Option<String>,
    ) {
        *self.failure.lock().unwrap() = Some(DeclaredFailure {
            kind: kind.into(),
            message,
        });
    }

    /// The context holding the invocation span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Check to run just before the span ends, recording any failure the
    /// handler declared while the response stream was being produced.
    fn completion_check(&self) -> Box<dyn FnOnce(&Context) + Send> {
        let failure = Arc::clone(&self.failure);
        Box::new(move |cx| record_declared_failure(cx, &failure))
    }
}

impl ActiveSpanSource for ServerContext {
    fn active_context(&self) -> Option<Context> {
        Some(self.cx.clone())
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("failed", &self.failure.lock().unwrap().is_some())
            .finish()
    }
}

fn record_declared_failure(cx: &Context, failure: &Mutex<Option<DeclaredFailure>>) {
    if let Some(failure) = failure.lock().unwrap().take() {
        let span = cx.span();
        span.set_status(Status::error(failure.kind.clone()));
        let mut attributes = vec![KeyValue::new(ERROR_KIND, failure.kind)];
        if let Some(message) = failure.message {
            attributes.push(KeyValue::new(ERROR_MESSAGE, message));
        }
        span.add_event(ERROR_EVENT, attributes);
    }
}

/// Parses the transport peer string into span attributes.
///
/// Recognizes the `ipv4:address:port` and `ipv6:[address]:port` forms.
/// Anything else is reported as a warning and contributes no attributes.
fn peer_attributes(peer: &str) -> Vec<KeyValue> {
    if let Some(rest) = peer.strip_prefix("ipv4:") {
        if let Some((address, port)) = rest.rsplit_once(':') {
            return vec![
                KeyValue::new(PEER_IPV4, address.to_owned()),
                KeyValue::new(PEER_PORT, port.to_owned()),
            ];
        }
    } else if let Some(rest) = peer.strip_prefix("ipv6:") {
        if let Some((address, port)) = rest.rsplit_once(':') {
            let address = address
                .strip_prefix('[')
                .and_then(|a| a.strip_suffix(']'))
                .unwrap_or(address);
            return vec![
                KeyValue::new(PEER_IPV6, address.to_owned()),
                KeyValue::new(PEER_PORT, port.to_owned()),
            ];
        }
    }
    otel_warn!(
        name: "GrpcServerInterceptor.UnrecognizedPeer",
        peer = peer.to_owned()
    );
    Vec::new()
}

/// Service-side interceptor producing one server span per invocation.
pub struct ServerInterceptor<T, P> {
    tracer: Arc<T>,
    propagator: Arc<P>,
    log_payloads: bool,
    traced_attributes: Vec<TracedAttribute>,
}

impl<T, P> ServerInterceptor<T, P> {
    /// Starts building an interceptor around a tracer and a propagator.
    pub fn builder(tracer: T, propagator: P) -> ServerInterceptorBuilder<T, P> {
        ServerInterceptorBuilder {
            tracer,
            propagator,
            log_payloads: false,
            traced_attributes: Vec::new(),
        }
    }
}

/// Builder for [`ServerInterceptor`].
#[derive(Debug)]
pub struct ServerInterceptorBuilder<T, P> {
    tracer: T,
    propagator: P,
    log_payloads: bool,
    traced_attributes: Vec<TracedAttribute>,
}

impl<T, P> ServerInterceptorBuilder<T, P> {
    /// Whether request and response payloads are logged as span events.
    pub fn log_payloads(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    /// Selects the optional attributes recorded on every invocation span.
    pub fn with_traced_attributes(
        mut self,
        attributes: impl IntoIterator<Item = TracedAttribute>,
    ) -> Self {
        self.traced_attributes = attributes.into_iter().collect();
        self
    }

    /// Builds the interceptor.
    pub fn build(self) -> ServerInterceptor<T, P> {
        ServerInterceptor {
            tracer: Arc::new(self.tracer),
            propagator: Arc::new(self.propagator),
            log_payloads: self.log_payloads,
            traced_attributes: self.traced_attributes,
        }
    }
}

impl<T, P> ServerInterceptor<T, P>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    P: TextMapPropagator,
{
    /// Handles a single-request, single-response invocation.
    pub fn handle_unary<Req, Resp, E, F>(
        &self,
        descriptor: &CallDescriptor,
        metadata: &CallMetadata,
        peer: Option<&str>,
        request: Req,
        handler: F,
    ) -> Result<Resp, E>
    where
        Req: fmt::Debug,
        Resp: fmt::Debug,
        E: Error,
        F: FnOnce(&ServerContext, Req) -> Result<Resp, E>,
    {
        let server_cx = self.start_invocation(descriptor, metadata, peer);
        if self.log_payloads {
            server_cx.cx.span().add_event(
                MESSAGE_EVENT,
                message_attributes(MESSAGE_TYPE_RECEIVED, 1, &request),
            );
        }
        let outcome = handler(&server_cx, request);
        self.finish_invocation(server_cx, outcome)
    }

    /// Handles an invocation streaming its requests.
    pub fn handle_client_streaming<Reqs, Resp, E, F>(
        &self,
        descriptor: &CallDescriptor,
        metadata: &CallMetadata,
        peer: Option<&str>,
        requests: Reqs,
        handler: F,
    ) -> Result<Resp, E>
    where
        Reqs: Iterator,
        Reqs::Item: fmt::Debug,
        Resp: fmt::Debug,
        E: Error,
        F: FnOnce(&ServerContext, RequestLogStream<Reqs>) -> Result<Resp, E>,
    {
        let server_cx = self.start_invocation(descriptor, metadata, peer);
        let requests = RequestLogStream::new(
            requests,
            server_cx.cx.clone(),
            self.log_payloads,
            MESSAGE_TYPE_RECEIVED,
        );
        let outcome = handler(&server_cx, requests);
        self.finish_invocation(server_cx, outcome)
    }

    /// Handles a single-request invocation whose responses are streamed.
    ///
    /// The invocation span stays open until the returned stream is consumed,
    /// so it covers response production rather than just the handler call.
    pub fn handle_server_streaming<Req, Resp, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        metadata: &CallMetadata,
        peer: Option<&str>,
        request: Req,
        handler: F,
    ) -> Result<TracedResponseStream<S>, E>
    where
        Req: fmt::Debug,
        S: Iterator<Item = Result<Resp, E>>,
        E: Error,
        F: FnOnce(&ServerContext, Req) -> Result<S, E>,
    {
        let server_cx = self.start_invocation(descriptor, metadata, peer);
        if self.log_payloads {
            server_cx.cx.span().add_event(
                MESSAGE_EVENT,
                message_attributes(MESSAGE_TYPE_RECEIVED, 1, &request),
            );
        }
        let outcome = handler(&server_cx, request);
        self.finish_streaming_invocation(server_cx, outcome)
    }

    /// Handles an invocation streaming in both directions.
    pub fn handle_bidi_streaming<Reqs, Resp, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        metadata: &CallMetadata,
        peer: Option<&str>,
        requests: Reqs,
        handler: F,
    ) -> Result<TracedResponseStream<S>, E>
    where
        Reqs: Iterator,
        Reqs::Item: fmt::Debug,
        S: Iterator<Item = Result<Resp, E>>,
        E: Error,
        F: FnOnce(&ServerContext, RequestLogStream<Reqs>) -> Result<S, E>,
    {
        let server_cx = self.start_invocation(descriptor, metadata, peer);
        let requests = RequestLogStream::new(
            requests,
            server_cx.cx.clone(),
            self.log_payloads,
            MESSAGE_TYPE_RECEIVED,
        );
        let outcome = handler(&server_cx, requests);
        self.finish_streaming_invocation(server_cx, outcome)
    }

    /// Builds the invocation span: child of the remote context recovered
    /// from the metadata when present, root otherwise. A corrupt context is
    /// logged on the span and otherwise ignored.
    fn start_invocation(
        &self,
        descriptor: &CallDescriptor,
        metadata: &CallMetadata,
        peer: Option<&str>,
    ) -> ServerContext {
        let mut attributes = call_attributes(descriptor, metadata, &self.traced_attributes);
        if let Some(peer) = peer {
            attributes.extend(peer_attributes(peer));
        }
        let builder = SpanBuilder::from_name(descriptor.method_name())
            .with_kind(SpanKind::Server)
            .with_attributes(attributes);

        let (parent_cx, codec_error) = match extract_span_context(self.propagator.as_ref(), metadata)
        {
            Ok(Some(remote)) => (Context::new().with_remote_span_context(remote), None),
            Ok(None) => (Context::new(), None),
            Err(error) => (Context::new(), Some(error)),
        };
        let span = self.tracer.build_with_context(builder, &parent_cx);
        let cx = parent_cx.with_span(span);
        if let Some(error) = codec_error {
            otel_warn!(
                name: "GrpcServerInterceptor.ExtractFailed",
                error = error.to_string()
            );
            cx.span().record_error(&error);
        }
        ServerContext::new(cx)
    }

    fn finish_invocation<Resp, E>(
        &self,
        server_cx: ServerContext,
        outcome: Result<Resp, E>,
    ) -> Result<Resp, E>
    where
        Resp: fmt::Debug,
        E: Error,
    {
        let span = server_cx.cx.span();
        match &outcome {
            Ok(response) => {
                if self.log_payloads {
                    span.add_event(
                        MESSAGE_EVENT,
                        message_attributes(MESSAGE_TYPE_SENT, 1, response),
                    );
                }
                record_declared_failure(&server_cx.cx, &server_cx.failure);
            }
            Err(error) => {
                span.set_status(Status::error(error.to_string()));
                span.record_error(error);
            }
        }
        span.end();
        outcome
    }

    fn finish_streaming_invocation<Resp, S, E>(
        &self,
        server_cx: ServerContext,
        outcome: Result<S, E>,
    ) -> Result<TracedResponseStream<S>, E>
    where
        S: Iterator<Item = Result<Resp, E>>,
        E: Error,
    {
        match outcome {
            Ok(responses) => {
                let check = server_cx.completion_check();
                Ok(TracedResponseStream::new(
                    responses,
                    server_cx.cx,
                    self.log_payloads,
                    MESSAGE_TYPE_SENT,
                )
                .with_completion_check(check))
            }
            Err(error) => {
                let span = server_cx.cx.span();
                span.set_status(Status::error(error.to_string()));
                span.record_error(&error);
                span.end();
                Err(error)
            }
        }
    }
}

impl<T, P> fmt::Debug for ServerInterceptor<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInterceptor")
            .field("log_payloads", &self.log_payloads)
            .field("traced_attributes", &self.traced_attributes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::inject_span_context;
    use opentelemetry::trace::{SpanId, Tracer as _, TracerProvider as _};
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracer, SdkTracerProvider};
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq)]
    #[error("{0}")]
    struct HandlerError(&'static str);

    fn test_tracer(exporter: &InMemorySpanExporter) -> (SdkTracerProvider, SdkTracer) {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("test");
        (provider, tracer)
    }

    #[test]
    fn invocation_span_is_a_child_of_the_propagated_context() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let propagator = TraceContextPropagator::new();

        let client = tracer.start("client-call");
        let client_cx = Context::new().with_span(client);
        let client_sc = client_cx.span().span_context().clone();
        let metadata =
            inject_span_context(&propagator, &client_cx, &CallMetadata::new()).unwrap();
        client_cx.span().end();

        let interceptor = ServerInterceptor::builder(tracer, propagator).build();
        let descriptor = CallDescriptor::unary("/pkg.Service/Get");
        let response: Result<String, HandlerError> = interceptor.handle_unary(
            &descriptor,
            &metadata,
            None,
            7_u32,
            |_, request| Ok(format!("value-{request}")),
        );
        assert_eq!(response, Ok("value-7".to_owned()));

        let spans = exporter.get_finished_spans().unwrap();
        let span = spans.iter().find(|s| s.name == "/pkg.Service/Get").unwrap();
        assert_eq!(span.span_kind, SpanKind::Server);
        assert_eq!(span.parent_span_id, client_sc.span_id());
        assert_eq!(span.span_context.trace_id(), client_sc.trace_id());
    }

    #[test]
    fn missing_context_yields_a_root_span() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let interceptor =
            ServerInterceptor::builder(tracer, TraceContextPropagator::new()).build();
        let descriptor = CallDescriptor::unary("/pkg.Service/Get");

        let _: Result<u32, HandlerError> =
            interceptor.handle_unary(&descriptor, &CallMetadata::new(), None, 1_u32, |_, r| Ok(r));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].parent_span_id, SpanId::INVALID);
    }

    #[test]
    fn corrupt_context_is_recorded_and_the_span_stays_root() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let interceptor =
            ServerInterceptor::builder(tracer, TraceContextPropagator::new()).build();
        let descriptor = CallDescriptor::unary("/pkg.Service/Get");
        let metadata = CallMetadata::new().with_entry("traceparent", "not-a-context");

        let _: Result<u32, HandlerError> =
            interceptor.handle_unary(&descriptor, &metadata, None, 1_u32, |_, r| Ok(r));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].parent_span_id, SpanId::INVALID);
        let exceptions: Vec<_> = spans[0]
            .events
            .iter()
            .filter(|event| event.name == "exception")
            .collect();
        assert_eq!(exceptions.len(), 1);
    }

    #[test]
    fn peer_string_is_parsed_into_attributes() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let interceptor =
            ServerInterceptor::builder(tracer, TraceContextPropagator::new()).build();
        let descriptor = CallDescriptor::unary("/pkg.Service/Get");

        let _: Result<u32, HandlerError> = interceptor.handle_unary(
            &descriptor,
            &CallMetadata::new(),
            Some("ipv4:10.0.0.1:50051"),
            1_u32,
            |_, r| Ok(r),
        );

        let spans = exporter.get_finished_spans().unwrap();
        assert!(spans[0]
            .attributes
            .contains(&KeyValue::new(PEER_IPV4, "10.0.0.1")));
        assert!(spans[0]
            .attributes
            .contains(&KeyValue::new(PEER_PORT, "50051")));
    }

    #[test]
    fn ipv6_and_unrecognized_peers() {
        assert_eq!(
            peer_attributes("ipv6:[::1]:443"),
            vec![
                KeyValue::new(PEER_IPV6, "::1"),
                KeyValue::new(PEER_PORT, "443"),
            ]
        );
        assert!(peer_attributes("unix:/tmp/sock").is_empty());
    }

    #[test]
    fn declared_failure_marks_the_span_without_aborting() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let interceptor =
            ServerInterceptor::builder(tracer, TraceContextPropagator::new()).build();
        let descriptor = CallDescriptor::unary("/pkg.Service/Get");

        let response: Result<u32, HandlerError> = interceptor.handle_unary(
            &descriptor,
            &CallMetadata::new(),
            None,
            1_u32,
            |server_cx, request| {
                server_cx.set_error_status("NOT_FOUND", Some("no such entity".to_owned()));
                Ok(request)
            },
        );
        assert_eq!(response, Ok(1));

        let spans = exporter.get_finished_spans().unwrap();
        assert!(matches!(spans[0].status, Status::Error { .. }));
        let errors: Vec<_> = spans[0]
            .events
            .iter()
            .filter(|event| event.name == "error")
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .attributes
            .contains(&KeyValue::new(ERROR_KIND, "NOT_FOUND")));
        assert!(errors[0]
            .attributes
            .contains(&KeyValue::new(ERROR_MESSAGE, "no such entity")));
    }

    #[test]
    fn handler_error_fails_the_span_and_is_returned() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let interceptor =
            ServerInterceptor::builder(tracer, TraceContextPropagator::new()).build();
        let descriptor = CallDescriptor::unary("/pkg.Service/Get");

        let response: Result<u32, HandlerError> = interceptor.handle_unary(
            &descriptor,
            &CallMetadata::new(),
            None,
            1_u32,
            |_, _| Err(HandlerError("internal")),
        );
        assert_eq!(response, Err(HandlerError("internal")));

        let spans = exporter.get_finished_spans().unwrap();
        assert!(matches!(spans[0].status, Status::Error { .. }));
        let exceptions: Vec<_> = spans[0]
            .events
            .iter()
            .filter(|event| event.name == "exception")
            .collect();
        assert_eq!(exceptions.len(), 1);
    }

    #[test]
    fn server_streaming_span_covers_the_response_stream() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let interceptor = ServerInterceptor::builder(tracer, TraceContextPropagator::new())
            .log_payloads(true)
            .build();
        let descriptor = CallDescriptor::server_streaming("/pkg.Service/Watch");

        let stream = interceptor
            .handle_server_streaming(
                &descriptor,
                &CallMetadata::new(),
                None,
                1_u32,
                |server_cx, _| {
                    server_cx.set_error_status("CANCELLED", None);
                    Ok::<_, HandlerError>(vec![Ok(10_u32), Ok(20)].into_iter())
                },
            )
            .unwrap();
        assert!(exporter.get_finished_spans().unwrap().is_empty());

        let items: Vec<_> = stream.collect();
        assert_eq!(items.len(), 2);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert!(
            matches!(span.status, Status::Error { .. }),
            "failure declared during streaming must be recorded at stream end"
        );
        let sent: Vec<_> = span
            .events
            .iter()
            .filter(|event| {
                event
                    .attributes
                    .contains(&KeyValue::new(crate::stream::MESSAGE_TYPE, MESSAGE_TYPE_SENT))
            })
            .collect();
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn client_streaming_requests_are_logged_as_received() {
        let exporter = InMemorySpanExporter::default();
        let (_provider, tracer) = test_tracer(&exporter);
        let interceptor = ServerInterceptor::builder(tracer, TraceContextPropagator::new())
            .log_payloads(true)
            .build();
        let descriptor = CallDescriptor::client_streaming("/pkg.Service/Put");

        let response: Result<usize, HandlerError> = interceptor.handle_client_streaming(
            &descriptor,
            &CallMetadata::new(),
            None,
            vec!["a", "b", "c"].into_iter(),
            |_, requests| Ok(requests.count()),
        );
        assert_eq!(response, Ok(3));

        let spans = exporter.get_finished_spans().unwrap();
        let received: Vec<_> = spans[0]
            .events
            .iter()
            .filter(|event| {
                event.attributes.contains(&KeyValue::new(
                    crate::stream::MESSAGE_TYPE,
                    MESSAGE_TYPE_RECEIVED,
                ))
            })
            .collect();
        assert_eq!(received.len(), 3);
    }
}
