//! Invocation-side interceptor.
//!
//! One client span is produced per call submission, the span's context is
//! injected into the outgoing metadata, and the invoker's result is
//! classified as immediate, deferred, or streamed and wrapped accordingly.

pub mod deferred;

pub use deferred::{ResponseHandle, TracedResponseHandle};

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanBuilder, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_warn, Context};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::call::{call_attributes, ActiveSpanSource, CallDescriptor, CurrentContext, TracedAttribute};
use crate::metadata::{inject_span_context, CallMetadata};
use crate::stream::{
    message_attributes, RequestLogStream, TracedResponseStream, MESSAGE_EVENT,
    MESSAGE_TYPE_RECEIVED, MESSAGE_TYPE_SENT,
};

/// Classification of an invoker's successful result.
///
/// Invokers produce this sum type; the interceptor dispatches on it to
/// decide how the call span is finished.
#[derive(Debug)]
pub enum CallResult<R, H, S> {
    /// The response is already realized.
    Immediate(R),
    /// The response will be realized later through a [`ResponseHandle`].
    Deferred(H),
    /// The response is a lazily-produced sequence of items.
    Stream(S),
}

/// The result shape returned by the interceptor's entry points: the same as
/// the invoker's, with deferred and streamed responses wrapped for
/// instrumentation.
pub type TracedCallResult<R, H, S, T, P> =
    CallResult<R, TracedResponseHandle<H, T, P>, TracedResponseStream<S>>;

/// Invocation-side interceptor producing one client span per call.
///
/// Built with [`ClientInterceptor::builder`]. The tracer and propagator are
/// shared with the wrappers handed back to callers, which may outlive the
/// call itself.
pub struct ClientInterceptor<T, P, A = CurrentContext> {
    tracer: Arc<T>,
    propagator: Arc<P>,
    active_span_source: Option<A>,
    log_payloads: bool,
    traced_attributes: Vec<TracedAttribute>,
}

impl<T, P> ClientInterceptor<T, P, CurrentContext> {
    /// Starts building an interceptor around a tracer and a propagator.
    pub fn builder(tracer: T, propagator: P) -> ClientInterceptorBuilder<T, P, CurrentContext> {
        ClientInterceptorBuilder {
            tracer,
            propagator,
            active_span_source: None,
            log_payloads: false,
            traced_attributes: Vec::new(),
        }
    }
}

/// Builder for [`ClientInterceptor`].
pub struct ClientInterceptorBuilder<T, P, A> {
    tracer: T,
    propagator: P,
    active_span_source: Option<A>,
    log_payloads: bool,
    traced_attributes: Vec<TracedAttribute>,
}

impl<T, P, A> ClientInterceptorBuilder<T, P, A> {
    /// Resolves span parentage through the given source instead of always
    /// producing root spans.
    pub fn with_active_span_source<B>(self, source: B) -> ClientInterceptorBuilder<T, P, B> {
        ClientInterceptorBuilder {
            tracer: self.tracer,
            propagator: self.propagator,
            active_span_source: Some(source),
            log_payloads: self.log_payloads,
            traced_attributes: self.traced_attributes,
        }
    }

    /// Whether request and response payloads are logged as span events.
    pub fn log_payloads(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    /// Selects the optional attributes recorded on every call span.
    pub fn with_traced_attributes(
        mut self,
        attributes: impl IntoIterator<Item = TracedAttribute>,
    ) -> Self {
        self.traced_attributes = attributes.into_iter().collect();
        self
    }

    /// Builds the interceptor.
    pub fn build(self) -> ClientInterceptor<T, P, A> {
        ClientInterceptor {
            tracer: Arc::new(self.tracer),
            propagator: Arc::new(self.propagator),
            active_span_source: self.active_span_source,
            log_payloads: self.log_payloads,
            traced_attributes: self.traced_attributes,
        }
    }
}

impl<T, P, A> ClientInterceptor<T, P, A>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    P: TextMapPropagator,
    A: ActiveSpanSource,
{
    /// Intercepts a single-request, single-response call.
    pub fn intercept_unary<Req, Resp, H, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        request: Req,
        metadata: &CallMetadata,
        invoker: F,
    ) -> Result<TracedCallResult<Resp, H, S, T, P>, E>
    where
        Req: fmt::Debug,
        Resp: fmt::Debug,
        H: ResponseHandle<Response = Resp, Error = E>,
        S: Iterator<Item = Result<Resp, E>>,
        E: Error,
        F: FnOnce(Req, CallMetadata) -> Result<CallResult<Resp, H, S>, E>,
    {
        self.intercept_single_request(descriptor, request, metadata, invoker)
    }

    /// Intercepts a single-request call whose responses are streamed.
    pub fn intercept_server_streaming<Req, Resp, H, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        request: Req,
        metadata: &CallMetadata,
        invoker: F,
    ) -> Result<TracedCallResult<Resp, H, S, T, P>, E>
    where
        Req: fmt::Debug,
        Resp: fmt::Debug,
        H: ResponseHandle<Response = Resp, Error = E>,
        S: Iterator<Item = Result<Resp, E>>,
        E: Error,
        F: FnOnce(Req, CallMetadata) -> Result<CallResult<Resp, H, S>, E>,
    {
        self.intercept_single_request(descriptor, request, metadata, invoker)
    }

    /// Intercepts a call streaming its requests with a single response.
    pub fn intercept_client_streaming<Reqs, Resp, H, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        requests: Reqs,
        metadata: &CallMetadata,
        invoker: F,
    ) -> Result<TracedCallResult<Resp, H, S, T, P>, E>
    where
        Reqs: Iterator,
        Reqs::Item: fmt::Debug,
        Resp: fmt::Debug,
        H: ResponseHandle<Response = Resp, Error = E>,
        S: Iterator<Item = Result<Resp, E>>,
        E: Error,
        F: FnOnce(RequestLogStream<Reqs>, CallMetadata) -> Result<CallResult<Resp, H, S>, E>,
    {
        self.intercept_streaming_request(descriptor, requests, metadata, invoker)
    }

    /// Intercepts a call streaming in both directions.
    pub fn intercept_bidi_streaming<Reqs, Resp, H, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        requests: Reqs,
        metadata: &CallMetadata,
        invoker: F,
    ) -> Result<TracedCallResult<Resp, H, S, T, P>, E>
    where
        Reqs: Iterator,
        Reqs::Item: fmt::Debug,
        Resp: fmt::Debug,
        H: ResponseHandle<Response = Resp, Error = E>,
        S: Iterator<Item = Result<Resp, E>>,
        E: Error,
        F: FnOnce(RequestLogStream<Reqs>, CallMetadata) -> Result<CallResult<Resp, H, S>, E>,
    {
        self.intercept_streaming_request(descriptor, requests, metadata, invoker)
    }

    fn intercept_single_request<Req, Resp, H, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        request: Req,
        metadata: &CallMetadata,
        invoker: F,
    ) -> Result<TracedCallResult<Resp, H, S, T, P>, E>
    where
        Req: fmt::Debug,
        Resp: fmt::Debug,
        H: ResponseHandle<Response = Resp, Error = E>,
        E: Error,
        F: FnOnce(Req, CallMetadata) -> Result<CallResult<Resp, H, S>, E>,
    {
        let cx = self.start_call(descriptor, metadata);
        let outgoing = self.inject_metadata(&cx, metadata);
        if self.log_payloads {
            cx.span().add_event(
                MESSAGE_EVENT,
                message_attributes(MESSAGE_TYPE_SENT, 1, &request),
            );
        }
        let outcome = invoker(request, outgoing);
        self.finish_call(descriptor, cx, outcome)
    }

    fn intercept_streaming_request<Reqs, Resp, H, S, E, F>(
        &self,
        descriptor: &CallDescriptor,
        requests: Reqs,
        metadata: &CallMetadata,
        invoker: F,
    ) -> Result<TracedCallResult<Resp, H, S, T, P>, E>
    where
        Reqs: Iterator,
        Reqs::Item: fmt::Debug,
        Resp: fmt::Debug,
        H: ResponseHandle<Response = Resp, Error = E>,
        E: Error,
        F: FnOnce(RequestLogStream<Reqs>, CallMetadata) -> Result<CallResult<Resp, H, S>, E>,
    {
        let cx = self.start_call(descriptor, metadata);
        let outgoing = self.inject_metadata(&cx, metadata);
        let requests =
            RequestLogStream::new(requests, cx.clone(), self.log_payloads, MESSAGE_TYPE_SENT);
        let outcome = invoker(requests, outgoing);
        self.finish_call(descriptor, cx, outcome)
    }

    /// Builds the call-submission span: child of the active span when the
    /// configured source yields one, root otherwise.
    fn start_call(&self, descriptor: &CallDescriptor, metadata: &CallMetadata) -> Context {
        let attributes = call_attributes(descriptor, metadata, &self.traced_attributes);
        let builder = SpanBuilder::from_name(descriptor.method_name())
            .with_kind(SpanKind::Client)
            .with_attributes(attributes);
        let parent_cx = self
            .active_span_source
            .as_ref()
            .and_then(|source| source.active_context())
            .unwrap_or_else(Context::new);
        let span = self.tracer.build_with_context(builder, &parent_cx);
        parent_cx.with_span(span)
    }

    /// Injects the call span's context into a copy of the metadata. A codec
    /// failure is logged on the span and the original metadata is used, so
    /// the call itself is never affected.
    fn inject_metadata(&self, cx: &Context, metadata: &CallMetadata) -> CallMetadata {
        match inject_span_context(self.propagator.as_ref(), cx, metadata) {
            Ok(injected) => injected,
            Err(error) => {
                otel_warn!(
                    name: "GrpcClientInterceptor.InjectFailed",
                    error = error.to_string()
                );
                cx.span().record_error(&error);
                metadata.clone()
            }
        }
    }

    /// Finishes the submission span according to the result classification
    /// and returns the same outcome, wrapped only for instrumentation.
    fn finish_call<Resp, H, S, E>(
        &self,
        descriptor: &CallDescriptor,
        cx: Context,
        outcome: Result<CallResult<Resp, H, S>, E>,
    ) -> Result<TracedCallResult<Resp, H, S, T, P>, E>
    where
        Resp: fmt::Debug,
        H: ResponseHandle<Response = Resp, Error = E>,
        E: Error,
    {
        match outcome {
            Err(error) => {
                let span = cx.span();
                span.set_status(Status::error(error.to_string()));
                span.record_error(&error);
                span.end();
                Err(error)
            }
            Ok(CallResult::Immediate(response)) => {
                let span = cx.span();
                if self.log_payloads {
                    span.add_event(
                        MESSAGE_EVENT,
                        message_attributes(MESSAGE_TYPE_RECEIVED, 1, &response),
                    );
                }
                span.end();
                Ok(CallResult::Immediate(response))
            }
            Ok(CallResult::Deferred(handle)) => {
                cx.span().end();
                Ok(CallResult::Deferred(TracedResponseHandle::new(
                    handle,
                    descriptor.method_name(),
                    Arc::clone(&self.tracer),
                    Arc::clone(&self.propagator),
                    self.log_payloads,
                )))
            }
            Ok(CallResult::Stream(stream)) => Ok(CallResult::Stream(TracedResponseStream::new(
                stream,
                cx,
                self.log_payloads,
                MESSAGE_TYPE_RECEIVED,
            ))),
        }
    }
}

impl<T, P, A> fmt::Debug for ClientInterceptor<T, P, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInterceptor")
            .field("log_payloads", &self.log_payloads)
            .field("traced_attributes", &self.traced_attributes)
            .finish()
    }
}

impl<T, P, A> fmt::Debug for ClientInterceptorBuilder<T, P, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInterceptorBuilder")
            .field("log_payloads", &self.log_payloads)
            .field("traced_attributes", &self.traced_attributes)
            .finish()
    }
}
