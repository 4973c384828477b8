//! Deferred results and the lazily-created completion span.
//!
//! When the underlying call returns a handle realized later, the submission
//! span only measures time-to-submit. The wrapper here creates a second span
//! at the moment the caller actually waits, so the recorded duration is the
//! true wait time.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{Link, Span, SpanBuilder, SpanKind, Status, Tracer};
use opentelemetry::{otel_warn, Context, Key, KeyValue};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::call::{COMPONENT, COMPONENT_VALUE};
use crate::metadata::{extract_span_context, CallMetadata};
use crate::stream::{message_attributes, MESSAGE_EVENT, MESSAGE_TYPE_RECEIVED};

/// Span link attribute recording the OpenTracing reference type carried by
/// the completion span's link.
const OPENTRACING_REF_TYPE: Key = Key::from_static_str("opentracing.ref_type");
const FOLLOWS_FROM: &str = "follows_from";

/// A handle to a call result realized asynchronously.
///
/// Mirrors the control surface of a gRPC call future: it can be cancelled
/// or polled for completion, exposes the trailing metadata delivered by the
/// remote side, and resolves through a blocking [`wait`](Self::wait).
pub trait ResponseHandle {
    /// The response value produced on success.
    type Response;
    /// The failure produced instead of a response.
    type Error: Error;

    /// Attempts to cancel the call.
    fn cancel(&mut self);

    /// Whether the call was cancelled.
    fn is_cancelled(&self) -> bool;

    /// Whether the result has been realized.
    fn is_done(&self) -> bool;

    /// The metadata delivered by the remote side after the response.
    ///
    /// Blocks until the call completes, like the wait itself.
    fn trailing_metadata(&mut self) -> Option<CallMetadata>;

    /// Blocks until the result is realized and returns it.
    fn wait(&mut self) -> Result<Self::Response, Self::Error>;
}

/// A [`ResponseHandle`] wrapper that creates a completion span at the moment
/// the caller first waits on the result.
///
/// All control operations pass through unchanged. The completion span's
/// start time is taken just before the blocking wait begins, and the span
/// carries a follows-from link to the context embedded in the trailing
/// metadata when one can be recovered. The outcome is memoized: repeated
/// waits replay it without touching span logic again, and a handle that is
/// cancelled before ever being waited on produces no completion span.
pub struct TracedResponseHandle<H: ResponseHandle, T, P> {
    inner: H,
    method: Cow<'static, str>,
    tracer: Arc<T>,
    propagator: Arc<P>,
    log_payloads: bool,
    outcome: Option<Result<H::Response, H::Error>>,
}

impl<H, T, P> TracedResponseHandle<H, T, P>
where
    H: ResponseHandle,
    T: Tracer,
    P: TextMapPropagator,
{
    pub(crate) fn new(
        inner: H,
        method: Cow<'static, str>,
        tracer: Arc<T>,
        propagator: Arc<P>,
        log_payloads: bool,
    ) -> Self {
        TracedResponseHandle {
            inner,
            method,
            tracer,
            propagator,
            log_payloads,
            outcome: None,
        }
    }

    /// Builds the completion span. The start timestamp is recorded before
    /// `trailing_metadata` so the span duration reflects how long the caller
    /// spent waiting for the response.
    fn start_completion_span(&mut self) -> T::Span {
        let wait_start = opentelemetry::time::now();
        let trailing = self.inner.trailing_metadata();

        let mut builder = SpanBuilder::from_name(self.method.clone())
            .with_kind(SpanKind::Client)
            .with_start_time(wait_start)
            .with_attributes([KeyValue::new(COMPONENT, COMPONENT_VALUE)]);
        let mut codec_error = None;
        if let Some(metadata) = &trailing {
            match extract_span_context(self.propagator.as_ref(), metadata) {
                Ok(Some(remote)) => {
                    builder = builder.with_links(vec![Link::new(
                        remote,
                        vec![KeyValue::new(OPENTRACING_REF_TYPE, FOLLOWS_FROM)],
                        0,
                    )]);
                }
                Ok(None) => {}
                Err(error) => codec_error = Some(error),
            }
        }

        let mut span = self.tracer.build_with_context(builder, &Context::new());
        if let Some(error) = codec_error {
            otel_warn!(
                name: "GrpcClientInterceptor.ExtractFailed",
                error = error.to_string()
            );
            span.record_error(&error);
        }
        span
    }
}

impl<H, T, P> ResponseHandle for TracedResponseHandle<H, T, P>
where
    H: ResponseHandle,
    H::Response: Clone + fmt::Debug,
    H::Error: Clone,
    T: Tracer,
    P: TextMapPropagator,
{
    type Response = H::Response;
    type Error = H::Error;

    fn cancel(&mut self) {
        self.inner.cancel()
    }

    fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    fn is_done(&self) -> bool {
        self.outcome.is_some() || self.inner.is_done()
    }

    fn trailing_metadata(&mut self) -> Option<CallMetadata> {
        self.inner.trailing_metadata()
    }

    fn wait(&mut self) -> Result<Self::Response, Self::Error> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let mut span = self.start_completion_span();
        let outcome = self.inner.wait();
        match &outcome {
            Ok(response) => {
                if self.log_payloads {
                    span.add_event(
                        MESSAGE_EVENT,
                        message_attributes(MESSAGE_TYPE_RECEIVED, 1, response),
                    );
                }
            }
            Err(error) => {
                span.set_status(Status::error(error.to_string()));
                span.record_error(error);
            }
        }
        span.end();

        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl<H, T, P> fmt::Debug for TracedResponseHandle<H, T, P>
where
    H: ResponseHandle + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedResponseHandle")
            .field("inner", &self.inner)
            .field("method", &self.method)
            .field("resolved", &self.outcome.is_some())
            .finish()
    }
}
