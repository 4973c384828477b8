//! Lazy pass-through wrappers for streamed requests and responses.
//!
//! Streamed responses are forward-only, finite, and not restartable; the
//! wrapper mirrors those transport semantics and keeps the call span open
//! until the stream is exhausted or fails.

use opentelemetry::trace::{Status, TraceContextExt};
use opentelemetry::{Context, Key, KeyValue};
use std::error::Error;
use std::fmt;

pub(crate) const MESSAGE_EVENT: &str = "message";
pub(crate) const MESSAGE_TYPE: Key = Key::from_static_str("message.type");
pub(crate) const MESSAGE_ID: Key = Key::from_static_str("message.id");
pub(crate) const MESSAGE_CONTENT: Key = Key::from_static_str("message.content");
pub(crate) const MESSAGE_TYPE_SENT: &str = "SENT";
pub(crate) const MESSAGE_TYPE_RECEIVED: &str = "RECEIVED";

pub(crate) fn message_attributes(
    direction: &'static str,
    id: i64,
    payload: &dyn fmt::Debug,
) -> Vec<KeyValue> {
    vec![
        KeyValue::new(MESSAGE_TYPE, direction),
        KeyValue::new(MESSAGE_ID, id),
        KeyValue::new(MESSAGE_CONTENT, format!("{payload:?}")),
    ]
}

/// A response stream proxy that keeps the call span open for the whole
/// consumption of the underlying sequence.
///
/// Each item is optionally logged as a message event and forwarded to the
/// consumer. The first error marks the span failed and ends it; the stream
/// is fused afterward. Exhaustion ends the span exactly once. A stream that
/// is dropped unconsumed relies on the SDK span's drop behavior to close
/// the span — consuming the stream is the caller's responsibility.
pub struct TracedResponseStream<S> {
    inner: S,
    cx: Context,
    log_payloads: bool,
    direction: &'static str,
    produced: i64,
    on_complete: Option<Box<dyn FnOnce(&Context) + Send>>,
    open: bool,
}

impl<S> TracedResponseStream<S> {
    pub(crate) fn new(
        inner: S,
        cx: Context,
        log_payloads: bool,
        direction: &'static str,
    ) -> Self {
        TracedResponseStream {
            inner,
            cx,
            log_payloads,
            direction,
            produced: 0,
            on_complete: None,
            open: true,
        }
    }

    /// Runs `check` against the span context just before the span is ended
    /// on clean exhaustion.
    pub(crate) fn with_completion_check(
        mut self,
        check: Box<dyn FnOnce(&Context) + Send>,
    ) -> Self {
        self.on_complete = Some(check);
        self
    }
}

impl<S: fmt::Debug> fmt::Debug for TracedResponseStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedResponseStream")
            .field("inner", &self.inner)
            .field("produced", &self.produced)
            .field("open", &self.open)
            .finish()
    }
}

impl<S, T, E> Iterator for TracedResponseStream<S>
where
    S: Iterator<Item = Result<T, E>>,
    T: fmt::Debug,
    E: Error,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.open {
            return None;
        }
        match self.inner.next() {
            Some(Ok(item)) => {
                if self.log_payloads {
                    self.produced += 1;
                    self.cx.span().add_event(
                        MESSAGE_EVENT,
                        message_attributes(self.direction, self.produced, &item),
                    );
                }
                Some(Ok(item))
            }
            Some(Err(error)) => {
                self.open = false;
                let span = self.cx.span();
                span.set_status(Status::error(error.to_string()));
                span.record_error(&error);
                span.end();
                Some(Err(error))
            }
            None => {
                self.open = false;
                if let Some(check) = self.on_complete.take() {
                    check(&self.cx);
                }
                self.cx.span().end();
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.open {
            self.inner.size_hint()
        } else {
            (0, Some(0))
        }
    }
}

/// A pass-through over a message sequence that logs each forwarded item on
/// the call span when payload logging is enabled.
///
/// Used for the outgoing request side of client-streaming calls on the
/// invocation side, and for the incoming request side on the service side.
pub struct RequestLogStream<I> {
    inner: I,
    cx: Context,
    log_payloads: bool,
    direction: &'static str,
    forwarded: i64,
}

impl<I> RequestLogStream<I> {
    pub(crate) fn new(inner: I, cx: Context, log_payloads: bool, direction: &'static str) -> Self {
        RequestLogStream {
            inner,
            cx,
            log_payloads,
            direction,
            forwarded: 0,
        }
    }
}

impl<I: fmt::Debug> fmt::Debug for RequestLogStream<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLogStream")
            .field("inner", &self.inner)
            .field("forwarded", &self.forwarded)
            .finish()
    }
}

impl<I> Iterator for RequestLogStream<I>
where
    I: Iterator,
    I::Item: fmt::Debug,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if self.log_payloads {
            self.forwarded += 1;
            self.cx.span().add_event(
                MESSAGE_EVENT,
                message_attributes(self.direction, self.forwarded, &item),
            );
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
