//! Call metadata and the span-context codec over it.
//!
//! gRPC metadata is an ordered sequence of key/value pairs. The codec here
//! appends a span context to a copy of the outgoing metadata and recovers a
//! remote context from received metadata. Both directions are total: a codec
//! failure is reported to the caller as a value and never fails the call.

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry::Context;
use std::fmt;
use thiserror::Error;

/// Errors raised by the span-context codec.
///
/// These are never fatal to a call. Callers log them on the relevant span
/// and continue with the original metadata, or with no causal link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContextCodecError {
    /// The span context is invalid and cannot be serialized.
    #[error("span context is invalid and cannot be injected into call metadata")]
    InvalidSpanContext,

    /// Propagation fields were present but did not decode to a usable context.
    #[error("call metadata carried trace context fields that could not be decoded: {fields:?}")]
    UndecodableContext {
        /// The propagation fields found in the metadata.
        fields: Vec<String>,
    },
}

/// An ordered sequence of key/value pairs attached to a call.
///
/// Metadata is immutable once sent: every transformation produces a new
/// value. Keys are ASCII-lowercased on insertion, matching gRPC metadata
/// normalization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallMetadata {
    entries: Vec<(String, String)>,
}

impl CallMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        CallMetadata::default()
    }

    /// Returns a copy of this metadata with the entry appended.
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries
            .push((key.into().to_ascii_lowercase(), value.into()));
        self
    }

    /// Returns the value of the first entry with the given key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CallMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CallMetadata::new(), |metadata, (k, v)| {
                metadata.with_entry(k, v)
            })
    }
}

impl fmt::Display for CallMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("]")
    }
}

/// Helper for injecting a span context into [`CallMetadata`].
#[derive(Debug)]
pub struct MetadataInjector<'a>(pub &'a mut CallMetadata);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0
            .entries
            .push((key.to_ascii_lowercase(), value));
    }
}

/// Helper for extracting a span context from [`CallMetadata`].
#[derive(Debug)]
pub struct MetadataExtractor<'a>(pub &'a CallMetadata);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.entries.iter().map(|(k, _)| k.as_str()).collect()
    }
}

/// Serializes the span context active in `cx` into a copy of `metadata`.
///
/// The original metadata is never modified. An invalid span context is
/// reported as an error so the caller can log it on the span and continue
/// with the unmodified metadata.
pub fn inject_span_context<P>(
    propagator: &P,
    cx: &Context,
    metadata: &CallMetadata,
) -> Result<CallMetadata, ContextCodecError>
where
    P: TextMapPropagator + ?Sized,
{
    if !cx.span().span_context().is_valid() {
        return Err(ContextCodecError::InvalidSpanContext);
    }
    let mut injected = metadata.clone();
    propagator.inject_context(cx, &mut MetadataInjector(&mut injected));
    Ok(injected)
}

/// Attempts to recover a remote span context from `metadata`.
///
/// `Ok(None)` means no propagation fields were present, which callers must
/// treat as "no causal link available". An `Err` means fields were present
/// but corrupt; callers log it and proceed as if absent.
pub fn extract_span_context<P>(
    propagator: &P,
    metadata: &CallMetadata,
) -> Result<Option<SpanContext>, ContextCodecError>
where
    P: TextMapPropagator + ?Sized,
{
    let extractor = MetadataExtractor(metadata);
    let fields: Vec<String> = propagator
        .fields()
        .filter(|field| extractor.get(field).is_some())
        .map(|field| field.to_owned())
        .collect();
    if fields.is_empty() {
        return Ok(None);
    }
    let cx = propagator.extract_with_context(&Context::new(), &extractor);
    let span_context = cx.span().span_context().clone();
    if span_context.is_valid() {
        Ok(Some(span_context))
    } else {
        Err(ContextCodecError::UndecodableContext { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Tracer, TracerProvider as _};
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

    fn sampled_context() -> Context {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(InMemorySpanExporter::default())
            .build();
        let span = provider.tracer("test").start("client-call");
        Context::new().with_span(span)
    }

    #[test]
    fn entries_keep_insertion_order_and_lowercase_keys() {
        let metadata = CallMetadata::new()
            .with_entry("X-First", "1")
            .with_entry("x-second", "2");
        assert_eq!(
            metadata.iter().collect::<Vec<_>>(),
            vec![("x-first", "1"), ("x-second", "2")]
        );
        assert_eq!(metadata.get("x-FIRST"), Some("1"));
        assert_eq!(metadata.to_string(), "[x-first=1, x-second=2]");
    }

    #[test]
    fn inject_appends_to_a_copy() {
        let propagator = TraceContextPropagator::new();
        let cx = sampled_context();
        let original = CallMetadata::new().with_entry("x-app", "demo");

        let injected = inject_span_context(&propagator, &cx, &original).unwrap();

        assert_eq!(original.len(), 1, "original must stay untouched");
        assert_eq!(injected.get("x-app"), Some("demo"));
        assert!(injected.get("traceparent").is_some());
    }

    #[test]
    fn inject_rejects_invalid_span_context() {
        let propagator = TraceContextPropagator::new();
        let err =
            inject_span_context(&propagator, &Context::new(), &CallMetadata::new()).unwrap_err();
        assert_eq!(err, ContextCodecError::InvalidSpanContext);
    }

    #[test]
    fn extract_round_trips_an_injected_context() {
        let propagator = TraceContextPropagator::new();
        let cx = sampled_context();
        let injected = inject_span_context(&propagator, &cx, &CallMetadata::new()).unwrap();

        let recovered = extract_span_context(&propagator, &injected)
            .unwrap()
            .expect("context should be present");
        assert_eq!(recovered.trace_id(), cx.span().span_context().trace_id());
        assert_eq!(recovered.span_id(), cx.span().span_context().span_id());
    }

    #[test]
    fn extract_reports_absent_fields_as_none() {
        let propagator = TraceContextPropagator::new();
        let metadata = CallMetadata::new().with_entry("x-app", "demo");
        assert_eq!(extract_span_context(&propagator, &metadata), Ok(None));
    }

    #[test]
    fn extract_reports_corrupt_fields_as_error() {
        let propagator = TraceContextPropagator::new();
        let metadata = CallMetadata::new().with_entry("traceparent", "not-a-context");
        let err = extract_span_context(&propagator, &metadata).unwrap_err();
        assert_eq!(
            err,
            ContextCodecError::UndecodableContext {
                fields: vec!["traceparent".to_owned()]
            }
        );
    }
}
