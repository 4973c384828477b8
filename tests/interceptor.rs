//! End-to-end propagation between the invocation-side and service-side
//! interceptors.

use opentelemetry::trace::{SpanKind, TraceContextExt, TracerProvider as _};
use opentelemetry::Context;
use opentelemetry_grpc::client::{CallResult, ClientInterceptor, ResponseHandle};
use opentelemetry_grpc::metadata::CallMetadata;
use opentelemetry_grpc::server::ServerInterceptor;
use opentelemetry_grpc::{CallDescriptor, CurrentContext, TracedAttribute};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracer, SdkTracerProvider};
use std::iter::Empty;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
struct RpcError(&'static str);

type NoStream = Empty<Result<String, RpcError>>;

#[derive(Debug)]
struct NeverHandle<R>(PhantomData<R>);

impl<R> ResponseHandle for NeverHandle<R> {
    type Response = R;
    type Error = RpcError;

    fn cancel(&mut self) {
        unreachable!()
    }

    fn is_cancelled(&self) -> bool {
        unreachable!()
    }

    fn is_done(&self) -> bool {
        unreachable!()
    }

    fn trailing_metadata(&mut self) -> Option<CallMetadata> {
        unreachable!()
    }

    fn wait(&mut self) -> Result<R, RpcError> {
        unreachable!()
    }
}

fn test_tracer(exporter: &InMemorySpanExporter) -> (SdkTracerProvider, SdkTracer) {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    let tracer = provider.tracer("test");
    (provider, tracer)
}

#[test]
fn client_and_server_spans_share_a_trace() {
    let exporter = InMemorySpanExporter::default();
    let (_provider, tracer) = test_tracer(&exporter);

    let client = ClientInterceptor::builder(tracer.clone(), TraceContextPropagator::new())
        .with_traced_attributes([TracedAttribute::MethodName, TracedAttribute::MethodType])
        .build();
    let server = ServerInterceptor::builder(tracer, TraceContextPropagator::new()).build();
    let descriptor = CallDescriptor::unary("/pkg.Service/Get");

    let result = client
        .intercept_unary::<u32, String, NeverHandle<String>, NoStream, RpcError, _>(
            &descriptor,
            7,
            &CallMetadata::new().with_entry("x-app", "demo"),
            |request, metadata| {
                // The "wire": the injected metadata arrives at the server
                // interceptor as invocation metadata.
                server
                    .handle_unary(
                        &descriptor,
                        &metadata,
                        Some("ipv4:127.0.0.1:50051"),
                        request,
                        |_, request| Ok(format!("value-{request}")),
                    )
                    .map(CallResult::Immediate)
            },
        )
        .unwrap();
    assert!(matches!(result, CallResult::Immediate(ref v) if v == "value-7"));

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    let server_span = spans
        .iter()
        .find(|s| s.span_kind == SpanKind::Server)
        .unwrap();
    let client_span = spans
        .iter()
        .find(|s| s.span_kind == SpanKind::Client)
        .unwrap();
    assert_eq!(
        server_span.span_context.trace_id(),
        client_span.span_context.trace_id()
    );
    assert_eq!(server_span.parent_span_id, client_span.span_context.span_id());
}

#[test]
fn current_context_source_parents_calls_to_the_attached_span() {
    use opentelemetry::trace::Tracer as _;
    use opentelemetry_grpc::ActiveSpanSource as _;

    let exporter = InMemorySpanExporter::default();
    let (_provider, tracer) = test_tracer(&exporter);

    let outer = tracer.start("outer");
    let outer_cx = Context::current().with_span(outer);
    let outer_sc = outer_cx.span().span_context().clone();

    let interceptor = ClientInterceptor::builder(tracer, TraceContextPropagator::new())
        .with_active_span_source(CurrentContext)
        .build();
    let descriptor = CallDescriptor::unary("/pkg.Service/Get");
    {
        let _guard = outer_cx.clone().attach();
        assert!(CurrentContext.active_context().is_some());
        interceptor
            .intercept_unary::<u32, u32, NeverHandle<u32>, Empty<Result<u32, RpcError>>, RpcError, _>(
                &descriptor,
                1,
                &CallMetadata::new(),
                |request, _| Ok(CallResult::Immediate(request)),
            )
            .unwrap();
    }
    outer_cx.span().end();

    let spans = exporter.get_finished_spans().unwrap();
    let call = spans.iter().find(|s| s.name == "/pkg.Service/Get").unwrap();
    assert_eq!(call.parent_span_id, outer_sc.span_id());
}
