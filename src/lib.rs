//! OpenTelemetry instrumentation for gRPC-style RPC clients and servers.
//!
//! # Components
//! The invocation-side [`client::ClientInterceptor`] wraps the four gRPC call
//! shapes (unary, client-streaming, server-streaming, bidirectional) and
//! produces one client span per call submission. Deferred results get a
//! second, lazily-created span measuring the time the caller actually spent
//! waiting; streamed responses keep the call span open until the stream is
//! exhausted. The service-side [`server::ServerInterceptor`] produces a
//! server span per incoming call, parented on the context carried by the
//! invocation metadata.
//!
//! Instrumentation is value-transparent: the caller observes exactly the
//! outcome the uninstrumented call would have produced, wrapped only for
//! instrumentation identity.
//!
//! ### Quick start
//! ```
//! use opentelemetry::global;
//! use opentelemetry_grpc::client::ClientInterceptor;
//! use opentelemetry_grpc::TracedAttribute;
//! use opentelemetry_sdk::propagation::TraceContextPropagator;
//!
//! let tracer = global::tracer("grpc-client");
//! let interceptor = ClientInterceptor::builder(tracer, TraceContextPropagator::new())
//!     .log_payloads(true)
//!     .with_traced_attributes([TracedAttribute::MethodName, TracedAttribute::Deadline])
//!     .build();
//! # drop(interceptor);
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

pub mod client;
pub mod metadata;
pub mod server;
pub mod stream;

mod call;

pub use call::{
    ActiveSpanSource, CallDescriptor, CurrentContext, MethodType, TracedAttribute, COMPONENT,
    GRPC_DEADLINE_MILLIS, GRPC_HEADERS, GRPC_METHOD_NAME, GRPC_METHOD_TYPE,
};
