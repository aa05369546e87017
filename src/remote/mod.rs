//! Steps whose transformation crosses a process boundary.
//!
//! A [`RemoteCallAdapter`] pairs wire/domain conversions with an optional
//! [`Persistence`] collaborator and drives one of four service shapes:
//!
//! ```text
//! WireIn ─► from_wire ─► [persist] ─► Service ─► to_wire ─► WireOut
//!                                        │
//!                   unary / client-streaming / server-streaming / bidi
//! ```
//!
//! Errors leaving the adapter are always [`PipelineError::Transport`](crate::PipelineError::Transport).

pub mod adapter;
pub mod persistence;
pub mod service;

pub use adapter::RemoteCallAdapter;
pub use persistence::{is_transient_storage_error, InMemoryPersistence, Persistence};
pub use service::{
    service_fn, BidiStreamingService, ClientStreamingService, ServerStreamingService, Service,
    ServiceFn,
};
