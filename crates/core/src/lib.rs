//! Domain logic for the go-live notification engine.
//!
//! Everything in this crate is pure computation over injected state: event
//! payload types, the message template model and its renderer, the
//! token-bucket rate limiter, and the transport-layer replay guard. No I/O
//! happens here, which is what keeps the webhook pipeline testable with a
//! fixed clock.

pub mod event;
pub mod guard;
pub mod ratelimit;
pub mod template;
