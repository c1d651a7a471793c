//! # replywatch-daemon
//!
//! Service replica for replywatch: tracks conversation response deadlines
//! and emits escalating timeout notifications across a horizontally
//! scaled fleet.
//!
//! Each replica runs the same set of tasks:
//!
//! - **Ingress** ([`http`]): agent-message and customer-response
//!   endpoints feeding the [`index::TimeoutIndex`]
//! - **Leader election** ([`leader`]): a store lease gating the detector
//! - **Detection** ([`detector`]): leader-only scans publishing timeout
//!   events to the shared stream
//! - **Consumption** ([`consumer`]): fleet-wide consumer-group processing
//!   with pending-entry recovery, delivering through a [`sink`]
//! - **Observability** ([`metrics`]): Prometheus metric families
//!
//! The binary in `main.rs` wires these together; integration tests drive
//! the same modules against the in-memory store.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod consumer;
pub mod detector;
pub mod http;
pub mod index;
pub mod leader;
pub mod metrics;
pub mod sink;
