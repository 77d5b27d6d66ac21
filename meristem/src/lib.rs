#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

//! Low-level engine of the `tendril` reactive cell graph.
//!
//! This crate owns everything the primitives in `tendril` share: the dynamic
//! [`Value`](value::Value) model, the cell and subscription stores, the frame
//! stack that records dependencies, dirty propagation, read-time validation
//! and the settle queue that runs deferred recomputations.
//!
//! # Logic
//!
//! The whole graph lives in one process-global critical section. Callbacks
//! (recipes, observers, cleanups) **must not** block on other threads that
//! need the graph; they **may** freely re-enter it from the same thread.

pub mod cancel;
pub mod error;
pub mod observer;
pub mod reactive;
pub mod runtime;
pub mod value;
