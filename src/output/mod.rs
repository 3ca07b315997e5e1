//! Lazily-resolved output values.
//!
//! An [`Output`] is a single-assignment cell holding a value that only becomes
//! known once a provider call completes (a generated registry URL, a load
//! balancer DNS name). Cells derived through [`Output::apply`],
//! [`Output::combine`] or [`Output::zip`] remember which resource outputs they
//! depend on, which is how the dependency graph learns its edges.

mod cell;

pub use cell::{Output, OutputFailure, OutputRef};
