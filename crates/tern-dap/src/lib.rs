//! Dataset object model for the tern data-access server.
//!
//! This crate is the narrow surface the response cache consumes:
//! - a tree of typed variables with read/send flags
//! - streaming sequences with a row cursor
//! - an XML-ish schema printer/parser with a pluggable type factory
//! - the opaque [`ConstraintEvaluator`] seam
//!
//! Variable payloads carry their values in memory; how a data handler fills
//! them from the underlying source is not modeled here.

mod dataset;
mod error;
mod eval;
pub mod schema;

pub use dataset::{Array, Dataset, Dim, Payload, ScalarKind, ScalarValue, Sequence, Variable};
pub use error::{DapError, Result};
pub use eval::ConstraintEvaluator;
pub use schema::{DefaultFactory, TypeFactory};
