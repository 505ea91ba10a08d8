//! Testing utilities module for rustle-jinja
//!
//! Shared template fixtures, file helpers and structural checks over
//! annotated trees.

pub mod fixtures;
pub mod helpers;
pub mod spans;

pub use fixtures::*;
pub use helpers::*;
pub use spans::*;
