pub mod spacing;

pub use spacing::{check_whitespace, in_expression, SpacingReport, SpacingTag, SpacingToken};
