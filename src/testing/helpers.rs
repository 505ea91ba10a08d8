//! Helpers shared by the unit tests

use crate::parser::{reformat, Environment, TemplateError};
use anyhow::Result;
use std::io::Write;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// Writes `content` to a temporary file that lives as long as the handle.
pub fn write_temp_file(content: &str, suffix: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Asserts that a template operation failed with a message containing `expected`.
pub fn assert_template_error<T>(result: Result<T, TemplateError>, expected: &str) {
    match result {
        Ok(_) => panic!("expected a template error containing '{expected}'"),
        Err(err) => {
            let message = err.to_string();
            assert!(
                message.contains(expected),
                "error '{message}' does not contain '{expected}'"
            );
        }
    }
}

/// Asserts that parse, annotate and dump reproduce `source` byte for byte.
pub fn assert_round_trip(source: &str, env: &Environment) {
    let dumped = reformat(source, env)
        .unwrap_or_else(|err| panic!("round trip of {source:?} failed: {err}"));
    pretty_assertions::assert_eq!(dumped, source);
}

/// Runs `f` and fails when it takes longer than `limit`.
pub fn within<T>(limit: Duration, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let value = f();
    let elapsed = start.elapsed();
    assert!(elapsed <= limit, "took {elapsed:?}, limit {limit:?}");
    value
}
