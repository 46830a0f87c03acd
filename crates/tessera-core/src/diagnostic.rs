//! Last-resort diagnostics
//!
//! Failures inside the ingestion path cannot be reported through `tracing`:
//! the capture layer would see its own report and loop. They go straight to
//! stderr as a single line instead.

use std::fmt::Display;
use std::io::Write;

/// Write one diagnostic line to stderr
///
/// Never panics, even when stderr is closed.
pub fn report(component: &str, message: impl Display) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "Warning: tessera {component}: {message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_does_not_panic() {
        report("test", "diagnostic line");
        report("test", format_args!("{} records lost", 3));
    }
}
