use crate::logging::setup_logging;

/// Standard test preamble: logging with a debug default so failing tests
/// come with context.
pub fn setup_test() {
    setup_logging("debug");
}
