//! End-to-end conversion tests: in-memory round trips, checkpoint
//! directories on disk and error reporting.

mod checkpoint_tests;
mod error_tests;
mod fixtures;
mod round_trip_tests;

/// Common test initialization
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("dolomite_convert=debug")
        .try_init();
}
