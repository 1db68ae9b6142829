//! Shared helpers for the integration test suite.

#![allow(dead_code)]

use std::sync::Arc;

use diskraft::Config;

/// Install a tracing subscriber honoring `RUST_LOG`, once per test binary.
///
/// `RUST_LOG=diskraft=debug cargo test` shows the full protocol exchange.
pub fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The default config used by most cluster tests.
pub fn default_config() -> Arc<Config> {
    Arc::new(Config::build("test").validate().expect("default test config is valid"))
}
