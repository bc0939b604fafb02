pub mod desk;
pub mod remote;

pub use desk::{by_arrival, code, wait_until, TestDesk};
pub use remote::{classify, Gate, LedgerRemote};

use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test writer. Filter with `RUST_LOG`;
/// warnings only by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}
