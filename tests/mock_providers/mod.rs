//! Mock synthesis service and shared test helpers
//!
//! The mock speaks the same WebSocket protocol as the real service, so
//! sessions under test run their real connection and receiver code.

// Allow dead code in test infrastructure - not every test binary uses every helper
#![allow(dead_code)]

pub mod websocket_mock;

use std::time::{Duration, Instant};

/// Poll `condition` until it holds, failing the test after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition not met within {}ms",
            timeout.as_millis()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
