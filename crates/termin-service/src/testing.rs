//! Helpers shared by the async test suites.

use std::time::Duration;

/// Poll `check` until it returns true or five seconds pass.
pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
