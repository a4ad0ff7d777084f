//! Helpers for driving async code from tests, where timing needs to be deterministic.

use std::{future::Future, time::Duration};

use tokio::{runtime::Builder, select, task::LocalSet};

/// Run the supplied future on a single-threaded runtime whose clock starts paused, so
/// `tokio::time::advance` and `Instant::now` are fully under the test's control.
pub fn block_on_locally<T>(f: impl Future<Output = T>) -> T {
    let rt = Builder::new_current_thread().enable_time().start_paused(true).build().unwrap();
    LocalSet::new().block_on(&rt, async move {
        select! {
            t = f => t,
            // Longer than any scan timeout the stack arms.
            _ = tokio::time::sleep(Duration::from_secs(100000)) => {
                panic!("test appears to be stuck");
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Instant};

    #[test]
    fn test_clock_is_paused() {
        block_on_locally(async {
            let start = Instant::now();
            advance(Duration::from_secs(60)).await;
            assert_eq!(Instant::now() - start, Duration::from_secs(60));
        });
    }
}
