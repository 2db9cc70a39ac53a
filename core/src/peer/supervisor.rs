// Copyright 2025 ribd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Task supervision: every task a session starts is joined under a deadline
//! when the session tears down.

use crate::fatal;
use crate::log::{debug, error};
use std::net::IpAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Wait for `handle` to finish. Returns the task's output, or `None` when it
/// was cancelled, panicked or missed the deadline. A task that misses the
/// deadline is logged as fatal, then aborted and awaited so nothing it owns
/// outlives the session.
pub async fn join_within<T>(
    mut handle: JoinHandle<T>,
    deadline: Duration,
    peer: IpAddr,
    task: &'static str,
) -> Option<T> {
    match timeout(deadline, &mut handle).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) if e.is_cancelled() => {
            debug!(%peer, task, "task cancelled");
            None
        }
        Ok(Err(e)) => {
            error!(%peer, task, error = %e, "task panicked");
            None
        }
        Err(_) => {
            fatal!(%peer, task, ?deadline, "task did not exit before join deadline, aborting");
            handle.abort();
            let _ = handle.await;
            None
        }
    }
}

/// Abort `handle` and wait for it to unwind.
pub async fn abort_and_join<T>(
    handle: JoinHandle<T>,
    deadline: Duration,
    peer: IpAddr,
    task: &'static str,
) {
    handle.abort();
    join_within(handle, deadline, peer, task).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::oneshot;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_join_returns_output() {
        let handle = tokio::spawn(async { 7 });
        assert_eq!(join_within(handle, Duration::from_secs(1), PEER, "test").await, Some(7));
    }

    #[tokio::test]
    async fn test_abort_and_join_pending_task() {
        let handle = tokio::spawn(std::future::pending::<()>());
        abort_and_join(handle, Duration::from_secs(1), PEER, "test").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let handle = tokio::spawn(std::future::pending::<u32>());
        assert_eq!(
            join_within(handle, Duration::from_secs(180), PEER, "test").await,
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded_aborts_task() {
        let (held_tx, held_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _held = held_tx;
            std::future::pending::<()>().await
        });
        assert_eq!(join_within(handle, Duration::from_secs(5), PEER, "test").await, None);
        // the task dropped what it owned
        assert!(held_rx.await.is_err());
    }
}
