//! Per-task timeout and cooperative-cancellation enforcement.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ErrorKind;

/// Runs `fut` to completion, racing it against an optional `timeout` and a
/// root cancellation signal. A timeout yields [`ErrorKind::DeadlineExceeded`];
/// cancellation yields [`ErrorKind::Cancelled`] — the same distinction the
/// scheduler surfaces for a task's terminal transition.
pub async fn run_with_timeout<F, T>(
    fut: F,
    timeout: Option<Duration>,
    mut cancel: watch::Receiver<bool>,
) -> Result<T, ErrorKind>
where
    F: Future<Output = Result<T, ErrorKind>>,
{
    tokio::select! {
        result = fut => result,
        _ = sleep_or_pending(timeout) => Err(ErrorKind::DeadlineExceeded),
        _ = cancel.changed() => Err(ErrorKind::Cancelled),
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_timeout() {
        let (_tx, rx) = watch::channel(false);
        let result = run_with_timeout(
            async { Ok::<_, ErrorKind>(42) },
            Some(Duration::from_secs(1)),
            rx,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn timeout_elapses_to_deadline_exceeded() {
        let (_tx, rx) = watch::channel(false);
        let result = run_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ErrorKind>(())
            },
            Some(Duration::from_millis(10)),
            rx,
        )
        .await;
        assert!(matches!(result, Err(ErrorKind::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let (tx, rx) = watch::channel(false);
        let running = run_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ErrorKind>(())
            },
            None,
            rx,
        );
        tokio::pin!(running);
        tx.send(true).unwrap();
        let result = running.await;
        assert!(matches!(result, Err(ErrorKind::Cancelled)));
    }
}
