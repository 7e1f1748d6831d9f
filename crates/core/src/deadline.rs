use std::future::Future;
use std::time::Duration;

/// Races `future` against a timer. The timer is dropped with this future on
/// either outcome; the inner future is dropped on timeout, which stops local
/// I/O but does not tell a remote peer to stop.
pub async fn with_timeout<F, T, E>(
    limit: Duration,
    future: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_elapsed) => Err(on_timeout()),
    }
}
