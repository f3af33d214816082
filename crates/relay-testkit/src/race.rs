use futures_util::future::join_all;
use std::future::Future;

/// Run `count` copies of `make_task` concurrently and collect their outputs in
/// completion order. Used by scenario tests that assert exclusivity under
/// concurrent claim attempts (e.g. two workers racing for the same timer).
pub async fn run_concurrent<F, Fut, T>(count: usize, make_task: F) -> Vec<T>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = (0..count)
        .map(|i| {
            let fut = make_task(i);
            tokio::spawn(fut)
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("concurrent task panicked"))
        .collect()
}
