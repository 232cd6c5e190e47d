use futures::{FutureExt, Stream, StreamExt, future};
use std::{collections::HashSet, fmt::Display, future::Future};

pub(crate) fn metric_name(name: &str) -> String {
    format!("tenant_controller_{}", name)
}

/// Value of the environment variable `name`, `None` when unset or blank.
pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a comma separated namespace list, `None` stands for all namespaces.
pub(crate) fn parse_namespaces(value: &str) -> Option<HashSet<String>> {
    let namespaces: HashSet<String> = value
        .split(',')
        .map(|v| v.trim().to_string())
        .collect();
    if namespaces.is_empty() || namespaces.contains("*") || namespaces.contains("") {
        None
    } else {
        Some(namespaces)
    }
}

/// Drive a watch stream until it ends, handing every event to `on_event`.
/// Errors are logged and skipped, the stream retries them through its backoff.
pub(crate) async fn consume_watch<S, T, E, F, Fut>(kind: &'static str, stream: S, mut on_event: F)
where
    S: Stream<Item = Result<T, E>>,
    E: Display,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    stream
        .for_each(move |res| match res {
            Ok(event) => on_event(event).left_future(),
            Err(e) => {
                warn!("{} watch failed, retrying: {}", kind, e);
                future::ready(()).right_future()
            }
        })
        .await;
    warn!("{} watch ended", kind);
}
