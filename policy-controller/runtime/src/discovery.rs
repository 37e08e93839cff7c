use crate::k8s::{Client, Resource};
use std::future::Future;
use tokio::time;

/// The number of times the policy API is checked before startup fails.
pub(crate) const MAX_ATTEMPTS: usize = 5;

pub(crate) const RETRY_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// Checks until `check` succeeds, at most `attempts` times, sleeping `interval` between attempts.
pub(crate) async fn retry<F, Fut>(attempts: usize, interval: time::Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=attempts {
        if check().await {
            return true;
        }
        tracing::debug!(attempt, "Resource kind not yet served");
        if attempt < attempts {
            time::sleep(interval).await;
        }
    }
    false
}

pub(crate) async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
