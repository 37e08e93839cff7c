use crate::k8s::ErrorResponse;
use futures::prelude::*;
use kube::runtime::watcher::{self, Event};
use std::io;

/// Receives a watch's resources in the order the watch observed them.
#[async_trait::async_trait]
pub(crate) trait Handle<T>: Send + Sync {
    async fn apply(&self, resource: T);

    async fn delete(&self, resource: T);
}

/// Feeds a watch's events to `handler` until the stream ends or fails fatally.
///
/// Benign errors are logged and the stream is polled again, so the watcher reconnects with its
/// backoff. Any other error is returned to the caller.
pub(crate) async fn run<T, H>(
    events: impl Stream<Item = Result<Event<T>, watcher::Error>>,
    handler: &H,
) -> Result<(), watcher::Error>
where
    H: Handle<T>,
{
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Apply(resource)) | Ok(Event::InitApply(resource)) => {
                handler.apply(resource).await
            }
            Ok(Event::Delete(resource)) => handler.delete(resource).await,
            Ok(Event::Init) => tracing::debug!("Resyncing"),
            Ok(Event::InitDone) => tracing::debug!("Resynced"),
            Err(error) if is_benign(&error) => {
                tracing::info!(%error, "Watch interrupted; reconnecting");
            }
            Err(error) => {
                tracing::error!(%error, "Watch failed");
                return Err(error);
            }
        }
    }
    tracing::debug!("Watch ended");
    Ok(())
}

/// Indicates whether a watch error only requires the watch to be restarted.
///
/// Expired resource versions (`410 Gone`) and connections closed by the server are benign.
pub(crate) fn is_benign(error: &watcher::Error) -> bool {
    match error {
        watcher::Error::WatchError(status) => is_expired(status),
        watcher::Error::InitialListFailed(error)
        | watcher::Error::WatchStartFailed(error)
        | watcher::Error::WatchFailed(error) => match error {
            kube::Error::Api(status) => is_expired(status),
            kube::Error::ReadEvents(error) => error.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        },
        _ => false,
    }
}

fn is_expired(status: &ErrorResponse) -> bool {
    status.code == 410 || status.reason == "Expired" || status.reason == "Gone"
}
