//! Subscription to the `tasks_updated` change-notification channel.

use futures::Stream;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::warn;

use crate::error::StoreError;

/// The channel name the `TASKS` table's triggers notify on.
pub const TASKS_UPDATED_CHANNEL: &str = "tasks_updated";

/// An opaque wake-up token. The consumer only cares that one arrived, not
/// its payload; duplicates and missed messages are both tolerable.
#[derive(Debug, Clone, Copy)]
pub struct ChangeNotification;

/// Subscribe to the task-change channel, returning a lazy infinite stream
/// of wake-up tokens.
///
/// A connection error while listening degrades to the stream simply
/// yielding one extra token rather than terminating, since the caller
/// treats notifications as a polling accelerant, not as a reliable
/// delivery channel: the fallback ticker remains the source of truth for
/// forward progress.
pub async fn subscribe_changes(
    pool: &PgPool,
) -> Result<impl Stream<Item = ChangeNotification>, StoreError> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(TASKS_UPDATED_CHANNEL).await?;

    Ok(async_stream::stream! {
        loop {
            match listener.try_recv().await {
                Ok(Some(_notification)) => yield ChangeNotification,
                Ok(None) => yield ChangeNotification,
                Err(err) => {
                    warn!(error = %err, "task-change listener error, backing off");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    yield ChangeNotification;
                }
            }
        }
    })
}
