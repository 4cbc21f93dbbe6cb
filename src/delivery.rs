use crate::chat_sender::ChatSender;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

const CHANNEL_TELEGRAM: &str = "Telegram";
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Per-user delivery: persist a record, send, retry twice on failure, mark
/// delivered on success (§4.F). Spawned as an independent task by the
/// Processor's fan-out; never touches the Processor mutex.
#[instrument(skip(store, chat_sender, text), fields(user_id))]
pub async fn deliver(store: Arc<Store>, chat_sender: Arc<dyn ChatSender>, user_id: i64, text: &str) {
    let telegram_id = match store.telegram_id_by_user_id(user_id).await {
        Ok(id) => id,
        Err(e) => {
            warn!(user_id, "no telegram id for user, aborting delivery: {e}");
            return;
        }
    };

    let message_id = match store.message_enqueue(CHANNEL_TELEGRAM, telegram_id, text).await {
        Ok(id) => id,
        Err(e) => {
            error!(user_id, telegram_id, "failed to persist outbound message: {e}");
            return;
        }
    };

    send_with_retries(&*chat_sender, &store, telegram_id, message_id, text).await;
}

/// Attempts `MAX_SEND_ATTEMPTS` immediate sends with no backoff. Leaves
/// `sent_at` unset on final failure so the sweeper can pick the message
/// back up later.
async fn send_with_retries(chat_sender: &dyn ChatSender, store: &Store, telegram_id: i64, message_id: i64, text: &str) {
    for attempt in 1..=MAX_SEND_ATTEMPTS {
        match chat_sender.send(telegram_id, text).await {
            Ok(()) => {
                if let Err(e) = store.message_mark_delivered(message_id).await {
                    error!(message_id, "failed to mark message delivered: {e}");
                }
                return;
            }
            Err(e) => {
                warn!(message_id, telegram_id, attempt, "chat send attempt failed: {e}");
                if !e.is_retryable() {
                    warn!(message_id, telegram_id, "non-retryable error, abandoning remaining attempts");
                    break;
                }
            }
        }
    }

    warn!(message_id, telegram_id, "exhausted delivery attempts, leaving for sweeper");
}

/// Background loop started once at process startup alongside the Tick
/// Scheduler. Retries messages still lacking a delivery receipt after a
/// grace period, re-using the persisted message id rather than enqueuing a
/// new one. Never touches the Processor mutex.
pub async fn run_sweeper(store: Arc<Store>, chat_sender: Arc<dyn ChatSender>, interval: Duration, grace_period_secs: i64) {
    loop {
        sleep(interval).await;

        let undelivered = match store.message_list_undelivered(CHANNEL_TELEGRAM, grace_period_secs).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("sweeper failed to list undelivered messages: {e}");
                continue;
            }
        };

        if undelivered.is_empty() {
            continue;
        }
        info!(count = undelivered.len(), "sweeper retrying undelivered messages");

        for message_id in undelivered {
            let store = store.clone();
            let chat_sender = chat_sender.clone();
            tokio::spawn(async move {
                resend(store, chat_sender, message_id).await;
            });
        }
    }
}

async fn resend(store: Arc<Store>, chat_sender: Arc<dyn ChatSender>, message_id: i64) {
    let (chat_id, text) = match (
        store.message_get_chat_id(message_id).await,
        store.message_get_text(message_id).await,
    ) {
        (Ok(chat_id), Ok(text)) => (chat_id, text),
        (Err(e), _) | (_, Err(e)) => {
            error!(message_id, "sweeper could not load message for resend: {e}");
            return;
        }
    };

    send_with_retries(&*chat_sender, &store, chat_id, message_id, &text).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::RelayError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FlakyChatSender {
        fail_times: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ChatSender for FlakyChatSender {
        async fn send(&self, _chat_id: i64, _text: &str) -> Result<(), RelayError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                Err(RelayError::Transient("simulated failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn test_store() -> (Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("test.db"), 2).await.unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn retries_once_then_succeeds_with_single_enqueue() {
        let (store, _dir) = test_store().await;
        store.add_user(999).await.unwrap();
        let crate::store::UserLookup::Found(user_id) = store.user_id_by_telegram_id(999).await.unwrap() else { panic!() };

        let chat_sender: Arc<dyn ChatSender> =
            Arc::new(FlakyChatSender { fail_times: 1, attempts: AtomicUsize::new(0) });

        deliver(store.clone(), chat_sender, user_id, "hello").await;

        let undelivered = store.message_list_undelivered("Telegram", -1).await.unwrap();
        assert!(undelivered.is_empty());
    }

    #[tokio::test]
    async fn exhausts_retries_and_leaves_message_for_sweeper() {
        let (store, _dir) = test_store().await;
        store.add_user(1000).await.unwrap();
        let crate::store::UserLookup::Found(user_id) = store.user_id_by_telegram_id(1000).await.unwrap() else { panic!() };

        let chat_sender: Arc<dyn ChatSender> =
            Arc::new(FlakyChatSender { fail_times: 10, attempts: AtomicUsize::new(0) });

        deliver(store.clone(), chat_sender, user_id, "hello").await;

        let undelivered = store.message_list_undelivered("Telegram", -1).await.unwrap();
        assert_eq!(undelivered.len(), 1);
    }
}
