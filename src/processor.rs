use crate::chat_sender::ChatSender;
use crate::config::KNOWN_TEAMS;
use crate::delivery;
use crate::formatter::{event_new_plain_text, event_reminder_plain_text};
use crate::store::{ClientTeam, Store};
use crate::ts_client::TicketInfoClient;
use crate::utils::errors::RelayError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

const EVENT_TYPE_NEWTICKET: &str = "newticket";
const CHANNEL_TELEGRAM: &str = "Telegram";

/// Whether ticket state closes out the event this tick, and which message
/// layout to emit (§4.E step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    New,
    ReminderContinue,
    ReminderTerminate,
}

/// The singleton-serial state machine (§4.E). Holds the process-wide mutex
/// that guarantees at most one event transition is ever in flight, and the
/// collaborators it drives a step forward with.
pub struct EventProcessor {
    store: Arc<Store>,
    ts_client: Arc<dyn TicketInfoClient>,
    chat_sender: Arc<dyn ChatSender>,
    default_interval_secs: i64,
    lock: Mutex<()>,
}

impl EventProcessor {
    pub fn new(
        store: Arc<Store>,
        ts_client: Arc<dyn TicketInfoClient>,
        chat_sender: Arc<dyn ChatSender>,
        default_interval_secs: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            ts_client,
            chat_sender,
            default_interval_secs,
            lock: Mutex::new(()),
        })
    }

    /// Records a newly arrived ticket as an Event row (§4.H). Returns
    /// whether a row was created or an active one already existed; either
    /// way the webhook adapter treats this as success.
    pub async fn create_event(self: &Arc<Self>, ticket_id: i64) -> Result<bool, RelayError> {
        use crate::store::CreateEventOutcome;
        let outcome = self
            .store
            .create_event(CHANNEL_TELEGRAM, EVENT_TYPE_NEWTICKET, ticket_id, self.default_interval_secs)
            .await?;
        Ok(matches!(outcome, CreateEventOutcome::Created(_)))
    }

    /// Drives exactly one event one step forward, then schedules its own
    /// next invocation to drain the queue (§4.E). Never propagates an
    /// error outward — it is a daemon loop and relies on the timer to
    /// retry.
    #[instrument(skip(self))]
    pub async fn process_one(self: Arc<Self>) {
        let _guard = self.lock.lock().await;

        let active = match self.store.pick_next_active().await {
            Ok(Some(active)) => active,
            Ok(None) => return,
            Err(e) => {
                error!("failed to pick next active event: {e}");
                return;
            }
        };

        // Tail-dispatch the drain before doing any work for this event: the
        // mutex is released between iterations via the runtime's task
        // dispatcher rather than recursing on this stack frame.
        let tail = self.clone();
        tokio::spawn(async move { tail.process_one().await });

        self.step(active.event_id, active.ticket_id).await;
    }

    async fn step(self: &Arc<Self>, event_id: i64, ticket_id: i64) {
        let ticket = match self.ts_client.get(ticket_id).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(event_id, ticket_id, "ticket detail fetch failed, deferring to next tick: {e}");
                return;
            }
        };

        let status = match self.store.get_event_status(event_id).await {
            Ok(status) => status,
            Err(e) => {
                error!(event_id, "failed to read event status: {e}");
                return;
            }
        };

        let outcome = match status.as_str() {
            "New" => StepOutcome::New,
            "Processing" | "Suspended" => {
                let terminal = ticket.lock == "lock"
                    || ticket.state_type == "closed"
                    || ticket.state_type == "merged";
                if terminal {
                    StepOutcome::ReminderTerminate
                } else {
                    StepOutcome::ReminderContinue
                }
            }
            other => {
                warn!(event_id, status = other, "unexpected event status, treating as Suspended");
                StepOutcome::ReminderContinue
            }
        };

        if let Err(e) = self.store.mark_processing(event_id).await {
            let fatal = RelayError::Fatal(format!("event {event_id}: cannot commit New->Processing transition: {e}"));
            error!(event_id, "{fatal}");
            return;
        }

        let text = match outcome {
            StepOutcome::New => event_new_plain_text(&ticket),
            StepOutcome::ReminderContinue | StepOutcome::ReminderTerminate => event_reminder_plain_text(&ticket),
        };

        self.fan_out(&ticket.customer_id, &text).await;

        let result = match outcome {
            StepOutcome::ReminderTerminate => self.store.mark_ended(event_id).await,
            StepOutcome::New | StepOutcome::ReminderContinue => {
                let interval = match self.store.get_activation_interval(event_id).await {
                    Ok(interval) => interval,
                    Err(e) => {
                        error!(event_id, "failed to read activation interval: {e}");
                        return;
                    }
                };
                self.store.mark_suspended(event_id, interval).await
            }
        };

        if let Err(e) = result {
            let fatal = RelayError::Fatal(format!("event {event_id}: cannot commit terminal status transition: {e}"));
            error!(event_id, "{fatal}");
        }
    }

    /// Resolves the event's audience from the ticket's customer and
    /// dispatches one Delivery Worker per user (§4.E step 8).
    async fn fan_out(self: &Arc<Self>, customer_id: &str, text: &str) {
        let users = match self.store.client_get_team(customer_id).await {
            Ok(ClientTeam::Bound(team)) => match self.store.users_by_team(&team).await {
                Ok(users) => users,
                Err(e) => {
                    error!("failed to resolve users for team {team}: {e}");
                    return;
                }
            },
            Ok(ClientTeam::NoBinding) => match self.store.users_by_any_team(&KNOWN_TEAMS).await {
                Ok(users) => users,
                Err(e) => {
                    error!("failed to resolve broadcast audience: {e}");
                    return;
                }
            },
            Ok(ClientTeam::ClientUnknown) => {
                info!(customer_id, "unknown client, recording empty binding and skipping this tick's fan-out");
                if let Err(e) = self.store.client_add(customer_id, "").await {
                    error!("failed to record unknown client {customer_id}: {e}");
                }
                return;
            }
            Ok(ClientTeam::Ambiguous) => {
                error!(customer_id, "client bound to more than one team, falling back to broadcast");
                match self.store.users_by_any_team(&KNOWN_TEAMS).await {
                    Ok(users) => users,
                    Err(e) => {
                        error!("failed to resolve broadcast audience: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("failed to resolve client team for {customer_id}: {e}");
                return;
            }
        };

        for user_id in users {
            let store = self.store.clone();
            let chat_sender = self.chat_sender.clone();
            let text = text.to_string();
            tokio::spawn(async move {
                delivery::deliver(store, chat_sender, user_id, &text).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TicketDetails;
    use crate::utils::errors::RelayError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeTicketClient {
        ticket: tokio::sync::Mutex<TicketDetails>,
    }

    #[async_trait]
    impl TicketInfoClient for FakeTicketClient {
        async fn get(&self, _ticket_id: i64) -> Result<TicketDetails, RelayError> {
            Ok(self.ticket.lock().await.clone())
        }
    }

    struct FakeChatSender {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl ChatSender for FakeChatSender {
        async fn send(&self, _chat_id: i64, _text: &str) -> Result<(), RelayError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ticket(state_type: &str) -> TicketDetails {
        TicketDetails {
            ticket_number: "2024010100001".to_string(),
            r#type: "X".to_string(),
            customer_id: "ACME".to_string(),
            title: "disk".to_string(),
            lock: "unlock".to_string(),
            state_type: state_type.to_string(),
            created: "2024-01-01 10:00:00".to_string(),
            url: "https://ts.example.com/ticket/4242".to_string(),
        }
    }

    async fn test_store() -> (Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("test.db"), 2).await.unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn new_event_fans_out_to_bound_team_and_suspends() {
        let (store, _dir) = test_store().await;
        store.client_add("ACME", "").await.unwrap();
        store.client_set_team("ACME", "Team2").await.unwrap();
        store.add_user(111).await.unwrap();
        store.add_user(222).await.unwrap();
        let crate::store::UserLookup::Found(u1) = store.user_id_by_telegram_id(111).await.unwrap() else { panic!() };
        let crate::store::UserLookup::Found(u3) = store.user_id_by_telegram_id(222).await.unwrap() else { panic!() };
        store.subscribe_add(u1, "Team2").await.unwrap();
        store.subscribe_add(u3, "Team2").await.unwrap();

        store.create_event("Telegram", "newticket", 4242, 300).await.unwrap();

        let ts_client = Arc::new(FakeTicketClient { ticket: tokio::sync::Mutex::new(ticket("open")) });
        let chat_sender = Arc::new(FakeChatSender { sent: AtomicUsize::new(0) });
        let processor = EventProcessor::new(store.clone(), ts_client, chat_sender.clone(), 300);

        processor.clone().process_one().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(chat_sender.sent.load(Ordering::SeqCst), 2);
        let status = store.get_event_status(1).await.unwrap();
        assert_eq!(status, "Suspended");
    }

    #[tokio::test]
    async fn unknown_client_records_binding_without_fan_out() {
        let (store, _dir) = test_store().await;
        store.create_event("Telegram", "newticket", 1, 300).await.unwrap();

        let mut ticket = ticket("open");
        ticket.customer_id = "NEW_CO".to_string();
        let ts_client = Arc::new(FakeTicketClient { ticket: tokio::sync::Mutex::new(ticket) });
        let chat_sender = Arc::new(FakeChatSender { sent: AtomicUsize::new(0) });
        let processor = EventProcessor::new(store.clone(), ts_client, chat_sender.clone(), 300);

        processor.clone().process_one().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(chat_sender.sent.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.client_get_team("NEW_CO").await.unwrap(),
            crate::store::ClientTeam::NoBinding
        );
    }

    #[tokio::test]
    async fn closed_ticket_terminates_event_after_fan_out() {
        let (store, _dir) = test_store().await;
        store.client_add("ACME", "").await.unwrap();
        store.create_event("Telegram", "newticket", 4242, -1).await.unwrap();
        store.mark_processing(1).await.unwrap();
        store.mark_suspended(1, -1).await.unwrap();

        let ts_client = Arc::new(FakeTicketClient { ticket: tokio::sync::Mutex::new(ticket("closed")) });
        let chat_sender = Arc::new(FakeChatSender { sent: AtomicUsize::new(0) });
        let processor = EventProcessor::new(store.clone(), ts_client, chat_sender.clone(), 300);

        processor.clone().process_one().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let status = store.get_event_status(1).await.unwrap();
        assert_eq!(status, "Ended");
    }
}
