use crate::config::KNOWN_TEAMS;
use crate::store::{Store, UserLookup};
use crate::utils::errors::RelayError;
use tracing::{info, warn};

/// A thin dispatcher over the inbound chat commands that exercise the
/// Store's User and Subscription operations (§6.A). Not a general command
/// parser: it recognizes exactly `/start`, `/subscribe<Team>`, and
/// `/unsubscribe<Team>`, and rejects anything naming a team outside the
/// closed enumeration before it reaches the Store.
pub async fn dispatch(store: &Store, telegram_id: i64, command: &str) -> Result<String, RelayError> {
    if command == "/start" {
        return handle_start(store, telegram_id).await;
    }

    if let Some(team) = command.strip_prefix("/subscribe") {
        return handle_subscribe(store, telegram_id, team).await;
    }

    if let Some(team) = command.strip_prefix("/unsubscribe") {
        return handle_unsubscribe(store, telegram_id, team).await;
    }

    warn!(command, "unrecognized command");
    Ok(format!("Unknown command: {command}"))
}

async fn handle_start(store: &Store, telegram_id: i64) -> Result<String, RelayError> {
    match store.add_user(telegram_id).await {
        Ok(()) => {
            info!(telegram_id, "registered new user");
            Ok("Registered. Use /subscribeTeam1, /subscribeTeam2, or /subscribeTeam3 to receive notifications.".to_string())
        }
        Err(RelayError::Conflict(_)) => Ok("Already registered.".to_string()),
        Err(e) => Err(e),
    }
}

async fn handle_subscribe(store: &Store, telegram_id: i64, team: &str) -> Result<String, RelayError> {
    if !KNOWN_TEAMS.contains(&team) {
        return Ok(format!("Unknown team: {team}"));
    }

    let user_id = match store.user_id_by_telegram_id(telegram_id).await? {
        UserLookup::Found(id) => id,
        UserLookup::NotFound => return Ok("Use /start before subscribing.".to_string()),
        UserLookup::Ambiguous => return Err(RelayError::Ambiguous(format!("telegram id {telegram_id}"))),
    };

    match store.subscribe_add(user_id, team).await {
        Ok(()) => Ok(format!("Subscribed to {team}.")),
        Err(RelayError::Conflict(_)) => Ok(format!("Already subscribed to {team}.")),
        Err(e) => Err(e),
    }
}

async fn handle_unsubscribe(store: &Store, telegram_id: i64, team: &str) -> Result<String, RelayError> {
    if !KNOWN_TEAMS.contains(&team) {
        return Ok(format!("Unknown team: {team}"));
    }

    let user_id = match store.user_id_by_telegram_id(telegram_id).await? {
        UserLookup::Found(id) => id,
        UserLookup::NotFound => return Ok("Use /start before unsubscribing.".to_string()),
        UserLookup::Ambiguous => return Err(RelayError::Ambiguous(format!("telegram id {telegram_id}"))),
    };

    match store.subscribe_remove(user_id, team).await {
        Ok(()) => Ok(format!("Unsubscribed from {team}.")),
        Err(RelayError::NotFound(_)) => Ok(format!("Not subscribed to {team}.")),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("test.db"), 2).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn start_then_subscribe_round_trips_through_users_by_team() {
        let (store, _dir) = test_store().await;
        dispatch(&store, 555, "/start").await.unwrap();
        dispatch(&store, 555, "/subscribeTeam1").await.unwrap();

        let UserLookup::Found(user_id) = store.user_id_by_telegram_id(555).await.unwrap() else { panic!() };
        assert!(store.users_by_team("Team1").await.unwrap().contains(&user_id));

        dispatch(&store, 555, "/unsubscribeTeam1").await.unwrap();
        assert!(!store.users_by_team("Team1").await.unwrap().contains(&user_id));
    }

    #[tokio::test]
    async fn subscribe_to_unknown_team_is_rejected_before_reaching_store() {
        let (store, _dir) = test_store().await;
        dispatch(&store, 555, "/start").await.unwrap();
        let reply = dispatch(&store, 555, "/subscribeTeam9").await.unwrap();
        assert!(reply.contains("Unknown team"));
    }
}
