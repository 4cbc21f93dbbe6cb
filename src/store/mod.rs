mod schema;

use crate::utils::errors::RelayError;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, instrument};

/// Outcome of `CreateEvent`: a brand new row, or confirmation that an
/// equivalent active row already exists (treated as a no-op by callers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateEventOutcome {
    Created(i64),
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveEvent {
    pub event_id: i64,
    pub ticket_id: i64,
}

/// Result of resolving a client to its bound team (§4.A `ClientGetTeam`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTeam {
    Bound(String),
    NoBinding,
    ClientUnknown,
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserLookup {
    Found(i64),
    NotFound,
    Ambiguous,
}

/// A pooled connection, checked out through the bounding semaphore and
/// returned to the pool when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Mutex<Vec<Connection>>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.lock().await.push(conn);
            });
        }
    }
}

struct ConnectionPool {
    connections: Arc<Mutex<Vec<Connection>>>,
    semaphore: Arc<Semaphore>,
    database_path: PathBuf,
}

impl ConnectionPool {
    fn new(database_path: PathBuf, max_connections: usize) -> rusqlite::Result<Self> {
        let pool = Self {
            connections: Arc::new(Mutex::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            database_path,
        };
        Ok(pool)
    }

    fn create_connection(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.database_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Concurrent writers now contend on real transactions (create_event,
        // client_add, client_set_team); block and retry rather than surface
        // SQLITE_BUSY as a spurious error.
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    async fn get(&self) -> rusqlite::Result<PooledConnection> {
        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore closed");

        let existing = self.connections.lock().await.pop();
        let conn = match existing {
            Some(conn) => conn,
            None => self.create_connection()?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.connections.clone(),
            _permit: permit,
        })
    }
}

pub struct Store {
    pool: ConnectionPool,
}

impl Store {
    /// Opens (creating if necessary) the database at `database_path`, then
    /// creates any missing tables and validates existing ones against the
    /// reference schema. A schema mismatch is fatal at startup.
    pub async fn new<P: AsRef<Path>>(database_path: P, max_connections: usize) -> anyhow::Result<Self> {
        let database_path = database_path.as_ref().to_path_buf();
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::new(database_path, max_connections)?;
        let conn = pool.get().await?;
        schema::ensure_schema(&conn)?;
        drop(conn);

        info!("store initialized and schema validated");
        Ok(Self { pool })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    // ---- Event operations ----------------------------------------------

    #[instrument(skip(self))]
    pub async fn create_event(
        &self,
        channel: &str,
        event_type: &str,
        ticket_id: i64,
        default_interval: i64,
    ) -> Result<CreateEventOutcome, RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();

        // check-then-insert must be atomic: two concurrent webhook requests
        // for the same ticket_id/type must not both observe "no existing
        // row" (spec.md scenario 6, the duplicate-webhook no-op contract).
        let tx = conn.unchecked_transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM events WHERE ticket_id = ?1 AND type = ?2 AND status != 'Ended'",
                (ticket_id, event_type),
                |row| row.get(0),
            )
            .ok();

        if existing.is_some() {
            return Ok(CreateEventOutcome::AlreadyExists);
        }

        tx.execute(
            "INSERT INTO events (status, channel, type, ticket_id, created_at, activation_interval, next_activation_at)
             VALUES ('New', ?1, ?2, ?3, ?4, ?5, ?6)",
            (channel, event_type, ticket_id, now, default_interval, now + default_interval),
        )?;
        let event_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(CreateEventOutcome::Created(event_id))
    }

    #[instrument(skip(self))]
    pub async fn pick_next_active(&self) -> Result<Option<ActiveEvent>, RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();

        let row = conn
            .query_row(
                "SELECT id, ticket_id FROM events
                 WHERE status IN ('New', 'Processing', 'Suspended') AND next_activation_at < ?1
                 ORDER BY next_activation_at ASC, id ASC
                 LIMIT 1",
                [now],
                |row| Ok(ActiveEvent { event_id: row.get(0)?, ticket_id: row.get(1)? }),
            )
            .ok();

        Ok(row)
    }

    pub async fn earliest_next_activation(&self, default_interval: i64) -> Result<i64, RelayError> {
        let conn = self.pool.get().await?;
        let earliest: Option<i64> = conn
            .query_row(
                "SELECT next_activation_at FROM events
                 WHERE status IN ('New', 'Processing', 'Suspended')
                 ORDER BY next_activation_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        Ok(earliest.unwrap_or_else(|| Self::now() + default_interval))
    }

    pub async fn get_event_status(&self, event_id: i64) -> Result<String, RelayError> {
        let conn = self.pool.get().await?;
        conn.query_row("SELECT status FROM events WHERE id = ?1", [event_id], |row| row.get(0))
            .map_err(|_| RelayError::NotFound(format!("event {event_id}")))
    }

    pub async fn mark_processing(&self, event_id: i64) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let updated = conn.execute("UPDATE events SET status = 'Processing' WHERE id = ?1", [event_id])?;
        if updated == 0 {
            return Err(RelayError::NotFound(format!("event {event_id}")));
        }
        Ok(())
    }

    pub async fn mark_suspended(&self, event_id: i64, activation_interval: i64) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();
        let updated = conn.execute(
            "UPDATE events SET status = 'Suspended', next_activation_at = ?1 WHERE id = ?2",
            (now + activation_interval, event_id),
        )?;
        if updated == 0 {
            return Err(RelayError::NotFound(format!("event {event_id}")));
        }
        Ok(())
    }

    pub async fn mark_ended(&self, event_id: i64) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();
        let updated = conn.execute(
            "UPDATE events SET status = 'Ended', finished_at = ?1 WHERE id = ?2",
            (now, event_id),
        )?;
        if updated == 0 {
            return Err(RelayError::NotFound(format!("event {event_id}")));
        }
        Ok(())
    }

    pub async fn has_event(&self, ticket_id: i64, event_type: &str) -> Result<bool, RelayError> {
        let conn = self.pool.get().await?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM events WHERE ticket_id = ?1 AND type = ?2",
            (ticket_id, event_type),
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns the row's activation interval, needed by callers driving
    /// `MarkSuspended` (the caller supplies the interval rather than the
    /// Store re-reading it internally, keeping each operation a single
    /// statement).
    pub async fn get_activation_interval(&self, event_id: i64) -> Result<i64, RelayError> {
        let conn = self.pool.get().await?;
        conn.query_row(
            "SELECT activation_interval FROM events WHERE id = ?1",
            [event_id],
            |row| row.get(0),
        )
        .map_err(|_| RelayError::NotFound(format!("event {event_id}")))
    }

    // ---- User operations -------------------------------------------------

    pub async fn add_user(&self, telegram_id: i64) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();
        let result = conn.execute(
            "INSERT INTO users (telegram_id, first_name, last_name, created_at, active)
             VALUES (?1, '', '', ?2, 1)",
            (telegram_id, now),
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(RelayError::Conflict(format!("user with telegram id {telegram_id} already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_first_name(&self, telegram_id: i64, first_name: &str) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let updated = conn.execute(
            "UPDATE users SET first_name = ?1 WHERE telegram_id = ?2",
            (first_name, telegram_id),
        )?;
        if updated == 0 {
            return Err(RelayError::NotFound(format!("user with telegram id {telegram_id}")));
        }
        Ok(())
    }

    pub async fn update_last_name(&self, telegram_id: i64, last_name: &str) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let updated = conn.execute(
            "UPDATE users SET last_name = ?1 WHERE telegram_id = ?2",
            (last_name, telegram_id),
        )?;
        if updated == 0 {
            return Err(RelayError::NotFound(format!("user with telegram id {telegram_id}")));
        }
        Ok(())
    }

    pub async fn user_id_by_telegram_id(&self, telegram_id: i64) -> Result<UserLookup, RelayError> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare("SELECT id FROM users WHERE telegram_id = ?1")?;
        let ids: Vec<i64> = stmt
            .query_map([telegram_id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        Ok(match ids.len() {
            0 => UserLookup::NotFound,
            1 => UserLookup::Found(ids[0]),
            _ => UserLookup::Ambiguous,
        })
    }

    pub async fn telegram_id_by_user_id(&self, user_id: i64) -> Result<i64, RelayError> {
        let conn = self.pool.get().await?;
        conn.query_row("SELECT telegram_id FROM users WHERE id = ?1", [user_id], |row| row.get(0))
            .map_err(|_| RelayError::NotFound(format!("user {user_id}")))
    }

    // ---- Subscription operations -----------------------------------------

    pub async fn subscribe_add(&self, user_id: i64, team: &str) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let already: i64 = conn.query_row(
            "SELECT count(*) FROM subscriptions WHERE user_id = ?1 AND team = ?2 AND active = 1",
            (user_id, team),
            |row| row.get(0),
        )?;
        if already > 0 {
            return Err(RelayError::Conflict(format!("user {user_id} already subscribed to {team}")));
        }

        let now = Self::now();
        conn.execute(
            "INSERT INTO subscriptions (user_id, team, active, created_at, finished_at)
             VALUES (?1, ?2, 1, ?3, NULL)",
            (user_id, team, now),
        )?;
        Ok(())
    }

    pub async fn subscribe_remove(&self, user_id: i64, team: &str) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();
        let updated = conn.execute(
            "UPDATE subscriptions SET active = 0, finished_at = ?1 WHERE active = 1 AND user_id = ?2 AND team = ?3",
            (now, user_id, team),
        )?;
        if updated == 0 {
            return Err(RelayError::NotFound(format!("user {user_id} not subscribed to {team}")));
        }
        Ok(())
    }

    pub async fn users_by_team(&self, team: &str) -> Result<Vec<i64>, RelayError> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare("SELECT user_id FROM subscriptions WHERE team = ?1 AND active = 1")?;
        let ids = stmt.query_map([team], |row| row.get(0))?.collect::<Result<_, _>>()?;
        Ok(ids)
    }

    pub async fn users_by_any_team(&self, teams: &[&str]) -> Result<Vec<i64>, RelayError> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for team in teams {
            for user_id in self.users_by_team(team).await? {
                if seen.insert(user_id) {
                    out.push(user_id);
                }
            }
        }
        Ok(out)
    }

    // ---- Client/team binding operations -----------------------------------

    pub async fn client_get_team(&self, client: &str) -> Result<ClientTeam, RelayError> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare("SELECT team FROM client_team_bindings WHERE client = ?1")?;
        let teams: Vec<String> = stmt.query_map([client], |row| row.get(0))?.collect::<Result<_, _>>()?;

        Ok(match teams.len() {
            0 => ClientTeam::ClientUnknown,
            1 if teams[0].is_empty() => ClientTeam::NoBinding,
            1 => ClientTeam::Bound(teams[0].clone()),
            _ => ClientTeam::Ambiguous,
        })
    }

    pub async fn client_add(&self, client: &str, team: &str) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        // count-then-insert must be atomic: SPEC_FULL.md §9 relies on
        // ClientAdd/ClientSetTeam, not a schema constraint, to keep at most
        // one live row per client during normal operation.
        let tx = conn.unchecked_transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT count(*) FROM client_team_bindings WHERE client = ?1",
            [client],
            |row| row.get(0),
        )?;
        if exists == 0 {
            tx.execute(
                "INSERT INTO client_team_bindings (client, team) VALUES (?1, ?2)",
                (client, team),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn client_set_team(&self, client: &str, team: &str) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let tx = conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE client_team_bindings SET team = ?1 WHERE client = ?2",
            (team, client),
        )?;
        if updated == 0 {
            tx.execute(
                "INSERT INTO client_team_bindings (client, team) VALUES (?1, ?2)",
                (client, team),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- Outbound message operations --------------------------------------

    pub async fn message_enqueue(&self, channel: &str, chat_id: i64, text: &str) -> Result<i64, RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();
        conn.execute(
            "INSERT INTO outbound_messages (channel, chat_id, message_text, created_at, sent_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            (channel, chat_id, text, now),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn message_mark_delivered(&self, id: i64) -> Result<(), RelayError> {
        let conn = self.pool.get().await?;
        let now = Self::now();
        // Idempotent: a second call finds sent_at already set and simply
        // leaves it untouched rather than erroring.
        conn.execute(
            "UPDATE outbound_messages SET sent_at = ?1 WHERE id = ?2 AND sent_at IS NULL",
            (now, id),
        )?;
        Ok(())
    }

    /// Messages still lacking a delivery receipt, at least `grace_period`
    /// seconds old. `sent_at IS NULL` is the authoritative "undelivered"
    /// predicate; the grace period gives a normal-path delivery attempt time
    /// to complete before the sweeper duplicates it (see SPEC_FULL.md §9).
    pub async fn message_list_undelivered(&self, channel: &str, grace_period_secs: i64) -> Result<Vec<i64>, RelayError> {
        let conn = self.pool.get().await?;
        let threshold = Self::now() - grace_period_secs;
        let mut stmt = conn.prepare(
            "SELECT id FROM outbound_messages WHERE channel = ?1 AND sent_at IS NULL AND created_at < ?2",
        )?;
        let ids = stmt.query_map((channel, threshold), |row| row.get(0))?.collect::<Result<_, _>>()?;
        Ok(ids)
    }

    pub async fn message_get_text(&self, id: i64) -> Result<String, RelayError> {
        let conn = self.pool.get().await?;
        conn.query_row("SELECT message_text FROM outbound_messages WHERE id = ?1", [id], |row| row.get(0))
            .map_err(|_| RelayError::NotFound(format!("message {id}")))
    }

    pub async fn message_get_chat_id(&self, id: i64) -> Result<i64, RelayError> {
        let conn = self.pool.get().await?;
        conn.query_row("SELECT chat_id FROM outbound_messages WHERE id = ?1", [id], |row| row.get(0))
            .map_err(|_| RelayError::NotFound(format!("message {id}")))
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
    async fn create_event_then_duplicate_is_noop() {
        let (store, _dir) = test_store().await;
        let first = store.create_event("Telegram", "newticket", 4242, 300).await.unwrap();
        assert!(matches!(first, CreateEventOutcome::Created(_)));

        let second = store.create_event("Telegram", "newticket", 4242, 300).await.unwrap();
        assert_eq!(second, CreateEventOutcome::AlreadyExists);
    }

    /// Two concurrent webhook requests for the same ticket id (spec.md §8
    /// scenario 6) must leave exactly one live Event row, not a race between
    /// two connections that both observed "no existing row".
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_create_event_leaves_a_single_row() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("concurrent.db"), 4).await.unwrap());

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.create_event("Telegram", "newticket", 4242, 300).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.create_event("Telegram", "newticket", 4242, 300).await })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, CreateEventOutcome::Created(_))).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == CreateEventOutcome::AlreadyExists).count(), 1);

        let conn = store.pool.get().await.unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM events WHERE ticket_id = 4242 AND type = 'newticket'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn pick_next_active_orders_by_activation_then_id() {
        let (store, _dir) = test_store().await;
        store.create_event("Telegram", "newticket", 1, -100).await.unwrap();
        store.create_event("Telegram", "newticket", 2, -200).await.unwrap();

        let picked = store.pick_next_active().await.unwrap().unwrap();
        assert_eq!(picked.ticket_id, 2);
    }

    #[tokio::test]
    async fn mark_ended_sets_finished_at() {
        let (store, _dir) = test_store().await;
        let outcome = store.create_event("Telegram", "newticket", 1, 300).await.unwrap();
        let CreateEventOutcome::Created(event_id) = outcome else { panic!() };

        store.mark_ended(event_id).await.unwrap();
        let status = store.get_event_status(event_id).await.unwrap();
        assert_eq!(status, "Ended");
    }

    #[tokio::test]
    async fn client_get_team_distinguishes_unknown_nobinding_and_bound() {
        let (store, _dir) = test_store().await;
        assert_eq!(store.client_get_team("ACME").await.unwrap(), ClientTeam::ClientUnknown);

        store.client_add("ACME", "").await.unwrap();
        assert_eq!(store.client_get_team("ACME").await.unwrap(), ClientTeam::NoBinding);

        store.client_set_team("ACME", "Team2").await.unwrap();
        assert_eq!(store.client_get_team("ACME").await.unwrap(), ClientTeam::Bound("Team2".to_string()));
    }

    #[tokio::test]
    async fn client_get_team_ambiguous_when_two_rows_bind_same_client() {
        let (store, _dir) = test_store().await;
        let conn = store.pool.get().await.unwrap();
        conn.execute("INSERT INTO client_team_bindings (client, team) VALUES ('ACME', 'Team1')", []).unwrap();
        conn.execute("INSERT INTO client_team_bindings (client, team) VALUES ('ACME', 'Team2')", []).unwrap();
        drop(conn);

        assert_eq!(store.client_get_team("ACME").await.unwrap(), ClientTeam::Ambiguous);
    }

    #[tokio::test]
    async fn users_by_any_team_deduplicates() {
        let (store, _dir) = test_store().await;
        store.add_user(111).await.unwrap();
        let UserLookup::Found(user_id) = store.user_id_by_telegram_id(111).await.unwrap() else { panic!() };
        store.subscribe_add(user_id, "Team1").await.unwrap();
        store.subscribe_add(user_id, "Team2").await.unwrap();

        let users = store.users_by_any_team(&["Team1", "Team2"]).await.unwrap();
        assert_eq!(users, vec![user_id]);
    }

    #[tokio::test]
    async fn message_mark_delivered_is_idempotent() {
        let (store, _dir) = test_store().await;
        let id = store.message_enqueue("Telegram", 99, "hi").await.unwrap();
        store.message_mark_delivered(id).await.unwrap();
        store.message_mark_delivered(id).await.unwrap();

        let undelivered = store.message_list_undelivered("Telegram", 0).await.unwrap();
        assert!(!undelivered.contains(&id));
    }

    #[tokio::test]
    async fn message_list_undelivered_respects_grace_period() {
        let (store, _dir) = test_store().await;
        let id = store.message_enqueue("Telegram", 99, "hi").await.unwrap();

        let immediate = store.message_list_undelivered("Telegram", 60).await.unwrap();
        assert!(!immediate.contains(&id));

        let no_grace = store.message_list_undelivered("Telegram", -1).await.unwrap();
        assert!(no_grace.contains(&id));
    }

    #[tokio::test]
    async fn schema_validates_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.db");
        {
            Store::new(&path, 1).await.unwrap();
        }
        // Reopening an already-valid database must not error.
        Store::new(&path, 1).await.unwrap();
    }
}
