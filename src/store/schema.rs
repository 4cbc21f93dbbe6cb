use rusqlite::Connection;
use tracing::{error, info};

/// One column of a table as reported by `PRAGMA table_info`.
struct ColumnSpec {
    name: &'static str,
    decl_type: &'static str,
    not_null: bool,
    /// 1-based primary-key position, 0 if not part of the primary key.
    pk: i32,
}

struct TableSpec {
    name: &'static str,
    create_sql: &'static str,
    columns: &'static [ColumnSpec],
}

const EVENTS: TableSpec = TableSpec {
    name: "events",
    create_sql: "CREATE TABLE events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status TEXT NOT NULL,
        channel TEXT NOT NULL,
        type TEXT NOT NULL,
        ticket_id INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        activation_interval INTEGER NOT NULL,
        next_activation_at INTEGER NOT NULL,
        finished_at INTEGER
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "INTEGER", not_null: false, pk: 1 },
        ColumnSpec { name: "status", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "channel", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "type", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "ticket_id", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "created_at", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "activation_interval", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "next_activation_at", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "finished_at", decl_type: "INTEGER", not_null: false, pk: 0 },
    ],
};

const USERS: TableSpec = TableSpec {
    name: "users",
    create_sql: "CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        telegram_id INTEGER NOT NULL UNIQUE,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "INTEGER", not_null: false, pk: 1 },
        ColumnSpec { name: "telegram_id", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "first_name", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "last_name", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "created_at", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "active", decl_type: "INTEGER", not_null: true, pk: 0 },
    ],
};

const SUBSCRIPTIONS: TableSpec = TableSpec {
    name: "subscriptions",
    create_sql: "CREATE TABLE subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        team TEXT NOT NULL,
        active INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        finished_at INTEGER
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "INTEGER", not_null: false, pk: 1 },
        ColumnSpec { name: "user_id", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "team", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "active", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "created_at", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "finished_at", decl_type: "INTEGER", not_null: false, pk: 0 },
    ],
};

// No PRIMARY KEY on `client`: the Ambiguous scenario (two teams bound to the
// same client) must be representable at the data layer. Uniqueness during
// normal operation is enforced by ClientAdd/ClientSetTeam instead.
const CLIENT_TEAM_BINDINGS: TableSpec = TableSpec {
    name: "client_team_bindings",
    create_sql: "CREATE TABLE client_team_bindings (
        client TEXT NOT NULL,
        team TEXT NOT NULL
    )",
    columns: &[
        ColumnSpec { name: "client", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "team", decl_type: "TEXT", not_null: true, pk: 0 },
    ],
};

const OUTBOUND_MESSAGES: TableSpec = TableSpec {
    name: "outbound_messages",
    create_sql: "CREATE TABLE outbound_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel TEXT NOT NULL,
        chat_id INTEGER NOT NULL,
        message_text TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        sent_at INTEGER
    )",
    columns: &[
        ColumnSpec { name: "id", decl_type: "INTEGER", not_null: false, pk: 1 },
        ColumnSpec { name: "channel", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "chat_id", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "message_text", decl_type: "TEXT", not_null: true, pk: 0 },
        ColumnSpec { name: "created_at", decl_type: "INTEGER", not_null: true, pk: 0 },
        ColumnSpec { name: "sent_at", decl_type: "INTEGER", not_null: false, pk: 0 },
    ],
};

const ALL_TABLES: &[&TableSpec] = &[
    &EVENTS,
    &USERS,
    &SUBSCRIPTIONS,
    &CLIENT_TEAM_BINDINGS,
    &OUTBOUND_MESSAGES,
];

/// Creates any missing tables and validates the column layout of tables that
/// already exist against the reference schema above. Aborts (returns `Err`)
/// on the first mismatch, naming the table and the discrepancy.
pub fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    for table in ALL_TABLES {
        if table_exists(conn, table.name)? {
            validate_table(conn, table)?;
        } else {
            info!("creating missing table '{}'", table.name);
            conn.execute(table.create_sql, [])?;
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn validate_table(conn: &Connection, table: &TableSpec) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table.name))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(1)?,  // name
            row.get::<_, String>(2)?,  // type
            row.get::<_, i32>(3)?,     // notnull
            row.get::<_, i32>(5)?,     // pk
        ))
    })?;

    let actual: Vec<(String, String, i32, i32)> = rows.collect::<Result<_, _>>()?;

    if actual.len() != table.columns.len() {
        error!(
            table = table.name,
            expected = table.columns.len(),
            actual = actual.len(),
            "column count mismatch"
        );
        anyhow::bail!(
            "schema validation failed for table '{}': expected {} columns, found {}",
            table.name,
            table.columns.len(),
            actual.len()
        );
    }

    for (expected, (name, decl_type, not_null, pk)) in table.columns.iter().zip(actual.iter()) {
        let not_null_matches = expected.not_null == (*not_null != 0);
        let pk_matches = expected.pk == *pk;
        if expected.name != name || expected.decl_type != decl_type.to_uppercase() || !not_null_matches || !pk_matches {
            error!(
                table = table.name,
                column = name.as_str(),
                expected_name = expected.name,
                expected_type = expected.decl_type,
                "column mismatch"
            );
            anyhow::bail!(
                "schema validation failed for table '{}': column '{}' does not match reference schema",
                table.name,
                name
            );
        }
    }

    Ok(())
}
