//! Persistence of WARN+ events into a SQLite log database, so dropped
//! deliveries and storage failures can be inspected after the fact.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        username TEXT,
        connection_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
    CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

const DEFAULT_QUERY_LIMIT: u32 = 100;

/// One persisted log line.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining structured fields as a JSON object.
    pub fields: Option<String>,
    pub username: Option<String>,
    pub connection_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the event target.
    pub target: Option<String>,
    pub username: Option<String>,
    pub connection_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append a record; `id` is ignored. Write errors are swallowed since
    /// there is nowhere left to report them.
    fn append(&self, record: &LogRecord) {
        let conn = self.conn.lock();
        let result = conn
            .prepare_cached(
                "INSERT INTO logs (timestamp, level, target, message, fields, username, connection_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .and_then(|mut stmt| {
                stmt.execute((
                    &record.timestamp,
                    &record.level,
                    &record.target,
                    &record.message,
                    &record.fields,
                    &record.username,
                    &record.connection_id,
                ))
            });
        if let Err(e) = result {
            eprintln!("relay-telemetry: dropping log record: {e}");
        }
    }

    /// Matching records, newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        let mut filter = |column: &str, op: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(value);
                clauses.push(format!("{column} {op} ?{}", args.len()));
            }
        };
        filter("level", "=", q.level.clone());
        filter("target", "LIKE", q.target.as_ref().map(|t| format!("%{t}%")));
        filter("username", "=", q.username.clone());
        filter("connection_id", "=", q.connection_id.clone());
        filter("timestamp", ">=", q.since.clone());

        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, username, connection_id FROM logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY id DESC LIMIT {}",
            q.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
        ));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                username: row.get(6)?,
                connection_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// Layer that forwards WARN and ERROR events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Connection identity recorded on a span, inherited by events inside it.
#[derive(Clone, Default)]
struct ConnectionContext {
    username: Option<String>,
    connection_id: Option<String>,
}

impl ConnectionContext {
    fn is_empty(&self) -> bool {
        self.username.is_none() && self.connection_id.is_none()
    }

    fn fill_from(&mut self, outer: &ConnectionContext) {
        if self.username.is_none() {
            self.username.clone_from(&outer.username);
        }
        if self.connection_id.is_none() {
            self.connection_id.clone_from(&outer.connection_id);
        }
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    context: ConnectionContext,
    rest: Map<String, Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: Value) {
        match field.name() {
            "message" => self.message = Some(into_text(value)),
            "username" => self.context.username = Some(into_text(value)),
            "connection_id" => self.context.connection_id = Some(into_text(value)),
            name => {
                self.rest.insert(name.to_owned(), value);
            }
        }
    }
}

fn into_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.context);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        values.record(&mut fields);
        if fields.context.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<ConnectionContext>() {
            Some(existing) => {
                let mut updated = fields.context;
                updated.fill_from(existing);
                *existing = updated;
            }
            None => extensions.insert(fields.context),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<ConnectionContext>() {
                    fields.context.fill_from(outer);
                }
            }
        }

        let extra = (!fields.rest.is_empty())
            .then(|| Value::Object(fields.rest).to_string());

        self.sink.append(&LogRecord {
            id: 0,
            timestamp: Utc::now().to_rfc3339(),
            level: level.as_str().to_owned(),
            target: event.metadata().target().to_owned(),
            message: fields.message.unwrap_or_default(),
            fields: extra,
            username: fields.context.username,
            connection_id: fields.context.connection_id,
        });
    }
}
