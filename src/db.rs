use crate::backend::{Backend, BackendError};
use crate::dedup::SeenCache;
use crate::models::{
    Channel, ChannelEvent, ChannelLog, ChannelType, Contact, Direction, Msg, MsgStatus,
    StatusUpdate,
};
use crate::queue;
use crate::sender::compute_backoff;
use crate::urns::Urn;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Which flavor of SQL the pool speaks. Queries in this module are
/// written Postgres-style with numbered `$n` markers; SQLite wants
/// anonymous placeholders instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> SqlDialect {
        if url.to_lowercase().starts_with("postgres") {
            SqlDialect::Postgres
        } else {
            SqlDialect::Sqlite
        }
    }
}

/// Collapse `$1`, `$2`, ... to `?` when the pool is SQLite. Parameters
/// here are always numbered in order of appearance and used once, so the
/// positional form binds identically.
pub fn dialect_sql(sql: &str, dialect: SqlDialect) -> Cow<'_, str> {
    if dialect == SqlDialect::Postgres || !sql.contains('$') {
        return Cow::Borrowed(sql);
    }
    let mut rewritten = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            rewritten.push('?');
        } else {
            rewritten.push(ch);
        }
    }
    Cow::Owned(rewritten)
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub async fn init_db(pool: &AnyPool, dialect: SqlDialect) -> Result<(), sqlx::Error> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY,
            uuid TEXT NOT NULL UNIQUE,
            channel_type TEXT NOT NULL,
            address TEXT NOT NULL,
            country TEXT NOT NULL,
            org_id INTEGER NOT NULL,
            config TEXT NOT NULL,
            flow_server_enabled INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS contacts (
            id INTEGER PRIMARY KEY,
            org_id INTEGER NOT NULL,
            name TEXT,
            created_on INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS contact_urns (
            id INTEGER PRIMARY KEY,
            org_id INTEGER NOT NULL,
            contact_id INTEGER NOT NULL,
            urn TEXT NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_contact_urns_org_urn
           ON contact_urns(org_id, urn)"#,
        r#"CREATE TABLE IF NOT EXISTS msgs (
            id INTEGER PRIMARY KEY,
            uuid TEXT NOT NULL,
            direction TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            channel_uuid TEXT NOT NULL,
            channel_type TEXT NOT NULL,
            org_id INTEGER NOT NULL,
            urn TEXT NOT NULL,
            text TEXT NOT NULL,
            attachments TEXT NOT NULL,
            quick_replies TEXT NOT NULL,
            external_id TEXT,
            contact_id INTEGER,
            contact_urn_id INTEGER,
            contact_name TEXT,
            received_on INTEGER,
            sent_on INTEGER,
            status TEXT NOT NULL,
            error_count INTEGER NOT NULL,
            next_attempt_at INTEGER,
            created_on INTEGER NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_msgs_channel_external
           ON msgs(channel_uuid, direction, external_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_msgs_outgoing
           ON msgs(direction, status, next_attempt_at)"#,
        r#"CREATE TABLE IF NOT EXISTS channel_events (
            id INTEGER PRIMARY KEY,
            channel_id INTEGER NOT NULL,
            channel_uuid TEXT NOT NULL,
            org_id INTEGER NOT NULL,
            urn TEXT NOT NULL,
            kind TEXT NOT NULL,
            extra TEXT NOT NULL,
            contact_id INTEGER,
            contact_urn_id INTEGER,
            occurred_on INTEGER NOT NULL,
            created_on INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS channel_logs (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            channel_uuid TEXT NOT NULL,
            msg_id INTEGER,
            url TEXT NOT NULL,
            request TEXT NOT NULL,
            response TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            elapsed_ms INTEGER NOT NULL,
            error TEXT,
            created_on INTEGER NOT NULL
        )"#,
    ];

    for stmt in stmts {
        let sql = dialect_sql(stmt, dialect);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }
    Ok(())
}

/// The production backend: messages and contacts in SQL, hand-off fan-out
/// in Redis, the seen cache in process memory.
pub struct DbBackend {
    pool: AnyPool,
    dialect: SqlDialect,
    redis: ConnectionManager,
    seen: SeenCache,
    celery_queue: String,
    max_send_attempts: i32,
}

impl DbBackend {
    pub fn new(
        pool: AnyPool,
        dialect: SqlDialect,
        redis: ConnectionManager,
        celery_queue: String,
        dedup_capacity: usize,
        dedup_ttl: Duration,
        max_send_attempts: i32,
    ) -> DbBackend {
        DbBackend {
            pool,
            dialect,
            redis,
            seen: SeenCache::new(dedup_capacity, dedup_ttl),
            celery_queue,
            max_send_attempts,
        }
    }

    async fn next_id(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        table: &str,
    ) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", table);
        let id: i64 = sqlx::query_scalar(&sql).fetch_one(&mut **tx).await?;
        Ok(id)
    }

    /// Find the contact owning this URN, creating contact and URN rows on
    /// first sight. Returns the contact plus the URN row id.
    async fn contact_for_urn(
        &self,
        org_id: i64,
        urn: &Urn,
        name: Option<&str>,
    ) -> Result<(Contact, i64), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let sql = dialect_sql(
            "SELECT id, contact_id FROM contact_urns WHERE org_id = $1 AND urn = $2",
            self.dialect,
        );
        let existing = sqlx::query(sql.as_ref())
            .bind(org_id)
            .bind(urn.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let urn_id: i64 = row.try_get("id")?;
            let contact_id: i64 = row.try_get("contact_id")?;
            let sql = dialect_sql("SELECT name FROM contacts WHERE id = $1", self.dialect);
            let name: Option<String> = sqlx::query_scalar(sql.as_ref())
                .bind(contact_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok((
                Contact {
                    id: contact_id,
                    org_id,
                    name,
                    urns: vec![urn.clone()],
                    is_new: false,
                },
                urn_id,
            ));
        }

        let contact_id = self.next_id(&mut tx, "contacts").await?;
        let sql = dialect_sql(
            "INSERT INTO contacts (id, org_id, name, created_on) VALUES ($1, $2, $3, $4)",
            self.dialect,
        );
        sqlx::query(sql.as_ref())
            .bind(contact_id)
            .bind(org_id)
            .bind(name)
            .bind(datetime_to_i64(Utc::now()))
            .execute(&mut *tx)
            .await?;

        let urn_id = self.next_id(&mut tx, "contact_urns").await?;
        let sql = dialect_sql(
            "INSERT INTO contact_urns (id, org_id, contact_id, urn) VALUES ($1, $2, $3, $4)",
            self.dialect,
        );
        sqlx::query(sql.as_ref())
            .bind(urn_id)
            .bind(org_id)
            .bind(contact_id)
            .bind(urn.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((
            Contact {
                id: contact_id,
                org_id,
                name: name.map(|n| n.to_string()),
                urns: vec![urn.clone()],
                is_new: true,
            },
            urn_id,
        ))
    }

    fn msg_from_row(&self, row: &sqlx::any::AnyRow) -> Result<Msg, BackendError> {
        let uuid: String = row.try_get("uuid").map_err(BackendError::Db)?;
        let direction: String = row.try_get("direction").map_err(BackendError::Db)?;
        let channel_uuid: String = row.try_get("channel_uuid").map_err(BackendError::Db)?;
        let channel_type: String = row.try_get("channel_type").map_err(BackendError::Db)?;
        let urn: String = row.try_get("urn").map_err(BackendError::Db)?;
        let attachments: String = row.try_get("attachments").map_err(BackendError::Db)?;
        let quick_replies: String = row.try_get("quick_replies").map_err(BackendError::Db)?;
        let status: String = row.try_get("status").map_err(BackendError::Db)?;
        let received_on: Option<i64> = row.try_get("received_on").map_err(BackendError::Db)?;
        let sent_on: Option<i64> = row.try_get("sent_on").map_err(BackendError::Db)?;
        let created_on: i64 = row.try_get("created_on").map_err(BackendError::Db)?;

        Ok(Msg {
            id: row.try_get("id").map_err(BackendError::Db)?,
            uuid: Uuid::parse_str(&uuid).map_err(|e| BackendError::Other(e.to_string()))?,
            direction: if direction == "O" {
                Direction::Outgoing
            } else {
                Direction::Incoming
            },
            channel_id: row.try_get("channel_id").map_err(BackendError::Db)?,
            channel_uuid: Uuid::parse_str(&channel_uuid)
                .map_err(|e| BackendError::Other(e.to_string()))?,
            channel_type: ChannelType::new(&channel_type),
            org_id: row.try_get("org_id").map_err(BackendError::Db)?,
            urn: Urn::parse(&urn).map_err(|e| BackendError::Other(e.to_string()))?,
            text: row.try_get("text").map_err(BackendError::Db)?,
            attachments: serde_json::from_str(&attachments).unwrap_or_default(),
            quick_replies: serde_json::from_str(&quick_replies).unwrap_or_default(),
            external_id: row.try_get("external_id").map_err(BackendError::Db)?,
            contact_name: row.try_get("contact_name").map_err(BackendError::Db)?,
            contact_id: row.try_get("contact_id").map_err(BackendError::Db)?,
            contact_urn_id: row.try_get("contact_urn_id").map_err(BackendError::Db)?,
            received_on: received_on.map(i64_to_datetime),
            sent_on: sent_on.map(i64_to_datetime),
            status: MsgStatus::from_code(&status).unwrap_or(MsgStatus::Pending),
            error_count: row.try_get::<i64, _>("error_count").map_err(BackendError::Db)? as i32,
            created_on: i64_to_datetime(created_on),
        })
    }
}

#[async_trait]
impl Backend for DbBackend {
    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: Uuid,
    ) -> Result<Channel, BackendError> {
        let sql = dialect_sql(
            r#"SELECT id, uuid, channel_type, address, country, org_id, config, flow_server_enabled
               FROM channels WHERE uuid = $1 AND channel_type = $2"#,
            self.dialect,
        );
        let row = sqlx::query(sql.as_ref())
            .bind(uuid.to_string())
            .bind(channel_type.code())
            .fetch_optional(&self.pool)
            .await?;

        let row = row.ok_or(BackendError::ChannelNotFound)?;
        let config_raw: String = row.try_get("config")?;
        let config: HashMap<String, serde_json::Value> =
            serde_json::from_str(&config_raw).unwrap_or_default();
        let uuid_raw: String = row.try_get("uuid")?;
        let type_raw: String = row.try_get("channel_type")?;
        let flow_server: i64 = row.try_get("flow_server_enabled")?;

        Ok(Channel {
            id: row.try_get("id")?,
            uuid: Uuid::parse_str(&uuid_raw).map_err(|e| BackendError::Other(e.to_string()))?,
            channel_type: ChannelType::new(&type_raw),
            address: row.try_get("address")?,
            country: row.try_get("country")?,
            org_id: row.try_get("org_id")?,
            config,
            flow_server_enabled: flow_server != 0,
        })
    }

    async fn write_msg(&self, msg: &mut Msg) -> Result<(), BackendError> {
        let channel = self.get_channel(&msg.channel_type, msg.channel_uuid).await?;
        let (contact, urn_id) = self
            .contact_for_urn(msg.org_id, &msg.urn, msg.contact_name.as_deref())
            .await?;
        msg.contact_id = Some(contact.id);
        msg.contact_urn_id = Some(urn_id);

        let mut tx = self.pool.begin().await?;
        let id = self.next_id(&mut tx, "msgs").await?;
        let sql = dialect_sql(
            r#"INSERT INTO msgs (
                id, uuid, direction, channel_id, channel_uuid, channel_type, org_id, urn, text,
                attachments, quick_replies, external_id, contact_id, contact_urn_id, contact_name,
                received_on, sent_on, status, error_count, next_attempt_at, created_on
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                      $18, $19, $20, $21)"#,
            self.dialect,
        );
        sqlx::query(sql.as_ref())
            .bind(id)
            .bind(msg.uuid.to_string())
            .bind(msg.direction.code())
            .bind(msg.channel_id)
            .bind(msg.channel_uuid.to_string())
            .bind(msg.channel_type.code())
            .bind(msg.org_id)
            .bind(msg.urn.as_str())
            .bind(&msg.text)
            .bind(serde_json::to_string(&msg.attachments).unwrap_or_else(|_| "[]".to_string()))
            .bind(serde_json::to_string(&msg.quick_replies).unwrap_or_else(|_| "[]".to_string()))
            .bind(msg.external_id.as_deref())
            .bind(msg.contact_id)
            .bind(msg.contact_urn_id)
            .bind(msg.contact_name.as_deref())
            .bind(msg.received_on.map(datetime_to_i64))
            .bind(msg.sent_on.map(datetime_to_i64))
            .bind(msg.status.code())
            .bind(msg.error_count as i64)
            .bind(Option::<i64>::None)
            .bind(datetime_to_i64(msg.created_on))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        msg.id = id;

        if msg.direction == Direction::Incoming {
            let mut conn = self.redis.clone();
            queue::queue_msg_handling(&mut conn, &self.celery_queue, &channel, &contact, msg)
                .await?;
        }
        Ok(())
    }

    fn check_external_id_seen(&self, msg: &Msg) -> bool {
        match msg.external_id.as_deref() {
            Some(external_id) => self.seen.contains(msg.channel_uuid, external_id),
            None => false,
        }
    }

    fn write_external_id_seen(&self, msg: &Msg) {
        if let Some(external_id) = msg.external_id.as_deref() {
            self.seen.insert(msg.channel_uuid, external_id);
        }
    }

    async fn write_msg_status(&self, status: &StatusUpdate) -> Result<(), BackendError> {
        let row = match (status.msg_id, status.external_id.as_deref()) {
            (Some(msg_id), _) => {
                let sql = dialect_sql("SELECT id, status FROM msgs WHERE id = $1", self.dialect);
                sqlx::query(sql.as_ref())
                    .bind(msg_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            (None, Some(external_id)) => {
                let sql = dialect_sql(
                    r#"SELECT id, status FROM msgs
                       WHERE channel_uuid = $1 AND direction = 'O' AND external_id = $2"#,
                    self.dialect,
                );
                sqlx::query(sql.as_ref())
                    .bind(status.channel_uuid.to_string())
                    .bind(external_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            (None, None) => None,
        };

        let row = row.ok_or(BackendError::MsgNotFound)?;
        let id: i64 = row.try_get("id")?;
        let current_raw: String = row.try_get("status")?;
        let current = MsgStatus::from_code(&current_raw).unwrap_or(MsgStatus::Pending);

        if current.is_regression(status.status) {
            tracing::debug!(
                msg_id = id,
                from = current.code(),
                to = status.status.code(),
                "dropping status regression"
            );
            return Ok(());
        }

        let sent_on = matches!(status.status, MsgStatus::Wired | MsgStatus::Sent)
            .then(|| datetime_to_i64(Utc::now()));
        // external_id only changes when the update was keyed by internal id
        let new_external = match status.msg_id {
            Some(_) => status.external_id.as_deref(),
            None => None,
        };
        let sql = dialect_sql(
            r#"UPDATE msgs SET status = $1,
                sent_on = COALESCE(sent_on, $2),
                external_id = COALESCE($3, external_id)
               WHERE id = $4"#,
            self.dialect,
        );
        sqlx::query(sql.as_ref())
            .bind(status.status.code())
            .bind(sent_on)
            .bind(new_external)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_channel_event(&self, event: &mut ChannelEvent) -> Result<(), BackendError> {
        let channel_type = {
            let sql = dialect_sql(
                "SELECT channel_type FROM channels WHERE uuid = $1",
                self.dialect,
            );
            let raw: Option<String> = sqlx::query_scalar(sql.as_ref())
                .bind(event.channel_uuid.to_string())
                .fetch_optional(&self.pool)
                .await?;
            raw.ok_or(BackendError::ChannelNotFound)?
        };
        let channel = self
            .get_channel(&ChannelType::new(&channel_type), event.channel_uuid)
            .await?;
        let (contact, urn_id) = self.contact_for_urn(event.org_id, &event.urn, None).await?;
        event.contact_id = Some(contact.id);
        event.contact_urn_id = Some(urn_id);

        let mut tx = self.pool.begin().await?;
        let id = self.next_id(&mut tx, "channel_events").await?;
        let sql = dialect_sql(
            r#"INSERT INTO channel_events (
                id, channel_id, channel_uuid, org_id, urn, kind, extra,
                contact_id, contact_urn_id, occurred_on, created_on
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
            self.dialect,
        );
        sqlx::query(sql.as_ref())
            .bind(id)
            .bind(event.channel_id)
            .bind(event.channel_uuid.to_string())
            .bind(event.org_id)
            .bind(event.urn.as_str())
            .bind(serde_json::to_string(&event.kind).unwrap_or_default())
            .bind(serde_json::to_string(&event.extra).unwrap_or_else(|_| "{}".to_string()))
            .bind(event.contact_id)
            .bind(event.contact_urn_id)
            .bind(datetime_to_i64(event.occurred_on))
            .bind(datetime_to_i64(event.created_on))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut conn = self.redis.clone();
        queue::queue_channel_event(&mut conn, &self.celery_queue, &channel, &contact, event, id)
            .await?;
        Ok(())
    }

    async fn write_channel_log(&self, log: &ChannelLog) -> Result<(), BackendError> {
        let sql = dialect_sql(
            r#"INSERT INTO channel_logs (
                id, description, channel_uuid, msg_id, url, request, response,
                status_code, elapsed_ms, error, created_on
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
            self.dialect,
        );
        sqlx::query(sql.as_ref())
            .bind(Uuid::new_v4().to_string())
            .bind(&log.description)
            .bind(log.channel_uuid.to_string())
            .bind(log.msg_id)
            .bind(&log.url)
            .bind(&log.request)
            .bind(&log.response)
            .bind(log.status_code as i64)
            .bind(log.elapsed_ms)
            .bind(log.error.as_deref())
            .bind(datetime_to_i64(log.created_on))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_next_outgoing_msg(&self) -> Result<Option<Msg>, BackendError> {
        let now = datetime_to_i64(Utc::now());
        let sql = dialect_sql(
            r#"SELECT * FROM msgs
               WHERE direction = 'O' AND status IN ('P', 'E')
                 AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
               ORDER BY created_on ASC LIMIT 1"#,
            self.dialect,
        );
        let row = sqlx::query(sql.as_ref())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let msg = self.msg_from_row(&row)?;

        // claim it; a concurrent worker losing this race just polls again
        let sql = dialect_sql(
            "UPDATE msgs SET status = 'Q' WHERE id = $1 AND status IN ('P', 'E')",
            self.dialect,
        );
        let claimed = sqlx::query(sql.as_ref())
            .bind(msg.id)
            .execute(&self.pool)
            .await?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(msg))
    }

    async fn mark_outgoing_msg_complete(
        &self,
        msg: &Msg,
        status: &StatusUpdate,
    ) -> Result<(), BackendError> {
        if status.status == MsgStatus::Errored {
            let attempts = msg.error_count + 1;
            if attempts >= self.max_send_attempts {
                let sql = dialect_sql(
                    "UPDATE msgs SET status = 'F', error_count = $1 WHERE id = $2",
                    self.dialect,
                );
                sqlx::query(sql.as_ref())
                    .bind(attempts as i64)
                    .bind(msg.id)
                    .execute(&self.pool)
                    .await?;
            } else {
                let next = Utc::now() + compute_backoff(attempts);
                let sql = dialect_sql(
                    "UPDATE msgs SET status = 'E', error_count = $1, next_attempt_at = $2 WHERE id = $3",
                    self.dialect,
                );
                sqlx::query(sql.as_ref())
                    .bind(attempts as i64)
                    .bind(datetime_to_i64(next))
                    .bind(msg.id)
                    .execute(&self.pool)
                    .await?;
            }
            return Ok(());
        }

        let sent_on = matches!(status.status, MsgStatus::Wired | MsgStatus::Sent)
            .then(|| datetime_to_i64(Utc::now()));
        let sql = dialect_sql(
            r#"UPDATE msgs SET status = $1,
                sent_on = COALESCE(sent_on, $2),
                external_id = COALESCE($3, external_id)
               WHERE id = $4"#,
            self.dialect,
        );
        sqlx::query(sql.as_ref())
            .bind(status.status.code())
            .bind(sent_on)
            .bind(status.external_id.as_deref())
            .bind(msg.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
