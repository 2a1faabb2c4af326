//! SQLite database operations
//!
//! All database access goes through this module.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;

const ACTOR_SELECT: &str = r#"
    SELECT a.id, a.user_id, a.kind,
           COALESCE(u.username, a.handle) AS handle,
           COALESCE(u.name, a.name, u.username, a.handle) AS name,
           a.params, a.created_at
    FROM actors a
    LEFT JOIN users u ON a.user_id <> 0 AND u.id = a.user_id
"#;

const QUEUE_COLUMNS: &str =
    "id, actor_id, follower_id, inbox, activity, retry_count, next_attempt_at, created_at";

fn actor_from_row(row: &SqliteRow) -> Result<Option<Actor>, AppError> {
    // A linked actor whose user row is gone has no identity left.
    let Some(handle) = row.try_get::<Option<String>, _>("handle")? else {
        return Ok(None);
    };

    let kind: String = row.try_get("kind")?;
    let params: String = row.try_get("params")?;
    let params: ActorParams = serde_json::from_str(&params).map_err(|e| {
        AppError::Internal(anyhow::anyhow!("corrupt actor params for {handle}: {e}"))
    })?;

    Ok(Some(Actor {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: ActorKind::parse(&kind).unwrap_or_default(),
        name: row
            .try_get::<Option<String>, _>("name")?
            .unwrap_or_else(|| handle.clone()),
        handle,
        params,
        created_at: row.try_get("created_at")?,
    }))
}

fn object_from_row(row: &SqliteRow) -> Result<StoredObject, AppError> {
    let status: String = row.try_get("status")?;
    let document: String = row.try_get("document")?;
    Ok(StoredObject {
        id: EntityId(row.try_get("id")?),
        actor_id: row.try_get("actor_id")?,
        context: row.try_get("context")?,
        reference: row.try_get("reference")?,
        status: ObjectStatus::parse(&status).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("unknown object status: {status}"))
        })?,
        document: parse_document(&document)?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn outbox_from_row(row: &SqliteRow) -> Result<OutboxRecord, AppError> {
    let document: String = row.try_get("document")?;
    Ok(OutboxRecord {
        id: EntityId(row.try_get("id")?),
        actor_id: row.try_get("actor_id")?,
        document: parse_document(&document)?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_document(raw: &str) -> Result<serde_json::Value, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt stored document: {e}")))
}

fn to_json(value: &impl serde::Serialize) -> Result<String, AppError> {
    serde_json::to_string(value).map_err(|e| AppError::Internal(e.into()))
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether an inbox URL lives on `domain` (or its `www.` host)
fn inbox_on_domain(inbox: &str, domain: &str) -> bool {
    let Some(host) = url::Url::parse(inbox)
        .ok()
        .and_then(|url| url.host_str().map(normalize_domain))
    else {
        return false;
    };
    host == domain || host.strip_prefix("www.") == Some(domain)
}

fn is_valid_handle(handle: &str) -> bool {
    !handle.is_empty()
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn create_user(&self, user: &NewUser) -> Result<User, AppError> {
        let id = sqlx::query(
            r#"
            INSERT INTO users (
                username, name, email, activation_pending, blocked,
                federation_opt_in, searchable_by_email, created_at
            ) VALUES (?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&user.username)
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.activation_pending)
        .bind(user.federation_opt_in)
        .bind(user.searchable_by_email)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_user(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ? COLLATE NOCASE")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn set_user_federation_opt_in(
        &self,
        user_id: i64,
        opt_in: Option<bool>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET federation_opt_in = ? WHERE id = ?")
            .bind(opt_in)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_user_blocked(&self, user_id: i64, blocked: bool) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET blocked = ? WHERE id = ?")
            .bind(blocked)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_user_activation_pending(
        &self,
        user_id: i64,
        pending: bool,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET activation_pending = ? WHERE id = ?")
            .bind(pending)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_user_to_group(&self, user_id: i64, group_id: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR IGNORE INTO user_groups (user_id, group_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set or clear the administrator override for a group
    pub async fn set_group_rule(
        &self,
        group_id: &str,
        rule: Option<GroupRule>,
    ) -> Result<(), AppError> {
        match rule {
            Some(rule) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO federation_group_rules (group_id, rule) VALUES (?, ?)",
                )
                .bind(group_id)
                .bind(rule.as_str())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM federation_group_rules WHERE group_id = ?")
                    .bind(group_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Overrides that apply to a user through any of their groups
    pub async fn group_rules_for_user(&self, user_id: i64) -> Result<Vec<GroupRule>, AppError> {
        let rules = sqlx::query_scalar::<_, String>(
            r#"
            SELECT r.rule FROM federation_group_rules r
            JOIN user_groups g ON g.group_id = r.group_id
            WHERE g.user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules.iter().filter_map(|rule| GroupRule::parse(rule)).collect())
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Create an actor not backed by a user account
    ///
    /// The handle shares one namespace with usernames.
    pub async fn create_virtual_actor(
        &self,
        handle: &str,
        name: &str,
        kind: ActorKind,
    ) -> Result<Actor, AppError> {
        if !is_valid_handle(handle) {
            return Err(AppError::Validation(format!("Invalid handle: {handle}")));
        }

        if self.get_user_by_username(handle).await?.is_some()
            || self.get_actor_by_handle(handle).await?.is_some()
        {
            return Err(AppError::Validation(format!(
                "Handle already taken: {handle}"
            )));
        }

        let id = sqlx::query(
            "INSERT INTO actors (user_id, kind, handle, name, params, created_at) VALUES (0, ?, ?, ?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(handle)
        .bind(name)
        .bind(to_json(&ActorParams::default())?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        tracing::info!(actor_id = id, handle, "Virtual actor created");

        self.get_actor(id).await?.ok_or(AppError::NotFound)
    }

    /// Get the actor of a user, creating it on first use
    pub async fn actor_for_user(&self, user_id: i64, kind: ActorKind) -> Result<Actor, AppError> {
        let user = self.get_user(user_id).await?.ok_or(AppError::NotFound)?;

        let taken = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM actors WHERE user_id = 0 AND handle = ?",
        )
        .bind(&user.username)
        .fetch_one(&self.pool)
        .await?;
        if taken > 0 {
            return Err(AppError::Validation(format!(
                "Handle already taken by a virtual actor: {}",
                user.username
            )));
        }

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO actors (user_id, kind, params, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(to_json(&ActorParams::default())?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::info!(user_id, username = %user.username, "Actor created for user");
        }

        let row = sqlx::query(&format!("{ACTOR_SELECT} WHERE a.user_id = ?"))
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        actor_from_row(&row)?.ok_or(AppError::NotFound)
    }

    pub async fn get_actor(&self, id: i64) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query(&format!("{ACTOR_SELECT} WHERE a.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => actor_from_row(&row),
            None => Ok(None),
        }
    }

    pub async fn get_actor_by_handle(&self, handle: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query(&format!(
            "{ACTOR_SELECT} WHERE COALESCE(u.username, a.handle) = ? COLLATE NOCASE"
        ))
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => actor_from_row(&row),
            None => Ok(None),
        }
    }

    pub async fn get_actor_by_user(&self, user_id: i64) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query(&format!("{ACTOR_SELECT} WHERE a.user_id = ? AND a.user_id <> 0"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => actor_from_row(&row),
            None => Ok(None),
        }
    }

    /// Replace the parameter bag of an actor
    pub async fn update_actor_params(
        &self,
        actor_id: i64,
        params: &ActorParams,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE actors SET params = ? WHERE id = ?")
            .bind(to_json(params)?)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    /// Store a key pair unless the actor already has one.
    ///
    /// Returns `false` when another writer stored a key pair first.
    pub async fn set_actor_keypair_if_absent(
        &self,
        actor_id: i64,
        keypair: &StoredKeyPair,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE actors SET params = json_set(params, '$.keypair', json(?))
            WHERE id = ? AND json_extract(params, '$.keypair') IS NULL
            "#,
        )
        .bind(to_json(keypair)?)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_actor(&self, actor_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM actors WHERE id = ?")
            .bind(actor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Insert or refresh a follower.
    ///
    /// Keyed by (actor_id, actor_uri); an existing row keeps its id so
    /// queued deliveries referencing it survive.
    pub async fn upsert_follower(&self, follower: &NewFollower) -> Result<i64, AppError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO followers (
                actor_id, actor_uri, handle, domain, follow_id, inbox, shared_inbox, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (actor_id, actor_uri) DO UPDATE SET
                handle = excluded.handle,
                domain = excluded.domain,
                follow_id = excluded.follow_id,
                inbox = excluded.inbox,
                shared_inbox = excluded.shared_inbox
            RETURNING id
            "#,
        )
        .bind(follower.actor_id)
        .bind(&follower.actor_uri)
        .bind(&follower.handle)
        .bind(normalize_domain(&follower.domain))
        .bind(&follower.follow_id)
        .bind(&follower.inbox)
        .bind(&follower.shared_inbox)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get_follower(
        &self,
        actor_id: i64,
        actor_uri: &str,
    ) -> Result<Option<Follower>, AppError> {
        let follower = sqlx::query_as::<_, Follower>(
            "SELECT * FROM followers WHERE actor_id = ? AND actor_uri = ?",
        )
        .bind(actor_id)
        .bind(actor_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follower)
    }

    /// Find the follower created by a specific Follow activity
    pub async fn find_follower(
        &self,
        actor_id: i64,
        actor_uri: &str,
        follow_id: &str,
    ) -> Result<Option<Follower>, AppError> {
        let follower = sqlx::query_as::<_, Follower>(
            "SELECT * FROM followers WHERE actor_id = ? AND actor_uri = ? AND follow_id = ?",
        )
        .bind(actor_id)
        .bind(actor_uri)
        .bind(follow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follower)
    }

    pub async fn delete_follower(&self, follower_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM followers WHERE id = ?")
            .bind(follower_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_follower_by_uri(
        &self,
        actor_id: i64,
        actor_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM followers WHERE actor_id = ? AND actor_uri = ?")
            .bind(actor_id)
            .bind(actor_uri)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_followers(&self, actor_id: i64) -> Result<Vec<Follower>, AppError> {
        let followers =
            sqlx::query_as::<_, Follower>("SELECT * FROM followers WHERE actor_id = ? ORDER BY id")
                .bind(actor_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(followers)
    }

    pub async fn count_followers(&self, actor_id: i64) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM followers WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Blocks / Fediblocks
    // =========================================================================

    /// Block a remote account for one actor; matching followers are removed.
    ///
    /// Returns the number of followers removed.
    pub async fn add_block(
        &self,
        actor_id: i64,
        handle: &str,
        domain: &str,
    ) -> Result<u64, AppError> {
        let domain = normalize_domain(domain);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO blocks (actor_id, handle, domain, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(actor_id)
        .bind(handle)
        .bind(&domain)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let shared_inboxes = sqlx::query_scalar::<_, Option<String>>(
            "DELETE FROM followers WHERE actor_id = ? AND handle = ? AND domain = ? RETURNING shared_inbox",
        )
        .bind(actor_id)
        .bind(handle)
        .bind(&domain)
        .fetch_all(&mut *tx)
        .await?;
        let removed = shared_inboxes.len() as u64;

        // Shared-inbox deliveries nobody else of this actor still needs
        for inbox in shared_inboxes.iter().flatten() {
            sqlx::query(
                r#"
                DELETE FROM delivery_queue
                WHERE actor_id = ? AND follower_id IS NULL AND inbox = ?
                  AND NOT EXISTS (
                      SELECT 1 FROM followers WHERE actor_id = ? AND shared_inbox = ?
                  )
                "#,
            )
            .bind(actor_id)
            .bind(inbox)
            .bind(actor_id)
            .bind(inbox)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(actor_id, handle, domain = %domain, removed, "Block stored");
        Ok(removed)
    }

    pub async fn remove_block(
        &self,
        actor_id: i64,
        handle: &str,
        domain: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM blocks WHERE actor_id = ? AND handle = ? AND domain = ?")
                .bind(actor_id)
                .bind(handle)
                .bind(normalize_domain(domain))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_blocks(&self, actor_id: i64) -> Result<Vec<Block>, AppError> {
        let blocks =
            sqlx::query_as::<_, Block>("SELECT * FROM blocks WHERE actor_id = ? ORDER BY id")
                .bind(actor_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(blocks)
    }

    pub async fn is_blocked(
        &self,
        actor_id: i64,
        handle: &str,
        domain: &str,
    ) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM blocks WHERE actor_id = ? AND handle = ? AND domain = ?",
        )
        .bind(actor_id)
        .bind(handle)
        .bind(normalize_domain(domain))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Block a whole remote domain server-wide; its followers are removed.
    ///
    /// Returns the number of followers removed.
    pub async fn add_fediblock(&self, domain: &str) -> Result<u64, AppError> {
        let domain = normalize_domain(domain);
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO fediblocks (domain, created_at) VALUES (?, ?)")
            .bind(&domain)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM followers WHERE domain = ?")
            .bind(&domain)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // Queued rows addressed to the domain, shared inboxes included
        let queued = sqlx::query_as::<_, (i64, String)>("SELECT id, inbox FROM delivery_queue")
            .fetch_all(&mut *tx)
            .await?;
        let doomed: Vec<i64> = queued
            .into_iter()
            .filter(|(_, inbox)| inbox_on_domain(inbox, &domain))
            .map(|(id, _)| id)
            .collect();
        if !doomed.is_empty() {
            let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM delivery_queue WHERE id IN (");
            let mut ids = query.separated(", ");
            for id in &doomed {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        tracing::info!(domain = %domain, removed, discarded = doomed.len(), "Fediblock stored");
        Ok(removed)
    }

    pub async fn remove_fediblock(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM fediblocks WHERE domain = ?")
            .bind(normalize_domain(domain))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM fediblocks WHERE domain = ?")
            .bind(normalize_domain(domain))
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Insert or overwrite an object record keyed by its id
    pub async fn upsert_object(&self, object: &StoredObject) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO objects (id, actor_id, context, reference, status, document, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(object.id.as_str())
        .bind(object.actor_id)
        .bind(&object.context)
        .bind(&object.reference)
        .bind(object.status.as_str())
        .bind(to_json(&object.document)?)
        .bind(object.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_object(&self, id: &str) -> Result<Option<StoredObject>, AppError> {
        let row = sqlx::query("SELECT * FROM objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    /// Newest object record generated for a piece of content
    pub async fn get_current_object(
        &self,
        actor_id: i64,
        context: &str,
        reference: &str,
    ) -> Result<Option<StoredObject>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM objects
            WHERE actor_id = ? AND context = ? AND reference = ?
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(actor_id)
        .bind(context)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    pub async fn count_objects(
        &self,
        actor_id: i64,
        context: &str,
        reference: &str,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM objects WHERE actor_id = ? AND context = ? AND reference = ?",
        )
        .bind(actor_id)
        .bind(context)
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Insert or overwrite an outbox record keyed by its id
    pub async fn upsert_outbox(&self, record: &OutboxRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR REPLACE INTO outbox (id, actor_id, document, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(record.id.as_str())
        .bind(record.actor_id)
        .bind(to_json(&record.document)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_outbox_record(&self, id: &str) -> Result<Option<OutboxRecord>, AppError> {
        let row = sqlx::query("SELECT * FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(outbox_from_row).transpose()
    }

    pub async fn count_outbox(&self, actor_id: i64) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Outbox page, newest first
    pub async fn list_outbox(
        &self,
        actor_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<OutboxRecord>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM outbox WHERE actor_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(actor_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outbox_from_row).collect()
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    /// Queue one activity for several inboxes; returns the rows written
    pub async fn enqueue_deliveries(
        &self,
        actor_id: i64,
        activity: &str,
        targets: &[DeliveryTarget],
        now: i64,
    ) -> Result<u64, AppError> {
        if targets.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for target in targets {
            written += sqlx::query(
                r#"
                INSERT INTO delivery_queue (
                    actor_id, follower_id, inbox, activity, retry_count, next_attempt_at, created_at
                ) VALUES (?, ?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(actor_id)
            .bind(target.follower_id)
            .bind(&target.inbox)
            .bind(activity)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        Ok(written)
    }

    /// Remove and return up to `limit` items that are due at `now`.
    ///
    /// Only rows this call actually deleted are returned, so two claimers
    /// racing on the same rows never both receive one. Callers serialize
    /// claims through the queue's exclusive section.
    pub async fn claim_due_deliveries(
        &self,
        now: i64,
        limit: u32,
    ) -> Result<Vec<QueueItem>, AppError> {
        let mut conn = self.pool.acquire().await?;

        let due = sqlx::query_as::<_, QueueItem>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM delivery_queue WHERE next_attempt_at <= ? ORDER BY next_attempt_at, id LIMIT ?"
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;

        if due.is_empty() {
            return Ok(due);
        }

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM delivery_queue WHERE id IN (");
        let mut ids = query.separated(", ");
        for item in &due {
            ids.push_bind(item.id);
        }
        ids.push_unseparated(") RETURNING id");

        let deleted: Vec<i64> = query
            .build_query_scalar::<i64>()
            .fetch_all(&mut *conn)
            .await?;

        Ok(due
            .into_iter()
            .filter(|item| deleted.contains(&item.id))
            .collect())
    }

    /// Put failed items back in one transaction.
    ///
    /// Items whose actor or follower has been deleted meanwhile, or whose
    /// inbox sits on a fediblocked domain, are skipped.
    /// Returns the number of rows restored.
    pub async fn requeue_deliveries(&self, items: &[QueueItem]) -> Result<u64, AppError> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let blocked_domains = sqlx::query_scalar::<_, String>("SELECT domain FROM fediblocks")
            .fetch_all(&mut *tx)
            .await?;

        let mut restored = 0;
        for item in items {
            if blocked_domains
                .iter()
                .any(|domain| inbox_on_domain(&item.inbox, domain))
            {
                continue;
            }
            restored += sqlx::query(
                r#"
                INSERT INTO delivery_queue (
                    actor_id, follower_id, inbox, activity, retry_count, next_attempt_at, created_at
                )
                SELECT ?, ?, ?, ?, ?, ?, ?
                WHERE EXISTS (SELECT 1 FROM actors WHERE id = ?)
                  AND (? IS NULL OR EXISTS (SELECT 1 FROM followers WHERE id = ?))
                "#,
            )
            .bind(item.actor_id)
            .bind(item.follower_id)
            .bind(&item.inbox)
            .bind(&item.activity)
            .bind(item.retry_count)
            .bind(item.next_attempt_at)
            .bind(item.created_at)
            .bind(item.actor_id)
            .bind(item.follower_id)
            .bind(item.follower_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        Ok(restored)
    }

    pub async fn list_queue_items(&self) -> Result<Vec<QueueItem>, AppError> {
        let items = sqlx::query_as::<_, QueueItem>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM delivery_queue ORDER BY next_attempt_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn count_queue_items(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delivery_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
