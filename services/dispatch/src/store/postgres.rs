//! SQLx/Postgres [`DispatchStore`] implementation.
//!
//! Atomicity mapping for the composite operations:
//! - `admit_and_insert_order`: one transaction serialized per identity
//!   with `pg_advisory_xact_lock`, so concurrent bursts from the same
//!   requester or IP count each other.
//! - `create_assignment_locked`: one transaction holding
//!   `SELECT ... FOR UPDATE` on the order row across the whole
//!   read-check-write.
//! - `transition_assignment`: guarded
//!   `UPDATE ... WHERE version = $expected` — the database's atomic
//!   compare-and-increment.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rounds_id::{AssignmentId, OrderId, RoundId, SignupId, UserId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::capacity::{round_remaining, volunteer_remaining, CapacityPolicy};
use crate::domain::{
    Assignment, AssignmentStatus, CapacityConfig, Order, OrderEffect, OrderLine, OrderStatus,
    Round, RoundStatus, Signup, SignupRole, SignupStatus,
};
use crate::error::{CapacityDetail, DispatchError, DispatchResult, RateLimitDetail};
use crate::store::DispatchStore;

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/rounds".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/rounds".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a new pool.
    pub async fn connect(config: &DbConfig) -> DispatchResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> DispatchResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run pending migrations via runtime loading.
    ///
    /// In production migrations run as part of deployment; this path
    /// exists for dev mode.
    pub async fn run_migrations(&self) -> DispatchResult<()> {
        let candidates = [
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/dispatch/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        for dir in &candidates {
            if let Ok(migrator) = sqlx::migrate::Migrator::new(dir.clone()).await {
                info!(migrations_dir = %dir.display(), "Running database migrations");
                migrator
                    .run(&self.pool)
                    .await
                    .map_err(|e| DispatchError::Database(sqlx::Error::Migrate(Box::new(e))))?;
                return Ok(());
            }
        }

        Err(DispatchError::Validation(
            "no migrations directory found".to_string(),
        ))
    }
}

fn decode_err(
    column: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(source),
    }
}

fn get_id<T>(row: &PgRow, column: &str, parse: fn(&str) -> Result<T, rounds_id::IdError>) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    parse(&raw).map_err(|e| decode_err(column, e))
}

fn get_opt_id<T>(
    row: &PgRow,
    column: &str,
    parse: fn(&str) -> Result<T, rounds_id::IdError>,
) -> Result<Option<T>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| parse(&s).map_err(|e| decode_err(column, e)))
        .transpose()
}

impl<'r> sqlx::FromRow<'r, PgRow> for Order {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let lines: serde_json::Value = row.try_get("lines")?;
        let lines: Vec<OrderLine> =
            serde_json::from_value(lines).map_err(|e| decode_err("lines", e))?;
        Ok(Self {
            id: get_id(row, "order_id", OrderId::parse)?,
            requester_id: get_opt_id(row, "requester_id", UserId::parse)?,
            client_ip: row.try_get("client_ip")?,
            lines,
            address: row.try_get("address")?,
            status: OrderStatus::parse(&status).map_err(|e| decode_err("status", e))?,
            round_id: get_opt_id(row, "round_id", RoundId::parse)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Round {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: get_id(row, "round_id", RoundId::parse)?,
            title: row.try_get("title")?,
            starts_at: row.try_get("starts_at")?,
            ends_at: row.try_get("ends_at")?,
            location: row.try_get("location")?,
            max_participants: row.try_get("max_participants")?,
            status: RoundStatus::parse(&status).map_err(|e| decode_err("status", e))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Signup {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: get_id(row, "signup_id", SignupId::parse)?,
            round_id: get_id(row, "round_id", RoundId::parse)?,
            user_id: get_id(row, "user_id", UserId::parse)?,
            role: SignupRole::parse(&role).map_err(|e| decode_err("role", e))?,
            status: SignupStatus::parse(&status).map_err(|e| decode_err("status", e))?,
            lottery_number: row.try_get("lottery_number")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for CapacityConfig {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            round_id: get_id(row, "round_id", RoundId::parse)?,
            max_orders_per_volunteer: row.try_get("max_orders_per_volunteer")?,
            override_capacity: row.try_get("override_capacity")?,
            updated_by: get_opt_id(row, "updated_by", UserId::parse)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Assignment {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: get_id(row, "assignment_id", AssignmentId::parse)?,
            order_id: get_id(row, "order_id", OrderId::parse)?,
            volunteer_id: get_id(row, "volunteer_id", UserId::parse)?,
            round_id: get_id(row, "round_id", RoundId::parse)?,
            status: AssignmentStatus::parse(&status).map_err(|e| decode_err("status", e))?,
            version: row.try_get("version")?,
            accepted_at: row.try_get("accepted_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const RESERVING_STATUSES: &str = "('pending_accept', 'accepted', 'in_progress')";

#[async_trait]
impl DispatchStore for PgStore {
    async fn rate_limit_counts(
        &self,
        requester_id: Option<UserId>,
        client_ip: &str,
        window_start: DateTime<Utc>,
    ) -> DispatchResult<(i64, i64)> {
        let requester_count: i64 = match requester_id {
            Some(requester) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM rate_limit_records
                     WHERE requester_id = $1 AND created_at >= $2",
                )
                .bind(requester.to_string())
                .bind(window_start)
                .fetch_one(&self.pool)
                .await?
            }
            None => 0,
        };

        let ip_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limit_records
             WHERE client_ip = $1 AND created_at >= $2",
        )
        .bind(client_ip)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        Ok((requester_count, ip_count))
    }

    async fn admit_and_insert_order(
        &self,
        order: Order,
        window_start: DateTime<Utc>,
        ceiling: i64,
        window_secs: i64,
    ) -> DispatchResult<Order> {
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent admissions for the same identity so the
        // count below cannot miss an in-flight insert.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&order.client_ip)
            .execute(&mut *tx)
            .await?;
        if let Some(requester) = order.requester_id {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(requester.to_string())
                .execute(&mut *tx)
                .await?;

            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM rate_limit_records
                 WHERE requester_id = $1 AND created_at >= $2",
            )
            .bind(requester.to_string())
            .bind(window_start)
            .fetch_one(&mut *tx)
            .await?;
            if count >= ceiling {
                return Err(DispatchError::RateLimitExceeded(RateLimitDetail {
                    scope: "requester",
                    count,
                    ceiling,
                    window_secs,
                }));
            }
        }

        let ip_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limit_records
             WHERE client_ip = $1 AND created_at >= $2",
        )
        .bind(&order.client_ip)
        .bind(window_start)
        .fetch_one(&mut *tx)
        .await?;
        if ip_count >= ceiling {
            return Err(DispatchError::RateLimitExceeded(RateLimitDetail {
                scope: "ip",
                count: ip_count,
                ceiling,
                window_secs,
            }));
        }

        sqlx::query(
            "INSERT INTO rate_limit_records (requester_id, client_ip, created_at)
             VALUES ($1, $2, $3)",
        )
        .bind(order.requester_id.map(|id| id.to_string()))
        .bind(&order.client_ip)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await?;

        let lines = serde_json::to_value(&order.lines)
            .map_err(|e| DispatchError::Validation(format!("unserializable order lines: {e}")))?;
        sqlx::query(
            "INSERT INTO orders (order_id, requester_id, client_ip, lines, address,
                                 status, round_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(order.id.to_string())
        .bind(order.requester_id.map(|id| id.to_string()))
        .bind(&order.client_ip)
        .bind(lines)
        .bind(&order.address)
        .bind(order.status.as_str())
        .bind(order.round_id.map(|id| id.to_string()))
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(order)
    }

    async fn delete_rate_limit_records_before(
        &self,
        horizon: DateTime<Utc>,
    ) -> DispatchResult<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_records WHERE created_at < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn order(&self, id: OrderId) -> DispatchResult<Order> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::not_found("order", id))
    }

    async fn pending_orders(&self, limit: i64, offset: i64) -> DispatchResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders
             WHERE status = 'pending' AND round_id IS NULL
             ORDER BY created_at ASC, order_id ASC
             LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn insert_round(&self, round: Round) -> DispatchResult<Round> {
        sqlx::query(
            "INSERT INTO rounds (round_id, title, starts_at, ends_at, location,
                                 max_participants, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(round.id.to_string())
        .bind(&round.title)
        .bind(round.starts_at)
        .bind(round.ends_at)
        .bind(&round.location)
        .bind(round.max_participants)
        .bind(round.status.as_str())
        .bind(round.created_at)
        .bind(round.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(round)
    }

    async fn round(&self, id: RoundId) -> DispatchResult<Round> {
        sqlx::query_as::<_, Round>("SELECT * FROM rounds WHERE round_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::not_found("round", id))
    }

    async fn rounds_with_status(&self, status: RoundStatus) -> DispatchResult<Vec<Round>> {
        let rounds = sqlx::query_as::<_, Round>(
            "SELECT * FROM rounds WHERE status = $1 ORDER BY starts_at ASC, round_id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rounds)
    }

    async fn set_round_status(
        &self,
        id: RoundId,
        status: RoundStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let result =
            sqlx::query("UPDATE rounds SET status = $2, updated_at = $3 WHERE round_id = $1")
                .bind(id.to_string())
                .bind(status.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("round", id));
        }
        Ok(())
    }

    async fn capacity_config(&self, round_id: RoundId) -> DispatchResult<Option<CapacityConfig>> {
        let config = sqlx::query_as::<_, CapacityConfig>(
            "SELECT * FROM capacity_configs WHERE round_id = $1",
        )
        .bind(round_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }

    async fn upsert_capacity_config(&self, config: CapacityConfig) -> DispatchResult<()> {
        sqlx::query(
            "INSERT INTO capacity_configs (round_id, max_orders_per_volunteer,
                                           override_capacity, updated_by,
                                           created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (round_id) DO UPDATE SET
                 max_orders_per_volunteer = EXCLUDED.max_orders_per_volunteer,
                 override_capacity = EXCLUDED.override_capacity,
                 updated_by = EXCLUDED.updated_by,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(config.round_id.to_string())
        .bind(config.max_orders_per_volunteer)
        .bind(config.override_capacity)
        .bind(config.updated_by.map(|id| id.to_string()))
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_signup(
        &self,
        round_id: RoundId,
        user_id: UserId,
        role: SignupRole,
        now: DateTime<Utc>,
    ) -> DispatchResult<Signup> {
        let mut tx = self.pool.begin().await?;

        // Lock the round row to serialize lottery number assignment.
        let round: Option<Round> =
            sqlx::query_as("SELECT * FROM rounds WHERE round_id = $1 FOR UPDATE")
                .bind(round_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        if round.is_none() {
            return Err(DispatchError::not_found("round", round_id));
        }

        let duplicate: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM signups WHERE round_id = $1 AND user_id = $2)",
        )
        .bind(round_id.to_string())
        .bind(user_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if duplicate {
            return Err(DispatchError::conflict(format!(
                "user {user_id} already signed up for round {round_id}"
            )));
        }

        let lottery_number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(lottery_number), 0) + 1 FROM signups WHERE round_id = $1",
        )
        .bind(round_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let signup = Signup {
            id: SignupId::new(),
            round_id,
            user_id,
            role,
            status: SignupStatus::Pending,
            lottery_number,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO signups (signup_id, round_id, user_id, role, status,
                                  lottery_number, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(signup.id.to_string())
        .bind(signup.round_id.to_string())
        .bind(signup.user_id.to_string())
        .bind(signup.role.as_str())
        .bind(signup.status.as_str())
        .bind(signup.lottery_number)
        .bind(signup.created_at)
        .bind(signup.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(signup)
    }

    async fn signup(&self, id: SignupId) -> DispatchResult<Signup> {
        sqlx::query_as::<_, Signup>("SELECT * FROM signups WHERE signup_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::not_found("signup", id))
    }

    async fn round_signups(&self, round_id: RoundId) -> DispatchResult<Vec<Signup>> {
        let signups = sqlx::query_as::<_, Signup>(
            "SELECT * FROM signups WHERE round_id = $1 ORDER BY lottery_number ASC",
        )
        .bind(round_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(signups)
    }

    async fn count_confirmed_volunteers(&self, round_id: RoundId) -> DispatchResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM signups
             WHERE round_id = $1 AND role = 'volunteer' AND status = 'confirmed'",
        )
        .bind(round_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn apply_signup_statuses(
        &self,
        updates: &[(SignupId, SignupStatus)],
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut tx = self.pool.begin().await?;
        for (id, status) in updates {
            let result = sqlx::query(
                "UPDATE signups SET status = $2, updated_at = $3 WHERE signup_id = $1",
            )
            .bind(id.to_string())
            .bind(status.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(DispatchError::not_found("signup", *id));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn assignment(&self, id: AssignmentId) -> DispatchResult<Assignment> {
        sqlx::query_as::<_, Assignment>("SELECT * FROM assignments WHERE assignment_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::not_found("assignment", id))
    }

    async fn round_assignments(&self, round_id: RoundId) -> DispatchResult<Vec<Assignment>> {
        let assignments = sqlx::query_as::<_, Assignment>(
            "SELECT * FROM assignments WHERE round_id = $1 ORDER BY assignment_id ASC",
        )
        .bind(round_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(assignments)
    }

    async fn count_reserving_round_assignments(&self, round_id: RoundId) -> DispatchResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM assignments
             WHERE round_id = $1 AND status IN {RESERVING_STATUSES}"
        ))
        .bind(round_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_reserving_volunteer_assignments(
        &self,
        round_id: RoundId,
        volunteer_id: UserId,
    ) -> DispatchResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM assignments
             WHERE round_id = $1 AND volunteer_id = $2 AND status IN {RESERVING_STATUSES}"
        ))
        .bind(round_id.to_string())
        .bind(volunteer_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn reserving_counts_by_volunteer(
        &self,
        round_id: RoundId,
    ) -> DispatchResult<BTreeMap<UserId, i64>> {
        let rows = sqlx::query(&format!(
            "SELECT volunteer_id, COUNT(*) AS held FROM assignments
             WHERE round_id = $1 AND status IN {RESERVING_STATUSES}
             GROUP BY volunteer_id"
        ))
        .bind(round_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let volunteer = get_id(&row, "volunteer_id", UserId::parse)?;
            let held: i64 = row.try_get("held")?;
            counts.insert(volunteer, held);
        }
        Ok(counts)
    }

    async fn create_assignment_locked(
        &self,
        order_id: OrderId,
        volunteer_id: UserId,
        round_id: RoundId,
        policy: CapacityPolicy,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let mut tx = self.pool.begin().await?;

        // Exclusive lock on the order row for the whole read-check-write.
        let order: Option<Order> =
            sqlx::query_as("SELECT * FROM orders WHERE order_id = $1 FOR UPDATE")
                .bind(order_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let order = order.ok_or_else(|| DispatchError::not_found("order", order_id))?;
        if order.status != OrderStatus::Pending || order.round_id.is_some() {
            return Err(DispatchError::conflict(format!(
                "order {order_id} is not pending and unbound"
            )));
        }

        let round: Option<Round> = sqlx::query_as("SELECT * FROM rounds WHERE round_id = $1")
            .bind(round_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let round = round.ok_or_else(|| DispatchError::not_found("round", round_id))?;
        if round.status != RoundStatus::Scheduled {
            return Err(DispatchError::conflict(format!(
                "round {round_id} is not scheduled"
            )));
        }

        let has_active: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM assignments
                           WHERE order_id = $1 AND status <> 'cancelled')",
        )
        .bind(order_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if has_active {
            return Err(DispatchError::conflict(format!(
                "order {order_id} already has an active assignment"
            )));
        }

        let has_confirmed_signup: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM signups
                           WHERE round_id = $1 AND user_id = $2
                             AND role = 'volunteer' AND status = 'confirmed')",
        )
        .bind(round_id.to_string())
        .bind(volunteer_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if !has_confirmed_signup {
            return Err(DispatchError::Validation(format!(
                "volunteer {volunteer_id} has no confirmed signup for round {round_id}"
            )));
        }

        let confirmed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM signups
             WHERE round_id = $1 AND role = 'volunteer' AND status = 'confirmed'",
        )
        .bind(round_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        let round_reserving: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM assignments
             WHERE round_id = $1 AND status IN {RESERVING_STATUSES}"
        ))
        .bind(round_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if round_remaining(policy, confirmed, round_reserving) <= 0 {
            return Err(DispatchError::CapacityExceeded(CapacityDetail {
                round_id,
                volunteer_id: None,
                capacity: policy.round_capacity(confirmed),
                in_use: round_reserving,
            }));
        }

        let volunteer_reserving: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM assignments
             WHERE round_id = $1 AND volunteer_id = $2 AND status IN {RESERVING_STATUSES}"
        ))
        .bind(round_id.to_string())
        .bind(volunteer_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if volunteer_remaining(policy, volunteer_reserving) <= 0 {
            return Err(DispatchError::CapacityExceeded(CapacityDetail {
                round_id,
                volunteer_id: Some(volunteer_id),
                capacity: i64::from(policy.max_orders_per_volunteer),
                in_use: volunteer_reserving,
            }));
        }

        let assignment = Assignment::offered(order_id, volunteer_id, round_id, now);
        sqlx::query(
            "INSERT INTO assignments (assignment_id, order_id, volunteer_id, round_id,
                                      status, version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(assignment.id.to_string())
        .bind(assignment.order_id.to_string())
        .bind(assignment.volunteer_id.to_string())
        .bind(assignment.round_id.to_string())
        .bind(assignment.status.as_str())
        .bind(assignment.version)
        .bind(assignment.created_at)
        .bind(assignment.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE orders SET status = 'assigned', round_id = $2, updated_at = $3
             WHERE order_id = $1",
        )
        .bind(order_id.to_string())
        .bind(round_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(assignment)
    }

    async fn transition_assignment(
        &self,
        id: AssignmentId,
        expected_version: i64,
        expected_status: AssignmentStatus,
        target: AssignmentStatus,
        effect: OrderEffect,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let mut tx = self.pool.begin().await?;

        // Compare-and-increment: the update only lands when the stored
        // version AND status still equal what the caller observed when
        // it validated the transition.
        let updated: Option<Assignment> = sqlx::query_as(
            "UPDATE assignments
             SET status = $4,
                 version = version + 1,
                 accepted_at = CASE WHEN $4 = 'accepted' THEN $5 ELSE accepted_at END,
                 completed_at = CASE WHEN $4 = 'completed' THEN $5 ELSE completed_at END,
                 updated_at = $5
             WHERE assignment_id = $1 AND version = $2 AND status = $3
             RETURNING *",
        )
        .bind(id.to_string())
        .bind(expected_version)
        .bind(expected_status.as_str())
        .bind(target.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let updated = match updated {
            Some(assignment) => assignment,
            None => {
                let stored: Option<(i64, String)> = sqlx::query_as(
                    "SELECT version, status FROM assignments WHERE assignment_id = $1",
                )
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
                return match stored {
                    Some((version, status)) => Err(DispatchError::conflict(format!(
                        "stale read for assignment {id}: supplied version {expected_version} ({expected_status}), stored {version} ({status})"
                    ))),
                    None => Err(DispatchError::not_found("assignment", id)),
                };
            }
        };

        let order_update = match effect {
            OrderEffect::None => None,
            OrderEffect::Started => Some(
                "UPDATE orders SET status = 'in_progress', updated_at = $2 WHERE order_id = $1",
            ),
            OrderEffect::Completed => Some(
                "UPDATE orders SET status = 'completed', updated_at = $2 WHERE order_id = $1",
            ),
            OrderEffect::Requeued => Some(
                "UPDATE orders SET status = 'pending', round_id = NULL, updated_at = $2
                 WHERE order_id = $1 AND status <> 'completed'",
            ),
        };
        if let Some(sql) = order_update {
            sqlx::query(sql)
                .bind(updated.order_id.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
    }
}
