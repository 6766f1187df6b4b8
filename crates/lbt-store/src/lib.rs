//! Relational store for the bill tracker: trait seam, Postgres
//! implementation, and an in-memory implementation with the same
//! transactional semantics for tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lbt_core::{Bill, BillDelta, NewNotification, Notification, ProcedureStep, ReferenceItem, ReferenceKind};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "lbt-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate procedure step for bill {bill_id} sequence {sequence_number}")]
    DuplicateStep { bill_id: i64, sequence_number: i64 },
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Store seam used by the sync engine. Every mutating method is atomic:
/// `apply_reference_batch` and `apply_bill_delta` commit all-or-nothing so
/// a mid-batch failure never leaves partial state behind.
#[async_trait]
pub trait BillStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn reference_items(&self, kind: ReferenceKind) -> Result<Vec<ReferenceItem>, StoreError>;

    async fn reference_label(
        &self,
        kind: ReferenceKind,
        external_id: i64,
    ) -> Result<Option<String>, StoreError>;

    async fn apply_reference_batch(
        &self,
        kind: ReferenceKind,
        inserts: &[ReferenceItem],
        updates: &[ReferenceItem],
    ) -> Result<(), StoreError>;

    async fn get_bill(&self, external_id: i64) -> Result<Option<Bill>, StoreError>;

    async fn step_sequences(&self, bill_id: i64) -> Result<HashSet<i64>, StoreError>;

    async fn linked_topics(&self, bill_id: i64) -> Result<HashSet<i64>, StoreError>;

    async fn apply_bill_delta(&self, delta: &BillDelta) -> Result<(), StoreError>;

    /// User ids holding a favorite on the bill. Read-only: favorites are
    /// owned by the HTTP layer.
    async fn favorites_for(&self, bill_id: i64) -> Result<Vec<i64>, StoreError>;

    async fn insert_notifications(&self, batch: &[NewNotification]) -> Result<(), StoreError>;
}

/// Bounded readiness probe against the store. Exhausting the budget is the
/// only condition that should halt a sync process entirely.
pub async fn wait_for_store(
    store: &dyn BillStore,
    max_attempts: u32,
    delay: Duration,
) -> Result<(), StoreError> {
    for attempt in 1..=max_attempts {
        match store.ping().await {
            Ok(()) => {
                info!(attempt, "store connection established");
                return Ok(());
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "store not ready");
                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(StoreError::Unavailable(format!(
        "no connection after {max_attempts} attempts"
    )))
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Build a lazily-connecting pool; readiness is checked separately via
    /// [`wait_for_store`] so startup retry stays explicit.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bill_from_row(row: &sqlx::postgres::PgRow) -> Result<Bill, sqlx::Error> {
    Ok(Bill {
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        year_started: row.try_get("year_started")?,
        current_status_ref: row.try_get("current_status_ref")?,
        current_step_type_ref: row.try_get("current_step_type_ref")?,
        last_event_time: row.try_get("last_event_time")?,
        agency_code: row.try_get("agency_code")?,
        dispatch_text: row.try_get("dispatch_text")?,
    })
}

fn map_step_insert_error(err: sqlx::Error, step: &ProcedureStep) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return StoreError::DuplicateStep {
                bill_id: step.bill_id,
                sequence_number: step.sequence_number,
            };
        }
    }
    StoreError::Sqlx(err)
}

const UPSERT_BILL: &str = r#"
    INSERT INTO bills (external_id, title, description, year_started,
                       current_status_ref, current_step_type_ref,
                       last_event_time, agency_code, dispatch_text)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (external_id) DO UPDATE
       SET title = EXCLUDED.title,
           description = EXCLUDED.description,
           year_started = EXCLUDED.year_started,
           current_status_ref = EXCLUDED.current_status_ref,
           current_step_type_ref = EXCLUDED.current_step_type_ref,
           last_event_time = EXCLUDED.last_event_time,
           agency_code = EXCLUDED.agency_code,
           dispatch_text = EXCLUDED.dispatch_text
"#;

const UPSERT_REFERENCE: &str = r#"
    INSERT INTO reference_items (kind, external_id, label)
    VALUES ($1, $2, $3)
    ON CONFLICT (kind, external_id) DO UPDATE
       SET label = EXCLUDED.label
"#;

#[async_trait]
impl BillStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn reference_items(&self, kind: ReferenceKind) -> Result<Vec<ReferenceItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT external_id, label FROM reference_items WHERE kind = $1 ORDER BY external_id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ReferenceItem {
                external_id: row.try_get("external_id")?,
                label: row.try_get("label")?,
            });
        }
        Ok(out)
    }

    async fn reference_label(
        &self,
        kind: ReferenceKind,
        external_id: i64,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT label FROM reference_items WHERE kind = $1 AND external_id = $2",
        )
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("label")?)),
            None => Ok(None),
        }
    }

    async fn apply_reference_batch(
        &self,
        kind: ReferenceKind,
        inserts: &[ReferenceItem],
        updates: &[ReferenceItem],
    ) -> Result<(), StoreError> {
        if inserts.is_empty() && updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for item in inserts.iter().chain(updates) {
            sqlx::query(UPSERT_REFERENCE)
                .bind(kind.as_str())
                .bind(item.external_id)
                .bind(&item.label)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_bill(&self, external_id: i64) -> Result<Option<Bill>, StoreError> {
        let row = sqlx::query("SELECT * FROM bills WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(bill_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn step_sequences(&self, bill_id: i64) -> Result<HashSet<i64>, StoreError> {
        let rows = sqlx::query("SELECT sequence_number FROM procedure_steps WHERE bill_id = $1")
            .bind(bill_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("sequence_number")?);
        }
        Ok(out)
    }

    async fn linked_topics(&self, bill_id: i64) -> Result<HashSet<i64>, StoreError> {
        let rows = sqlx::query("SELECT topic_id FROM bill_topics WHERE bill_id = $1")
            .bind(bill_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("topic_id")?);
        }
        Ok(out)
    }

    async fn apply_bill_delta(&self, delta: &BillDelta) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let bill = &delta.bill;
        sqlx::query(UPSERT_BILL)
            .bind(bill.external_id)
            .bind(&bill.title)
            .bind(&bill.description)
            .bind(bill.year_started)
            .bind(bill.current_status_ref)
            .bind(bill.current_step_type_ref)
            .bind(bill.last_event_time)
            .bind(&bill.agency_code)
            .bind(&bill.dispatch_text)
            .execute(&mut *tx)
            .await?;

        for step in &delta.new_steps {
            sqlx::query(
                r#"
                INSERT INTO procedure_steps
                    (bill_id, sequence_number, event_time, status_ref, step_type_ref)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(step.bill_id)
            .bind(step.sequence_number)
            .bind(step.event_time)
            .bind(step.status_ref)
            .bind(step.step_type_ref)
            .execute(&mut *tx)
            .await
            .map_err(|err| map_step_insert_error(err, step))?;
        }

        for topic_id in &delta.new_topic_links {
            sqlx::query(
                "INSERT INTO bill_topics (bill_id, topic_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(bill.external_id)
            .bind(topic_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn favorites_for(&self, bill_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT user_id FROM favorites WHERE bill_id = $1 ORDER BY user_id")
            .bind(bill_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("user_id")?);
        }
        Ok(out)
    }

    async fn insert_notifications(&self, batch: &[NewNotification]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let created_at = Utc::now().naive_utc();
        let mut tx = self.pool.begin().await?;
        for item in batch {
            sqlx::query(
                r#"
                INSERT INTO notifications (user_id, bill_id, title, body, read_flag, created_at)
                VALUES ($1, $2, $3, $4, FALSE, $5)
                "#,
            )
            .bind(item.user_id)
            .bind(item.bill_id)
            .bind(&item.title)
            .bind(&item.body)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemState {
    reference: BTreeMap<(ReferenceKind, i64), String>,
    bills: BTreeMap<i64, Bill>,
    steps: BTreeMap<(i64, i64), ProcedureStep>,
    topics: BTreeSet<(i64, i64)>,
    favorites: BTreeSet<(i64, i64)>,
    notifications: Vec<Notification>,
    next_notification_id: i64,
}

/// Map-backed [`BillStore`] mirroring the Postgres semantics, including
/// all-or-nothing delta application and duplicate-step rejection. Used by
/// the sync-engine tests; no live database required.
#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().expect("mem store mutex poisoned")
    }

    pub fn add_favorite(&self, user_id: i64, bill_id: i64) {
        self.lock().favorites.insert((user_id, bill_id));
    }

    pub fn bill(&self, external_id: i64) -> Option<Bill> {
        self.lock().bills.get(&external_id).cloned()
    }

    pub fn bill_count(&self) -> usize {
        self.lock().bills.len()
    }

    pub fn steps_for(&self, bill_id: i64) -> Vec<ProcedureStep> {
        self.lock()
            .steps
            .range((bill_id, i64::MIN)..=(bill_id, i64::MAX))
            .map(|(_, step)| step.clone())
            .collect()
    }

    pub fn topics_for(&self, bill_id: i64) -> Vec<i64> {
        self.lock()
            .topics
            .iter()
            .filter(|(bill, _)| *bill == bill_id)
            .map(|(_, topic)| *topic)
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }
}

#[async_trait]
impl BillStore for MemStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn reference_items(&self, kind: ReferenceKind) -> Result<Vec<ReferenceItem>, StoreError> {
        Ok(self
            .lock()
            .reference
            .iter()
            .filter(|((item_kind, _), _)| *item_kind == kind)
            .map(|((_, external_id), label)| ReferenceItem {
                external_id: *external_id,
                label: label.clone(),
            })
            .collect())
    }

    async fn reference_label(
        &self,
        kind: ReferenceKind,
        external_id: i64,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.lock().reference.get(&(kind, external_id)).cloned())
    }

    async fn apply_reference_batch(
        &self,
        kind: ReferenceKind,
        inserts: &[ReferenceItem],
        updates: &[ReferenceItem],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        for item in inserts.iter().chain(updates) {
            state
                .reference
                .insert((kind, item.external_id), item.label.clone());
        }
        Ok(())
    }

    async fn get_bill(&self, external_id: i64) -> Result<Option<Bill>, StoreError> {
        Ok(self.lock().bills.get(&external_id).cloned())
    }

    async fn step_sequences(&self, bill_id: i64) -> Result<HashSet<i64>, StoreError> {
        Ok(self
            .lock()
            .steps
            .range((bill_id, i64::MIN)..=(bill_id, i64::MAX))
            .map(|((_, sequence), _)| *sequence)
            .collect())
    }

    async fn linked_topics(&self, bill_id: i64) -> Result<HashSet<i64>, StoreError> {
        Ok(self
            .lock()
            .topics
            .iter()
            .filter(|(bill, _)| *bill == bill_id)
            .map(|(_, topic)| *topic)
            .collect())
    }

    async fn apply_bill_delta(&self, delta: &BillDelta) -> Result<(), StoreError> {
        let mut state = self.lock();

        // Validate before mutating so a rejected delta leaves no trace.
        let mut incoming = BTreeSet::new();
        for step in &delta.new_steps {
            let key = (step.bill_id, step.sequence_number);
            if state.steps.contains_key(&key) || !incoming.insert(key) {
                return Err(StoreError::DuplicateStep {
                    bill_id: step.bill_id,
                    sequence_number: step.sequence_number,
                });
            }
        }

        state
            .bills
            .insert(delta.bill.external_id, delta.bill.clone());
        for step in &delta.new_steps {
            state
                .steps
                .insert((step.bill_id, step.sequence_number), step.clone());
        }
        for topic_id in &delta.new_topic_links {
            state.topics.insert((delta.bill.external_id, *topic_id));
        }
        Ok(())
    }

    async fn favorites_for(&self, bill_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .lock()
            .favorites
            .iter()
            .filter(|(_, bill)| *bill == bill_id)
            .map(|(user, _)| *user)
            .collect())
    }

    async fn insert_notifications(&self, batch: &[NewNotification]) -> Result<(), StoreError> {
        let created_at = Utc::now().naive_utc();
        let mut state = self.lock();
        for item in batch {
            state.next_notification_id += 1;
            let id = state.next_notification_id;
            state.notifications.push(Notification {
                id,
                user_id: item.user_id,
                bill_id: item.bill_id,
                title: item.title.clone(),
                body: item.body.clone(),
                read_flag: false,
                created_at,
            });
        }
        Ok(())
    }
}
