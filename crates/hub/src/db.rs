use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use time::OffsetDateTime;
use tracing::warn;

use crate::error::ControlError;
use crate::phase::{format_timestamp, CultivationCycle, GrowthPhase};
use crate::ports::{Actuator, ConfigStore};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of `growboxes`, as loaded at startup.
#[derive(Debug, Clone)]
pub struct GrowboxRecord {
    pub sensor_name: String,
    pub phase: Option<GrowthPhase>,
    pub cycle: CultivationCycle,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/growbox/growbox.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every pooled connection to ":memory:" is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Grow boxes
    // ----------------------------

    /// Make sure a row exists for `sensor_name`; existing data is untouched.
    pub async fn register_box(&self, sensor_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO growboxes (sensor_name) VALUES (?)
            ON CONFLICT(sensor_name) DO NOTHING
            "#,
        )
        .bind(sensor_name)
        .execute(&self.pool)
        .await
        .context("register_box failed")?;
        Ok(())
    }

    pub async fn load_growboxes(&self) -> Result<Vec<GrowboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_name, growth_phase, cultivation_active,
                   cultivation_start, vegetative_start, flowering_start
            FROM growboxes
            ORDER BY sensor_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_growboxes failed")?;

        rows.iter()
            .map(|r| {
                Ok(GrowboxRecord {
                    sensor_name: r.try_get("sensor_name")?,
                    phase: phase_column(r)?,
                    cycle: cycle_columns(r)?,
                })
            })
            .collect()
    }

    pub async fn phase(&self, sensor_name: &str) -> Result<Option<GrowthPhase>> {
        let row = sqlx::query("SELECT growth_phase FROM growboxes WHERE sensor_name = ?")
            .bind(sensor_name)
            .fetch_optional(&self.pool)
            .await
            .context("get_phase failed")?;

        match row {
            Some(r) => phase_column(&r),
            None => Ok(None),
        }
    }

    pub async fn update_phase(
        &self,
        sensor_name: &str,
        phase: GrowthPhase,
        now: OffsetDateTime,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("set_phase: begin failed")?;

        sqlx::query(
            r#"
            INSERT INTO growboxes (sensor_name, growth_phase) VALUES (?, ?)
            ON CONFLICT(sensor_name) DO UPDATE SET growth_phase = excluded.growth_phase
            "#,
        )
        .bind(sensor_name)
        .bind(phase.as_str())
        .execute(&mut *tx)
        .await
        .context("set_phase failed")?;

        let stamp = match phase {
            GrowthPhase::Vegetative => Some(
                "UPDATE growboxes SET vegetative_start = COALESCE(vegetative_start, ?) \
                 WHERE sensor_name = ?",
            ),
            GrowthPhase::Flowering => Some(
                "UPDATE growboxes SET flowering_start = COALESCE(flowering_start, ?) \
                 WHERE sensor_name = ?",
            ),
            GrowthPhase::Seedling => None,
        };
        if let Some(sql) = stamp {
            sqlx::query(sql)
                .bind(format_timestamp(now))
                .bind(sensor_name)
                .execute(&mut *tx)
                .await
                .context("set_phase: stamping start date failed")?;
        }

        tx.commit().await.context("set_phase: commit failed")?;
        Ok(())
    }

    pub async fn cultivation(&self, sensor_name: &str) -> Result<CultivationCycle> {
        let row = sqlx::query(
            r#"
            SELECT cultivation_active, cultivation_start, vegetative_start, flowering_start
            FROM growboxes
            WHERE sensor_name = ?
            "#,
        )
        .bind(sensor_name)
        .fetch_optional(&self.pool)
        .await
        .context("get_cultivation failed")?;

        match row {
            Some(r) => cycle_columns(&r),
            None => Ok(CultivationCycle::default()),
        }
    }

    pub async fn begin_cultivation(&self, sensor_name: &str, now: OffsetDateTime) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO growboxes (
              sensor_name, growth_phase, cultivation_active,
              cultivation_start, vegetative_start, flowering_start
            ) VALUES (?, ?, 1, ?, NULL, NULL)
            ON CONFLICT(sensor_name) DO UPDATE SET
              growth_phase=excluded.growth_phase,
              cultivation_active=1,
              cultivation_start=excluded.cultivation_start,
              vegetative_start=NULL,
              flowering_start=NULL
            "#,
        )
        .bind(sensor_name)
        .bind(GrowthPhase::Seedling.as_str())
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await
        .context("start_cultivation failed")?;
        Ok(())
    }

    pub async fn clear_cultivation(&self, sensor_name: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("end_cultivation: begin failed")?;

        sqlx::query(
            r#"
            UPDATE growboxes SET
              growth_phase=NULL,
              cultivation_active=0,
              cultivation_start=NULL,
              vegetative_start=NULL,
              flowering_start=NULL
            WHERE sensor_name = ?
            "#,
        )
        .bind(sensor_name)
        .execute(&mut *tx)
        .await
        .context("end_cultivation failed")?;

        sqlx::query("DELETE FROM actuator_states WHERE sensor_name = ?")
            .bind(sensor_name)
            .execute(&mut *tx)
            .await
            .context("end_cultivation: clearing actuator states failed")?;

        tx.commit().await.context("end_cultivation: commit failed")?;
        Ok(())
    }

    // ----------------------------
    // Actuator states
    // ----------------------------

    pub async fn actuator_state(&self, sensor_name: &str, actuator: Actuator) -> Result<bool> {
        let row = sqlx::query(
            "SELECT state FROM actuator_states WHERE sensor_name = ? AND actuator = ?",
        )
        .bind(sensor_name)
        .bind(actuator.key())
        .fetch_optional(&self.pool)
        .await
        .context("get_actuator_state failed")?;

        Ok(match row {
            Some(r) => r.try_get("state")?,
            None => false,
        })
    }

    pub async fn load_actuator_states(&self, sensor_name: &str) -> Result<HashMap<Actuator, bool>> {
        let rows = sqlx::query("SELECT actuator, state FROM actuator_states WHERE sensor_name = ?")
            .bind(sensor_name)
            .fetch_all(&self.pool)
            .await
            .context("load_actuator_states failed")?;

        let mut states = HashMap::new();
        for r in rows {
            let key: String = r.try_get("actuator")?;
            match Actuator::from_key(&key) {
                Some(a) => {
                    states.insert(a, r.try_get("state")?);
                }
                None => warn!(sensor = %sensor_name, "ignoring unknown actuator '{key}'"),
            }
        }
        Ok(states)
    }

    pub async fn upsert_actuator_state(
        &self,
        sensor_name: &str,
        actuator: Actuator,
        value: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actuator_states (sensor_name, actuator, state, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(sensor_name, actuator) DO UPDATE SET
              state=excluded.state,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(sensor_name)
        .bind(actuator.key())
        .bind(value)
        .bind(format_timestamp(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await
        .context("set_actuator_state failed")?;
        Ok(())
    }

    // ----------------------------
    // Reading history
    // ----------------------------

    pub async fn insert_reading(
        &self,
        ts: i64,
        sensor_name: &str,
        avg_temp: Option<f64>,
        avg_hum: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (ts, sensor_name, avg_temp, avg_hum)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(sensor_name)
        .bind(avg_temp)
        .bind(avg_hum)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest reading for a box: `(ts, avg_temp, avg_hum)`.
    pub async fn latest_reading(
        &self,
        sensor_name: &str,
    ) -> Result<Option<(i64, Option<f64>, Option<f64>)>> {
        let row = sqlx::query(
            r#"
            SELECT ts, avg_temp, avg_hum
            FROM readings
            WHERE sensor_name = ?
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_name)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")?;

        row.map(|r| Ok((r.try_get("ts")?, r.try_get("avg_temp")?, r.try_get("avg_hum")?)))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Unknown phase text disables automation rather than failing the lookup.
fn phase_column(r: &SqliteRow) -> Result<Option<GrowthPhase>> {
    let raw: Option<String> = r.try_get("growth_phase")?;
    Ok(raw.and_then(|s| match s.parse() {
        Ok(p) => Some(p),
        Err(e) => {
            warn!("stored growth phase ignored: {e}");
            None
        }
    }))
}

fn cycle_columns(r: &SqliteRow) -> Result<CultivationCycle> {
    Ok(CultivationCycle {
        active: r.try_get("cultivation_active")?,
        cultivation_start: r.try_get("cultivation_start")?,
        vegetative_start: r.try_get("vegetative_start")?,
        flowering_start: r.try_get("flowering_start")?,
    })
}

// ---------------------------------------------------------------------------
// Config store port
// ---------------------------------------------------------------------------

#[async_trait]
impl ConfigStore for Db {
    async fn get_phase(&self, sensor_name: &str) -> Result<Option<GrowthPhase>, ControlError> {
        Ok(self.phase(sensor_name).await?)
    }

    async fn set_phase(
        &self,
        sensor_name: &str,
        phase: GrowthPhase,
        now: OffsetDateTime,
    ) -> Result<(), ControlError> {
        Ok(self.update_phase(sensor_name, phase, now).await?)
    }

    async fn get_cultivation(&self, sensor_name: &str) -> Result<CultivationCycle, ControlError> {
        Ok(self.cultivation(sensor_name).await?)
    }

    async fn start_cultivation(
        &self,
        sensor_name: &str,
        now: OffsetDateTime,
    ) -> Result<(), ControlError> {
        Ok(self.begin_cultivation(sensor_name, now).await?)
    }

    async fn end_cultivation(&self, sensor_name: &str) -> Result<(), ControlError> {
        Ok(self.clear_cultivation(sensor_name).await?)
    }

    async fn get_actuator_state(
        &self,
        sensor_name: &str,
        actuator: Actuator,
    ) -> Result<bool, ControlError> {
        Ok(self.actuator_state(sensor_name, actuator).await?)
    }

    async fn set_actuator_state(
        &self,
        sensor_name: &str,
        actuator: Actuator,
        value: bool,
    ) -> Result<(), ControlError> {
        Ok(self.upsert_actuator_state(sensor_name, actuator, value).await?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
