use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::warn;

use crate::calibration::SensorCalibration;
use crate::plants::{self, PlantThreshold, DEFAULT_PLANT};

/// JSON array of persisted soil readings.
pub const HISTORY_KEY: &str = "history";
/// Display name of the plant the thresholds are taken from.
pub const SELECTED_PLANT_KEY: &str = "selected_plant";
/// camelCase JSON `{wetValue, dryValue, name}`.
pub const CALIBRATION_KEY: &str = "sensor_calibration";

/// Durable key/value store. Values are opaque strings; callers own the
/// encoding.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/soil-monitor/soil-monitor.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Each connection to an in-memory database gets its own empty copy,
        // so pin the pool to one connection that never expires.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
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
    // Raw key/value access
    // ----------------------------

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get {key} failed"))
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("put {key} failed"))?;
        Ok(())
    }

    // ----------------------------
    // Settings
    // ----------------------------

    pub async fn load_selected_plant(&self) -> Result<String> {
        Ok(self
            .get(SELECTED_PLANT_KEY)
            .await?
            .unwrap_or_else(|| DEFAULT_PLANT.to_string()))
    }

    /// The stored plant profile. Names are matched the way [`plants::lookup`]
    /// matches them; anything else gets the default profile.
    pub async fn load_plant(&self) -> Result<&'static PlantThreshold> {
        let stored = self.load_selected_plant().await?;
        if plants::lookup(&stored).is_none() {
            warn!(stored = %stored, using = DEFAULT_PLANT, "stored plant unknown");
        }
        Ok(plants::find_by_name(&stored))
    }

    pub async fn save_selected_plant(&self, name: &str) -> Result<()> {
        self.put(SELECTED_PLANT_KEY, name).await
    }

    /// Falls back to the default profile when nothing is stored or the stored
    /// value no longer decodes.
    pub async fn load_calibration(&self) -> Result<SensorCalibration> {
        let Some(stored) = self.get(CALIBRATION_KEY).await? else {
            return Ok(SensorCalibration::default());
        };
        match serde_json::from_str(&stored) {
            Ok(c) => Ok(c),
            Err(e) => {
                warn!("stored calibration unreadable, using default: {e}");
                Ok(SensorCalibration::default())
            }
        }
    }

    pub async fn save_calibration(&self, calibration: &SensorCalibration) -> Result<()> {
        let json = serde_json::to_string(calibration).context("encode calibration")?;
        self.put(CALIBRATION_KEY, &json).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
