use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use serde::Deserialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::{BusinessHours, Engine, EngineError};
use crate::model::Geometry;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid business hours: {0}")]
    Hours(EngineError),
    #[error("invalid UTC offset: {0} minutes")]
    Offset(i32),
    #[error("cannot read floor plan {path}: {source}")]
    FloorPlanIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed floor plan {path}: {source}")]
    FloorPlanJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime settings, read from `SEATLINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub hours: BusinessHours,
    /// Base of confirmation links: `<base_url>/confirm/<token>`.
    pub base_url: String,
    pub admin_emails: Vec<String>,
    pub admin_token: String,
    pub floor_plan: Option<PathBuf>,
    pub mail_webhook: Option<String>,
    pub notify_timeout: Duration,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub max_connections: usize,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not valid, using default");
            default
        }),
        None => default,
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let offset_minutes: i32 = parsed(&lookup, "SEATLINE_UTC_OFFSET_MINUTES", 0);
        let offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::Offset(offset_minutes))?;
        let hours = BusinessHours::new(
            parsed(&lookup, "SEATLINE_OPEN_HOUR", 10),
            parsed(&lookup, "SEATLINE_CLOSE_HOUR", 24),
            offset,
        )
        .map_err(ConfigError::Hours)?;

        let admin_emails = lookup("SEATLINE_ADMIN_EMAILS")
            .unwrap_or_default()
            .split(',')
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        Ok(Self {
            bind: non_empty(&lookup, "SEATLINE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "SEATLINE_PORT", 8080),
            data_dir: PathBuf::from(non_empty(&lookup, "SEATLINE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: non_empty(&lookup, "SEATLINE_METRICS_PORT").and_then(|p| p.parse().ok()),
            hours,
            base_url: non_empty(&lookup, "SEATLINE_BASE_URL").unwrap_or_else(|| "http://localhost:8080".into()),
            admin_emails,
            admin_token: non_empty(&lookup, "SEATLINE_ADMIN_TOKEN").unwrap_or_else(|| "seatline".into()),
            floor_plan: non_empty(&lookup, "SEATLINE_FLOOR_PLAN").map(PathBuf::from),
            mail_webhook: non_empty(&lookup, "SEATLINE_MAIL_WEBHOOK"),
            notify_timeout: Duration::from_millis(parsed(&lookup, "SEATLINE_NOTIFY_TIMEOUT_MS", 5000)),
            sweep_interval: Duration::from_secs(parsed::<u64>(&lookup, "SEATLINE_SWEEP_INTERVAL_SECS", 30).max(1)),
            compact_threshold: parsed(&lookup, "SEATLINE_COMPACT_THRESHOLD", 1000),
            max_connections: parsed::<usize>(&lookup, "SEATLINE_MAX_CONNECTIONS", 256).max(1),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

/// One table in a floor-plan file.
#[derive(Debug, Clone, Deserialize)]
pub struct FloorPlanTable {
    #[serde(default)]
    pub id: Option<Ulid>,
    pub label: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    pub capacity: u32,
}

pub fn load_floor_plan(path: &Path) -> Result<Vec<FloorPlanTable>, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FloorPlanIo {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::FloorPlanJson { path: display, source })
}

/// Create the floor plan's tables, skipping labels that already exist.
/// Returns how many tables were created.
pub async fn provision(engine: &Engine, plan: &[FloorPlanTable]) -> Result<usize, EngineError> {
    let mut existing: Vec<String> = engine
        .list_tables(0, crate::engine::ProjectionPolicy::Dashboard)
        .await
        .into_iter()
        .map(|t| t.table.label)
        .collect();

    let mut created = 0;
    for entry in plan {
        if existing.iter().any(|l| l == entry.label.trim()) {
            continue;
        }
        let geometry = Geometry {
            x: entry.x,
            y: entry.y,
            width: entry.width,
            height: entry.height,
        };
        let info = engine
            .create_table(entry.id.unwrap_or_else(Ulid::new), &entry.label, geometry, entry.capacity)
            .await?;
        existing.push(info.label);
        created += 1;
    }
    if created > 0 {
        info!(created, "floor plan provisioned");
    }
    Ok(created)
}
