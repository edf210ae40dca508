//! Value records returned by every adapter call.

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::cmp::Ordering;
use std::fmt::Display;
use std::time::Duration;

static NO_DIAGNOSTIC: &str = "tool failed without diagnostic output";

fn failure_message<D: Display>(message: D) -> String {
    let message = message.to_string();
    if message.trim().is_empty() {
        NO_DIAGNOSTIC.to_string()
    } else {
        message
    }
}

/// Outcome of a backup.
///
/// `success == false` always comes with a non-empty `error_message`, and a
/// successful result never carries one.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BackupResult {
    pub success: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub bytes_added: u64,
    pub bytes_processed: u64,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub snapshot_id: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl BackupResult {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
            ..Default::default()
        }
    }

    pub fn failure<D: Display>(duration: Duration, message: D) -> Self {
        Self {
            success: false,
            duration,
            error_message: Some(failure_message(message)),
            ..Default::default()
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub error_message: Option<String>,
}

impl CheckResult {
    pub fn failure<D: Display>(duration: Duration, message: D) -> Self {
        let message = failure_message(message);
        Self {
            success: false,
            errors: vec![message.clone()],
            warnings: Vec::new(),
            duration,
            error_message: Some(message),
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RestoreResult {
    pub success: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub bytes_restored: u64,
    pub files_restored: u64,
    pub error_message: Option<String>,
}

impl RestoreResult {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
            ..Default::default()
        }
    }

    pub fn failure<D: Display>(duration: Duration, message: D) -> Self {
        Self {
            success: false,
            duration,
            error_message: Some(failure_message(message)),
            ..Default::default()
        }
    }
}

/// A point-in-time capture held in a repository.
///
/// Ordered by timestamp, then id. The remaining fields only break ties so that
/// the order agrees with equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Builder)]
pub struct Snapshot {
    #[builder(into)]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    #[builder(default, into)]
    pub hostname: String,
    #[serde(default)]
    #[builder(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub tags: Vec<String>,
}

impl Ord for Snapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.hostname.cmp(&other.hostname))
            .then_with(|| self.paths.cmp(&other.paths))
            .then_with(|| self.tags.cmp(&other.tags))
    }
}

impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
