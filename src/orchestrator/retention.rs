use crate::orchestrator::backend::types::Snapshot;
use bon::Builder;
use chrono::{DateTime, Datelike, Timelike, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use validator::Validate;

/// Generational keep counts. An unset (or zero) field imposes nothing.
#[skip_serializing_none]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Validate, Serialize, Deserialize, Builder)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
}

/// Time partition used for generational buckets, evaluated in UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Granularity {
    Hourly,
    Daily,
    /// ISO-8601 week, so the last days of December may belong to week 1 of the next year
    Weekly,
    Monthly,
    Yearly,
}

type BucketKey = (i32, u32, u32, u32);

impl Granularity {
    /// Keys order the same way as the timestamps they come from.
    pub fn bucket_key(self, t: &DateTime<Utc>) -> BucketKey {
        match self {
            Granularity::Hourly => (t.year(), t.month(), t.day(), t.hour()),
            Granularity::Daily => (t.year(), t.month(), t.day(), 0),
            Granularity::Weekly => {
                let week = t.iso_week();
                (week.year(), week.week(), 0, 0)
            }
            Granularity::Monthly => (t.year(), t.month(), 0, 0),
            Granularity::Yearly => (t.year(), 0, 0, 0),
        }
    }
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.enabled_counts().is_empty()
    }

    /// Enabled generational dimensions with their bucket counts.
    pub fn generations(&self) -> Vec<(Granularity, usize)> {
        [
            (Granularity::Hourly, self.keep_hourly),
            (Granularity::Daily, self.keep_daily),
            (Granularity::Weekly, self.keep_weekly),
            (Granularity::Monthly, self.keep_monthly),
            (Granularity::Yearly, self.keep_yearly),
        ]
        .into_iter()
        .filter_map(|(g, count)| enabled(count).map(|c| (g, c)))
        .collect()
    }

    /// `(option name, count)` for every enabled field, `keep_last` first.
    pub fn enabled_counts(&self) -> Vec<(&'static str, u32)> {
        [
            ("keep_last", self.keep_last),
            ("keep_hourly", self.keep_hourly),
            ("keep_daily", self.keep_daily),
            ("keep_weekly", self.keep_weekly),
            ("keep_monthly", self.keep_monthly),
            ("keep_yearly", self.keep_yearly),
        ]
        .into_iter()
        .filter_map(|(name, count)| count.filter(|c| *c > 0).map(|c| (name, c)))
        .collect()
    }
}

fn enabled(count: Option<u32>) -> Option<usize> {
    count.filter(|c| *c > 0).map(|c| c as usize)
}

/// Snapshots surviving `policy`, in input order.
///
/// Membership is decided by id, so ids must be unique within `snapshots`.
/// An empty policy keeps nothing: never feed its complement to a deletion
/// without checking [`RetentionPolicy::is_empty`] first.
pub fn keep(snapshots: &[Snapshot], policy: &RetentionPolicy) -> Vec<Snapshot> {
    let keep_ids = keep_ids(snapshots, policy);
    snapshots
        .iter()
        .filter(|s| keep_ids.contains(s.id.as_str()))
        .cloned()
        .collect()
}

/// Complement of [`keep`], in input order.
pub fn to_delete(snapshots: &[Snapshot], policy: &RetentionPolicy) -> Vec<Snapshot> {
    let keep_ids = keep_ids(snapshots, policy);
    snapshots
        .iter()
        .filter(|s| !keep_ids.contains(s.id.as_str()))
        .cloned()
        .collect()
}

fn keep_ids<'a>(snapshots: &'a [Snapshot], policy: &RetentionPolicy) -> HashSet<&'a str> {
    // stable, so equal timestamps keep their input order
    let newest_first = snapshots
        .iter()
        .sorted_by(|a, b| b.timestamp.cmp(&a.timestamp))
        .collect_vec();

    let mut keep_ids = HashSet::new();
    if let Some(last) = enabled(policy.keep_last) {
        keep_ids.extend(newest_first.iter().copied().take(last).map(|s| s.id.as_str()));
    }

    for (granularity, count) in policy.generations() {
        // keys are monotonic over the sorted list, so each bucket is one contiguous run
        // and its first element is the newest snapshot in it
        let representatives = newest_first
            .iter()
            .copied()
            .dedup_by(|a, b| {
                granularity.bucket_key(&a.timestamp) == granularity.bucket_key(&b.timestamp)
            })
            .take(count);
        keep_ids.extend(representatives.map(|s| s.id.as_str()));
    }

    keep_ids
}
