use crate::database::*;
use crate::error::Result;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Flat,
    /// Not present in the previous snapshot.
    New,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CounterDelta {
    pub name: String,
    pub current: u64,
    pub previous: Option<u64>,
    pub delta: i64,
    pub trend: Trend,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotDiff {
    pub captured_at: DateTime<Utc>,
    pub previous_captured_at: Option<DateTime<Utc>>,
    pub deltas: Vec<CounterDelta>,
}

/// Counts of every collection the admin page reports.
pub fn collect_counters(db: &sled::Db) -> Result<BTreeMap<String, u64>> {
    let mut counters = BTreeMap::new();
    let single = [
        ("users", USERS),
        ("logs", LOGS),
        ("reviews", REVIEWS),
        ("comments", COMMENTS),
        ("lists", LISTS),
        ("connections", CONNECTIONS),
        ("pending_requests", CONNECTION_REQUESTS),
        ("saves", LIST_SAVES),
        ("activities", ACTIVITIES),
    ];
    for (name, tree) in single.iter() {
        counters.insert(name.to_string(), db.open_tree(*tree)?.len() as u64);
    }
    let mut likes = 0;
    for tree in [REVIEW_LIKES, COMMENT_LIKES, LIST_LIKES].iter() {
        likes += db.open_tree(*tree)?.len() as u64;
    }
    counters.insert("likes".to_owned(), likes);
    Ok(counters)
}

fn diff(
    previous: Option<&StatsSnapshot>,
    current: &StatsSnapshot,
) -> SnapshotDiff {
    let deltas = current
        .counters
        .iter()
        .map(|(name, &value)| {
            let before = previous.and_then(|p| p.counters.get(name).copied());
            let delta = value as i64 - before.unwrap_or(0) as i64;
            let trend = match before {
                None => Trend::New,
                Some(_) if delta > 0 => Trend::Up,
                Some(_) if delta < 0 => Trend::Down,
                Some(_) => Trend::Flat,
            };
            CounterDelta {
                name: name.clone(),
                current: value,
                previous: before,
                delta,
                trend,
            }
        })
        .collect();
    SnapshotDiff {
        captured_at: current.captured_at,
        previous_captured_at: previous.map(|p| p.captured_at),
        deltas,
    }
}

/// Keeps exactly one previous snapshot per operator.
pub struct SnapshotStore<C: Clock> {
    snapshots: sled::Tree,
    clock: C,
}

impl<C: Clock> SnapshotStore<C> {
    pub fn open(db: &sled::Db, clock: C) -> sled::Result<Self> {
        Ok(SnapshotStore {
            snapshots: db.open_tree(STATS_SNAPSHOTS)?,
            clock,
        })
    }

    pub fn previous(&self, operator: &str) -> Result<Option<StatsSnapshot>> {
        self.snapshots.get(operator.as_bytes())?.map(decode).transpose()
    }

    /// Stores `counters` as the operator's snapshot and reports the change
    /// from the one it replaces.
    pub fn compare(&self, operator: &str, counters: BTreeMap<String, u64>) -> Result<SnapshotDiff> {
        let current = StatsSnapshot {
            captured_at: self.clock.now(),
            counters,
        };
        let previous: Option<StatsSnapshot> = self
            .snapshots
            .insert(operator.as_bytes(), encode(&current)?)?
            .map(decode)
            .transpose()?;
        debug!(
            "snapshot for {} replaces one from {:?}",
            operator,
            previous.as_ref().map(|p| p.captured_at)
        );
        Ok(diff(previous.as_ref(), &current))
    }
}
