//! Film logs, the public activity stream and the connection feed.
//!
//! Each log is indexed per owner by watched date (`log_dates`), so one
//! owner's history can be walked newest first. The feed merges those walks
//! across peers itself instead of relying on a cross-owner query.

use crate::connections::ConnectionDb;
use crate::database::*;
use crate::error::{Error, Result};
use crate::identity::require_user;
use crate::model::*;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use log::{debug, info};
use sled::transaction::{ConflictableTransactionResult, Transactional};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Most peers read together in one merge pass.
pub const FEED_BATCH_SIZE: usize = 30;

/// Whether a log with `visibility` may be shown to a viewer.
pub fn is_visible(visibility: Visibility, is_owner: bool, is_connection: bool) -> bool {
    if is_owner {
        return true;
    }
    match visibility {
        Visibility::Public => true,
        Visibility::Followers => is_connection,
        Visibility::Private => false,
    }
}

fn log_date_key(owner: &str, watched_date: NaiveDate, log_id: &str) -> Vec<u8> {
    let mut key = prefix_of(owner.as_bytes());
    // shift so dates before the common era still sort below later ones
    let days = (watched_date.num_days_from_ce() as i64 - i32::MIN as i64) as u32;
    key.extend_from_slice(&days.to_be_bytes());
    key.extend_from_slice(log_id.as_bytes());
    key
}

fn activity_key(created_at: DateTime<Utc>, id: &str) -> Vec<u8> {
    let mut key = (created_at.timestamp_millis().max(0) as u64).to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// One owner's logs, newest watched date first, already filtered for the viewer.
struct OwnerLogs {
    owner: String,
    ids: Box<dyn Iterator<Item = sled::Result<sled::IVec>>>,
    is_owner: bool,
    is_connection: bool,
}

impl OwnerLogs {
    fn open(log_dates: &sled::Tree, owner: &str, is_owner: bool, is_connection: bool) -> OwnerLogs {
        OwnerLogs {
            owner: owner.to_owned(),
            ids: Box::new(log_dates.scan_prefix(prefix_of(owner.as_bytes())).values().rev()),
            is_owner,
            is_connection,
        }
    }

    fn next_visible(&mut self, logs: &sled::Tree) -> Result<Option<LogEntry>> {
        while let Some(id) = self.ids.next() {
            let id = id?;
            let entry: LogEntry = match logs.get(compound_key(&[self.owner.as_bytes(), &id[..]]))? {
                Some(bytes) => decode(bytes)?,
                None => continue,
            };
            if is_visible(entry.visibility, self.is_owner, self.is_connection) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

/// Head of one stream in the merge heap, ordered newest first.
struct Head {
    entry: LogEntry,
    stream: usize,
}

impl Head {
    fn rank(&self) -> (NaiveDate, DateTime<Utc>, Reverse<&str>, Reverse<usize>) {
        (
            self.entry.watched_date,
            self.entry.created_at,
            Reverse(self.entry.owner.as_str()),
            Reverse(self.stream),
        )
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// k-way merge of per-owner streams, keeping the newest `limit` entries.
fn merge_newest_first(
    logs: &sled::Tree,
    mut streams: Vec<OwnerLogs>,
    limit: usize,
) -> Result<Vec<LogEntry>> {
    let mut heap = BinaryHeap::new();
    for (stream, logs_of_owner) in streams.iter_mut().enumerate() {
        if let Some(entry) = logs_of_owner.next_visible(logs)? {
            heap.push(Head { entry, stream });
        }
    }
    let mut merged = Vec::new();
    while merged.len() < limit {
        let head = match heap.pop() {
            Some(head) => head,
            None => break,
        };
        if let Some(entry) = streams[head.stream].next_visible(logs)? {
            heap.push(Head {
                entry,
                stream: head.stream,
            });
        }
        merged.push(head.entry);
    }
    Ok(merged)
}

fn feed_order(a: &LogEntry, b: &LogEntry) -> Ordering {
    b.watched_date
        .cmp(&a.watched_date)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.owner.cmp(&b.owner))
}

pub trait ActivityDb {
    type Error;
    /// Stores a log, its date index entry and, for public logs, an activity.
    fn add_log(&self, log: NewLogEntry) -> std::result::Result<LogEntry, Self::Error>;
    fn record_activity(&self, activity: NewActivity) -> std::result::Result<Activity, Self::Error>;
    /// Every log of `owner`, unfiltered, in id order.
    fn all_logs(&self, owner: &str) -> std::result::Result<Vec<LogEntry>, Self::Error>;
    /// `owner`'s logs as `viewer` may see them, newest watched date first.
    fn user_logs(&self, viewer: &str, owner: &str)
        -> std::result::Result<Vec<LogEntry>, Self::Error>;
    fn connection_activity(
        &self,
        viewer: &str,
        peers: &[UserId],
        limit: usize,
    ) -> std::result::Result<Vec<FeedItem>, Self::Error>;
    fn recent_activities(&self, limit: usize) -> std::result::Result<Vec<Activity>, Self::Error>;
}

impl ActivityDb for sled::Db {
    type Error = Error;

    fn add_log(&self, log: NewLogEntry) -> Result<LogEntry> {
        let owner = require_user(self, &log.owner)?;
        let logs = self.open_tree(LOGS)?;
        let log_dates = self.open_tree(LOG_DATES)?;
        let activities = self.open_tree(ACTIVITIES)?;
        let created_at = Utc::now();
        let entry = LogEntry {
            id: next_id(self)?,
            owner: log.owner,
            movie: log.movie,
            watched_date: log.watched_date,
            rating: log.rating,
            review: log.review.filter(|text| !text.trim().is_empty()),
            tags: log.tags,
            visibility: log.visibility,
            rewatch: log.rewatch,
            created_at,
        };
        let activity = if entry.visibility == Visibility::Public {
            Some(Activity {
                id: next_id(self)?,
                owner: owner.uid.clone(),
                owner_name: owner.display_name.clone(),
                owner_photo: owner.photo.clone(),
                kind: if entry.review.is_some() {
                    ActivityKind::Review
                } else {
                    ActivityKind::Log
                },
                movie: entry.movie.to_ref(),
                rating: if entry.rating > 0.0 {
                    Some(entry.rating)
                } else {
                    None
                },
                review: entry.review.clone(),
                created_at,
            })
        } else {
            None
        };
        (&logs, &log_dates, &activities).transaction(
            |(logs, log_dates, activities)| -> ConflictableTransactionResult<(), Error> {
                logs.insert(
                    compound_key(&[entry.owner.as_bytes(), entry.id.as_bytes()]),
                    encode_tx(&entry)?,
                )?;
                log_dates.insert(
                    log_date_key(&entry.owner, entry.watched_date, &entry.id),
                    entry.id.as_bytes(),
                )?;
                if let Some(activity) = &activity {
                    activities.insert(
                        activity_key(activity.created_at, &activity.id),
                        encode_tx(activity)?,
                    )?;
                }
                Ok(())
            },
        )?;
        info!("{} logged {}", entry.owner, entry.movie.title);
        Ok(entry)
    }

    fn record_activity(&self, activity: NewActivity) -> Result<Activity> {
        let owner = require_user(self, &activity.owner)?;
        let activities = self.open_tree(ACTIVITIES)?;
        let activity = Activity {
            id: next_id(self)?,
            owner: owner.uid,
            owner_name: owner.display_name,
            owner_photo: owner.photo,
            kind: activity.kind,
            movie: activity.movie,
            rating: activity.rating,
            review: activity.review,
            created_at: Utc::now(),
        };
        activities.insert(
            activity_key(activity.created_at, &activity.id),
            encode(&activity)?,
        )?;
        debug!("{} recorded {:?} activity", activity.owner, activity.kind);
        Ok(activity)
    }

    fn all_logs(&self, owner: &str) -> Result<Vec<LogEntry>> {
        let logs = self.open_tree(LOGS)?;
        scan_values(&logs, &prefix_of(owner.as_bytes()))
    }

    fn user_logs(&self, viewer: &str, owner: &str) -> Result<Vec<LogEntry>> {
        let logs = self.open_tree(LOGS)?;
        let log_dates = self.open_tree(LOG_DATES)?;
        let is_owner = viewer == owner;
        let is_connection = !is_owner && self.is_connected(viewer, owner)?;
        let mut stream = OwnerLogs::open(&log_dates, owner, is_owner, is_connection);
        let mut entries = Vec::new();
        while let Some(entry) = stream.next_visible(&logs)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    fn connection_activity(
        &self,
        viewer: &str,
        peers: &[UserId],
        limit: usize,
    ) -> Result<Vec<FeedItem>> {
        let logs = self.open_tree(LOGS)?;
        let log_dates = self.open_tree(LOG_DATES)?;
        let mut entries = Vec::new();
        for batch in peers.chunks(FEED_BATCH_SIZE) {
            let mut streams = Vec::with_capacity(batch.len());
            for peer in batch {
                let is_owner = peer == viewer;
                let is_connection = !is_owner && self.is_connected(viewer, peer)?;
                streams.push(OwnerLogs::open(&log_dates, peer, is_owner, is_connection));
            }
            entries.extend(merge_newest_first(&logs, streams, limit)?);
        }
        // batches are each sorted; combine them
        entries.sort_by(feed_order);
        entries.truncate(limit);

        let mut feed = Vec::with_capacity(entries.len());
        for entry in entries {
            let owner = require_user(self, &entry.owner)?;
            feed.push(FeedItem {
                entry,
                owner_name: owner.display_name,
                owner_photo: owner.photo,
            });
        }
        debug!("feed for {} has {} items from {} peers", viewer, feed.len(), peers.len());
        Ok(feed)
    }

    fn recent_activities(&self, limit: usize) -> Result<Vec<Activity>> {
        let activities = self.open_tree(ACTIVITIES)?;
        activities
            .iter()
            .values()
            .rev()
            .take(limit)
            .map(|value| decode(value?))
            .collect()
    }
}

/// Feed of everyone `viewer` is connected with.
pub fn feed_for(db: &sled::Db, viewer: &str, limit: usize) -> Result<Vec<FeedItem>> {
    let peers = db.list_connections(viewer)?;
    db.connection_activity(viewer, &peers, limit)
}

#[cfg(test)]
pub(crate) fn test_movie(id: u64, title: &str) -> MovieSnapshot {
    MovieSnapshot {
        id,
        media_type: MediaType::Movie,
        title: title.to_owned(),
        year: Some(2000),
        poster: None,
        runtime: Some(120),
        genres: vec!["Drama".to_owned()],
        director: Some("Someone".to_owned()),
        countries: vec!["US".to_owned()],
    }
}
