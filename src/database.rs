use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use std::path::Path;

pub(crate) const USERS: &[u8] = b"users";
pub(crate) const USERNAMES: &[u8] = b"usernames";
pub(crate) const CONNECTIONS: &[u8] = b"connections";
pub(crate) const USER_CONNECTIONS: &[u8] = b"user_connections";
pub(crate) const CONNECTION_REQUESTS: &[u8] = b"connection_requests";
pub(crate) const INCOMING_REQUESTS: &[u8] = b"incoming_requests";
pub(crate) const REVIEWS: &[u8] = b"reviews";
pub(crate) const COMMENTS: &[u8] = b"comments";
pub(crate) const REVIEW_COMMENTS: &[u8] = b"review_comments";
pub(crate) const LISTS: &[u8] = b"lists";
pub(crate) const USER_LISTS: &[u8] = b"user_lists";
pub(crate) const REVIEW_LIKES: &[u8] = b"review_likes";
pub(crate) const COMMENT_LIKES: &[u8] = b"comment_likes";
pub(crate) const LIST_LIKES: &[u8] = b"list_likes";
pub(crate) const LIST_SAVES: &[u8] = b"list_saves";
pub(crate) const SAVED_LISTS: &[u8] = b"saved_lists";
pub(crate) const LOGS: &[u8] = b"logs";
pub(crate) const LOG_DATES: &[u8] = b"log_dates";
pub(crate) const ACTIVITIES: &[u8] = b"activities";
pub(crate) const STATS_SNAPSHOTS: &[u8] = b"stats_snapshots";

const SEPARATOR: u8 = 0;

/// Opens the database at `path`, or a throwaway one when no path is given.
pub fn open(path: Option<&Path>) -> sled::Result<sled::Db> {
    match path {
        Some(path) => sled::Config::new().path(path).open(),
        None => sled::Config::new().temporary(true).open(),
    }
}

/// Fresh document id. Fixed width hex so byte order matches creation order.
pub(crate) fn next_id(db: &sled::Db) -> Result<String> {
    Ok(format!("{:016x}", db.generate_id()?))
}

pub(crate) fn compound_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEPARATOR);
        }
        key.extend_from_slice(part);
    }
    key
}

/// Prefix matching every compound key whose first part is `part`.
pub(crate) fn prefix_of(part: &[u8]) -> Vec<u8> {
    let mut prefix = part.to_vec();
    prefix.push(SEPARATOR);
    prefix
}

/// Last component of a compound key.
pub(crate) fn key_suffix(key: &[u8]) -> &[u8] {
    match key.iter().rposition(|b| *b == SEPARATOR) {
        Some(pos) => &key[pos + 1..],
        None => key,
    }
}

/// Id of the unordered pair `{a, b}`, identical for both argument orders.
///
/// `_` and `\` inside a uid are escaped with `\`, so the one unescaped `_`
/// always marks where the first uid ends.
pub fn pair_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}_{}", escape_uid(lo), escape_uid(hi))
}

fn escape_uid(uid: &str) -> String {
    let mut escaped = String::with_capacity(uid.len());
    for c in uid.chars() {
        if c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned, V: AsRef<[u8]>>(bytes: V) -> Result<T> {
    Ok(bincode::deserialize(bytes.as_ref())?)
}

pub(crate) fn encode_tx<T: Serialize>(value: &T) -> ConflictableTransactionResult<Vec<u8>, Error> {
    bincode::serialize(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

pub(crate) fn decode_tx<T: DeserializeOwned, V: AsRef<[u8]>>(
    bytes: V,
) -> ConflictableTransactionResult<T, Error> {
    bincode::deserialize(bytes.as_ref()).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

/// Decodes every value stored under `prefix`, in key order.
pub(crate) fn scan_values<T: DeserializeOwned>(tree: &sled::Tree, prefix: &[u8]) -> Result<Vec<T>> {
    tree.scan_prefix(prefix)
        .values()
        .map(|value| decode(value?))
        .collect()
}

#[cfg(test)]
pub(crate) fn temporary() -> sled::Db {
    open(None).unwrap()
}
