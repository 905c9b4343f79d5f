use crate::database::*;
use crate::error::{Error, Result};
use crate::identity::UserDb;
use crate::model::User;
use sled::transaction::{ConflictableTransactionResult, Transactional, TransactionalTree};
use std::collections::HashMap;
use unic_ucd_category::GeneralCategory;

const PEOPLE_FREQUENCY: &[u8] = b"people_frequency";
const PEOPLE_TOKENS: &[u8] = b"people_tokens";
const PEOPLE_DOCLEN: &[u8] = b"people_doclen";
const PEOPLE_DOCUMENTS: &[u8] = b"people_documents";

/// Doclen key holding the summed length of all documents.
const TOTAL_DOCLEN: &[u8] = b"";
/// Token that occurs exactly once in every document, so its count is the
/// number of indexed documents.
const DOCUMENT_TOKEN: &str = "";

const K1: f32 = 1.2;
const B: f32 = 0.75;

pub fn tokens_iter(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c| !is_token_character(c)).filter(|t| !t.is_empty())
}

pub fn is_token_character(c: char) -> bool {
    let category = GeneralCategory::of(c);
    category.is_number() || category.is_letter() || category == GeneralCategory::PrivateUse
}

fn token_counts(text: &str) -> (HashMap<String, u32>, u32) {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut total = 0u32;
    for token in tokens_iter(text) {
        *counts.entry(token.to_lowercase()).or_insert(0) += 1;
        total += 1;
    }
    counts.insert(DOCUMENT_TOKEN.to_owned(), 1);
    (counts, total)
}

fn frequency_key(token_id: u64, key: &[u8]) -> Vec<u8> {
    let mut frequency_key = token_id.to_be_bytes().to_vec();
    frequency_key.extend_from_slice(key);
    frequency_key
}

fn document_text(user: &User) -> String {
    match &user.username {
        Some(username) => format!("{} {}", user.display_name, username),
        None => user.display_name.clone(),
    }
}

pub struct PeopleIndex {
    frequency: sled::Tree,
    tokens: sled::Tree,
    doclen: sled::Tree,
    documents: sled::Tree,
}

impl PeopleIndex {
    pub fn open(db: &sled::Db) -> sled::Result<PeopleIndex> {
        Ok(PeopleIndex {
            frequency: db.open_tree(PEOPLE_FREQUENCY)?,
            tokens: db.open_tree(PEOPLE_TOKENS)?,
            doclen: db.open_tree(PEOPLE_DOCLEN)?,
            documents: db.open_tree(PEOPLE_DOCUMENTS)?,
        })
    }

    /// Indexes `user`, replacing whatever was indexed for it before.
    pub fn index_user(&self, user: &User) -> Result<()> {
        let key = user.uid.as_bytes();
        let text = document_text(user);
        (&self.frequency, &self.tokens, &self.doclen, &self.documents)
            .transaction(
                |(frequency, tokens, doclen, documents)| -> ConflictableTransactionResult<(), Error> {
                    if let Some(old) = documents.get(key)? {
                        if old.as_ref() == text.as_bytes() {
                            return Ok(());
                        }
                        let old_text = String::from_utf8_lossy(old.as_ref()).into_owned();
                        remove_document(frequency, tokens, doclen, key, &old_text)?;
                    }
                    add_document(frequency, tokens, doclen, key, &text)?;
                    documents.insert(key, text.as_bytes())?;
                    Ok(())
                },
            )?;
        Ok(())
    }

    /// BM25 scores of every document matching at least one token of `query`.
    pub fn query(&self, query: &str) -> Result<HashMap<sled::IVec, f32>> {
        let mut query_counts: HashMap<String, u32> = HashMap::new();
        for token in tokens_iter(query) {
            *query_counts.entry(token.to_lowercase()).or_insert(0) += 1;
        }

        let mut ret = HashMap::new();

        let num_documents = match self.tokens.get(DOCUMENT_TOKEN.as_bytes())? {
            Some(data) => decode::<(u32, u64), _>(data)?.0,
            None => 0,
        };
        if num_documents == 0 {
            return Ok(ret);
        }
        let total_dl: u32 = match self.doclen.get(TOTAL_DOCLEN)? {
            Some(dl) => decode(dl)?,
            None => 0,
        };
        let avgdl = total_dl as f32 / num_documents as f32;

        for (token, count) in query_counts {
            let (matching, id): (u32, u64) = match self.tokens.get(token.as_bytes())? {
                Some(data) => decode(data)?,
                None => continue,
            };
            let idf = ((num_documents as f32 - matching as f32 + 0.5)
                / (matching as f32 + 0.5)
                + 1.0)
                .ln();
            for entry in self.frequency.scan_prefix(id.to_be_bytes()) {
                let (id_and_key, frequency_data) = entry?;
                let frequency: u32 = decode(frequency_data)?;
                let key = sled::IVec::from(&id_and_key[8..]);
                let dl: u32 = match self.doclen.get(&key)? {
                    Some(dl) => decode(dl)?,
                    None => 0,
                };
                let bm25 = idf * frequency as f32 * (K1 + 1.0)
                    / (frequency as f32 + K1 * (1.0 - B + B * dl as f32 / avgdl));
                *ret.entry(key).or_insert(0.0) += bm25 * count as f32;
            }
        }

        Ok(ret)
    }
}

fn add_document(
    frequency: &TransactionalTree,
    tokens: &TransactionalTree,
    doclen: &TransactionalTree,
    key: &[u8],
    text: &str,
) -> ConflictableTransactionResult<(), Error> {
    let (counts, total) = token_counts(text);
    doclen.insert(key, encode_tx(&total)?)?;
    let old_total_dl: u32 = match doclen.get(TOTAL_DOCLEN)? {
        Some(dl) => decode_tx(dl)?,
        None => 0,
    };
    doclen.insert(TOTAL_DOCLEN, encode_tx(&(old_total_dl + total))?)?;
    for (token, count) in counts.iter() {
        let (old_count, id): (u32, u64) = match tokens.get(token.as_bytes())? {
            Some(old) => decode_tx(old)?,
            None => (0, tokens.generate_id()?),
        };
        frequency.insert(frequency_key(id, key), encode_tx(count)?)?;
        // number of documents containing the token, not occurrences
        tokens.insert(token.as_bytes(), encode_tx(&(old_count + 1, id))?)?;
    }
    Ok(())
}

fn remove_document(
    frequency: &TransactionalTree,
    tokens: &TransactionalTree,
    doclen: &TransactionalTree,
    key: &[u8],
    text: &str,
) -> ConflictableTransactionResult<(), Error> {
    let (counts, _) = token_counts(text);
    let total: u32 = match doclen.remove(key)? {
        Some(dl) => decode_tx(dl)?,
        None => return Ok(()),
    };
    let old_total_dl: u32 = match doclen.get(TOTAL_DOCLEN)? {
        Some(dl) => decode_tx(dl)?,
        None => 0,
    };
    doclen.insert(TOTAL_DOCLEN, encode_tx(&old_total_dl.saturating_sub(total))?)?;
    for token in counts.keys() {
        if let Some(old) = tokens.get(token.as_bytes())? {
            let (old_count, id): (u32, u64) = decode_tx(old)?;
            frequency.remove(frequency_key(id, key))?;
            tokens.insert(token.as_bytes(), encode_tx(&(old_count.saturating_sub(1), id))?)?;
        }
    }
    Ok(())
}

/// Users ranked by how well their name matches `query`, best first.
pub fn search_users(db: &sled::Db, query: &str, limit: usize) -> Result<Vec<User>> {
    let mut scored: Vec<(sled::IVec, f32)> = PeopleIndex::open(db)?.query(query)?.into_iter().collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    let mut users = Vec::new();
    for (key, _) in scored.into_iter().take(limit) {
        let uid = String::from_utf8_lossy(&key).into_owned();
        if let Some(user) = db.get_user(&uid)? {
            users.push(user);
        }
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_user;
    use crate::model::ProfileUpdate;

    #[test]
    fn ranks_exact_token_matches() {
        let db = temporary();
        test_user(&db, "alice");
        test_user(&db, "bob");
        db.reserve_username("bob", "bobcat").unwrap();
        let found = search_users(&db, "Alice", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid, "alice");
        let found = search_users(&db, "bobcat", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid, "bob");
    }

    #[test]
    fn repeated_name_ranks_first() {
        let db = temporary();
        for (uid, name, username) in &[("u1", "Bob", "bob"), ("u2", "Bob Smith", "bsmith")] {
            test_user(&db, uid);
            db.update_profile(
                uid,
                ProfileUpdate {
                    display_name: Some(name.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
            db.reserve_username(uid, username).unwrap();
        }
        let scores = PeopleIndex::open(&db).unwrap().query("bob").unwrap();
        assert!(scores.values().all(|score| *score > 0.0));
        let ranked: Vec<_> = search_users(&db, "bob", 10)
            .unwrap()
            .into_iter()
            .map(|user| user.uid)
            .collect();
        assert_eq!(ranked, vec!["u1", "u2"]);
    }

    #[test]
    fn reindexing_replaces_old_tokens() {
        let db = temporary();
        test_user(&db, "u1");
        db.reserve_username("u1", "nova").unwrap();
        assert_eq!(search_users(&db, "nova", 10).unwrap().len(), 1);
        db.reserve_username("u1", "vega").unwrap();
        assert!(search_users(&db, "nova", 10).unwrap().is_empty());
        assert_eq!(search_users(&db, "vega", 10).unwrap()[0].uid, "u1");
    }

    #[test]
    fn unchanged_profile_leaves_index_alone() {
        let db = temporary();
        let user = test_user(&db, "u1");
        let index = PeopleIndex::open(&db).unwrap();
        let cs = db.checksum().unwrap();
        index.index_user(&user).unwrap();
        assert_eq!(cs, db.checksum().unwrap());
    }

    #[test]
    fn empty_index_matches_nothing() {
        let db = temporary();
        assert!(search_users(&db, "anyone", 5).unwrap().is_empty());
    }
}
