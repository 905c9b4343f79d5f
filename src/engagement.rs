//! Likes, saves and comments, and the counters cached on their parents.
//!
//! A record and the counter it feeds are always written in the same sled
//! transaction. sled reruns a transaction that raced with another writer,
//! so `like_count` equals the number of like records once writers settle.

use crate::database::*;
use crate::error::{abort, Error};
use crate::identity::require_user;
use crate::model::*;
use chrono::Utc;
use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionResult, Transactional};

pub trait EngagementDb {
    type Error;
    fn add_review(&self, review: NewReview) -> Result<Review, Self::Error>;
    fn get_review(&self, id: &str) -> Result<Option<Review>, Self::Error>;
    fn add_list(&self, list: NewList) -> Result<List, Self::Error>;
    fn get_list(&self, id: &str) -> Result<Option<List>, Self::Error>;
    fn lists_of(&self, owner: &str) -> Result<Vec<List>, Self::Error>;
    fn append_to_list(&self, uid: &str, list_id: &str, movie: MovieRef)
        -> Result<List, Self::Error>;
    /// Likes or unlikes the entity and returns whether it is now liked.
    fn toggle_like(&self, uid: &str, entity_id: &str, kind: EntityKind)
        -> Result<bool, Self::Error>;
    fn is_liked(&self, uid: &str, entity_id: &str, kind: EntityKind) -> Result<bool, Self::Error>;
    /// Number of like records, the value `like_count` must agree with.
    fn like_count_of(&self, entity_id: &str, kind: EntityKind) -> Result<usize, Self::Error>;
    /// Saves or unsaves `owner`'s list and returns whether it is now saved.
    fn toggle_save(&self, uid: &str, owner: &str, list_id: &str) -> Result<bool, Self::Error>;
    fn saved_lists(&self, uid: &str) -> Result<Vec<List>, Self::Error>;
    fn add_comment(&self, comment: NewComment) -> Result<Comment, Self::Error>;
    fn get_comment(&self, id: &str) -> Result<Option<Comment>, Self::Error>;
    fn delete_comment(&self, uid: &str, comment_id: &str) -> Result<(), Self::Error>;
    fn comments_for(&self, review_id: &str) -> Result<Vec<Comment>, Self::Error>;
}

/// Records carrying a cached like counter.
trait Likeable: Serialize + DeserializeOwned {
    fn like_count_mut(&mut self) -> &mut u64;
}

impl Likeable for Review {
    fn like_count_mut(&mut self) -> &mut u64 {
        &mut self.like_count
    }
}

impl Likeable for Comment {
    fn like_count_mut(&mut self) -> &mut u64 {
        &mut self.like_count
    }
}

impl Likeable for List {
    fn like_count_mut(&mut self) -> &mut u64 {
        &mut self.like_count
    }
}

fn entity_tree(kind: EntityKind) -> &'static [u8] {
    match kind {
        EntityKind::Review => REVIEWS,
        EntityKind::Comment => COMMENTS,
        EntityKind::List => LISTS,
    }
}

fn likes_tree(kind: EntityKind) -> &'static [u8] {
    match kind {
        EntityKind::Review => REVIEW_LIKES,
        EntityKind::Comment => COMMENT_LIKES,
        EntityKind::List => LIST_LIKES,
    }
}

fn bump(counter: &mut u64, up: bool) {
    if up {
        *counter += 1;
    } else {
        *counter = counter.saturating_sub(1);
    }
}

fn toggle_like_on<T: Likeable>(
    db: &sled::Db,
    uid: &str,
    entity_id: &str,
    kind: EntityKind,
) -> Result<bool, Error> {
    let entities = db.open_tree(entity_tree(kind))?;
    let likes = db.open_tree(likes_tree(kind))?;
    let key = compound_key(&[entity_id.as_bytes(), uid.as_bytes()]);
    let record = LikeRecord {
        entity_id: entity_id.to_owned(),
        kind,
        user: uid.to_owned(),
        created_at: Utc::now(),
    };
    let liked = (&entities, &likes).transaction(
        |(entities, likes)| -> ConflictableTransactionResult<bool, Error> {
            let mut entity: T = match entities.get(entity_id.as_bytes())? {
                Some(bytes) => decode_tx(bytes)?,
                None => return abort(Error::not_found(format!("{:?} {}", kind, entity_id))),
            };
            let liked = if likes.remove(key.as_slice())?.is_some() {
                false
            } else {
                likes.insert(key.as_slice(), encode_tx(&record)?)?;
                true
            };
            bump(entity.like_count_mut(), liked);
            entities.insert(entity_id.as_bytes(), encode_tx(&entity)?)?;
            Ok(liked)
        },
    )?;
    debug!("{} liked={} {:?} {}", uid, liked, kind, entity_id);
    Ok(liked)
}

fn get_record<T: DeserializeOwned>(db: &sled::Db, tree: &[u8], id: &str) -> Result<Option<T>, Error> {
    db.open_tree(tree)?.get(id.as_bytes())?.map(decode).transpose()
}

impl EngagementDb for sled::Db {
    type Error = Error;

    fn add_review(&self, review: NewReview) -> Result<Review, Error> {
        require_user(self, &review.author)?;
        let reviews = self.open_tree(REVIEWS)?;
        let review = Review {
            id: next_id(self)?,
            author: review.author,
            log_id: review.log_id,
            movie: review.movie,
            rating: review.rating,
            text: review.text,
            like_count: 0,
            comment_count: 0,
            created_at: Utc::now(),
        };
        reviews.insert(review.id.as_bytes(), encode(&review)?)?;
        Ok(review)
    }

    fn get_review(&self, id: &str) -> Result<Option<Review>, Error> {
        get_record(self, REVIEWS, id)
    }

    fn add_list(&self, list: NewList) -> Result<List, Error> {
        require_user(self, &list.owner)?;
        let lists = self.open_tree(LISTS)?;
        let user_lists = self.open_tree(USER_LISTS)?;
        let list = List {
            id: next_id(self)?,
            owner: list.owner,
            name: list.name,
            description: list.description,
            movies: Vec::new(),
            like_count: 0,
            save_count: 0,
            created_at: Utc::now(),
        };
        (&lists, &user_lists).transaction(
            |(lists, user_lists)| -> ConflictableTransactionResult<(), Error> {
                lists.insert(list.id.as_bytes(), encode_tx(&list)?)?;
                user_lists.insert(
                    compound_key(&[list.owner.as_bytes(), list.id.as_bytes()]),
                    list.id.as_bytes(),
                )?;
                Ok(())
            },
        )?;
        info!("{} created list {}", list.owner, list.id);
        Ok(list)
    }

    fn get_list(&self, id: &str) -> Result<Option<List>, Error> {
        get_record(self, LISTS, id)
    }

    fn lists_of(&self, owner: &str) -> Result<Vec<List>, Error> {
        let user_lists = self.open_tree(USER_LISTS)?;
        let mut lists = Vec::new();
        for id in user_lists.scan_prefix(prefix_of(owner.as_bytes())).values() {
            if let Some(list) = self.get_list(&String::from_utf8_lossy(&id?))? {
                lists.push(list);
            }
        }
        Ok(lists)
    }

    fn append_to_list(&self, uid: &str, list_id: &str, movie: MovieRef) -> Result<List, Error> {
        let lists = self.open_tree(LISTS)?;
        let list = lists.transaction(|lists| -> ConflictableTransactionResult<List, Error> {
            let mut list: List = match lists.get(list_id.as_bytes())? {
                Some(bytes) => decode_tx(bytes)?,
                None => return abort(Error::not_found(format!("list {}", list_id))),
            };
            if list.owner != uid {
                return abort(Error::PermissionDenied(format!(
                    "list {} belongs to {}",
                    list_id, list.owner
                )));
            }
            let present = list
                .movies
                .iter()
                .any(|m| m.id == movie.id && m.media_type == movie.media_type);
            if !present {
                list.movies.push(movie.clone());
                lists.insert(list_id.as_bytes(), encode_tx(&list)?)?;
            }
            Ok(list)
        })?;
        Ok(list)
    }

    fn toggle_like(&self, uid: &str, entity_id: &str, kind: EntityKind) -> Result<bool, Error> {
        match kind {
            EntityKind::Review => toggle_like_on::<Review>(self, uid, entity_id, kind),
            EntityKind::Comment => toggle_like_on::<Comment>(self, uid, entity_id, kind),
            EntityKind::List => toggle_like_on::<List>(self, uid, entity_id, kind),
        }
    }

    fn is_liked(&self, uid: &str, entity_id: &str, kind: EntityKind) -> Result<bool, Error> {
        let likes = self.open_tree(likes_tree(kind))?;
        Ok(likes.contains_key(compound_key(&[entity_id.as_bytes(), uid.as_bytes()]))?)
    }

    fn like_count_of(&self, entity_id: &str, kind: EntityKind) -> Result<usize, Error> {
        let likes = self.open_tree(likes_tree(kind))?;
        let mut count = 0;
        for key in likes.scan_prefix(prefix_of(entity_id.as_bytes())).keys() {
            key?;
            count += 1;
        }
        Ok(count)
    }

    fn toggle_save(&self, uid: &str, owner: &str, list_id: &str) -> Result<bool, Error> {
        let lists = self.open_tree(LISTS)?;
        let saves = self.open_tree(LIST_SAVES)?;
        let saved_lists = self.open_tree(SAVED_LISTS)?;
        let save_key = compound_key(&[list_id.as_bytes(), uid.as_bytes()]);
        let saved_key = compound_key(&[uid.as_bytes(), list_id.as_bytes()]);
        let saved_at = encode(&Utc::now())?;
        let saved = (&lists, &saves, &saved_lists).transaction(
            |(lists, saves, saved_lists)| -> ConflictableTransactionResult<bool, Error> {
                let mut list: List = match lists.get(list_id.as_bytes())? {
                    Some(bytes) => decode_tx(bytes)?,
                    None => return abort(Error::not_found(format!("list {}", list_id))),
                };
                if list.owner != owner {
                    return abort(Error::not_found(format!("list {} of {}", list_id, owner)));
                }
                let saved = if saves.remove(save_key.as_slice())?.is_some() {
                    saved_lists.remove(saved_key.as_slice())?;
                    false
                } else {
                    saves.insert(save_key.as_slice(), saved_at.clone())?;
                    saved_lists.insert(saved_key.as_slice(), list_id.as_bytes())?;
                    true
                };
                bump(&mut list.save_count, saved);
                lists.insert(list_id.as_bytes(), encode_tx(&list)?)?;
                Ok(saved)
            },
        )?;
        debug!("{} saved={} list {}", uid, saved, list_id);
        Ok(saved)
    }

    fn saved_lists(&self, uid: &str) -> Result<Vec<List>, Error> {
        let saved_lists = self.open_tree(SAVED_LISTS)?;
        let mut lists = Vec::new();
        for key in saved_lists.scan_prefix(prefix_of(uid.as_bytes())).keys() {
            let key = key?;
            let list_id = String::from_utf8_lossy(key_suffix(&key)).into_owned();
            if let Some(list) = self.get_list(&list_id)? {
                lists.push(list);
            }
        }
        Ok(lists)
    }

    fn add_comment(&self, comment: NewComment) -> Result<Comment, Error> {
        let reviews = self.open_tree(REVIEWS)?;
        let comments = self.open_tree(COMMENTS)?;
        let review_comments = self.open_tree(REVIEW_COMMENTS)?;
        let comment = Comment {
            id: next_id(self)?,
            review_id: comment.review_id,
            author: comment.author,
            text: comment.text,
            like_count: 0,
            created_at: Utc::now(),
        };
        (&reviews, &comments, &review_comments).transaction(
            |(reviews, comments, review_comments)| -> ConflictableTransactionResult<(), Error> {
                let mut review: Review = match reviews.get(comment.review_id.as_bytes())? {
                    Some(bytes) => decode_tx(bytes)?,
                    None => {
                        return abort(Error::not_found(format!("review {}", comment.review_id)))
                    }
                };
                comments.insert(comment.id.as_bytes(), encode_tx(&comment)?)?;
                review_comments.insert(
                    compound_key(&[comment.review_id.as_bytes(), comment.id.as_bytes()]),
                    comment.id.as_bytes(),
                )?;
                bump(&mut review.comment_count, true);
                reviews.insert(comment.review_id.as_bytes(), encode_tx(&review)?)?;
                Ok(())
            },
        )?;
        debug!("{} commented on review {}", comment.author, comment.review_id);
        Ok(comment)
    }

    fn get_comment(&self, id: &str) -> Result<Option<Comment>, Error> {
        get_record(self, COMMENTS, id)
    }

    fn delete_comment(&self, uid: &str, comment_id: &str) -> Result<(), Error> {
        let reviews = self.open_tree(REVIEWS)?;
        let comments = self.open_tree(COMMENTS)?;
        let review_comments = self.open_tree(REVIEW_COMMENTS)?;
        (&reviews, &comments, &review_comments).transaction(
            |(reviews, comments, review_comments)| -> ConflictableTransactionResult<(), Error> {
                let comment: Comment = match comments.get(comment_id.as_bytes())? {
                    Some(bytes) => decode_tx(bytes)?,
                    None => return abort(Error::not_found(format!("comment {}", comment_id))),
                };
                if comment.author != uid {
                    return abort(Error::PermissionDenied(format!(
                        "comment {} was written by {}",
                        comment_id, comment.author
                    )));
                }
                comments.remove(comment_id.as_bytes())?;
                review_comments.remove(compound_key(&[
                    comment.review_id.as_bytes(),
                    comment_id.as_bytes(),
                ]))?;
                if let Some(bytes) = reviews.get(comment.review_id.as_bytes())? {
                    let mut review: Review = decode_tx(bytes)?;
                    bump(&mut review.comment_count, false);
                    reviews.insert(comment.review_id.as_bytes(), encode_tx(&review)?)?;
                }
                Ok(())
            },
        )?;
        // likes of a deleted comment are unreachable, drop them
        let likes = self.open_tree(COMMENT_LIKES)?;
        for key in likes.scan_prefix(prefix_of(comment_id.as_bytes())).keys() {
            likes.remove(key?)?;
        }
        debug!("{} deleted comment {}", uid, comment_id);
        Ok(())
    }

    fn comments_for(&self, review_id: &str) -> Result<Vec<Comment>, Error> {
        let review_comments = self.open_tree(REVIEW_COMMENTS)?;
        let mut comments = Vec::new();
        for id in review_comments.scan_prefix(prefix_of(review_id.as_bytes())).values() {
            let id = id?;
            if let Some(comment) = self.get_comment(&String::from_utf8_lossy(&id))? {
                comments.push(comment);
            }
        }
        Ok(comments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_user;
    use std::thread;

    fn movie() -> MovieRef {
        MovieRef {
            id: 680,
            media_type: MediaType::Movie,
            title: "Pulp Fiction".to_owned(),
            year: Some(1994),
            poster: None,
        }
    }

    fn review(db: &sled::Db, author: &str) -> Review {
        db.add_review(NewReview {
            author: author.to_owned(),
            log_id: None,
            movie: movie(),
            rating: 4.5,
            text: "Royale with cheese".to_owned(),
        })
        .unwrap()
    }

    #[test]
    fn like_round_trip_restores_state() {
        let db = temporary();
        test_user(&db, "alice");
        let review = review(&db, "alice");

        assert!(db.toggle_like("bob", &review.id, EntityKind::Review).unwrap());
        assert!(db.is_liked("bob", &review.id, EntityKind::Review).unwrap());
        assert_eq!(db.get_review(&review.id).unwrap().unwrap().like_count, 1);

        assert!(!db.toggle_like("bob", &review.id, EntityKind::Review).unwrap());
        assert!(!db.is_liked("bob", &review.id, EntityKind::Review).unwrap());
        assert_eq!(db.get_review(&review.id).unwrap().unwrap(), review);
        assert_eq!(db.like_count_of(&review.id, EntityKind::Review).unwrap(), 0);
    }

    #[test]
    fn liking_missing_entity_fails_cleanly() {
        let db = temporary();
        match db.toggle_like("bob", "nope", EntityKind::Comment) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected not found, got {:?}", other),
        }
        assert_eq!(db.like_count_of("nope", EntityKind::Comment).unwrap(), 0);
    }

    #[test]
    fn concurrent_likes_keep_counter_in_sync() {
        let db = temporary();
        test_user(&db, "alice");
        let review = review(&db, "alice");
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let db = db.clone();
                let id = review.id.clone();
                thread::spawn(move || {
                    let uid = format!("fan{}", i);
                    // odd fans change their mind
                    let toggles = if i % 2 == 0 { 1 } else { 2 };
                    for _ in 0..toggles {
                        db.toggle_like(&uid, &id, EntityKind::Review).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stored = db.get_review(&review.id).unwrap().unwrap();
        let records = db.like_count_of(&review.id, EntityKind::Review).unwrap();
        assert_eq!(records, 8);
        assert_eq!(stored.like_count, records as u64);
    }

    #[test]
    fn concurrent_saves_keep_counter_in_sync() {
        let db = temporary();
        test_user(&db, "alice");
        let list = db
            .add_list(NewList {
                owner: "alice".to_owned(),
                name: "Noir".to_owned(),
                description: String::new(),
            })
            .unwrap();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let db = db.clone();
                let id = list.id.clone();
                thread::spawn(move || {
                    let uid = format!("fan{}", i);
                    let toggles = if i % 2 == 0 { 1 } else { 2 };
                    for _ in 0..toggles {
                        db.toggle_save(&uid, "alice", &id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stored = db.get_list(&list.id).unwrap().unwrap();
        let records = db.open_tree(LIST_SAVES).unwrap().len();
        assert_eq!(records, 8);
        assert_eq!(stored.save_count, records as u64);
        assert_eq!(db.open_tree(SAVED_LISTS).unwrap().len(), 8);
    }

    #[test]
    fn concurrent_comments_keep_counter_in_sync() {
        let db = temporary();
        test_user(&db, "alice");
        let review = review(&db, "alice");
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let db = db.clone();
                let id = review.id.clone();
                thread::spawn(move || {
                    db.add_comment(NewComment {
                        review_id: id,
                        author: format!("fan{}", i),
                        text: "first".to_owned(),
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stored = db.get_review(&review.id).unwrap().unwrap();
        let comments = db.comments_for(&review.id).unwrap();
        assert_eq!(comments.len(), 16);
        assert_eq!(stored.comment_count, comments.len() as u64);
    }

    #[test]
    fn saves_track_the_list() {
        let db = temporary();
        test_user(&db, "alice");
        let list = db
            .add_list(NewList {
                owner: "alice".to_owned(),
                name: "Tarantino".to_owned(),
                description: String::new(),
            })
            .unwrap();
        assert!(db.toggle_save("bob", "alice", &list.id).unwrap());
        assert_eq!(db.get_list(&list.id).unwrap().unwrap().save_count, 1);
        assert_eq!(db.saved_lists("bob").unwrap()[0].id, list.id);
        assert!(db.toggle_save("bob", "carol", &list.id).is_err());

        assert!(!db.toggle_save("bob", "alice", &list.id).unwrap());
        assert_eq!(db.get_list(&list.id).unwrap().unwrap().save_count, 0);
        assert!(db.saved_lists("bob").unwrap().is_empty());
    }

    #[test]
    fn lists_append_without_duplicates() {
        let db = temporary();
        test_user(&db, "alice");
        let list = db
            .add_list(NewList {
                owner: "alice".to_owned(),
                name: "Faves".to_owned(),
                description: String::new(),
            })
            .unwrap();
        db.append_to_list("alice", &list.id, movie()).unwrap();
        let list = db.append_to_list("alice", &list.id, movie()).unwrap();
        assert_eq!(list.movies.len(), 1);
        assert_eq!(db.lists_of("alice").unwrap(), vec![list.clone()]);
        assert!(db.lists_of("bob").unwrap().is_empty());
        match db.append_to_list("bob", &list.id, movie()) {
            Err(Error::PermissionDenied(_)) => {}
            other => panic!("expected permission denied, got {:?}", other),
        }
        assert!(db.toggle_like("bob", &list.id, EntityKind::List).unwrap());
        assert_eq!(db.get_list(&list.id).unwrap().unwrap().like_count, 1);
    }

    #[test]
    fn comments_count_on_review() {
        let db = temporary();
        test_user(&db, "alice");
        let review = review(&db, "alice");
        let first = db
            .add_comment(NewComment {
                review_id: review.id.clone(),
                author: "bob".to_owned(),
                text: "agreed".to_owned(),
            })
            .unwrap();
        db.add_comment(NewComment {
            review_id: review.id.clone(),
            author: "carol".to_owned(),
            text: "overrated".to_owned(),
        })
        .unwrap();
        assert_eq!(db.get_review(&review.id).unwrap().unwrap().comment_count, 2);
        assert_eq!(db.comments_for(&review.id).unwrap().len(), 2);

        db.toggle_like("alice", &first.id, EntityKind::Comment).unwrap();
        assert_eq!(db.get_comment(&first.id).unwrap().unwrap().like_count, 1);

        assert!(db.delete_comment("carol", &first.id).is_err());
        db.delete_comment("bob", &first.id).unwrap();
        assert_eq!(db.get_review(&review.id).unwrap().unwrap().comment_count, 1);
        assert_eq!(db.comments_for(&review.id).unwrap().len(), 1);
        assert_eq!(db.like_count_of(&first.id, EntityKind::Comment).unwrap(), 0);
    }

    #[test]
    fn comment_on_missing_review_writes_nothing() {
        let db = temporary();
        assert!(db
            .add_comment(NewComment {
                review_id: "nope".to_owned(),
                author: "bob".to_owned(),
                text: "hello".to_owned(),
            })
            .is_err());
        assert_eq!(db.open_tree(COMMENTS).unwrap().len(), 0);
    }
}
