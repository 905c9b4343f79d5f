use crate::database::*;
use crate::error::{abort, Error};
use crate::model::*;
use crate::search::PeopleIndex;
use chrono::Utc;
use log::{debug, info};
use sled::transaction::{ConflictableTransactionResult, Transactional};
use sled::CompareAndSwapError;
use unic_ucd_category::GeneralCategory;

const USERNAME_MIN_CHARS: usize = 3;
const USERNAME_MAX_CHARS: usize = 30;

pub trait UserDb {
    type Error;
    /// Returns the stored user, creating it on the first sign-in.
    fn sign_in(&self, auth: &AuthUser) -> Result<User, Self::Error>;
    fn get_user(&self, uid: &str) -> Result<Option<User>, Self::Error>;
    fn update_profile(&self, uid: &str, update: ProfileUpdate) -> Result<User, Self::Error>;
    /// Claims `username` for `uid` and returns the normalized name.
    fn reserve_username(&self, uid: &str, username: &str) -> Result<String, Self::Error>;
    fn is_username_available(&self, username: &str) -> Result<bool, Self::Error>;
    fn resolve_user(&self, username: &str) -> Result<Option<User>, Self::Error>;
}

/// Lowercases and validates a username.
pub fn normalize_username(username: &str) -> Result<String, Error> {
    let name = username.trim().to_lowercase();
    let len = name.chars().count();
    if len < USERNAME_MIN_CHARS || len > USERNAME_MAX_CHARS {
        return Err(Error::InvalidUsername(format!(
            "must be {} to {} characters",
            USERNAME_MIN_CHARS, USERNAME_MAX_CHARS
        )));
    }
    if let Some(c) = name.chars().find(|c| !is_username_character(*c)) {
        return Err(Error::InvalidUsername(format!("character {:?} not allowed", c)));
    }
    Ok(name)
}

fn is_username_character(c: char) -> bool {
    let category = GeneralCategory::of(c);
    category.is_letter() || category.is_number() || c == '_' || c == '.'
}

impl UserDb for sled::Db {
    type Error = Error;

    fn sign_in(&self, auth: &AuthUser) -> Result<User, Error> {
        let users = self.open_tree(USERS)?;
        let user = User {
            uid: auth.uid.clone(),
            display_name: auth.display_name.clone(),
            username: None,
            photo: auth.photo.clone(),
            bio: String::new(),
            is_public: true,
            top_five: Vec::new(),
            created_at: Utc::now(),
        };
        match users.compare_and_swap(
            auth.uid.as_bytes(),
            None as Option<&[u8]>,
            Some(encode(&user)?),
        )? {
            Ok(()) => {
                info!("created user {}", user.uid);
                PeopleIndex::open(self)?.index_user(&user)?;
                Ok(user)
            }
            Err(CompareAndSwapError { current, .. }) => match current {
                Some(existing) => decode(existing),
                None => Err(Error::conflict(format!("user {} changed during sign in", auth.uid))),
            },
        }
    }

    fn get_user(&self, uid: &str) -> Result<Option<User>, Error> {
        let users = self.open_tree(USERS)?;
        users.get(uid.as_bytes())?.map(decode).transpose()
    }

    fn update_profile(&self, uid: &str, update: ProfileUpdate) -> Result<User, Error> {
        let users = self.open_tree(USERS)?;
        let user = users
            .transaction(|users| -> ConflictableTransactionResult<User, Error> {
                let mut user: User = match users.get(uid.as_bytes())? {
                    Some(bytes) => decode_tx(bytes)?,
                    None => return abort(Error::not_found(format!("user {}", uid))),
                };
                let update = update.clone();
                if let Some(display_name) = update.display_name {
                    user.display_name = display_name;
                }
                if let Some(photo) = update.photo {
                    user.photo = Some(photo);
                }
                if let Some(bio) = update.bio {
                    user.bio = bio;
                }
                if let Some(is_public) = update.is_public {
                    user.is_public = is_public;
                }
                if let Some(top_five) = update.top_five {
                    user.top_five = top_five.into_iter().take(5).collect();
                }
                users.insert(uid.as_bytes(), encode_tx(&user)?)?;
                Ok(user)
            })?;
        PeopleIndex::open(self)?.index_user(&user)?;
        Ok(user)
    }

    fn reserve_username(&self, uid: &str, username: &str) -> Result<String, Error> {
        let name = normalize_username(username)?;
        let users = self.open_tree(USERS)?;
        let usernames = self.open_tree(USERNAMES)?;
        let user = (&users, &usernames).transaction(
            |(users, usernames)| -> ConflictableTransactionResult<User, Error> {
                let mut user: User = match users.get(uid.as_bytes())? {
                    Some(bytes) => decode_tx(bytes)?,
                    None => return abort(Error::not_found(format!("user {}", uid))),
                };
                if let Some(owner) = usernames.get(name.as_bytes())? {
                    if owner.as_ref() != uid.as_bytes() {
                        return abort(Error::conflict(format!("username {} is taken", name)));
                    }
                }
                if let Some(old) = &user.username {
                    let still_ours = usernames
                        .get(old.as_bytes())?
                        .map_or(false, |owner| owner.as_ref() == uid.as_bytes());
                    if old != &name && still_ours {
                        usernames.remove(old.as_bytes())?;
                    }
                }
                usernames.insert(name.as_bytes(), uid.as_bytes())?;
                user.username = Some(name.clone());
                users.insert(uid.as_bytes(), encode_tx(&user)?)?;
                Ok(user)
            },
        )?;
        info!("user {} reserved username {}", uid, name);
        PeopleIndex::open(self)?.index_user(&user)?;
        Ok(name)
    }

    fn is_username_available(&self, username: &str) -> Result<bool, Error> {
        let name = normalize_username(username)?;
        let usernames = self.open_tree(USERNAMES)?;
        Ok(!usernames.contains_key(name.as_bytes())?)
    }

    fn resolve_user(&self, username: &str) -> Result<Option<User>, Error> {
        let name = username.trim().to_lowercase();
        let users = self.open_tree(USERS)?;
        for value in users.iter().values() {
            let user: User = decode(value?)?;
            if user.username.as_deref() == Some(name.as_str()) {
                return Ok(Some(user));
            }
        }
        debug!("no user with username {}", name);
        Ok(None)
    }
}

/// Loads a user that must exist.
pub(crate) fn require_user(db: &sled::Db, uid: &str) -> Result<User, Error> {
    db.get_user(uid)?
        .ok_or_else(|| Error::not_found(format!("user {}", uid)))
}

#[cfg(test)]
pub(crate) fn test_user(db: &sled::Db, uid: &str) -> User {
    db.sign_in(&AuthUser {
        uid: uid.to_owned(),
        display_name: uid.to_uppercase(),
        photo: Some(format!("https://img.example/{}.png", uid)),
    })
    .unwrap()
}
