use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;

/// What the identity provider hands us for the signed in user.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthUser {
    pub uid: UserId,
    pub display_name: String,
    pub photo: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub uid: UserId,
    pub display_name: String,
    /// Always lowercase. `None` until the user reserves one.
    pub username: Option<String>,
    pub photo: Option<String>,
    pub bio: String,
    pub is_public: bool,
    pub top_five: Vec<MovieRef>,
    pub created_at: DateTime<Utc>,
}

/// Merge update of a user profile, absent fields are left untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub photo: Option<String>,
    pub bio: Option<String>,
    pub is_public: Option<bool>,
    pub top_five: Option<Vec<MovieRef>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

/// Short reference to a catalog title, as embedded in lists and activities.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MovieRef {
    pub id: u64,
    pub media_type: MediaType,
    pub title: String,
    pub year: Option<i32>,
    pub poster: Option<String>,
}

/// Catalog metadata captured at the time a film was logged.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MovieSnapshot {
    pub id: u64,
    pub media_type: MediaType,
    pub title: String,
    pub year: Option<i32>,
    pub poster: Option<String>,
    /// Minutes.
    pub runtime: Option<u32>,
    pub genres: Vec<String>,
    pub director: Option<String>,
    pub countries: Vec<String>,
}

impl MovieSnapshot {
    pub fn to_ref(&self) -> MovieRef {
        MovieRef {
            id: self.id,
            media_type: self.media_type,
            title: self.title.clone(),
            year: self.year,
            poster: self.poster.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Followers,
    Public,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub owner: UserId,
    pub movie: MovieSnapshot,
    pub watched_date: NaiveDate,
    /// 0 means unrated.
    pub rating: f64,
    pub review: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub rewatch: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewLogEntry {
    pub owner: UserId,
    pub movie: MovieSnapshot,
    pub watched_date: NaiveDate,
    pub rating: f64,
    pub review: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub rewatch: bool,
}

/// A pending request. Accepting or rejecting it deletes the record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionRequest {
    pub id: String,
    pub from: UserId,
    pub to: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: String,
    pub users: (UserId, UserId),
    pub created_at: DateTime<Utc>,
}

/// Relationship between a viewer and a target, seen from the viewer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ConnectionStatus {
    None,
    Pending { request_id: String },
    Incoming { request_id: String },
    Accepted,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IncomingRequest {
    pub request: ConnectionRequest,
    pub requester: User,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Review,
    Comment,
    List,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LikeRecord {
    pub entity_id: String,
    pub kind: EntityKind,
    pub user: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Review {
    pub id: String,
    pub author: UserId,
    pub log_id: Option<String>,
    pub movie: MovieRef,
    pub rating: f64,
    pub text: String,
    pub like_count: u64,
    pub comment_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewReview {
    pub author: UserId,
    pub log_id: Option<String>,
    pub movie: MovieRef,
    pub rating: f64,
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: String,
    pub review_id: String,
    pub author: UserId,
    pub text: String,
    pub like_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewComment {
    pub review_id: String,
    pub author: UserId,
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct List {
    pub id: String,
    pub owner: UserId,
    pub name: String,
    pub description: String,
    pub movies: Vec<MovieRef>,
    pub like_count: u64,
    pub save_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewList {
    pub owner: UserId,
    pub name: String,
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Log,
    Review,
    Watchlist,
    Favorite,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Activity {
    pub id: String,
    pub owner: UserId,
    pub owner_name: String,
    pub owner_photo: Option<String>,
    pub kind: ActivityKind,
    pub movie: MovieRef,
    pub rating: Option<f64>,
    pub review: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewActivity {
    pub owner: UserId,
    pub kind: ActivityKind,
    pub movie: MovieRef,
    pub rating: Option<f64>,
    pub review: Option<String>,
}

/// A connection's log entry decorated with the owner's current profile.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub entry: LogEntry,
    pub owner_name: String,
    pub owner_photo: Option<String>,
}
