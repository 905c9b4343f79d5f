use actix_identity::{CookieIdentityPolicy, Identity, IdentityService};
use actix_web::{error, middleware::Logger, web, App, HttpResponse, HttpServer};
use chrono::{NaiveDate, Utc};
use log::{debug, info, warn};
use reelgraph::activity::feed_for;
use reelgraph::config::Config;
use reelgraph::connections::connected_users;
use reelgraph::model::*;
use reelgraph::search::search_users;
use reelgraph::snapshot::{collect_counters, SnapshotStore, SystemClock};
use reelgraph::stats::{compute_stats, compute_streak, Stats};
use reelgraph::{ActivityDb, ConnectionDb, EngagementDb, Error, Result, UserDb};
use serde::{Deserialize, Serialize};

type Db = web::Data<sled::Db>;
type Settings = web::Data<Config>;

const SEARCH_LIMIT: usize = 20;

fn log_error<E: std::fmt::Debug>(err: E, message: &'static str) -> error::Error {
    debug!("{:?}", err);
    error::ErrorInternalServerError(message)
}

/// Write failures go back to the client so it can tell the user.
fn write_error(err: Error) -> error::Error {
    match err {
        Error::NotFound(what) => error::ErrorNotFound(what),
        Error::Conflict(what) => error::ErrorConflict(what),
        Error::PermissionDenied(what) => error::ErrorForbidden(what),
        Error::InvalidUsername(what) => error::ErrorBadRequest(what),
        err @ Error::Storage(_) | err @ Error::Codec(_) => log_error(err, "Database error"),
    }
}

/// Read failures render as an empty state.
fn or_empty<T: Default>(result: Result<T>, what: &str) -> T {
    result.unwrap_or_else(|err| {
        warn!("{} failed, showing nothing: {}", what, err);
        T::default()
    })
}

fn signed_in(id: &Identity) -> actix_web::Result<String> {
    id.identity()
        .ok_or_else(|| error::ErrorUnauthorized("Sign in first"))
}

fn today() -> NaiveDate {
    Utc::now().naive_utc().date()
}

#[derive(Deserialize)]
struct Page {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
}

#[derive(Deserialize)]
struct UsernameParams {
    username: String,
}

#[derive(Deserialize)]
struct AcceptParams {
    from: String,
}

#[derive(Deserialize)]
struct LikeParams {
    entity_id: String,
    kind: EntityKind,
}

#[derive(Deserialize)]
struct LogParams {
    movie: MovieSnapshot,
    watched_date: NaiveDate,
    #[serde(default)]
    rating: f64,
    review: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    visibility: Visibility,
    #[serde(default)]
    rewatch: bool,
}

#[derive(Deserialize)]
struct ReviewParams {
    log_id: Option<String>,
    movie: MovieRef,
    rating: f64,
    text: String,
}

#[derive(Deserialize)]
struct CommentParams {
    text: String,
}

#[derive(Deserialize)]
struct ListParams {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Serialize)]
struct Toggled {
    active: bool,
}

#[derive(Serialize)]
struct Availability {
    available: bool,
}

#[derive(Serialize)]
struct ProfileStats {
    stats: Stats,
    streak: u32,
}

/// Trusts the posted uid. This route stands in for the identity provider
/// and must only be reachable through it.
async fn sign_in(
    params: web::Json<AuthUser>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let user = db.sign_in(&params).map_err(write_error)?;
    id.remember(user.uid.clone());
    Ok(HttpResponse::Ok().json(user))
}

async fn logout(id: Identity) -> actix_web::Result<HttpResponse> {
    id.forget();
    Ok(HttpResponse::NoContent().finish())
}

async fn me(id: Identity, db: Db) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    match db.get_user(&uid).map_err(write_error)? {
        Some(user) => Ok(HttpResponse::Ok().json(user)),
        None => Err(error::ErrorUnauthorized("Unknown user")),
    }
}

async fn update_profile(
    params: web::Json<ProfileUpdate>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let user = db
        .update_profile(&uid, params.into_inner())
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(user))
}

async fn reserve_username(
    params: web::Json<UsernameParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let username = db
        .reserve_username(&uid, &params.username)
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(username))
}

async fn username_available(name: web::Path<String>, db: Db) -> HttpResponse {
    let available = or_empty(db.is_username_available(&name), "username lookup");
    HttpResponse::Ok().json(Availability { available })
}

async fn resolve_user(name: web::Path<String>, db: Db) -> HttpResponse {
    match or_empty(db.resolve_user(&name), "user lookup") {
        Some(user) => HttpResponse::Ok().json(user),
        None => HttpResponse::NotFound().finish(),
    }
}

async fn search(params: web::Query<SearchParams>, db: Db) -> HttpResponse {
    let users = or_empty(search_users(&db, &params.q, SEARCH_LIMIT), "people search");
    HttpResponse::Ok().json(users)
}

async fn connection_status(
    target: web::Path<String>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let status = db
        .connection_status(&uid, &target)
        .unwrap_or_else(|err| {
            warn!("connection status failed: {}", err);
            ConnectionStatus::None
        });
    Ok(HttpResponse::Ok().json(status))
}

async fn connect(
    target: web::Path<String>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let status = db.send_request(&uid, &target).map_err(write_error)?;
    Ok(HttpResponse::Ok().json(status))
}

async fn cancel_request(
    target: web::Path<String>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    db.cancel_request(&uid, &target).map_err(write_error)?;
    Ok(HttpResponse::NoContent().finish())
}

async fn disconnect(
    peer: web::Path<String>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    db.remove_connection(&uid, &peer).map_err(write_error)?;
    Ok(HttpResponse::NoContent().finish())
}

async fn incoming_requests(id: Identity, db: Db) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let requests = or_empty(db.list_incoming(&uid), "incoming requests");
    Ok(HttpResponse::Ok().json(requests))
}

async fn accept_request(
    request_id: web::Path<String>,
    params: web::Json<AcceptParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let connection = db
        .accept_request(&request_id, &params.from, &uid)
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(connection))
}

async fn reject_request(
    request_id: web::Path<String>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let addressed = db
        .list_incoming(&uid)
        .map_err(write_error)?
        .iter()
        .any(|incoming| incoming.request.id == *request_id);
    if !addressed {
        return Err(error::ErrorNotFound("No such request"));
    }
    db.reject_request(&request_id).map_err(write_error)?;
    Ok(HttpResponse::NoContent().finish())
}

async fn connections(id: Identity, db: Db) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let users = or_empty(connected_users(&db, &uid), "connections");
    Ok(HttpResponse::Ok().json(users))
}

async fn feed(
    page: web::Query<Page>,
    id: Identity,
    db: Db,
    settings: Settings,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let limit = page.limit.unwrap_or(settings.feed_limit);
    let items = or_empty(feed_for(&db, &uid, limit), "feed");
    Ok(HttpResponse::Ok().json(items))
}

async fn recent_activities(page: web::Query<Page>, db: Db, settings: Settings) -> HttpResponse {
    let limit = page.limit.unwrap_or(settings.feed_limit);
    let activities = or_empty(db.recent_activities(limit), "recent activities");
    HttpResponse::Ok().json(activities)
}

async fn add_log(
    params: web::Json<LogParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let params = params.into_inner();
    let entry = db
        .add_log(NewLogEntry {
            owner: uid,
            movie: params.movie,
            watched_date: params.watched_date,
            rating: params.rating,
            review: params.review,
            tags: params.tags,
            visibility: params.visibility,
            rewatch: params.rewatch,
        })
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(entry))
}

async fn user_logs(owner: web::Path<String>, id: Identity, db: Db) -> HttpResponse {
    let viewer = id.identity().unwrap_or_default();
    let logs = or_empty(db.user_logs(&viewer, &owner), "user logs");
    HttpResponse::Ok().json(logs)
}

async fn user_stats(owner: web::Path<String>, id: Identity, db: Db) -> HttpResponse {
    let viewer = id.identity().unwrap_or_default();
    let logs = or_empty(db.user_logs(&viewer, &owner), "user logs");
    let lists = or_empty(db.lists_of(&owner), "user lists");
    let today = today();
    HttpResponse::Ok().json(ProfileStats {
        stats: compute_stats(&logs, lists.len(), today),
        streak: compute_streak(&logs, today),
    })
}

async fn add_review(
    params: web::Json<ReviewParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let params = params.into_inner();
    let review = db
        .add_review(NewReview {
            author: uid,
            log_id: params.log_id,
            movie: params.movie,
            rating: params.rating,
            text: params.text,
        })
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(review))
}

async fn add_comment(
    review_id: web::Path<String>,
    params: web::Json<CommentParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let comment = db
        .add_comment(NewComment {
            review_id: review_id.into_inner(),
            author: uid,
            text: params.into_inner().text,
        })
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(comment))
}

async fn comments(review_id: web::Path<String>, db: Db) -> HttpResponse {
    let comments = or_empty(db.comments_for(&review_id), "comments");
    HttpResponse::Ok().json(comments)
}

async fn delete_comment(
    comment_id: web::Path<String>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    db.delete_comment(&uid, &comment_id).map_err(write_error)?;
    Ok(HttpResponse::NoContent().finish())
}

async fn toggle_like(
    params: web::Json<LikeParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let active = db
        .toggle_like(&uid, &params.entity_id, params.kind)
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(Toggled { active }))
}

async fn add_list(
    params: web::Json<ListParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let params = params.into_inner();
    let list = db
        .add_list(NewList {
            owner: uid,
            name: params.name,
            description: params.description,
        })
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(list))
}

async fn append_to_list(
    list_id: web::Path<String>,
    movie: web::Json<MovieRef>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let list = db
        .append_to_list(&uid, &list_id, movie.into_inner())
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(list))
}

async fn toggle_save(
    path: web::Path<(String, String)>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let (owner, list_id) = path.into_inner();
    let active = db
        .toggle_save(&uid, &owner, &list_id)
        .map_err(write_error)?;
    Ok(HttpResponse::Ok().json(Toggled { active }))
}

async fn saved_lists(id: Identity, db: Db) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    let lists = or_empty(db.saved_lists(&uid), "saved lists");
    Ok(HttpResponse::Ok().json(lists))
}

async fn admin_stats(id: Identity, db: Db, settings: Settings) -> actix_web::Result<HttpResponse> {
    let uid = signed_in(&id)?;
    if !settings.is_admin(&uid) {
        return Err(error::ErrorForbidden("Admins only"));
    }
    let counters = collect_counters(&db).map_err(|err| log_error(err, "Database error"))?;
    let diff = SnapshotStore::open(&db, SystemClock)
        .map_err(|err| log_error(err, "Database error"))?
        .compare(&uid, counters)
        .map_err(|err| log_error(err, "Database error"))?;
    Ok(HttpResponse::Ok().json(diff))
}

#[actix_rt::main]
async fn main() -> std::io::Result<()> {
    std::env::set_var("RUST_BACKTRACE", "1");
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("reelgraph=debug,actix_web=info"),
    )
    .init();

    let config = Config::load();
    let db = reelgraph::database::open(config.db_path.as_deref())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    let bind = config.bind.clone();
    let cookie_key = config.cookie_key.clone();
    info!("listening on {}", bind);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(IdentityService::new(
                CookieIdentityPolicy::new(&cookie_key)
                    .name("auth-cookie")
                    .secure(false),
            ))
            .data(db.clone())
            .data(config.clone())
            .route("/session", web::post().to(sign_in))
            .route("/logout", web::post().to(logout))
            .route("/me", web::get().to(me))
            .route("/me", web::patch().to(update_profile))
            .route("/me/username", web::put().to(reserve_username))
            .route("/me/saved", web::get().to(saved_lists))
            .route("/usernames/{name}", web::get().to(username_available))
            .route("/search", web::get().to(search))
            .route("/u/{name}", web::get().to(resolve_user))
            .route("/users/{uid}/status", web::get().to(connection_status))
            .route("/users/{uid}/request", web::post().to(connect))
            .route("/users/{uid}/request", web::delete().to(cancel_request))
            .route("/users/{uid}/logs", web::get().to(user_logs))
            .route("/users/{uid}/stats", web::get().to(user_stats))
            .route("/users/{uid}/lists/{list}/save", web::post().to(toggle_save))
            .route("/connections", web::get().to(connections))
            .route("/connections/{uid}", web::delete().to(disconnect))
            .route("/requests", web::get().to(incoming_requests))
            .route("/requests/{id}/accept", web::post().to(accept_request))
            .route("/requests/{id}/reject", web::post().to(reject_request))
            .route("/feed", web::get().to(feed))
            .route("/activity", web::get().to(recent_activities))
            .route("/logs", web::post().to(add_log))
            .route("/reviews", web::post().to(add_review))
            .route("/reviews/{id}/comments", web::get().to(comments))
            .route("/reviews/{id}/comments", web::post().to(add_comment))
            .route("/comments/{id}", web::delete().to(delete_comment))
            .route("/likes", web::post().to(toggle_like))
            .route("/lists", web::post().to(add_list))
            .route("/lists/{id}/movies", web::post().to(append_to_list))
            .route("/admin/stats", web::get().to(admin_stats))
    })
    .bind(bind)?
    .run()
    .await
}
