use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::downloader::{self, ExportFormat};
use crate::error::{EntryError, Result};
use crate::loader::{ExperimentUpload, from_upload};
use crate::login::{self, NewUser, SessionStore, UserCredentials};
use crate::model::{Actor, DataType, EntryStatus, TreatmentFields};
use crate::observations::CellEdit;
use crate::registry::TraitRef;
use crate::store::Store;

const SESSION_COOKIE: &str = "session";

/// Text an admin must type to wipe a location.
pub const PURGE_CONFIRMATION: &str = "DELETE";

pub struct AppState {
    store: Mutex<Store>,
    sessions: SessionStore,
}

impl AppState {
    pub fn new(store: Store, session_ttl: Duration) -> Self {
        AppState {
            store: Mutex::new(store),
            sessions: SessionStore::new(session_ttl),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve the session cookie to the logged-in actor.
    fn actor(&self, jar: &CookieJar) -> Result<Actor> {
        let session_id = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(|| EntryError::Unauthorized("not logged in".into()))?;
        self.sessions
            .validate(&session_id)
            .ok_or_else(|| EntryError::Unauthorized("session expired".into()))
    }

    fn admin(&self, jar: &CookieJar) -> Result<Actor> {
        let actor = self.actor(jar)?;
        actor.require_admin()?;
        Ok(actor)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: String,
}

impl IntoResponse for EntryError {
    fn into_response(self) -> Response {
        let status = match &self {
            EntryError::Validation(_) | EntryError::Grid(_) => StatusCode::BAD_REQUEST,
            EntryError::Scope(_) | EntryError::Forbidden(_) => StatusCode::FORBIDDEN,
            EntryError::State(_) => StatusCode::CONFLICT,
            EntryError::NotFound(_) => StatusCode::NOT_FOUND,
            EntryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EntryError::Storage(_) | EntryError::Io(_) | EntryError::Snapshot(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("{}", self);
        } else {
            debug!("request rejected: {}", self);
        }

        let body = ErrorResponse {
            status: "error",
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct NewLocation {
    name: String,
}

#[derive(Deserialize)]
struct NewTrait {
    name: String,
    #[serde(default = "default_data_type")]
    data_type: DataType,
    #[serde(default)]
    unit: String,
}

fn default_data_type() -> DataType {
    DataType::Number
}

#[derive(Deserialize)]
struct GridQuery {
    /// Comma-separated trait names; all applicable traits when absent.
    traits: Option<String>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

#[derive(Deserialize)]
struct ExportQuery {
    status: Option<String>,
    format: Option<String>,
}

#[derive(Deserialize)]
struct PurgeRequest {
    confirm: String,
}

#[derive(Deserialize)]
struct EntryRequest {
    edits: Vec<CellEdit>,
    #[serde(default)]
    submit: bool,
}

#[derive(Serialize)]
struct UploadSummary {
    experiment_id: String,
    treatments: usize,
    traits: Vec<String>,
}

#[derive(Serialize)]
struct Changed {
    status: &'static str,
    changed: usize,
}

#[derive(Serialize)]
struct Toggled {
    id: i64,
    active: bool,
}

fn ok(changed: usize) -> Json<Changed> {
    Json(Changed {
        status: "ok",
        changed,
    })
}

/// Build the full router around shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/login", post(handle_login))
        .route("/logout", post(handle_logout))
        .route("/api/me", get(whoami))
        .route("/api/locations", get(list_locations).post(create_location))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/experiment/upload", post(upload_experiment))
        .route("/api/traits", get(list_traits).post(add_trait))
        .route("/api/traits/:id/toggle", post(toggle_trait))
        .route("/api/treatments", get(list_treatments).post(add_treatment))
        .route("/api/treatments/:id/toggle", post(toggle_treatment))
        .route("/api/treatments/:id/reset", post(reset_treatment))
        .route("/api/treatments/:id", axum::routing::delete(delete_treatment))
        .route("/api/reopen", post(reopen_all))
        .route("/api/history", get(history))
        .route("/api/export", get(export))
        .route("/api/danger/purge", post(purge))
        .route("/api/entry/traits", get(entry_traits))
        .route("/api/entry", get(entry_grid).post(save_entry))
        .with_state(state)
}

pub async fn run(config: ServerConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&config.db)?;
    let state = Arc::new(AppState::new(store, config.session_ttl()));
    let app = router(state);

    let listener = TcpListener::bind(config.bind).await?;
    info!("listening on http://{}", config.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(credentials): Json<UserCredentials>,
) -> Result<(CookieJar, Json<Actor>)> {
    let actor = login::verify_user(&state.store(), &credentials.username, &credentials.password)?
        .ok_or_else(|| EntryError::Unauthorized("invalid username or password".into()))?;

    let session_id = state.sessions.create(actor.clone());
    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true);
    info!("{} logged in as {}", actor.username, actor.role);
    Ok((jar.add(cookie), Json(actor)))
}

async fn handle_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Json<Changed>) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.remove(cookie.value());
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        ok(0),
    )
}

async fn whoami(State(state): State<Arc<AppState>>, jar: CookieJar) -> Result<Json<Actor>> {
    Ok(Json(state.actor(&jar)?))
}

async fn list_locations(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    state.actor(&jar)?.require_super_admin()?;
    Ok(Json(login::list_locations(&state.store())?))
}

async fn create_location(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<NewLocation>,
) -> Result<impl IntoResponse> {
    state.actor(&jar)?.require_super_admin()?;
    let location = login::create_location(&state.store(), &body.name)?;
    Ok((StatusCode::CREATED, Json(location)))
}

async fn list_users(State(state): State<Arc<AppState>>, jar: CookieJar) -> Result<impl IntoResponse> {
    state.actor(&jar)?.require_super_admin()?;
    Ok(Json(login::list_users(&state.store())?))
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<NewUser>,
) -> Result<impl IntoResponse> {
    state.actor(&jar)?.require_super_admin()?;
    let user = login::register_user(&state.store(), &body)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn upload_experiment(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut multipart: Multipart,
) -> Result<Json<UploadSummary>> {
    let actor = state.admin(&jar)?;
    let scope = actor.scope()?;

    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EntryError::Validation(format!("bad multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload.csv").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| EntryError::Validation(format!("could not read upload: {}", e)))?;
            file = Some((filename, bytes));
        }
    }
    let (filename, bytes) =
        file.ok_or_else(|| EntryError::Validation("no file data received".into()))?;

    let upload = ExperimentUpload::from_grid(&from_upload(&filename, &bytes)?)?;
    state.store().replace_experiment(scope, &upload)?;
    info!("{} uploaded '{}' for {}", actor.username, filename, scope);

    Ok(Json(UploadSummary {
        experiment_id: upload.experiment_id,
        treatments: upload.treatments.len(),
        traits: upload.traits,
    }))
}

async fn list_traits(State(state): State<Arc<AppState>>, jar: CookieJar) -> Result<impl IntoResponse> {
    let scope = state.admin(&jar)?.scope()?;
    Ok(Json(state.store().registry().list(scope)?))
}

async fn add_trait(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<NewTrait>,
) -> Result<impl IntoResponse> {
    let scope = state.admin(&jar)?.scope()?;
    let def = state
        .store()
        .registry()
        .define(scope, &body.name, body.data_type, &body.unit)?;
    Ok((StatusCode::CREATED, Json(def)))
}

async fn toggle_trait(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<Json<Toggled>> {
    let scope = state.admin(&jar)?.scope()?;
    let active = state.store().registry().toggle(scope, &TraitRef::Id(id))?;
    Ok(Json(Toggled { id, active }))
}

async fn list_treatments(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse> {
    let scope = state.admin(&jar)?.scope()?;
    let status = parse_status(query.status.as_deref())?;
    Ok(Json(state.store().catalog().list(scope, status)?))
}

async fn add_treatment(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(fields): Json<TreatmentFields>,
) -> Result<impl IntoResponse> {
    let scope = state.admin(&jar)?.scope()?;
    let record = state.store().catalog().add(scope, fields)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn toggle_treatment(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<Json<Toggled>> {
    let scope = state.admin(&jar)?.scope()?;
    let active = state.store().catalog().toggle_active(scope, id)?;
    Ok(Json(Toggled { id, active }))
}

async fn reset_treatment(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<Json<Changed>> {
    let scope = state.admin(&jar)?.scope()?;
    state.store().catalog().reset(scope, id)?;
    Ok(ok(1))
}

async fn delete_treatment(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<Json<Changed>> {
    let scope = state.admin(&jar)?.scope()?;
    state.store().catalog().remove(scope, id)?;
    Ok(ok(1))
}

async fn reopen_all(State(state): State<Arc<AppState>>, jar: CookieJar) -> Result<Json<Changed>> {
    let actor = state.admin(&jar)?;
    let changed = state.store().observations().reopen(actor.scope()?, &actor)?;
    Ok(ok(changed))
}

async fn history(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<GridQuery>,
) -> Result<impl IntoResponse> {
    let scope = state.admin(&jar)?.scope()?;
    let status = parse_status(query.status.as_deref())?;
    let store = state.store();
    let traits = match split_traits(query.traits.as_deref()) {
        Some(names) => names,
        None => store
            .registry()
            .list(scope)?
            .into_iter()
            .map(|t| t.name)
            .collect(),
    };
    Ok(Json(store.observations().load_history(scope, &traits, status)?))
}

async fn export(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse> {
    let scope = state.admin(&jar)?.scope()?;
    let status = parse_status(query.status.as_deref())?;
    let format = ExportFormat::from_name(query.format.as_deref().unwrap_or("xlsx"))?;

    let grid = state.store().observations().export_wide(scope, status)?;
    let bytes = downloader::render(&grid, format)?;
    let filename = downloader::export_filename(status, format);

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    ))
}

async fn purge(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<PurgeRequest>,
) -> Result<Json<Changed>> {
    let actor = state.admin(&jar)?;
    if body.confirm != PURGE_CONFIRMATION {
        return Err(EntryError::Validation(format!(
            "type {} to confirm",
            PURGE_CONFIRMATION
        )));
    }
    let scope = actor.scope()?;
    state.store().purge_scope(scope)?;
    warn!("{} purged all data of {}", actor.username, scope);
    Ok(ok(0))
}

async fn entry_traits(State(state): State<Arc<AppState>>, jar: CookieJar) -> Result<impl IntoResponse> {
    let scope = state.actor(&jar)?.scope()?;
    Ok(Json(state.store().registry().list_active(scope)?))
}

async fn entry_grid(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<GridQuery>,
) -> Result<impl IntoResponse> {
    let scope = state.actor(&jar)?.scope()?;
    let status = parse_status(query.status.as_deref())?;
    let store = state.store();
    let traits = match split_traits(query.traits.as_deref()) {
        Some(names) => names,
        None => store
            .registry()
            .list_active(scope)?
            .into_iter()
            .map(|t| t.name)
            .collect(),
    };
    Ok(Json(store.observations().load_wide(scope, &traits, status)?))
}

async fn save_entry(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<EntryRequest>,
) -> Result<Json<Changed>> {
    let actor = state.actor(&jar)?;
    let scope = actor.scope()?;
    let store = state.store();
    let written = if body.submit {
        store.observations().submit_wide(scope, &body.edits, &actor)?
    } else {
        store.observations().save_wide(scope, &body.edits, &actor)?
    };
    Ok(ok(written))
}

/// `None`, empty and `all` mean no status filter.
fn parse_status(raw: Option<&str>) -> Result<Option<EntryStatus>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
        Some(s) => s.parse().map(Some),
    }
}

fn split_traits(raw: Option<&str>) -> Option<Vec<String>> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    })
}
