//!
//! quillhub HTTP/WS server
//! -----------------------
//! Axum adapter over the `Dispatcher`. Handlers only translate between HTTP and
//! operation calls; every policy decision happens inside the dispatcher.
//!
//! - `Authorization: Bearer <token>` resolves the caller for each request.
//! - Operation errors map to their HTTP status with a `{status, code, message}` body.
//! - `POST /images` takes a multipart upload (field `file`) and answers with the
//!   relay outcome. A relay failure is still a 200; only policy and input
//!   problems use error statuses.
//! - `GET /ws` streams every new post as a JSON text frame.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, EventStream};
use crate::identity::{AuthContext, RequestContext, SessionManager};
use crate::model::{
    AuthPayload, Category, EmailAvailability, Invite, InviteInput, NewPostInput, Post, Settings, SettingsPatch,
    SignInInput, SignUpInput, User, UserPatch,
};
use crate::relay::{ImageHost, RelayOutcome, SmmsHost, UploadRelay};
use crate::store::{MemoryStore, PostFilter, UserFilter};

/// Room for multipart boundaries and part headers on top of the file itself.
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub auth: AuthContext,
    /// Request body cap for `POST /images`.
    pub upload_body_limit: usize,
}

impl AppState {
    /// Wire every collaborator from `config`, forwarding uploads to the configured image host.
    pub fn from_config(config: &ServerConfig) -> Self {
        let host = SmmsHost::new(config.image_host_url.clone(), config.image_host_token.clone());
        Self::with_host(config, Arc::new(host))
    }

    pub fn with_host(config: &ServerConfig, host: Arc<dyn ImageHost>) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session_ttl));
        let dispatcher = Dispatcher::new(
            MemoryStore::new().shared(),
            sessions,
            Arc::new(UploadRelay::new(config.relay_config(), host)),
            Arc::new(EventBus::new(config.event_buffer)),
        );
        let auth = dispatcher.auth();
        let upload_body_limit = usize::try_from(config.max_upload_bytes)
            .unwrap_or(usize::MAX)
            .saturating_add(MULTIPART_OVERHEAD);
        Self { dispatcher: Arc::new(dispatcher), auth, upload_body_limit }
    }

    fn context(&self, headers: &HeaderMap) -> RequestContext {
        let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        self.auth.context_for(authorization)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        let body = json!({ "status": "error", "code": self.code_str(), "message": self.message() });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.upload_body_limit);
    Router::new()
        .route("/", get(|| async { "quillhub ok" }))
        .route("/sign-up", post(sign_up))
        .route("/sign-in", post(sign_in))
        .route("/sign-out", post(sign_out))
        .route("/me", get(me).put(update_me))
        .route("/settings", get(user_settings).put(update_settings))
        .route("/settings/user", get(settings_user))
        .route("/categories", get(categories))
        .route("/email", get(email_available))
        .route("/feed", get(feed))
        .route("/posts", get(posts).post(create_post))
        .route("/posts/{id}", get(post_by_id))
        .route("/posts/{id}/author", get(post_author))
        .route("/posts/{id}/likes", get(post_likes))
        .route("/posts/{id}/like", post(like_action))
        .route("/posts/{id}/comments", post(add_comment))
        .route("/users/{id}/posts", get(user_posts))
        .route("/users/{id}/settings", get(user_settings_of))
        .route("/invites", post(invite))
        .route("/images", post(relay_image).layer(upload_limit))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Start the HTTP server on `config.http_port` and serve until the process exits.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config);
    if let Some(seed) = &config.admin {
        match state.dispatcher.seed_admin(seed) {
            Ok(Some(u)) => info!("admin account '{}' created", u.email),
            Ok(None) => debug!("admin account '{}' already present", seed.email),
            Err(e) => warn!("could not seed admin account: {}", e),
        }
    }
    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct EmailQuery { email: String }

#[derive(Debug, Deserialize)]
struct CommentPayload { content: String }

async fn sign_up(State(state): State<AppState>, headers: HeaderMap, Json(input): Json<SignUpInput>) -> AppResult<Json<AuthPayload>> {
    state.dispatcher.sign_up(&state.context(&headers), &input).map(Json)
}

async fn sign_in(State(state): State<AppState>, headers: HeaderMap, Json(input): Json<SignInInput>) -> AppResult<Json<AuthPayload>> {
    state.dispatcher.sign_in(&state.context(&headers), &input).map(Json)
}

async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    let revoked = state.dispatcher.sign_out(&state.context(&headers))?;
    Ok(Json(json!({ "status": "ok", "revoked": revoked })))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<User>> {
    state.dispatcher.me(&state.context(&headers)).map(Json)
}

async fn update_me(State(state): State<AppState>, headers: HeaderMap, Json(patch): Json<UserPatch>) -> AppResult<Json<User>> {
    state.dispatcher.update_me(&state.context(&headers), &patch).map(Json)
}

async fn user_settings(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Option<Settings>>> {
    state.dispatcher.user_settings(&state.context(&headers)).map(Json)
}

async fn settings_user(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Option<User>>> {
    let ctx = state.context(&headers);
    match state.dispatcher.user_settings(&ctx)? {
        Some(settings) => state.dispatcher.settings_user(&ctx, &settings).map(Json),
        None => Ok(Json(None)),
    }
}

async fn user_settings_of(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> AppResult<Json<Option<Settings>>> {
    let ctx = state.context(&headers);
    let user = state
        .dispatcher
        .store()
        .find_user(&UserFilter::id(&id))?
        .ok_or_else(|| AppError::not_found("user_not_found", format!("user '{}' not found", id)))?;
    state.dispatcher.user_settings_of(&ctx, &user).map(Json)
}

async fn update_settings(State(state): State<AppState>, headers: HeaderMap, Json(patch): Json<SettingsPatch>) -> AppResult<Json<Settings>> {
    state.dispatcher.update_settings(&state.context(&headers), &patch).map(Json)
}

async fn categories(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Vec<Category>>> {
    state.dispatcher.categories(&state.context(&headers)).map(Json)
}

async fn email_available(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<EmailQuery>) -> AppResult<Json<EmailAvailability>> {
    state.dispatcher.email_available(&state.context(&headers), &q.email).map(Json)
}

async fn posts(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Vec<Post>>> {
    state.dispatcher.posts(&state.context(&headers)).map(Json)
}

async fn feed(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Vec<Post>>> {
    state.dispatcher.feed(&state.context(&headers)).map(Json)
}

async fn create_post(State(state): State<AppState>, headers: HeaderMap, Json(input): Json<NewPostInput>) -> AppResult<impl IntoResponse> {
    let post = state.dispatcher.create_post(&state.context(&headers), input)?;
    Ok((StatusCode::CREATED, Json(post)))
}

async fn post_by_id(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> AppResult<Json<Post>> {
    state
        .dispatcher
        .post(&state.context(&headers), &id)?
        .map(Json)
        .ok_or_else(|| AppError::not_found("post_not_found", format!("post '{}' not found", id)))
}

fn load_post(state: &AppState, id: &str) -> AppResult<Post> {
    state
        .dispatcher
        .store()
        .find_post(&PostFilter::id(id))?
        .ok_or_else(|| AppError::not_found("post_not_found", format!("post '{}' not found", id)))
}

async fn post_author(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> AppResult<Json<Option<User>>> {
    let ctx = state.context(&headers);
    let post = load_post(&state, &id)?;
    state.dispatcher.post_author(&ctx, &post).map(Json)
}

async fn post_likes(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> AppResult<Json<Vec<User>>> {
    let ctx = state.context(&headers);
    let post = load_post(&state, &id)?;
    state.dispatcher.post_likes(&ctx, &post).map(Json)
}

async fn like_action(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> AppResult<Json<Post>> {
    state.dispatcher.like_action(&state.context(&headers), &id).map(Json)
}

async fn add_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<CommentPayload>,
) -> AppResult<Json<Post>> {
    state.dispatcher.add_comment(&state.context(&headers), &id, &payload.content).map(Json)
}

async fn user_posts(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> AppResult<Json<Vec<Post>>> {
    state.dispatcher.user_posts(&state.context(&headers), &id).map(Json)
}

async fn invite(State(state): State<AppState>, headers: HeaderMap, Json(input): Json<InviteInput>) -> AppResult<Json<Invite>> {
    state.dispatcher.invite(&state.context(&headers), &input).map(Json)
}

async fn relay_image(State(state): State<AppState>, headers: HeaderMap, mut multipart: Multipart) -> AppResult<Json<RelayOutcome>> {
    let ctx = state.context(&headers);
    // Reject before reading the body.
    crate::dispatcher::ops::SEND_IMAGE.check(ctx.identity())?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::user("invalid_multipart", e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field.content_type().unwrap_or("application/octet-stream").to_string();
        let body = field.map_err(std::io::Error::other);
        let outcome = state.dispatcher.relay_image(&ctx, body, &mime_type, &filename).await?;
        return Ok(Json(outcome));
    }
    Err(AppError::user("missing_file", "multipart field 'file' is required"))
}

async fn ws_handler(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let events = match state.dispatcher.subscribe_new_content(&state.context(&headers)) {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| forward_events(socket, events))
}

/// Push events to the socket until either side goes away. The subscription is
/// dropped (and released) when this returns.
async fn forward_events(mut socket: WebSocket, mut events: EventStream) {
    loop {
        tokio::select! {
            ev = events.next() => {
                let Some(ev) = ev else { break };
                let text = match serde_json::to_string(&ev) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("event encode failed: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(topic = events.topic(), "websocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_uses_status_and_code() {
        let resp = AppError::forbidden("nope").into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = AppError::duplicate_identity("dup").into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn upload_limit_follows_config() {
        let config = ServerConfig { max_upload_bytes: 8 * 1024 * 1024, ..Default::default() };
        let state = AppState::from_config(&config);
        assert_eq!(state.upload_body_limit, 8 * 1024 * 1024 + MULTIPART_OVERHEAD);
    }

    #[test]
    fn context_reads_bearer_header() {
        let state = AppState::from_config(&ServerConfig::default());
        let mut headers = HeaderMap::new();
        assert!(state.context(&headers).identity.is_none());
        headers.insert(header::AUTHORIZATION, "Bearer not-a-session".parse().unwrap());
        let ctx = state.context(&headers);
        assert!(ctx.identity.is_none());
        assert_eq!(ctx.token.as_deref(), Some("not-a-session"));
    }
}
