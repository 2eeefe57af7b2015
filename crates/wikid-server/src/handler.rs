use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::time::Duration;

use bytes::Bytes;
use axum::extract::{ConnectInfo, Form, Multipart, Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use wikid_store::{AttachOutcome, ListMode};
use wikid_types::titles::{is_story_state, is_synthetic};
use wikid_types::{AttachmentId, ContentHash, Tiddler};

use crate::auth::{Access, ACCOUNT_KEY, CSRF_KEY};
use crate::cookies::{self, SetCookies, CSRF_COOKIE, FIRST_LOAD_COOKIE, SESSION_COOKIE};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use crate::synthetic;

/// TiddlyWiki version reported by `/status`.
pub const TIDDLYWIKI_VERSION: &str = "5.2.3";
/// Header the TiddlyWeb adaptor sends on login and logout.
const REQUESTED_WITH: &str = "x-requested-with";
const NO_STORE_REVALIDATE: &str = "max-age=0, must-revalidate";
const LIST_CACHE_CONTROL: &str = "public, max-age=0, must-revalidate";

/// Health check handler.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "name": "wikid",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WikiStatus {
    pub username: String,
    pub anonymous: bool,
    pub read_only: bool,
    pub space: Space,
    pub tiddlywiki_version: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Space {
    pub recipe: String,
}

/// `GET /status`. Also arms the first-load cookie so the next listing is full.
pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let mut jar = SetCookies::new();
    if cookies::get(&headers, FIRST_LOAD_COOKIE).is_none() {
        jar.set(FIRST_LOAD_COOKIE, "1", state.config.session.ttl_secs, true);
    }

    let access = Access::resolve(&state.sessions, &headers, &mut jar);
    let auth = state.auth.as_ref();
    let status = if access.can_read(auth) {
        access.refresh_csrf(&mut jar, state.config.session.ttl_secs);
        WikiStatus {
            username: access.user.clone().unwrap_or_else(|| "GUEST".into()),
            anonymous: auth.allow_anonymous_read(),
            read_only: !access.can_edit(auth),
            space: Space {
                recipe: state.config.recipe.clone(),
            },
            tiddlywiki_version: TIDDLYWIKI_VERSION.into(),
        }
    } else {
        WikiStatus {
            username: "GUEST".into(),
            anonymous: false,
            read_only: true,
            space: Space {
                recipe: state.config.recipe.clone(),
            },
            tiddlywiki_version: TIDDLYWIKI_VERSION.into(),
        }
    };
    (jar, [(CACHE_CONTROL, LIST_CACHE_CONTROL)], Json(status)).into_response()
}

/// `GET /recipes/{recipe}/tiddlers.json`.
pub async fn list(
    State(state): State<AppState>,
    Path(recipe): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ServerResult<Response> {
    check_recipe(&state, &recipe)?;
    let mut jar = SetCookies::new();
    let access = Access::resolve(&state.sessions, &headers, &mut jar);
    if !access.can_read(state.auth.as_ref()) {
        return Ok((
            jar,
            [
                (CACHE_CONTROL, LIST_CACHE_CONTROL),
                (CONTENT_TYPE, "application/json"),
            ],
            "[]",
        )
            .into_response());
    }

    let mode = if cookies::get(&headers, FIRST_LOAD_COOKIE).is_some() {
        jar.clear(FIRST_LOAD_COOKIE, true);
        ListMode::Full
    } else {
        ListMode::Slim
    };
    access.refresh_csrf(&mut jar, state.config.session.ttl_secs);

    let extra = synthetic::all(state.clock.now(), connect.map(|c| c.0));
    let body = state.with_store(move |store| store.list(&extra, mode)).await?;
    debug!(?mode, bytes = body.len(), "served listing");

    Ok((
        jar,
        [
            (CACHE_CONTROL, LIST_CACHE_CONTROL),
            (CONTENT_TYPE, "application/json"),
        ],
        body,
    )
        .into_response())
}

/// `GET /recipes/{recipe}/tiddlers/{title}`.
pub async fn get_tiddler(
    State(state): State<AppState>,
    Path((recipe, title)): Path<(String, String)>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ServerResult<Response> {
    check_recipe(&state, &recipe)?;
    if let Some(skipped) = skip_story_state(&state, &title) {
        return Ok(skipped);
    }

    let mut jar = SetCookies::new();
    let access = Access::resolve(&state.sessions, &headers, &mut jar);
    if !access.can_read(state.auth.as_ref()) {
        return Err(ServerError::Unauthorized);
    }
    access.refresh_csrf(&mut jar, state.config.session.ttl_secs);

    let fetched = {
        let title = title.clone();
        state.with_store(move |store| store.get(&title)).await?
    };
    let (mut tiddler, tag) = match fetched {
        Some(fetched) => {
            let mut tiddler = fetched.tiddler;
            tiddler.revision = fetched.revision.to_string();
            (tiddler, Some(etag(&state.config.recipe, fetched.revision, &fetched.hash)))
        }
        None => {
            let generated = synthetic::generate(&title, state.clock.now(), connect.map(|c| c.0))
                .ok_or_else(|| ServerError::NotFound(title.clone()))?;
            (generated, None)
        }
    };
    tiddler.apply_read_defaults(&state.config.recipe);

    if let Some(tag) = &tag {
        let matches = headers
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == tag);
        if matches {
            return Ok((StatusCode::NOT_MODIFIED, jar, [(ETAG, tag.clone())]).into_response());
        }
    }

    let body = tiddler
        .to_json()
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    let mut response = (
        jar,
        [
            (CACHE_CONTROL, NO_STORE_REVALIDATE),
            (CONTENT_TYPE, "application/json"),
        ],
        body,
    )
        .into_response();
    if let Some(tag) = tag {
        if let Ok(value) = tag.parse() {
            response.headers_mut().insert(ETAG, value);
        }
    }
    Ok(response)
}

/// `PUT /recipes/{recipe}/tiddlers/{title}`.
pub async fn put_tiddler(
    State(state): State<AppState>,
    Path((recipe, title)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ServerResult<Response> {
    check_recipe(&state, &recipe)?;
    if let Some(skipped) = skip_story_state(&state, &title) {
        return Ok(skipped);
    }

    let mut jar = SetCookies::new();
    let access = Access::resolve(&state.sessions, &headers, &mut jar);
    if !access.can_edit(state.auth.as_ref()) {
        return Err(ServerError::Unauthorized);
    }
    access.refresh_csrf(&mut jar, state.config.session.ttl_secs);

    if is_synthetic(&title) {
        let tag = format!("\"{}//0:\"", state.config.recipe);
        return Ok((StatusCode::NO_CONTENT, jar, [(ETAG, tag)]).into_response());
    }

    let tiddler = Tiddler::from_json(&body).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let has_macro = tiddler.has_macro_tag();
    let attachment = tiddler.canonical_uri().and_then(AttachmentId::from_canonical_uri);

    let outcome = {
        let title = title.clone();
        state
            .with_store(move |store| store.put(&title, tiddler, has_macro, attachment.as_ref()))
            .await?
    };
    debug!(%title, revision = outcome.revision, "stored tiddler");
    if let Some(released) = &outcome.released {
        remove_attachment(&state.config.files_dir, released).await;
    }

    let tag = etag(&state.config.recipe, outcome.revision, &outcome.hash);
    Ok((StatusCode::NO_CONTENT, jar, [(ETAG, tag)]).into_response())
}

/// `DELETE /bags/{recipe}/tiddlers/{title}` (and the recipe path).
pub async fn delete_tiddler(
    State(state): State<AppState>,
    Path((recipe, title)): Path<(String, String)>,
    headers: HeaderMap,
) -> ServerResult<Response> {
    check_recipe(&state, &recipe)?;
    let mut jar = SetCookies::new();
    let access = Access::resolve(&state.sessions, &headers, &mut jar);
    if !access.can_edit(state.auth.as_ref()) {
        return Err(ServerError::Unauthorized);
    }
    access.refresh_csrf(&mut jar, state.config.session.ttl_secs);

    let outcome = {
        let title = title.clone();
        state.with_store(move |store| store.delete(&title)).await?
    };
    if !outcome.existed {
        return Err(ServerError::NotFound(title));
    }
    debug!(%title, "deleted tiddler");
    if let Some(released) = &outcome.release {
        remove_attachment(&state.config.files_dir, released).await;
    }
    Ok((StatusCode::NO_CONTENT, jar).into_response())
}

/// `POST /upload`: multipart `meta` (tiddler JSON) plus a `text` file part.
/// Responds with the attachment's save-name.
pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ServerResult<Response> {
    let mut jar = SetCookies::new();
    let access = Access::resolve(&state.sessions, &headers, &mut jar);
    if !access.can_edit(state.auth.as_ref()) {
        return Err(ServerError::Unauthorized);
    }

    let mut meta = None;
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("meta") if meta.is_none() => {
                meta = Some(field.bytes().await.map_err(|e| ServerError::BadRequest(e.to_string()))?)
            }
            Some("text") if file.is_none() => {
                file = Some(field.bytes().await.map_err(|e| ServerError::BadRequest(e.to_string()))?)
            }
            _ => {}
        }
    }
    let meta = meta.ok_or_else(|| ServerError::BadRequest("missing meta part".into()))?;
    let file = file.ok_or_else(|| ServerError::BadRequest("missing text part".into()))?;

    let tiddler = Tiddler::from_json(&meta).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let title = tiddler.title.clone();
    let has_macro = tiddler.has_macro_tag();

    let id = AttachmentId::generate(state.clock.now());
    save_attachment(&state.config.files_dir, &id, &file).await?;

    let attached = {
        let (title, id) = (title.clone(), id.clone());
        state
            .with_store(move |store| {
                store.put(&title, tiddler, has_macro, None)?;
                store.attach_attachment(&title, &id)
            })
            .await
    };
    let attached = match attached {
        Ok(attached) => attached,
        Err(e) => {
            remove_attachment(&state.config.files_dir, &id).await;
            return Err(e);
        }
    };
    match attached {
        AttachOutcome::Attached { released } => {
            if let Some(released) = &released {
                remove_attachment(&state.config.files_dir, released).await;
            }
        }
        AttachOutcome::Missing => {
            remove_attachment(&state.config.files_dir, &id).await;
            return Err(ServerError::NotFound(title));
        }
    }
    info!(%title, attachment = %id, bytes = file.len(), "stored upload");
    Ok((jar, id.as_str().to_owned()).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub user: String,
    pub password: String,
}

/// `POST /challenge/tiddlywebplugins.tiddlyspace.cookie_form`.
///
/// Every attempt takes at least `login_delay_ms`, whether or not the
/// credentials are accepted.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> ServerResult<Response> {
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(state.config.login_delay_ms);
    require_tiddlywiki(&headers)?;

    let mut jar = SetCookies::new();
    if Access::resolve(&state.sessions, &headers, &mut jar).session.is_some() {
        return Ok((StatusCode::NO_CONTENT, jar).into_response());
    }

    let identity = state.auth.login(&form.user, &form.password).await?;
    tokio::time::sleep_until(deadline).await;
    let Some(identity) = identity else {
        warn!(user = %form.user, "login rejected");
        return Err(ServerError::Unauthorized);
    };

    let ttl = state.config.session.ttl_secs;
    let (token, session) = state.sessions.new_token()?;
    session.set(ACCOUNT_KEY, identity.name.clone());
    jar.set(SESSION_COOKIE, &token, ttl, true);
    let access = Access {
        token: Some(token),
        session: Some(session),
        user: Some(identity.name),
    };
    access.refresh_csrf(&mut jar, ttl);
    info!(user = ?access.user, "logged in");
    Ok((StatusCode::NO_CONTENT, jar).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogoutForm {
    pub csrf_token: String,
}

/// `POST /logout`. The form must echo the session's CSRF token.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<LogoutForm>,
) -> ServerResult<Response> {
    require_tiddlywiki(&headers)?;

    let mut jar = SetCookies::new();
    let access = Access::resolve(&state.sessions, &headers, &mut jar);
    let (Some(token), Some(session)) = (access.token, access.session) else {
        return Err(ServerError::Unauthorized);
    };
    let expected = session.get_str(CSRF_KEY).ok_or(ServerError::Unauthorized)?;
    if form.csrf_token != expected {
        return Err(ServerError::BadRequest("csrf token mismatch".into()));
    }

    state.sessions.destroy(&token);
    info!(user = ?access.user, "logged out");

    let mut jar = SetCookies::new();
    jar.clear(SESSION_COOKIE, true);
    jar.clear(CSRF_COOKIE, false);
    Ok((StatusCode::NO_CONTENT, jar).into_response())
}

/// `"{recipe}//{revision}:{hash}"`
pub fn etag(recipe: &str, revision: u64, hash: &ContentHash) -> String {
    format!("\"{recipe}//{revision}:{}\"", hash.to_hex())
}

fn check_recipe(state: &AppState, recipe: &str) -> ServerResult<()> {
    if recipe == state.config.recipe {
        Ok(())
    } else {
        Err(ServerError::NotFound(format!("recipe {recipe}")))
    }
}

/// Story and history lists are per-browser state; unless syncing them is
/// enabled they are acknowledged and dropped.
fn skip_story_state(state: &AppState, title: &str) -> Option<Response> {
    if state.config.sync_story_list || !is_story_state(title) {
        return None;
    }
    let tag = format!("\"{}/{title}/0:\"", state.config.recipe);
    Some((StatusCode::NO_CONTENT, [(ETAG, tag)]).into_response())
}

fn require_tiddlywiki(headers: &HeaderMap) -> ServerResult<()> {
    let mut values = headers.get_all(REQUESTED_WITH).iter();
    match (values.next(), values.next()) {
        (Some(v), None) if v == "TiddlyWiki" => Ok(()),
        _ => Err(ServerError::BadRequest("missing X-Requested-With".into())),
    }
}

async fn save_attachment(dir: &FsPath, id: &AttachmentId, data: &[u8]) -> ServerResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut fd = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dir.join(id.as_str()))
        .await?;
    fd.write_all(data).await?;
    fd.sync_all().await?;
    Ok(())
}

async fn remove_attachment(dir: &FsPath, id: &AttachmentId) {
    let path = dir.join(id.as_str());
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!(attachment = %id, "removed attachment file"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove attachment file"),
    }
}
