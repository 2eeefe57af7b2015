//! TiddlyWeb-compatible HTTP server for wikid.
//!
//! Serves a single-file TiddlyWiki and the sync endpoints its TiddlyWeb
//! adaptor talks to, backed by a [`wikid_store::TiddlerStore`] and a
//! [`wikid_session::MemorySessionStore`].
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/status` | login state; arms a full first listing |
//! | GET | `/recipes/{r}/tiddlers.json` | all tiddlers (full or slim) |
//! | GET, PUT, DELETE | `/recipes/{r}/tiddlers/{title}` | one tiddler |
//! | DELETE | `/bags/{r}/tiddlers/{title}` | one tiddler |
//! | POST | `/upload` | store an attachment and its tiddler |
//! | POST | `/challenge/tiddlywebplugins.tiddlyspace.cookie_form` | login |
//! | POST | `/logout` | logout |
//! | GET | `/files/*` | uploaded attachments |
//! | GET | `/v1/health` | health check |

pub mod auth;
pub mod config;
pub mod cookies;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;
pub mod state;
pub mod synthetic;

pub use auth::{Access, AllowAllAuth, AuthProvider, Identity};
pub use config::{ServerConfig, StoreConfig};
pub use error::{ServerError, ServerResult};
pub use server::{open_store, WikiServer};
pub use state::AppState;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::header::{CONTENT_TYPE, COOKIE, ETAG, IF_NONE_MATCH, SET_COOKIE};
    use axum::http::{Request, Response, StatusCode};
    use axum::Router;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use tower::util::ServiceExt;
    use wikid_session::ManualClock;
    use wikid_store::{MemoryTiddlerStore, TiddlerStore};
    use wikid_types::AttachmentId;

    use super::*;

    struct Harness {
        app: Router,
        state: AppState,
        dir: TempDir,
    }

    fn harness_with(auth: Arc<dyn AuthProvider>, tweak: impl FnOnce(&mut ServerConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            files_dir: dir.path().join("files"),
            index_path: dir.path().join("index.html"),
            login_delay_ms: 0,
            store: StoreConfig::Memory {
                snapshot_path: None,
            },
            ..ServerConfig::default()
        };
        tweak(&mut config);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let server = WikiServer::with_parts(
            Arc::new(MemoryTiddlerStore::new()),
            auth,
            clock,
            config,
        );
        Harness {
            app: server.router(),
            state: server.state().clone(),
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(AllowAllAuth), |_| {})
    }

    impl Harness {
        async fn send(&self, req: Request<Body>) -> Response<Body> {
            self.app.clone().oneshot(req).await.unwrap()
        }

        async fn get(&self, uri: &str) -> Response<Body> {
            self.send(Request::get(uri).body(Body::empty()).unwrap()).await
        }

        async fn put_json(&self, uri: &str, json: &str) -> Response<Body> {
            self.send(
                Request::put(uri)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(json.to_owned()))
                    .unwrap(),
            )
            .await
        }

        async fn login(&self, user: &str, password: &str) -> Response<Body> {
            self.send(
                Request::post("/challenge/tiddlywebplugins.tiddlyspace.cookie_form")
                    .header("X-Requested-With", "TiddlyWiki")
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("user={user}&password={password}")))
                    .unwrap(),
            )
            .await
        }
    }

    async fn body_bytes(res: Response<Body>) -> Vec<u8> {
        axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(res: Response<Body>) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(res).await).unwrap()
    }

    fn set_cookie(res: &Response<Body>, name: &str) -> Option<String> {
        res.headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    }

    fn etag_of(res: &Response<Body>) -> Option<String> {
        res.headers()
            .get(ETAG)
            .map(|v| v.to_str().unwrap().to_string())
    }

    fn titles(listing: &serde_json::Value) -> Vec<String> {
        listing
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["title"].as_str().unwrap().to_string())
            .collect()
    }

    /// Grants nothing to anonymous visitors; accepts alice/secret.
    struct PasswordAuth;

    #[async_trait]
    impl AuthProvider for PasswordAuth {
        async fn login(&self, user: &str, password: &str) -> ServerResult<Option<Identity>> {
            Ok((user == "alice" && password == "secret").then(|| Identity::user(user)))
        }

        fn allow_anonymous_read(&self) -> bool {
            false
        }

        fn allow_anonymous_edit(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn health_endpoint() {
        let h = harness();
        let res = h.get("/v1/health").await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["status"], "ok");
    }

    #[tokio::test]
    async fn status_arms_first_load_cookie() {
        let h = harness();
        let res = h.get("/status").await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(set_cookie(&res, cookies::FIRST_LOAD_COOKIE).as_deref(), Some("1"));
        let status = body_json(res).await;
        assert_eq!(status["username"], "GUEST");
        assert_eq!(status["anonymous"], true);
        assert_eq!(status["read_only"], false);
        assert_eq!(status["space"]["recipe"], "default");
        assert_eq!(status["tiddlywiki_version"], handler::TIDDLYWIKI_VERSION);
    }

    #[tokio::test]
    async fn put_then_get_with_etag() {
        let h = harness();
        let res = h
            .put_json(
                "/recipes/default/tiddlers/HelloThere",
                r#"{"title":"HelloThere","text":"Welcome","tags":["intro"]}"#,
            )
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let put_tag = etag_of(&res).unwrap();
        assert!(put_tag.starts_with("\"default//1:"));

        let res = h.get("/recipes/default/tiddlers/HelloThere").await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(etag_of(&res).as_deref(), Some(put_tag.as_str()));
        let doc = body_json(res).await;
        assert_eq!(doc["text"], "Welcome");
        assert_eq!(doc["revision"], "1");
        assert_eq!(doc["bag"], "default");
        assert_eq!(doc["type"], "text/vnd.tiddlywiki");

        let res = h
            .send(
                Request::get("/recipes/default/tiddlers/HelloThere")
                    .header(IF_NONE_MATCH, put_tag.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn second_put_bumps_revision_and_skinny_keeps_text() {
        let h = harness();
        h.put_json("/recipes/default/tiddlers/A", r#"{"title":"A","text":"body"}"#)
            .await;
        let res = h
            .put_json(
                "/recipes/default/tiddlers/A",
                r#"{"title":"A","tags":["x"],"_is_skinny":""}"#,
            )
            .await;
        assert!(etag_of(&res).unwrap().starts_with("\"default//2:"));
        let doc = body_json(h.get("/recipes/default/tiddlers/A").await).await;
        assert_eq!(doc["text"], "body");
        assert_eq!(doc["tags"][0], "x");
    }

    #[tokio::test]
    async fn missing_tiddler_is_404_and_bad_json_is_400() {
        let h = harness();
        let res = h.get("/recipes/default/tiddlers/Nope").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let res = h.put_json("/recipes/default/tiddlers/Bad", "{not json").await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.state.store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_recipe_is_404() {
        let h = harness();
        assert_eq!(
            h.get("/recipes/other/tiddlers.json").await.status(),
            StatusCode::NOT_FOUND
        );
        let res = h
            .put_json("/recipes/other/tiddlers/A", r#"{"title":"A"}"#)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn first_listing_after_status_is_full() {
        let h = harness();
        h.put_json("/recipes/default/tiddlers/A", r#"{"title":"A","text":"alpha"}"#)
            .await;

        let slim = body_json(h.get("/recipes/default/tiddlers.json").await).await;
        assert_eq!(titles(&slim), ["A", "$:/sync-time", "$:/client-ip"]);
        assert!(slim[0].get("text").is_none());

        let res = h
            .send(
                Request::get("/recipes/default/tiddlers.json")
                    .header(COOKIE, "_tiddly=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(set_cookie(&res, cookies::FIRST_LOAD_COOKIE).as_deref(), Some(""));
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let full = body_json(res).await;
        assert_eq!(full[0]["text"], "alpha");
        assert_eq!(full[1]["text"], "2024-03-01T12:00:00.000000000Z");
    }

    #[tokio::test]
    async fn story_list_is_acknowledged_but_not_stored() {
        let h = harness();
        let res = h
            .put_json("/recipes/default/tiddlers/$:/StoryList", r#"{"title":"$:/StoryList"}"#)
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(etag_of(&res).as_deref(), Some("\"default/$:/StoryList/0:\""));
        assert_eq!(h.state.store.len().unwrap(), 0);

        let res = h.get("/recipes/default/tiddlers/$:/HistoryList").await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn story_list_is_stored_when_synced() {
        let h = harness_with(Arc::new(AllowAllAuth), |c| c.sync_story_list = true);
        let res = h
            .put_json("/recipes/default/tiddlers/$:/StoryList", r#"{"title":"$:/StoryList"}"#)
            .await;
        assert!(etag_of(&res).unwrap().starts_with("\"default//1:"));
        assert_eq!(h.state.store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn synthetic_tiddlers_are_generated_not_stored() {
        let h = harness();
        let res = h.get("/recipes/default/tiddlers/$:/sync-time").await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(etag_of(&res).is_none());
        let doc = body_json(res).await;
        assert_eq!(doc["text"], "2024-03-01T12:00:00.000000000Z");
        assert_eq!(doc["bag"], "default");

        let res = h
            .put_json("/recipes/default/tiddlers/$:/client-ip", r#"{"title":"$:/client-ip"}"#)
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(etag_of(&res).as_deref(), Some("\"default//0:\""));
        assert_eq!(h.state.store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_released_attachment_file() {
        let h = harness();
        let id = AttachmentId::parse("20220201T104852-VgVjI7W_aR7_nkPT").unwrap();
        let files = h.dir.path().join("files");
        std::fs::create_dir_all(&files).unwrap();
        std::fs::write(files.join(id.as_str()), b"png").unwrap();

        let doc = format!(
            r#"{{"title":"Pic","fields":{{"_canonical_uri":"/files/{}"}}}}"#,
            id.as_str()
        );
        h.put_json("/recipes/default/tiddlers/Pic", &doc).await;
        h.put_json("/recipes/default/tiddlers/Pic2", &doc.replace("\"Pic\"", "\"Pic2\""))
            .await;
        assert_eq!(h.state.store.attachment_count(&id).unwrap(), 2);

        let del = |title: &str| {
            Request::delete(format!("/bags/default/tiddlers/{title}"))
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(h.send(del("Pic")).await.status(), StatusCode::NO_CONTENT);
        assert!(files.join(id.as_str()).exists());
        assert_eq!(h.send(del("Pic2")).await.status(), StatusCode::NO_CONTENT);
        assert!(!files.join(id.as_str()).exists());
        assert_eq!(h.send(del("Pic2")).await.status(), StatusCode::NOT_FOUND);
    }

    fn multipart(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        let boundary = "wikidtestboundary";
        let mut body = String::new();
        for (name, filename, value) in parts {
            body.push_str(&format!("--{boundary}\r\n"));
            match filename {
                Some(f) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        Request::post("/upload")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_saves_file_and_binds_tiddler() {
        let h = harness();
        let res = h
            .send(multipart(&[
                ("meta", None, r#"{"title":"photo.png","type":"image/png"}"#),
                ("text", Some("photo.png"), "hello"),
            ]))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let id = String::from_utf8(body_bytes(res).await).unwrap();
        let id = AttachmentId::parse(&id).unwrap();
        assert!(id.as_str().starts_with("20240301T120000-"));

        let saved = std::fs::read(h.dir.path().join("files").join(id.as_str())).unwrap();
        assert_eq!(saved, b"hello");
        assert!(h.state.store.get("photo.png").unwrap().is_some());
        assert_eq!(h.state.store.attachment_count(&id).unwrap(), 1);

        let res = h
            .send(
                Request::delete("/recipes/default/tiddlers/photo.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(!h.dir.path().join("files").join(id.as_str()).exists());
    }

    #[tokio::test]
    async fn store_work_runs_on_blocking_pool() {
        let h = harness();
        let caller = std::thread::current().id();
        let (worker, len) = h
            .state
            .with_store(|store| Ok((std::thread::current().id(), store.len()?)))
            .await
            .unwrap();
        assert_ne!(worker, caller);
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn reupload_replaces_old_file() {
        let h = harness();
        let mut ids = Vec::new();
        for content in ["first", "second"] {
            let res = h
                .send(multipart(&[
                    ("meta", None, r#"{"title":"photo"}"#),
                    ("text", Some("photo.png"), content),
                ]))
                .await;
            assert_eq!(res.status(), StatusCode::OK);
            let id = String::from_utf8(body_bytes(res).await).unwrap();
            ids.push(AttachmentId::parse(&id).unwrap());
        }

        let files = h.dir.path().join("files");
        assert_eq!(std::fs::read_dir(&files).unwrap().count(), 1);
        assert!(!files.join(ids[0].as_str()).exists());
        assert_eq!(std::fs::read(files.join(ids[1].as_str())).unwrap(), b"second");
        assert_eq!(h.state.store.attachment_count(&ids[0]).unwrap(), 0);
        assert_eq!(h.state.store.attachment_count(&ids[1]).unwrap(), 1);
        assert_eq!(h.state.store.get("photo").unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn upload_without_file_part_is_400() {
        let h = harness();
        let res = h
            .send(multipart(&[("meta", None, r#"{"title":"x"}"#)]))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.state.store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_tiddler_is_rejected() {
        let h = harness_with(Arc::new(AllowAllAuth), |c| c.tiddler_size_limit = 64);
        let text = "x".repeat(256);
        let res = h
            .put_json(
                "/recipes/default/tiddlers/Big",
                &format!(r#"{{"title":"Big","text":"{text}"}}"#),
            )
            .await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn login_requires_tiddlywiki_header() {
        let h = harness();
        let res = h
            .send(
                Request::post("/challenge/tiddlywebplugins.tiddlyspace.cookie_form")
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("user=a&password=b"))
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(h.state.sessions.is_empty());
    }

    #[tokio::test]
    async fn login_and_logout_with_csrf() {
        let h = harness();
        let res = h.login("alice", "pw").await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let token = set_cookie(&res, cookies::SESSION_COOKIE).unwrap();
        let csrf = set_cookie(&res, cookies::CSRF_COOKIE).unwrap();
        assert_eq!(h.state.sessions.len(), 1);

        let res = h
            .send(
                Request::get("/status")
                    .header(COOKIE, format!("tiddlywiki={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        let csrf = set_cookie(&res, cookies::CSRF_COOKIE).unwrap_or(csrf);
        assert_eq!(body_json(res).await["username"], "alice");

        let logout = |csrf: &str| {
            Request::post("/logout")
                .header("X-Requested-With", "TiddlyWiki")
                .header(COOKIE, format!("tiddlywiki={token}"))
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!("csrf_token={csrf}")))
                .unwrap()
        };
        assert_eq!(h.send(logout("wrong")).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.state.sessions.len(), 1);

        let res = h.send(logout(&csrf)).await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(set_cookie(&res, cookies::SESSION_COOKIE).as_deref(), Some(""));
        assert!(h.state.sessions.is_empty());

        assert_eq!(h.send(logout(&csrf)).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn private_wiki_requires_login() {
        let h = harness_with(Arc::new(PasswordAuth), |_| {});
        assert_eq!(
            h.get("/recipes/default/tiddlers/A").await.status(),
            StatusCode::UNAUTHORIZED
        );
        let res = h
            .put_json("/recipes/default/tiddlers/A", r#"{"title":"A"}"#)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let listing = body_bytes(h.get("/recipes/default/tiddlers.json").await).await;
        assert_eq!(listing, b"[]");
        let status = body_json(h.get("/status").await).await;
        assert_eq!(status["read_only"], true);
        assert_eq!(status["anonymous"], false);

        assert_eq!(h.login("alice", "nope").await.status(), StatusCode::UNAUTHORIZED);
        let res = h.login("alice", "secret").await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let token = set_cookie(&res, cookies::SESSION_COOKIE).unwrap();

        let res = h
            .send(
                Request::put("/recipes/default/tiddlers/A")
                    .header(COOKIE, format!("tiddlywiki={token}"))
                    .body(Body::from(r#"{"title":"A","text":"mine"}"#))
                    .unwrap(),
            )
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let stored = h.state.store.get("A").unwrap().unwrap();
        assert_eq!(stored.tiddler.text, "mine");
        assert_eq!(stored.revision, 1);
    }
}
