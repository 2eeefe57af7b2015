use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use rand::RngCore;
use wikid_session::{MemorySessionStore, Session};

use crate::cookies::{self, SetCookies, CSRF_COOKIE, SESSION_COOKIE};
use crate::error::ServerResult;

/// Session key holding the logged-in account name.
pub const ACCOUNT_KEY: &str = "acc";
/// Session key holding the current CSRF token.
pub const CSRF_KEY: &str = "csrf";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
}

impl Identity {
    pub fn user(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Login and anonymous-access policy.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Check credentials. `Ok(None)` means they were rejected.
    async fn login(&self, user: &str, password: &str) -> ServerResult<Option<Identity>>;

    /// Whether visitors without a session may read tiddlers.
    fn allow_anonymous_read(&self) -> bool;

    /// Whether visitors without a session may write tiddlers.
    fn allow_anonymous_edit(&self) -> bool;
}

/// Accepts every login and lets anyone read and write.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllAuth;

#[async_trait]
impl AuthProvider for AllowAllAuth {
    async fn login(&self, user: &str, _password: &str) -> ServerResult<Option<Identity>> {
        Ok(Some(Identity::user(user)))
    }

    fn allow_anonymous_read(&self) -> bool {
        true
    }

    fn allow_anonymous_edit(&self) -> bool {
        true
    }
}

/// Who is making a request, resolved from the session cookie.
#[derive(Clone, Debug, Default)]
pub struct Access {
    pub token: Option<String>,
    pub session: Option<Arc<Session>>,
    pub user: Option<String>,
}

impl Access {
    /// Look up (and renew) the request's session. A live session gets its
    /// cookie refreshed.
    pub fn resolve(sessions: &MemorySessionStore, headers: &HeaderMap, jar: &mut SetCookies) -> Self {
        let Some(token) = cookies::get(headers, SESSION_COOKIE).filter(|t| !t.is_empty()) else {
            return Self::default();
        };
        let Some(session) = sessions.get_or_renew(&token) else {
            return Self::default();
        };
        jar.set(SESSION_COOKIE, &token, sessions.config().ttl_secs, true);
        let user = session.get_str(ACCOUNT_KEY);
        Self {
            token: Some(token),
            session: Some(session),
            user,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    pub fn can_read(&self, auth: &dyn AuthProvider) -> bool {
        self.is_logged_in() || auth.allow_anonymous_read()
    }

    pub fn can_edit(&self, auth: &dyn AuthProvider) -> bool {
        self.is_logged_in() || auth.allow_anonymous_edit()
    }

    /// Issue a new CSRF token for the session, if there is one.
    pub fn refresh_csrf(&self, jar: &mut SetCookies, max_age: u64) -> Option<String> {
        let session = self.session.as_ref()?;
        let token = csrf_token();
        session.set(CSRF_KEY, token.clone());
        jar.set(CSRF_COOKIE, &token, max_age, false);
        Some(token)
    }
}

fn csrf_token() -> String {
    let mut buf = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;
    use axum::http::HeaderValue;
    use wikid_session::{SessionConfig, SystemClock};

    fn sessions() -> MemorySessionStore {
        MemorySessionStore::new(SessionConfig::default(), Arc::new(SystemClock))
    }

    fn with_cookie(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE}={token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn allow_all_accepts_everyone() {
        let auth = AllowAllAuth;
        let id = auth.login("alice", "anything").await.unwrap().unwrap();
        assert_eq!(id.name, "alice");
        assert!(auth.allow_anonymous_read());
        assert!(auth.allow_anonymous_edit());
    }

    #[test]
    fn no_cookie_is_anonymous() {
        let mut jar = SetCookies::new();
        let access = Access::resolve(&sessions(), &HeaderMap::new(), &mut jar);
        assert!(access.session.is_none());
        assert!(!access.is_logged_in());
        assert!(jar.is_empty());
        assert!(access.refresh_csrf(&mut jar, 60).is_none());
    }

    #[test]
    fn unknown_token_is_anonymous() {
        let mut jar = SetCookies::new();
        let access = Access::resolve(&sessions(), &with_cookie("stale"), &mut jar);
        assert!(access.session.is_none());
        assert!(jar.is_empty());
    }

    #[test]
    fn live_session_resolves_user_and_refreshes_cookie() {
        let store = sessions();
        let (token, session) = store.new_token().unwrap();
        session.set(ACCOUNT_KEY, "alice");

        let mut jar = SetCookies::new();
        let access = Access::resolve(&store, &with_cookie(&token), &mut jar);
        assert_eq!(access.user.as_deref(), Some("alice"));
        assert!(jar.iter().any(|c| c.starts_with(&format!("{SESSION_COOKIE}={token}"))));

        let csrf = access.refresh_csrf(&mut jar, 60).unwrap();
        assert_eq!(session.get_str(CSRF_KEY), Some(csrf.clone()));
        assert!(jar.iter().any(|c| c.starts_with(&format!("{CSRF_COOKIE}={csrf}"))));
    }

    #[test]
    fn session_without_account_is_not_logged_in() {
        let store = sessions();
        let (token, _) = store.new_token().unwrap();
        let mut jar = SetCookies::new();
        let access = Access::resolve(&store, &with_cookie(&token), &mut jar);
        assert!(access.session.is_some());
        assert!(!access.is_logged_in());
    }
}
