//! Minimal cookie handling for the session, first-load and CSRF cookies.

use std::convert::Infallible;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, IntoResponseParts, Response, ResponseParts};

/// Holds the session token.
pub const SESSION_COOKIE: &str = "tiddlywiki";
/// Set by `/status`; the next listing that sees it is a full one.
pub const FIRST_LOAD_COOKIE: &str = "_tiddly";
/// Readable by the page script; echoed back on logout.
pub const CSRF_COOKIE: &str = "csrf_token";

/// Value of the request cookie `name`.
pub fn get(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

/// `Set-Cookie` headers accumulated while handling a request.
#[derive(Clone, Debug, Default)]
pub struct SetCookies(Vec<String>);

impl SetCookies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` for `max_age` seconds, scoped to the whole site.
    pub fn set(&mut self, name: &str, value: &str, max_age: u64, http_only: bool) {
        let mut cookie = format!("{name}={value}; Path=/; Max-Age={max_age}; SameSite=Strict");
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        self.0.push(cookie);
    }

    /// Expire `name` on the client.
    pub fn clear(&mut self, name: &str, http_only: bool) {
        let mut cookie = format!("{name}=; Path=/; Max-Age=0; SameSite=Strict");
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        self.0.push(cookie);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl IntoResponseParts for SetCookies {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        for cookie in self.0 {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                res.headers_mut().append(SET_COOKIE, value);
            }
        }
        Ok(res)
    }
}

impl IntoResponse for SetCookies {
    fn into_response(self) -> Response {
        (self, ()).into_response()
    }
}
