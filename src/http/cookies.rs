//! Session cookie handling.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;

use crate::session::SessionToken;

pub const DEFAULT_COOKIE_NAME: &str = "gold_star_session";

#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub name: String,
    pub path: String,
    /// Set the Secure flag. Only disable for plain-HTTP development.
    pub secure: bool,
    pub max_age_secs: u64,
}

impl CookieSettings {
    pub fn new(secure: bool, max_age_secs: u64) -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_string(),
            path: "/".to_string(),
            secure,
            max_age_secs,
        }
    }

    /// `Set-Cookie` value carrying a session token.
    ///
    /// SameSite=Lax so the cookie survives the top-level redirect back from
    /// the IdP.
    pub fn build_cookie(&self, token: &SessionToken) -> String {
        self.render(&token.to_hex(), self.max_age_secs)
    }

    /// `Set-Cookie` value that expires the session cookie.
    pub fn clear_cookie(&self) -> String {
        self.render("", 0)
    }

    fn render(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}; Path={}", self.name, value, self.path);
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str("; HttpOnly; SameSite=Lax");
        cookie.push_str(&format!("; Max-Age={}", max_age));
        cookie
    }

    /// Session token from the request's `Cookie` headers.
    ///
    /// Malformed values are ignored as if absent.
    pub fn session_token(&self, headers: &HeaderMap) -> Option<SessionToken> {
        let prefix = format!("{}=", self.name);
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|header| header.split(';'))
            .filter_map(|part| part.trim().strip_prefix(prefix.as_str()))
            .find_map(SessionToken::from_hex)
    }
}
