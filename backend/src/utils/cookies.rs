use std::str::FromStr;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl FromStr for SameSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lax" => Ok(SameSite::Lax),
            "strict" => Ok(SameSite::Strict),
            "none" => Ok(SameSite::None),
            other => Err(format!("unknown SameSite policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CookieOptions {
    pub secure: bool,
    pub same_site: SameSite,
}

pub const SESSION_COOKIE_NAME: &str = "session_token";
pub const CSRF_COOKIE_NAME: &str = "csrf_token";
pub const COOKIE_PATH: &str = "/";

/// Builds an HttpOnly `Set-Cookie` value scoped to the whole site.
pub fn build_cookie(name: &str, value: &str, max_age: Duration, options: CookieOptions) -> String {
    cookie_string(name, value, max_age, options, true)
}

/// Same as [`build_cookie`] but readable from page script, for the
/// double-submit CSRF cookie.
pub fn build_script_cookie(
    name: &str,
    value: &str,
    max_age: Duration,
    options: CookieOptions,
) -> String {
    cookie_string(name, value, max_age, options, false)
}

fn cookie_string(
    name: &str,
    value: &str,
    max_age: Duration,
    options: CookieOptions,
    http_only: bool,
) -> String {
    let mut cookie = format!(
        "{}={}; Path={}; Max-Age={}",
        name,
        value,
        COOKIE_PATH,
        max_age.as_secs()
    );
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie.push_str("; SameSite=");
    cookie.push_str(same_site_value(options.same_site));
    // Browsers drop SameSite=None cookies that are not Secure.
    if options.secure || options.same_site == SameSite::None {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn build_clear_cookie(name: &str, options: CookieOptions) -> String {
    build_cookie(name, "", Duration::ZERO, options)
}

/// Finds `name` across every `Cookie` header of a request.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|header| extract_cookie_value(header, name))
}

pub fn extract_cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

fn same_site_value(same_site: SameSite) -> &'static str {
    match same_site {
        SameSite::Lax => "Lax",
        SameSite::Strict => "Strict",
        SameSite::None => "None",
    }
}
