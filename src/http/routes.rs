//! Route handlers.

use axum::extract::{Form, Query, RawQuery, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::error::error_body;
use super::AppState;
use crate::auth::{LogoutDispatch, LogoutOutcome, HOME_PATH, LOGIN_PATH};
use crate::directory::{notify_in_background, User};
use crate::saml::error::malformed;
use crate::saml::{AuthError, AuthResult, InboundMessage, MessageParam, RedirectQuery};
use crate::session::Session;

pub fn router(state: AppState) -> Router {
    let config = state.flow.provider().config();
    let acs_path = config.acs_path();
    let slo_path = config.slo_path();

    Router::new()
        .route(HOME_PATH, get(home))
        .route(LOGIN_PATH, get(login))
        .route(&acs_path, post(assertion_consumer))
        .route(&slo_path, get(logout_redirect).post(logout_post))
        .route("/saml/metadata", get(metadata))
        .route("/api/me", get(me))
        .route("/give_star", post(give_star))
        .with_state(state)
}

/// 302, not the 303 `Redirect::to` sends.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

fn found_with_cookie(location: &str, cookie: String) -> Response {
    (
        StatusCode::FOUND,
        [(LOCATION, location.to_string()), (SET_COOKIE, cookie)],
    )
        .into_response()
}

fn session_of(state: &AppState, headers: &HeaderMap) -> AuthResult<Option<Session>> {
    state.flow.current_session(state.cookies.session_token(headers))
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    next: Option<String>,
}

async fn login(State(state): State<AppState>, Query(query): Query<LoginQuery>) -> AuthResult<Response> {
    let redirect_url = state.flow.login(query.next.as_deref())?;
    Ok(found(&redirect_url))
}

#[derive(Debug, Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: Option<String>,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
}

async fn assertion_consumer(
    State(state): State<AppState>,
    Form(form): Form<AcsForm>,
) -> AuthResult<Response> {
    let saml_response = form
        .saml_response
        .ok_or_else(|| AuthError::Validation(malformed("missing SAMLResponse")))?;

    let outcome = state
        .flow
        .assertion_consumer(&saml_response, form.relay_state.as_deref())?;
    Ok(found_with_cookie(
        &outcome.redirect_url,
        state.cookies.build_cookie(&outcome.session.token),
    ))
}

fn logout_response(state: &AppState, outcome: LogoutOutcome) -> Response {
    if outcome.clear_cookie {
        found_with_cookie(&outcome.redirect_url, state.cookies.clear_cookie())
    } else {
        found(&outcome.redirect_url)
    }
}

async fn logout_redirect(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> AuthResult<Response> {
    let query = RedirectQuery::parse(raw.as_deref().unwrap_or(""));
    let message = InboundMessage::Redirect(&query);
    let dispatch = match query.message() {
        Some((MessageParam::Response, _)) => LogoutDispatch::Complete(message),
        Some((MessageParam::Request, _)) => LogoutDispatch::IdpInitiated {
            message,
            relay_state: query.relay_state(),
        },
        None => LogoutDispatch::Initiate,
    };

    let token = state.cookies.session_token(&headers);
    let outcome = state.flow.logout(token, dispatch)?;
    Ok(logout_response(&state, outcome))
}

async fn logout_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> AuthResult<Response> {
    let relay_state = form.get("RelayState").map(String::as_str).filter(|rs| !rs.is_empty());
    let dispatch = if let Some(request) = form.get(MessageParam::Request.name()) {
        LogoutDispatch::IdpInitiated {
            message: InboundMessage::Post(request),
            relay_state,
        }
    } else if let Some(response) = form.get(MessageParam::Response.name()) {
        LogoutDispatch::Complete(InboundMessage::Post(response))
    } else {
        LogoutDispatch::Initiate
    };

    let token = state.cookies.session_token(&headers);
    let outcome = state.flow.logout(token, dispatch)?;
    Ok(logout_response(&state, outcome))
}

async fn metadata(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, "application/samlmetadata+xml")],
        state.flow.provider().metadata(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct Person {
    email: String,
    display_name: String,
}

impl From<User> for Person {
    fn from(user: User) -> Self {
        Self {
            email: user.email,
            display_name: user.display_name,
        }
    }
}

#[derive(Debug, Serialize)]
struct HomePage {
    user: Person,
    stars_received: usize,
    colleagues: Vec<Person>,
}

async fn home(State(state): State<AppState>, headers: HeaderMap) -> AuthResult<Response> {
    let Some(session) = session_of(&state, &headers)? else {
        return Ok(found(LOGIN_PATH));
    };

    let email = session.name_id();
    let user = state
        .directory
        .get_user(email)
        .map_err(AuthError::Storage)?
        .map(Person::from)
        .unwrap_or_else(|| Person {
            email: email.to_string(),
            display_name: session.claims.display_name(),
        });
    let stars_received = state
        .directory
        .stars_received(email)
        .map_err(AuthError::Storage)?
        .len();
    let colleagues = state
        .directory
        .list_colleagues(email)
        .map_err(AuthError::Storage)?
        .into_iter()
        .map(Person::from)
        .collect();

    Ok(Json(HomePage {
        user,
        stars_received,
        colleagues,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
struct Me {
    email: String,
    display_name: String,
    session_index: Option<String>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> AuthResult<Response> {
    let Some(session) = session_of(&state, &headers)? else {
        return Ok(error_body(StatusCode::UNAUTHORIZED, "unauthenticated"));
    };
    Ok(Json(Me {
        email: session.name_id().to_string(),
        display_name: session.claims.display_name(),
        session_index: session.claims.session_index.clone(),
        expires_at: session.expires_at,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct GiveStarForm {
    receiver_email: String,
}

async fn give_star(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<GiveStarForm>,
) -> AuthResult<Response> {
    let Some(session) = session_of(&state, &headers)? else {
        return Ok(found(LOGIN_PATH));
    };
    let giver = session.name_id();
    let receiver_email = form.receiver_email.trim();

    if let Err(e) = state.directory.give_star(giver, receiver_email) {
        debug!(giver = %giver, receiver = %receiver_email, error = %e, "Star refused");
        return Ok(e.into_response());
    }

    if let Some(receiver) = state.directory.get_user(receiver_email).map_err(AuthError::Storage)? {
        notify_in_background(state.notifier.clone(), receiver, session.claims.display_name());
    }
    Ok(found(HOME_PATH))
}
