use std::net::SocketAddr;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Path, State as StateE},
    http::HeaderMap,
    routing::get,
};
use log::debug;

use crate::{
    Result, State,
    captcha::CaptchaForm,
    instances::{self, Instance},
};

async fn get_instance(
    StateE(state): StateE<State>,
    Path(challenge_name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Instance>> {
    let session = state.auth.authenticate(&headers, &state.tokens).await?;
    let instance = instances::get_instance(&state, &challenge_name, &session.team_id).await?;
    Ok(Json(instance))
}

async fn start_instance(
    StateE(state): StateE<State>,
    Path(challenge_name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Instance>> {
    let session = state.auth.authenticate(&headers, &state.tokens).await?;
    let remote_ip = client_ip(state.config.use_proxy_headers, &headers, addr);
    parse_captcha_form(&body)
        .validate(&state.config, &state.http, remote_ip.as_deref())
        .await?;

    debug!(
        "Starting instance challenge={challenge_name} team={}",
        session.team_id
    );
    let instance = instances::start_instance(&state, &challenge_name, &session.team_id).await?;
    Ok(Json(instance))
}

async fn stop_instance(
    StateE(state): StateE<State>,
    Path(challenge_name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Instance>> {
    let session = state.auth.authenticate(&headers, &state.tokens).await?;
    let remote_ip = client_ip(state.config.use_proxy_headers, &headers, addr);
    parse_captcha_form(&body)
        .validate(&state.config, &state.http, remote_ip.as_deref())
        .await?;

    debug!(
        "Stopping instance challenge={challenge_name} team={}",
        session.team_id
    );
    let instance = instances::stop_instance(&state, &challenge_name, &session.team_id).await?;
    Ok(Json(instance))
}

// The captcha form rides in an optional JSON body; a missing or unreadable
// body is the same as an empty form.
fn parse_captcha_form(body: &Bytes) -> CaptchaForm {
    if body.is_empty() {
        return CaptchaForm::default();
    }
    serde_json::from_slice(body).unwrap_or_default()
}

fn client_ip(use_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> Option<String> {
    if use_proxy_headers {
        let forwarded = headers.get("x-forwarded-for")?.to_str().ok()?;
        return forwarded.split(',').next().map(|ip| ip.trim().to_owned());
    }
    Some(addr.ip().to_string())
}

pub fn router() -> Router<State> {
    Router::new().route(
        "/v1/instances/{challenge_name}",
        get(get_instance).put(start_instance).delete(stop_instance),
    )
}
