//! Administrative HTTPS API (JSON bodied).
//!
//! Authenticated with a `Secure` session cookie issued by `/api/login`;
//! every endpoint is confined to LAN-class remotes by the origin gate.
//! The one exception is `/api/password` on an unconfigured host, which
//! bootstraps the admin account.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Extension, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::{json, Value};
use tracing::{info, warn};

use lumen_protocol::clients::{ClientUpdate, CommandEntry};
use lumen_protocol::{apps, crypto, storage, Config, PairedClient, Permissions};

use super::{AdminState, ConnInfo, ExitKind, SessionCookie};

/// Session cookies live for 30 days.
const SESSION_EXPIRE_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/pin", post(save_pin))
        .route("/api/otp", get(request_otp))
        .route("/api/apps", get(get_apps).post(save_app))
        .route("/api/apps/delete", post(delete_app))
        .route("/api/apps/reorder", post(reorder_apps))
        .route("/api/apps/launch", post(launch_app))
        .route("/api/apps/close", post(close_app))
        .route("/api/clients/list", get(list_clients))
        .route("/api/clients/update", post(update_client))
        .route("/api/clients/unpair", post(unpair))
        .route("/api/clients/unpair-all", post(unpair_all))
        .route("/api/clients/disconnect", post(disconnect))
        .route("/api/config", get(get_config).post(save_config))
        .route("/api/password", post(save_password))
        .route("/api/covers/upload", post(upload_cover))
        .route(
            "/api/reset-display-device-persistence",
            post(reset_display_persistence),
        )
        .route("/api/logs", get(get_logs))
        .route("/api/restart", post(restart))
        .route("/api/quit", post(quit))
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> Response {
    json_error(StatusCode::NOT_FOUND, "Not Found")
}

fn json_error(code: StatusCode, message: &str) -> Response {
    (
        code,
        Json(json!({ "status": false, "status_code": code.as_u16(), "error": message })),
    )
        .into_response()
}

fn bad_request(message: impl std::fmt::Display) -> Response {
    json_error(StatusCode::BAD_REQUEST, &message.to_string())
}

fn status_ok() -> Response {
    Json(json!({ "status": true })).into_response()
}

fn cookie_value(headers: &HeaderMap, key: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == key).then(|| value.to_string())
    })
}

fn check_origin(st: &AdminState, conn: &ConnInfo) -> Result<(), Response> {
    let allowed = st.ctx.config.read().unwrap().origin_web_ui_allowed;
    let class = lumen_protocol::config::classify_origin(&conn.remote.ip());
    if class > allowed {
        info!("admin API: [{}] denied by origin policy", conn.remote);
        return Err(json_error(StatusCode::FORBIDDEN, "Forbidden"));
    }
    Ok(())
}

/// Origin gate + session-cookie check.
fn authenticate(st: &AdminState, headers: &HeaderMap, conn: &ConnInfo) -> Result<(), Response> {
    check_origin(st, conn)?;

    if !st.ctx.identity.has_credentials() {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "No credentials configured. Set a password first.",
        ));
    }

    let denied = || json_error(StatusCode::UNAUTHORIZED, "Unauthorized");

    let mut stored = st.cookie.lock().unwrap();
    let Some(session) = stored.as_ref() else {
        return Err(denied());
    };
    if session.created.elapsed() > SESSION_EXPIRE_DURATION {
        *stored = None;
        return Err(denied());
    }

    let Some(raw) = cookie_value(headers, "auth") else {
        return Err(denied());
    };
    let hashed = crypto::hex_string(&crypto::sha256(
        format!("{raw}{}", st.ctx.identity.salt()).as_bytes(),
    ));
    if hashed != session.hashed {
        return Err(denied());
    }
    Ok(())
}

async fn login(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = check_origin(&st, &conn) {
        return denied;
    }
    let username = body.get("username").and_then(Value::as_str).unwrap_or("");
    let password = body.get("password").and_then(Value::as_str).unwrap_or("");

    if !st.ctx.identity.verify_login(username, password) {
        warn!("admin login failed from [{}]", conn.remote);
        return json_error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let raw = match crypto::random_alphabet(64, crypto::DEFAULT_ALPHABET) {
        Ok(raw) => raw,
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let hashed = crypto::hex_string(&crypto::sha256(
        format!("{raw}{}", st.ctx.identity.salt()).as_bytes(),
    ));
    *st.cookie.lock().unwrap() = Some(SessionCookie { hashed, created: Instant::now() });

    (
        [(
            header::SET_COOKIE,
            format!("auth={raw}; Secure; Max-Age=2592000; Path=/"),
        )],
        Json(json!({ "status": true })),
    )
        .into_response()
}

async fn save_password(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    // A configured host requires a valid session; the very first password
    // can be set without one.
    if st.ctx.identity.has_credentials() {
        if let Err(denied) = authenticate(&st, &headers, &conn) {
            return denied;
        }
    } else if let Err(denied) = check_origin(&st, &conn) {
        return denied;
    }

    let field = |key: &str| body.get(key).and_then(Value::as_str).unwrap_or("").to_string();
    let current_username = field("currentUsername");
    let current_password = field("currentPassword");
    let mut new_username = field("newUsername");
    let new_password = field("newPassword");
    let confirm = field("confirmNewPassword");

    if new_username.is_empty() {
        new_username = current_username.clone();
    }
    if new_username.is_empty() {
        return bad_request("Invalid Username");
    }
    if !st
        .ctx
        .identity
        .verify_current_for_change(&current_username, &current_password)
    {
        return bad_request("Invalid Current Credentials");
    }
    if new_password.is_empty() || new_password != confirm {
        return bad_request("Password Mismatch");
    }

    if let Err(e) = st.ctx.identity.save_credentials(
        &st.ctx.paths.credentials,
        &new_username,
        &new_password,
    ) {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    // Force a re-login under the new salt.
    *st.cookie.lock().unwrap() = None;
    status_ok()
}

async fn save_pin(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let pin = body.get("pin").and_then(Value::as_str).unwrap_or("");
    let name = body.get("name").and_then(Value::as_str).unwrap_or("");

    if pin.len() != 4 {
        return bad_request(format!("Pin must be 4 digits, {} provided", pin.len()));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return bad_request("Pin must be numeric");
    }

    let delivered = st.pin_gate.submit(pin, name).is_some();
    Json(json!({ "status": delivered })).into_response()
}

async fn request_otp(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Query(args): Query<std::collections::HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let Some(passphrase) = args.get("passphrase") else {
        return bad_request("Passphrase not provided!");
    };
    if passphrase.len() < 4 {
        return bad_request("Passphrase too short!");
    }
    let device_name = args.get("deviceName").cloned().unwrap_or_default();

    match st.ctx.pairing.request_otp(passphrase, &device_name) {
        Ok(otp) => Json(json!({
            "status": true,
            "otp": otp,
            "ip": conn.local.ip().to_string(),
            "name": st.ctx.config.read().unwrap().host_name,
            "message": "OTP created, effective within 3 minutes.",
        }))
        .into_response(),
        Err(e) => bad_request(e),
    }
}

async fn get_apps(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    match std::fs::read_to_string(&st.ctx.paths.file_apps) {
        Ok(content) => (
            [(header::CONTENT_TYPE, "application/json")],
            content,
        )
            .into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn save_app(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    if let Err(e) = apps::save_app(&st.ctx.paths.file_apps, body) {
        warn!("save app: {e}");
        return bad_request(e);
    }
    // Editing the catalog stops the running app before the reload.
    st.ctx.terminate_app(false, false).await;
    st.ctx.reload_apps().await;
    status_ok()
}

async fn delete_app(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Query(args): Query<std::collections::HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let Some(uuid) = args.get("uuid") else {
        return bad_request("Missing a required parameter to delete app");
    };
    match apps::delete_app(&st.ctx.paths.file_apps, uuid) {
        Ok(_) => {
            st.ctx.reload_apps().await;
            status_ok()
        }
        Err(e) => {
            warn!("delete app: {e}");
            bad_request(e)
        }
    }
}

async fn reorder_apps(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let order: Vec<String> = body
        .get("order")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if order.is_empty() {
        return bad_request("Missing app order");
    }
    match apps::reorder_apps(&st.ctx.paths.file_apps, &order) {
        Ok(()) => {
            st.ctx.reload_apps().await;
            status_ok()
        }
        Err(e) => bad_request(e),
    }
}

async fn launch_app(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Query(args): Query<std::collections::HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let Some(uuid) = args.get("uuid") else {
        return bad_request("Missing a required launch parameter");
    };

    let ctx = Arc::clone(&st.ctx);
    let (app, env) = {
        let catalog = ctx.apps.read().unwrap();
        (
            catalog.find_by_uuid(uuid).cloned(),
            catalog.env.clone(),
        )
    };
    let Some(app) = app else {
        warn!("couldn't find app with uuid [{uuid}]");
        return bad_request("Cannot find requested application");
    };

    info!("launching app [{}] from the admin API", app.name);

    // Host-initiated launch: a synthetic client with full permissions.
    let host_client = PairedClient::new(
        String::new(),
        String::new(),
        ctx.identity.unique_id.clone(),
        Permissions::ALL,
    );
    let mut launch = match super::gamestream::make_launch_session(
        &ctx,
        &args,
        &host_client,
        true,
        false,
    ) {
        Ok(launch) => launch,
        Err(_) => return bad_request("Invalid launch parameters"),
    };

    let no_active = ctx.sessions.count() == 0;
    use lumen_protocol::launcher::LaunchError;
    match ctx.launcher.execute(&app, &mut launch, &env, no_active).await {
        Ok(()) => status_ok(),
        Err(LaunchError::EncoderInit) => bad_request(
            "Failed to initialize video capture/encoding. Is a display connected and turned on?",
        ),
        Err(LaunchError::ProcessStart) => bad_request("Failed to start the specified application"),
    }
}

async fn close_app(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    st.ctx.terminate_app(false, true).await;
    status_ok()
}

async fn list_clients(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let mut connected = st.ctx.sessions.all_uuids();
    let named_certs: Vec<Value> = st
        .ctx
        .clients
        .snapshot()
        .into_iter()
        .map(|client| {
            let is_connected = connected
                .iter()
                .position(|uuid| *uuid == client.uuid)
                .map(|pos| {
                    connected.swap_remove(pos);
                })
                .is_some();
            let mut node = json!({
                "name": client.name,
                "uuid": client.uuid,
                "display_mode": client.display_mode,
                "perm": client.perm.bits(),
                "enable_legacy_ordering": client.enable_legacy_ordering,
                "allow_client_commands": client.allow_client_commands,
                "always_use_virtual_display": client.always_use_virtual_display,
                "connected": is_connected,
            });
            if !client.do_cmds.is_empty() {
                node["do"] = json!(client.do_cmds);
            }
            if !client.undo_cmds.is_empty() {
                node["undo"] = json!(client.undo_cmds);
            }
            node
        })
        .collect();

    Json(json!({ "status": true, "named_certs": named_certs })).into_response()
}

fn command_entries(value: Option<&Value>) -> Vec<CommandEntry> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

async fn update_client(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let Some(uuid) = body.get("uuid").and_then(Value::as_str) else {
        return bad_request("Missing client uuid");
    };
    let Some(existing) = st.ctx.clients.find(uuid) else {
        return Json(json!({ "status": false })).into_response();
    };

    let update = ClientUpdate {
        name: body
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&existing.name)
            .to_string(),
        display_mode: body
            .get("display_mode")
            .and_then(Value::as_str)
            .unwrap_or(&existing.display_mode)
            .to_string(),
        perm: body
            .get("perm")
            .and_then(Value::as_u64)
            .map(|raw| Permissions::from_raw(raw as u32))
            .unwrap_or(existing.perm),
        do_cmds: if body.get("do").is_some() {
            command_entries(body.get("do"))
        } else {
            existing.do_cmds.clone()
        },
        undo_cmds: if body.get("undo").is_some() {
            command_entries(body.get("undo"))
        } else {
            existing.undo_cmds.clone()
        },
        enable_legacy_ordering: body
            .get("enable_legacy_ordering")
            .and_then(Value::as_bool)
            .unwrap_or(existing.enable_legacy_ordering),
        allow_client_commands: body
            .get("allow_client_commands")
            .and_then(Value::as_bool)
            .unwrap_or(existing.allow_client_commands),
        always_use_virtual_display: body
            .get("always_use_virtual_display")
            .and_then(Value::as_bool)
            .unwrap_or(existing.always_use_virtual_display),
    };

    match st.ctx.update_client(uuid, update).await {
        Ok(updated) => Json(json!({ "status": updated })).into_response(),
        Err(e) => bad_request(e),
    }
}

async fn unpair(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let Some(uuid) = body.get("uuid").and_then(Value::as_str) else {
        return bad_request("Missing client uuid");
    };
    match st.ctx.unpair_client(uuid).await {
        Ok(removed) => Json(json!({ "status": removed })).into_response(),
        Err(e) => bad_request(e),
    }
}

async fn unpair_all(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    match st.ctx.unpair_all().await {
        Ok(()) => status_ok(),
        Err(e) => bad_request(e),
    }
}

async fn disconnect(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let Some(uuid) = body.get("uuid").and_then(Value::as_str) else {
        return bad_request("Missing client uuid");
    };
    let stopped = st.ctx.sessions.stop(uuid, true).await;
    Json(json!({ "status": stopped })).into_response()
}

async fn get_config(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let raw = st.ctx.config.read().unwrap().raw.clone();
    let mut body = json!({
        "status": true,
        "platform": std::env::consts::OS,
        "version": lumen_protocol::VERSION,
    });
    for (key, value) in &raw {
        body[key.as_str()] = json!(value);
    }
    Json(body).into_response()
}

async fn save_config(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let Some(map) = body.as_object() else {
        return bad_request("Config body must be an object");
    };

    let mut entries = BTreeMap::new();
    for (key, value) in map {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !value.is_empty() {
            entries.insert(key.clone(), value);
        }
    }

    let config = Config::replace_from_map(entries);
    if let Err(e) = config.save(&st.ctx.paths.config_file) {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    *st.ctx.config.write().unwrap() = config;
    info!("configuration updated; port changes apply after a restart");
    status_ok()
}

fn escape_cover_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

async fn upload_cover(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    let key = body.get("key").and_then(Value::as_str).unwrap_or("");
    if key.is_empty() {
        return bad_request("Cover key is required");
    }
    let url = body.get("url").and_then(Value::as_str).unwrap_or("");

    let path = st
        .ctx
        .paths
        .covers_dir
        .join(format!("{}.png", escape_cover_key(key)));

    let bytes = if !url.is_empty() {
        let host_ok = url::host_is_igdb(url);
        if !host_ok {
            return bad_request("Only images.igdb.com is allowed");
        }
        match reqwest::get(url).await {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(bytes) => bytes.to_vec(),
                Err(_) => return bad_request("Failed to download cover"),
            },
            _ => return bad_request("Failed to download cover"),
        }
    } else {
        let data = body.get("data").and_then(Value::as_str).unwrap_or("");
        match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(_) => return bad_request("Invalid cover data"),
        }
    };

    if let Err(e) = storage::write_atomic(&path, &bytes) {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    Json(json!({ "status": true, "path": path.to_string_lossy() })).into_response()
}

mod url {
    /// Accept only `https://images.igdb.com/...` cover sources.
    pub fn host_is_igdb(url: &str) -> bool {
        url.strip_prefix("https://")
            .map(|rest| {
                rest.split(['/', '?'])
                    .next()
                    .map(|host| host == "images.igdb.com")
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

async fn reset_display_persistence(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    st.ctx.launcher.display().reset_persistence();
    status_ok()
}

async fn get_logs(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    match std::fs::read_to_string(&st.ctx.paths.log_file) {
        Ok(content) => ([(header::CONTENT_TYPE, "text/plain")], content).into_response(),
        Err(_) => ([(header::CONTENT_TYPE, "text/plain")], String::new()).into_response(),
    }
}

async fn restart(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    info!("restart requested from the admin API");
    let _ = st.exit_tx.send(ExitKind::Restart);
    status_ok()
}

async fn quit(
    State(st): State<AdminState>,
    Extension(conn): Extension<ConnInfo>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&st, &headers, &conn) {
        return denied;
    }
    info!("shutdown requested from the admin API");
    let _ = st.exit_tx.send(ExitKind::Quit);
    status_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use lumen_protocol::{Collaborators, Config, HostContext, Paths};

    use crate::backends;
    use crate::web::PinGate;

    fn admin_state() -> (AdminState, mpsc::UnboundedReceiver<ExitKind>, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path().to_path_buf());
        let ctx = HostContext::init(
            paths,
            Config::default(),
            Collaborators {
                display: Arc::new(backends::PassiveDisplayDevice),
                encoders: backends::DefaultEncoderProbe::new(),
                virtual_display_driver: Arc::new(backends::MissingVirtualDisplayDriver),
                clipboard: Arc::new(backends::MemoryClipboard::default()),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            AdminState {
                ctx,
                pin_gate: PinGate::new(),
                cookie: Arc::new(Mutex::new(None)),
                exit_tx,
            },
            exit_rx,
            dir,
        )
    }

    async fn call(
        st: &AdminState,
        method: Method,
        uri: &str,
        body: Option<Value>,
        cookie: Option<&str>,
        remote: &str,
    ) -> (StatusCode, HeaderMap, String) {
        let conn = ConnInfo {
            remote: format!("{remote}:55000").parse().unwrap(),
            local: "192.168.1.2:47990".parse().unwrap(),
        };
        let app = build_router(st.clone()).layer(Extension(conn));

        let mut request = Request::builder().method(method).uri(uri);
        if body.is_some() {
            request = request.header(header::CONTENT_TYPE, "application/json");
        }
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, format!("auth={cookie}"));
        }
        let request = request
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn set_cookie_value(headers: &HeaderMap) -> String {
        let raw = headers
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("Set-Cookie expected");
        raw.strip_prefix("auth=")
            .and_then(|rest| rest.split(';').next())
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn password_bootstrap_then_login_then_authed_call() {
        let (st, _exit, _dir) = admin_state();

        // No credentials yet: authenticated endpoints refuse.
        let (status, _, _) =
            call(&st, Method::GET, "/api/clients/list", None, None, "192.168.1.10").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // First password can be set without a session.
        let (status, _, _) = call(
            &st,
            Method::POST,
            "/api/password",
            Some(json!({ "newUsername": "admin", "newPassword": "hunter2",
                         "confirmNewPassword": "hunter2" })),
            None,
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Wrong password: 401 and no cookie.
        let (status, _, _) = call(
            &st,
            Method::POST,
            "/api/login",
            Some(json!({ "username": "admin", "password": "wrong" })),
            None,
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Correct login issues the auth cookie.
        let (status, headers, _) = call(
            &st,
            Method::POST,
            "/api/login",
            Some(json!({ "username": "Admin", "password": "hunter2" })),
            None,
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cookie = set_cookie_value(&headers);
        assert!(headers
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Secure"));

        // The cookie authenticates follow-up calls.
        let (status, _, body) = call(
            &st,
            Method::GET,
            "/api/clients/list",
            None,
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("named_certs"));

        // A bogus cookie does not.
        let (status, _, _) = call(
            &st,
            Method::GET,
            "/api/clients/list",
            None,
            Some("forged"),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn origin_gate_blocks_wan() {
        let (st, _exit, _dir) = admin_state();
        let (status, _, _) = call(
            &st,
            Method::POST,
            "/api/login",
            Some(json!({ "username": "a", "password": "b" })),
            None,
            "8.8.8.8",
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    async fn logged_in(st: &AdminState) -> String {
        st.ctx
            .identity
            .save_credentials(&st.ctx.paths.credentials, "admin", "hunter2")
            .unwrap();
        let (_, headers, _) = call(
            st,
            Method::POST,
            "/api/login",
            Some(json!({ "username": "admin", "password": "hunter2" })),
            None,
            "192.168.1.10",
        )
        .await;
        set_cookie_value(&headers)
    }

    #[tokio::test]
    async fn pin_endpoint_validates_and_delivers() {
        let (st, _exit, _dir) = admin_state();
        let cookie = logged_in(&st).await;

        // Bad PINs are rejected.
        let (status, _, body) = call(
            &st,
            Method::POST,
            "/api/pin",
            Some(json!({ "pin": "12", "name": "" })),
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("4 digits"));

        let (status, _, _) = call(
            &st,
            Method::POST,
            "/api/pin",
            Some(json!({ "pin": "12ab", "name": "" })),
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // No pairing attempt waiting: status false.
        let (_, _, body) = call(
            &st,
            Method::POST,
            "/api/pin",
            Some(json!({ "pin": "1234", "name": "" })),
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert!(body.contains("false"));

        // With a parked attempt the PIN is delivered.
        let rx = st.pin_gate.park("client-uid");
        let (_, _, body) = call(
            &st,
            Method::POST,
            "/api/pin",
            Some(json!({ "pin": "1234", "name": "Named PC" })),
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert!(body.contains("true"));
        let submission = rx.await.unwrap();
        assert_eq!(submission.pin, "1234");
        assert_eq!(submission.name, "Named PC");
    }

    #[tokio::test]
    async fn otp_requires_passphrase() {
        let (st, _exit, _dir) = admin_state();
        let cookie = logged_in(&st).await;

        let (status, _, _) = call(
            &st,
            Method::GET,
            "/api/otp?passphrase=ab",
            None,
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = call(
            &st,
            Method::GET,
            "/api/otp?passphrase=hunter2&deviceName=Phone",
            None,
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"otp\""));
        assert!(body.contains("3 minutes"));
    }

    #[tokio::test]
    async fn quit_and_restart_signal_exit() {
        let (st, mut exit_rx, _dir) = admin_state();
        let cookie = logged_in(&st).await;

        let (status, _, _) = call(
            &st,
            Method::POST,
            "/api/restart",
            None,
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(exit_rx.recv().await, Some(ExitKind::Restart));

        let (status, _, _) = call(
            &st,
            Method::POST,
            "/api/quit",
            None,
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(exit_rx.recv().await, Some(ExitKind::Quit));
    }

    #[tokio::test]
    async fn password_change_invalidates_session() {
        let (st, _exit, _dir) = admin_state();
        let cookie = logged_in(&st).await;

        let (status, _, _) = call(
            &st,
            Method::POST,
            "/api/password",
            Some(json!({ "currentUsername": "admin", "currentPassword": "hunter2",
                         "newUsername": "admin", "newPassword": "correct horse",
                         "confirmNewPassword": "correct horse" })),
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // The old session cookie is gone.
        let (status, _, _) = call(
            &st,
            Method::GET,
            "/api/clients/list",
            None,
            Some(&cookie),
            "192.168.1.10",
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(st.ctx.identity.verify_login("admin", "correct horse"));
    }

    #[test]
    fn cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "foo=bar; auth=secret-value; other=1".parse().unwrap(),
        );
        assert_eq!(cookie_value(&headers, "auth").as_deref(), Some("secret-value"));
        assert_eq!(cookie_value(&headers, "foo").as_deref(), Some("bar"));
        assert!(cookie_value(&headers, "missing").is_none());
        assert!(cookie_value(&HeaderMap::new(), "auth").is_none());
    }

    #[test]
    fn cover_key_escaping() {
        assert_eq!(escape_cover_key("igdb_1234"), "igdb_1234");
        assert_eq!(escape_cover_key("a/b"), "a%2Fb");
        assert_eq!(escape_cover_key("x y"), "x%20y");
    }

    #[test]
    fn igdb_host_check() {
        assert!(url::host_is_igdb("https://images.igdb.com/igdb/image/upload/x.png"));
        assert!(!url::host_is_igdb("https://evil.example.com/images.igdb.com/x.png"));
        assert!(!url::host_is_igdb("http://images.igdb.com/x.png"));
        assert!(!url::host_is_igdb("https://images.igdb.com.evil.com/x.png"));
    }
}
