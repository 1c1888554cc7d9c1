//! Gamestream control-plane endpoints (XML bodied).
//!
//! The plain listener serves only `serverinfo` and the pairing flow; the
//! mutual-TLS listener serves everything, with the verified paired client
//! attached to each request. Routing is shared: handlers branch on the
//! [`PeerIdentity`] extension instead of being duplicated per listener.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, error, info, warn};

use lumen_protocol::apps::{REMOTE_INPUT_UUID, TERMINATE_APP_UUID};
use lumen_protocol::crypto;
use lumen_protocol::session::bitrate::BitrateParams;
use lumen_protocol::{
    EncryptionMode, HostContext, LaunchSession, OtpOutcome, PairedClient, PairingReply,
    Permissions, StreamConfig,
};

use super::xml::{Element, XmlRoot};
use super::{ConnInfo, GsState, PeerIdentity};

pub fn build_router(state: GsState) -> Router {
    Router::new()
        .route("/serverinfo", get(serverinfo))
        .route("/pair", get(pair))
        .route("/applist", get(applist))
        .route("/appasset", get(appasset))
        .route("/launch", get(launch))
        .route("/resume", get(resume))
        .route("/cancel", get(cancel))
        .route("/actions/clipboard", get(get_clipboard).post(set_clipboard))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> XmlRoot {
    XmlRoot::new(404).http_status(StatusCode::NOT_FOUND)
}

fn unauthorized(path: &str) -> XmlRoot {
    XmlRoot::new(401)
        .attr("query", path)
        .attr(
            "status_message",
            "The client is not authorized. Certificate verification failed.",
        )
}

/// Resolve the verified client, or produce the 401 diagnostic.
fn require_client(identity: &PeerIdentity, path: &str) -> Result<PairedClient, XmlRoot> {
    match identity {
        PeerIdentity::Authenticated(client) => Ok(client.clone()),
        _ => Err(unauthorized(path)),
    }
}

fn local_ip_for_clients(local: IpAddr) -> String {
    // Clients track LAN IPv6 separately and expect an IPv4 here; the
    // loopback placeholder tells them to ignore the field.
    match local {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => "127.0.0.1".to_string(),
        },
    }
}

async fn serverinfo(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
    Extension(conn): Extension<ConnInfo>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlRoot {
    if matches!(identity, PeerIdentity::Unverified) {
        return unauthorized("/serverinfo");
    }
    let ctx = &st.ctx;
    let config = ctx.config.read().unwrap().clone();
    let support = ctx.launcher.encoders().last_support();

    let pair_status = match (&identity, args.contains_key("uniqueid")) {
        (PeerIdentity::Authenticated(_), true) => 1,
        _ => 0,
    };

    let mut root = XmlRoot::new(200)
        .text("hostname", &config.host_name)
        .text("appversion", lumen_protocol::VERSION)
        .text("GfeVersion", lumen_protocol::GFE_VERSION)
        .text("uniqueid", ctx.identity.unique_id.clone())
        .text("HttpsPort", config.port_https())
        .text("ExternalPort", config.port_http())
        .text("MaxLumaPixelsHEVC", support.max_luma_pixels_hevc());

    if let PeerIdentity::Authenticated(client) = &identity {
        root = root.text("mac", super::primary_mac_address());

        if client.perm.check(Permissions::SERVER_CMD) {
            for cmd in &config.server_cmds {
                root = root.text("ServerCommand", &cmd.name);
            }
        } else {
            debug!(
                "ServerCommand list denied for [{}] ({})",
                client.name,
                client.perm.bits()
            );
        }
        root = root.text("Permission", client.perm.bits());

        root = root.text("VirtualDisplayCapable", true);
        let driver_ready = ctx.launcher.vdisplay().status()
            == lumen_protocol::launcher::virtual_display::DriverStatus::Ok;
        if client.perm.check_any(Permissions::ALL_ACTIONS) {
            root = root.text("VirtualDisplayDriverReady", driver_ready);
        } else {
            root = root.text("VirtualDisplayDriverReady", true);
        }
    } else {
        // Placeholder values for the unauthenticated listener.
        root = root.text("mac", "00:00:00:00:00:00").text("Permission", "0");
    }

    root = root
        .text("LocalIP", local_ip_for_clients(conn.local.ip()))
        .text("ServerCodecModeSupport", support.server_codec_mode_flags())
        .text("PairStatus", pair_status);

    if matches!(identity, PeerIdentity::Authenticated(_)) {
        let mut current_appid = ctx.launcher.running().await;
        // With input-only mode, resuming goes through launching the same
        // app again, so only the input-only placeholder is advertised.
        if config.enable_input_only_mode && current_appid != ctx.input_only_app_id() {
            current_appid = 0;
        }
        root = root
            .text("currentgame", current_appid)
            .text("currentgameuuid", ctx.launcher.running_app_uuid().await)
            .text(
                "state",
                if current_appid > 0 { "SUNSHINE_SERVER_BUSY" } else { "SUNSHINE_SERVER_FREE" },
            );
    } else {
        root = root
            .text("currentgame", 0)
            .text("currentgameuuid", "")
            .text("state", "SUNSHINE_SERVER_FREE");
    }

    root
}

fn reply_to_xml(reply: PairingReply) -> XmlRoot {
    let mut root = XmlRoot::new(reply.status_code).text("paired", if reply.paired { 1 } else { 0 });
    if let Some(message) = reply.status_message {
        root = root.attr("status_message", message);
    }
    for (name, value) in reply.fields {
        root = root.text(name, value);
    }
    root
}

async fn pair(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlRoot {
    if matches!(identity, PeerIdentity::Unverified) {
        return unauthorized("/pair");
    }
    let ctx = &st.ctx;
    let (enable_pairing, pin_stdin) = {
        let config = ctx.config.read().unwrap();
        (config.enable_pairing, config.pin_stdin)
    };
    if !enable_pairing {
        return XmlRoot::error(403, "Pairing is disabled for this instance");
    }

    let Some(unique_id) = args.get("uniqueid").cloned() else {
        return XmlRoot::error(400, "Missing uniqueid parameter");
    };

    match args.get("phrase").map(String::as_str) {
        Some("getservercert") => {
            return getservercert(&st, &unique_id, &args, pin_stdin).await;
        }
        Some("pairchallenge") => {
            return XmlRoot::new(200).text("paired", 1);
        }
        _ => {}
    }

    if !ctx.pairing.has_session(&unique_id) {
        return XmlRoot::error(400, "Invalid uniqueid");
    }

    let host_cert = ctx.identity.cert_pem.clone();
    let host_key = ctx.identity.key_pem.clone();
    if let Some(challenge) = args.get("clientchallenge") {
        reply_to_xml(ctx.pairing.client_challenge(&unique_id, challenge, &host_cert))
    } else if let Some(response) = args.get("serverchallengeresp") {
        reply_to_xml(ctx.pairing.server_challenge_resp(&unique_id, response, &host_key))
    } else if let Some(secret) = args.get("clientpairingsecret") {
        let (reply, commit) = ctx.pairing.client_pairing_secret(&unique_id, secret);
        if let Some(commit) = commit {
            // The first client ever paired gets the full mask.
            let perm = if ctx.clients.is_empty() {
                Permissions::ALL
            } else {
                Permissions::DEFAULT
            };
            let client = PairedClient::new(
                commit.name,
                commit.cert_pem,
                uuid::Uuid::new_v4().to_string(),
                perm,
            );
            if let Err(e) = ctx.clients.add(client) {
                error!("couldn't persist paired client: {e}");
            }
        }
        reply_to_xml(reply)
    } else {
        XmlRoot::error(404, "Invalid pairing request")
    }
}

async fn getservercert(
    st: &GsState,
    unique_id: &str,
    args: &HashMap<String, String>,
    pin_stdin: bool,
) -> XmlRoot {
    let ctx = &st.ctx;
    let device_name = args.get("devicename").cloned().unwrap_or_default();
    let (Some(client_cert), Some(salt)) = (args.get("clientcert"), args.get("salt")) else {
        return XmlRoot::error(400, "Missing clientcert or salt parameter");
    };
    if let Err(e) = ctx
        .pairing
        .create_session(unique_id, &device_name, client_cert, salt)
    {
        return XmlRoot::error(400, e.to_string());
    }
    let host_cert = ctx.identity.cert_pem.clone();

    if let Some(otpauth) = args.get("otpauth") {
        return match ctx.pairing.check_otp(unique_id, otpauth) {
            OtpOutcome::Unavailable => XmlRoot::error(503, "OTP auth not available."),
            OtpOutcome::Matched { pin, name_override } => {
                if let Some(name) = name_override {
                    ctx.pairing.override_name(unique_id, &name);
                }
                reply_to_xml(ctx.pairing.getservercert(unique_id, &pin, &host_cert))
            }
            OtpOutcome::Mismatch => {
                // Proceed with a random PIN; the attacker fails at phase
                // four without learning which step tripped.
                let pin = crypto::random_alphabet(16, "0123456789").unwrap_or_default();
                reply_to_xml(ctx.pairing.getservercert(unique_id, &pin, &host_cert))
            }
        };
    }

    if pin_stdin {
        let pin = tokio::task::spawn_blocking(|| {
            use std::io::Write;
            print!("Please insert pin: ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            line.trim().to_string()
        })
        .await
        .unwrap_or_default();
        return reply_to_xml(ctx.pairing.getservercert(unique_id, &pin, &host_cert));
    }

    // Park the response until the admin supplies a PIN.
    info!("pairing attempt from [{device_name}], waiting for PIN");
    let rx = st.pin_gate.park(unique_id);
    match rx.await {
        Ok(submission) => {
            if !submission.name.is_empty() {
                ctx.pairing.override_name(unique_id, &submission.name);
            }
            reply_to_xml(ctx.pairing.getservercert(unique_id, &submission.pin, &host_cert))
        }
        Err(_) => XmlRoot::error(400, "Pairing attempt superseded"),
    }
}

async fn applist(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
) -> XmlRoot {
    let client = match require_client(&identity, "/applist") {
        Ok(client) => client,
        Err(denied) => return denied,
    };
    let ctx = &st.ctx;

    if !client.perm.check_any(Permissions::ALL_ACTIONS) {
        debug!("app list denied for [{}] ({})", client.name, client.perm.bits());
        return XmlRoot::new(200).child(
            Element::new("App")
                .text("IsHdrSupported", 0)
                .text("AppTitle", "Permission Denied")
                .text("UUID", "")
                .text("IDX", "0")
                .text("ID", "114514"),
        );
    }

    let config = ctx.config.read().unwrap().clone();
    let current_appid = ctx.launcher.running().await;
    let input_only_id = ctx.input_only_app_id();
    let terminate_id = ctx.terminate_app_id();
    let hide_inactive =
        config.enable_input_only_mode && current_appid > 0 && current_appid != input_only_id;
    let legacy_ordering = config.legacy_ordering && client.enable_legacy_ordering;

    let hdr_supported = if ctx.launcher.encoders().last_support().hdr_supported() { 1 } else { 0 };

    let apps = ctx.apps.read().unwrap().apps.clone();
    let pad_bits = lumen_protocol::apps::pad_width_for_count(apps.len().max(1));

    let mut root = XmlRoot::new(200);
    for (i, app) in apps.iter().enumerate() {
        let appid = app.numeric_id();
        if hide_inactive {
            if appid != current_appid && appid != input_only_id && appid != terminate_id {
                continue;
            }
        } else if appid == terminate_id {
            continue;
        }

        let title = if legacy_ordering {
            lumen_protocol::apps::pad_for_ordering(&app.name, pad_bits, i)
        } else {
            app.name.clone()
        };

        root = root.child(
            Element::new("App")
                .text("IsHdrSupported", hdr_supported)
                .text("AppTitle", title)
                .text("UUID", &app.uuid)
                .text("IDX", &app.idx)
                .text("ID", &app.id),
        );
    }
    root
}

async fn appasset(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
    Query(args): Query<HashMap<String, String>>,
) -> Response {
    let client = match require_client(&identity, "/appasset") {
        Ok(client) => client,
        Err(denied) => return denied.into_response(),
    };
    if !client.perm.check_any(Permissions::ALL_ACTIONS) {
        debug!("app asset denied for [{}]", client.name);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let appid: i32 = args
        .get("appid")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    let image_path = st.ctx.apps.read().unwrap().app_image(appid);

    match tokio::fs::read(&image_path).await {
        Ok(bytes) => ([(axum::http::header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(e) => {
            warn!("couldn't read app image {}: {e}", image_path.display());
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Build the per-stream launch session from request parameters. Also
/// used by the admin launch endpoint with a synthetic host-side client.
pub(crate) fn make_launch_session(
    ctx: &Arc<HostContext>,
    args: &HashMap<String, String>,
    client: &PairedClient,
    host_audio: bool,
    input_only: bool,
) -> Result<LaunchSession, XmlRoot> {
    let arg = |key: &str, default: &str| {
        args.get(key).cloned().unwrap_or_else(|| default.to_string())
    };
    let int_arg = |key: &str, default: i32| {
        args.get(key).and_then(|raw| raw.parse::<i32>().ok()).unwrap_or(default)
    };

    let mut launch = LaunchSession {
        id: ctx.next_session_id(),
        gcm_key: Vec::new(),
        iv: Vec::new(),
        av_ping_payload: String::new(),
        control_connect_data: 0,
        device_name: if client.name.is_empty() {
            "LumenDisplay".to_string()
        } else {
            client.name.clone()
        },
        unique_id: client.uuid.clone(),
        perm: client.perm,
        host_audio: false,
        width: 0,
        height: 0,
        fps_milli: 0,
        gcmap: int_arg("gcmap", 0),
        surround_info: int_arg("surroundAudioInfo", 196_610),
        surround_params: arg("surroundParams", ""),
        enable_hdr: int_arg("hdrMode", 0) != 0,
        enable_sops: int_arg("sops", 0) != 0,
        virtual_display: int_arg("virtualDisplay", 0) != 0 || client.always_use_virtual_display,
        scale_factor: int_arg("scaleFactor", 100).clamp(1, 400) as u32,
        rtsp_url_scheme: "rtsp://".to_string(),
        client_do_cmds: client.do_cmds.clone(),
        client_undo_cmds: client.undo_cmds.clone(),
        input_only,
    };

    // Admin-initiated launches carry the host's own identity and no
    // stream keys.
    if client.uuid != ctx.identity.unique_id {
        let rikey = args
            .get("rikey")
            .and_then(|raw| crypto::from_hex(raw).ok())
            .ok_or_else(|| XmlRoot::error(400, "Invalid rikey parameter"))?;
        let rikeyid: u32 = args
            .get("rikeyid")
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| XmlRoot::error(400, "Invalid rikeyid parameter"))?;

        launch.gcm_key = rikey;
        launch.host_audio = host_audio;

        // Encrypted RTSP requires a client-reported corever >= 1.
        if int_arg("corever", 0) >= 1 {
            launch.rtsp_url_scheme = "rtspenc://".to_string();
        }

        launch.av_ping_payload =
            crypto::hex_string(&crypto::random_bytes(8).map_err(internal_error)?);
        let mut connect_data = [0u8; 4];
        connect_data.copy_from_slice(&crypto::random_bytes(4).map_err(internal_error)?);
        launch.control_connect_data = u32::from_ne_bytes(connect_data);

        // 16-byte IV with the big-endian key id in front.
        let mut iv = vec![0u8; 16];
        iv[..4].copy_from_slice(&rikeyid.to_be_bytes());
        launch.iv = iv;
    }

    // Client display-mode override beats the request, which beats the
    // configured fallback.
    let (fallback_mode, mode_str);
    {
        let config = ctx.config.read().unwrap();
        fallback_mode = config.fallback_mode.clone();
    }
    if client.display_mode.is_empty() {
        mode_str = arg("mode", &fallback_mode);
        info!("display mode for client [{}] requested to [{mode_str}]", client.name);
    } else {
        mode_str = client.display_mode.clone();
        info!("display mode for client [{}] overridden to [{mode_str}]", client.name);
    }

    let mut parts = mode_str.split('x');
    let parsed = (|| {
        let width: u32 = parts.next()?.parse().ok()?;
        let height: u32 = parts.next()?.parse().ok()?;
        let mut fps: f64 = parts.next()?.parse().ok()?;
        if fps < 1000.0 {
            fps *= 1000.0;
        }
        Some((width, height, fps as u32))
    })();
    let (width, height, fps_milli) = parsed.unwrap_or((1920, 1080, 60_000));
    launch.width = width;
    launch.height = height;
    launch.fps_milli = fps_milli;

    Ok(launch)
}

fn internal_error(e: lumen_protocol::HostError) -> XmlRoot {
    XmlRoot::error(400, e.to_string())
}

fn stream_config_for(ctx: &Arc<HostContext>, launch: &LaunchSession) -> StreamConfig {
    let config = ctx.config.read().unwrap();
    StreamConfig {
        bitrate_kbps: 20_000,
        auto_bitrate: true,
        gcm_enabled: launch.encrypted(),
        bitrate_params: BitrateParams {
            min_kbps: config.auto_bitrate_min_kbps,
            max_kbps: config.auto_bitrate_max_kbps,
            decrease_factor: config.auto_bitrate_decrease_factor,
            increase_factor: config.auto_bitrate_increase_factor,
            ..BitrateParams::default()
        },
    }
}

fn session_url(launch: &LaunchSession, conn: &ConnInfo, rtsp_port: u16) -> String {
    format!(
        "{}{}:{}",
        launch.rtsp_url_scheme,
        local_ip_for_clients(conn.local.ip()),
        rtsp_port
    )
}

fn encryption_rejected() -> XmlRoot {
    XmlRoot::error(
        403,
        "Encryption is mandatory for this host but unsupported by the client",
    )
    .text("gamesession", 0)
}

async fn launch(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
    Extension(conn): Extension<ConnInfo>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlRoot {
    let client = match require_client(&identity, "/launch") {
        Ok(client) => client,
        Err(denied) => return denied,
    };
    let ctx = Arc::clone(&st.ctx);

    let appid_str = args.get("appid").cloned().unwrap_or_else(|| "0".to_string());
    let appuuid = args.get("appuuid").cloned().unwrap_or_default();
    let appid: i32 = appid_str.parse().unwrap_or(0);

    let current_appid = ctx.launcher.running().await;
    let current_uuid = ctx.launcher.running_app_uuid().await;
    let input_only_id = ctx.input_only_app_id();
    let terminate_id = ctx.terminate_app_id();
    let (enable_input_only, encryption_mode) = {
        let config = ctx.config.read().unwrap();
        (config.enable_input_only_mode, config.encryption_mode)
    };
    let is_input_only =
        enable_input_only && (appid == input_only_id || appuuid == REMOTE_INPUT_UUID);

    debug!("launching app [{appid_str}] with UUID [{appuuid}]");

    // Joining a running session only needs view permission.
    let joining_existing = current_appid > 0
        && (appuuid != TERMINATE_APP_UUID || appid != terminate_id)
        && (is_input_only
            || appid == current_appid
            || (!appuuid.is_empty() && appuuid == current_uuid));
    let allowed = if joining_existing {
        client.perm.check_any(Permissions::ALLOW_VIEW)
    } else {
        client.perm.check(Permissions::LAUNCH)
    };
    if !allowed {
        debug!("launch denied for [{}] ({})", client.name, client.perm.bits());
        return XmlRoot::error(403, "Permission denied").text("resume", 0);
    }

    if !args.contains_key("rikey")
        || !args.contains_key("rikeyid")
        || !args.contains_key("localAudioPlayMode")
        || (!args.contains_key("appid") && !args.contains_key("appuuid"))
    {
        return XmlRoot::error(400, "Missing a required launch parameter").text("resume", 0);
    }

    if !is_input_only {
        // The reserved terminate pseudo app stops whatever is running.
        if (enable_input_only && appid == terminate_id) || appuuid == TERMINATE_APP_UUID {
            ctx.terminate_app(false, true).await;
            return XmlRoot::error(410, "App terminated.").text("resume", 0);
        }

        if current_appid > 0
            && current_appid != input_only_id
            && ((appid > 0 && appid != current_appid)
                || (!appuuid.is_empty() && appuuid != current_uuid))
        {
            return XmlRoot::error(400, "An app is already running on this host")
                .text("resume", 0);
        }
    }

    let host_audio = args
        .get("localAudioPlayMode")
        .and_then(|raw| raw.parse::<i32>().ok())
        .unwrap_or(0)
        != 0;
    st.host_audio.store(host_audio, Ordering::Relaxed);

    let mut launch = match make_launch_session(&ctx, &args, &client, host_audio, is_input_only) {
        Ok(launch) => launch,
        Err(denied) => return denied,
    };

    if !launch.encrypted() && encryption_mode == EncryptionMode::Mandatory {
        error!("rejecting client that cannot comply with mandatory encryption");
        return encryption_rejected();
    }

    let no_active_sessions = ctx.sessions.count() == 0;
    // Joining the already-running app is a resume in launch clothing and
    // is flagged as such in the reply.
    let mut resumed = false;

    if is_input_only {
        info!("launching input only session");
        launch.client_do_cmds.clear();
        launch.client_undo_cmds.clear();
        launch.input_only = true;

        // Probe once so a later real launch starts fast; failures are
        // tolerated for input-only.
        if no_active_sessions && !ctx.launcher.virtual_display_active().await {
            let _ = ctx.launcher.encoders().probe();
            if current_appid == 0 {
                ctx.launcher.launch_input_only(input_only_id).await;
            }
        }
    } else if appid > 0 || !appuuid.is_empty() {
        if appid == current_appid || (!appuuid.is_empty() && appuuid == current_uuid) {
            // Same app: behave as a resume, without re-running prep
            // commands.
            debug!("resuming app [{}] from launch path", ctx.launcher.last_run_app_name().await);
            resumed = true;

            if !ctx.launcher.allow_client_commands().await || !client.allow_client_commands {
                launch.client_do_cmds.clear();
                launch.client_undo_cmds.clear();
            }
            if current_appid == input_only_id {
                launch.input_only = true;
            }

            if no_active_sessions && !ctx.launcher.virtual_display_active().await {
                let config = ctx.config.read().unwrap().clone();
                if let Err(e) = ctx.launcher.display().configure(&launch, &config) {
                    warn!("display configuration failed: {e}");
                }
                if ctx.launcher.encoders().probe().is_err() {
                    return XmlRoot::error(
                        503,
                        "Failed to initialize video capture/encoding. Is a display connected and turned on?",
                    )
                    .text("resume", 0);
                }
            }
        } else {
            let (app, env) = {
                let catalog = ctx.apps.read().unwrap();
                let app = catalog
                    .find_by_id(&appid_str)
                    .or_else(|| {
                        if appuuid.is_empty() {
                            None
                        } else {
                            catalog.find_by_uuid(&appuuid)
                        }
                    })
                    .cloned();
                (app, catalog.env.clone())
            };
            let Some(app) = app else {
                error!("couldn't find app with ID [{appid_str}] or UUID [{appuuid}]");
                return XmlRoot::error(404, "Cannot find requested application")
                    .text("gamesession", 0);
            };

            if !app.allow_client_commands {
                launch.client_do_cmds.clear();
                launch.client_undo_cmds.clear();
            }

            use lumen_protocol::launcher::LaunchError;
            match ctx.launcher.execute(&app, &mut launch, &env, no_active_sessions).await {
                Ok(()) => {}
                Err(LaunchError::EncoderInit) => {
                    return XmlRoot::error(
                        503,
                        "Failed to initialize video capture/encoding. Is a display connected and turned on?",
                    )
                    .text("gamesession", 0);
                }
                Err(LaunchError::ProcessStart) => {
                    return XmlRoot::error(400, "Failed to start the specified application")
                        .text("gamesession", 0);
                }
            }
        }
    } else {
        return XmlRoot::error(403, "How did you get here?").text("gamesession", 0);
    }

    let rtsp_port = ctx.config.read().unwrap().port_rtsp();
    let url = session_url(&launch, &conn, rtsp_port);
    ctx.sessions.alloc(stream_config_for(&ctx, &launch), &launch).await;

    let mut root = XmlRoot::new(200).text("sessionUrl0", url).text("gamesession", 1);
    if resumed {
        root = root.text("resume", 1);
    }
    root
}

async fn resume(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
    Extension(conn): Extension<ConnInfo>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlRoot {
    let client = match require_client(&identity, "/resume") {
        Ok(client) => client,
        Err(denied) => return denied,
    };
    let ctx = Arc::clone(&st.ctx);

    if !client.perm.check_any(Permissions::ALLOW_VIEW) {
        debug!("resume denied for [{}] ({})", client.name, client.perm.bits());
        return XmlRoot::error(403, "Permission denied").text("resume", 0);
    }

    let current_appid = ctx.launcher.running().await;
    if current_appid == 0 {
        return XmlRoot::error(503, "No running app to resume").text("resume", 0);
    }

    if !args.contains_key("rikey") || !args.contains_key("rikeyid") {
        return XmlRoot::error(400, "Missing a required resume parameter").text("resume", 0);
    }

    // Newer clients send localAudioPlayMode on resume too; honour it only
    // when no active session could be disturbed.
    let no_active_sessions = ctx.sessions.count() == 0;
    if no_active_sessions {
        if let Some(mode) = args.get("localAudioPlayMode") {
            st.host_audio
                .store(mode.parse::<i32>().unwrap_or(0) != 0, Ordering::Relaxed);
        }
    }
    let host_audio = st.host_audio.load(Ordering::Relaxed);

    let mut launch = match make_launch_session(&ctx, &args, &client, host_audio, false) {
        Ok(launch) => launch,
        Err(denied) => return denied,
    };

    if !ctx.launcher.allow_client_commands().await || !client.allow_client_commands {
        launch.client_do_cmds.clear();
        launch.client_undo_cmds.clear();
    }

    let (enable_input_only, encryption_mode) = {
        let config = ctx.config.read().unwrap();
        (config.enable_input_only_mode, config.encryption_mode)
    };
    if enable_input_only && current_appid == ctx.input_only_app_id() {
        launch.input_only = true;
    }

    if no_active_sessions && !ctx.launcher.virtual_display_active().await {
        // Reconfigure the display before probing: the probe must see the
        // display layout the stream will use.
        let config = ctx.config.read().unwrap().clone();
        if let Err(e) = ctx.launcher.display().configure(&launch, &config) {
            warn!("display configuration failed: {e}");
        }
        if ctx.launcher.encoders().probe().is_err() {
            return XmlRoot::error(
                503,
                "Failed to initialize video capture/encoding. Is a display connected and turned on?",
            )
            .text("resume", 0);
        }
    }

    if !launch.encrypted() && encryption_mode == EncryptionMode::Mandatory {
        error!("rejecting client that cannot comply with mandatory encryption");
        return encryption_rejected();
    }

    let rtsp_port = ctx.config.read().unwrap().port_rtsp();
    let url = session_url(&launch, &conn, rtsp_port);
    ctx.sessions.alloc(stream_config_for(&ctx, &launch), &launch).await;

    info!("client [{}] resumed [{}]", client.name, ctx.launcher.last_run_app_name().await);
    XmlRoot::new(200).text("sessionUrl0", url).text("resume", 1)
}

async fn cancel(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
) -> XmlRoot {
    let client = match require_client(&identity, "/cancel") {
        Ok(client) => client,
        Err(denied) => return denied,
    };
    let ctx = &st.ctx;

    if !client.perm.check(Permissions::LAUNCH) {
        debug!("cancel denied for [{}] ({})", client.name, client.perm.bits());
        return XmlRoot::error(403, "Permission denied").text("resume", 0);
    }

    ctx.sessions.terminate_all().await;
    if ctx.launcher.running().await > 0 {
        ctx.terminate_app(false, true).await;
    }
    // The display configuration must be reverted even when no app was
    // being tracked anymore.
    ctx.launcher.display().revert();

    XmlRoot::new(200).text("cancel", 1)
}

async fn get_clipboard(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
    Query(args): Query<HashMap<String, String>>,
) -> Response {
    let client = match require_client(&identity, "/actions/clipboard") {
        Ok(client) => client,
        Err(denied) => return denied.into_response(),
    };

    if !client.perm.check_any(Permissions::ALLOW_VIEW)
        || !client.perm.check(Permissions::CLIPBOARD_READ)
    {
        debug!("clipboard read denied for [{}]", client.name);
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if args.get("type").map(String::as_str) != Some("text") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if !st.ctx.sessions.all_uuids().contains(&client.uuid) {
        debug!("client [{}] reading clipboard is not connected to a stream", client.name);
        return StatusCode::FORBIDDEN.into_response();
    }

    match st.ctx.clipboard.get_text() {
        Ok(content) => content.into_response(),
        Err(e) => {
            warn!("clipboard read failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn set_clipboard(
    State(st): State<GsState>,
    Extension(identity): Extension<PeerIdentity>,
    Query(args): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let client = match require_client(&identity, "/actions/clipboard") {
        Ok(client) => client,
        Err(denied) => return denied.into_response(),
    };

    if !client.perm.check_any(Permissions::ALLOW_VIEW)
        || !client.perm.check(Permissions::CLIPBOARD_SET)
    {
        debug!("clipboard write denied for [{}]", client.name);
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if args.get("type").map(String::as_str) != Some("text") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if !st.ctx.sessions.all_uuids().contains(&client.uuid) {
        debug!("client [{}] setting clipboard is not connected to a stream", client.name);
        return StatusCode::FORBIDDEN.into_response();
    }

    match st.ctx.clipboard.set_text(&body) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!("clipboard write failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use lumen_protocol::{Collaborators, Config, Paths};

    use crate::backends;
    use crate::web::PinGate;

    async fn state() -> (GsState, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path().to_path_buf());
        let mut config = Config::default();
        config.host_name = "Test Host".into();
        config.enable_input_only_mode = false;

        let ctx = HostContext::init(
            paths,
            config,
            Collaborators {
                display: Arc::new(backends::PassiveDisplayDevice),
                encoders: backends::DefaultEncoderProbe::new(),
                virtual_display_driver: Arc::new(backends::MissingVirtualDisplayDriver),
                clipboard: Arc::new(backends::MemoryClipboard::default()),
            },
            Duration::from_secs(5),
        )
        .unwrap();

        (
            GsState {
                ctx,
                pin_gate: PinGate::new(),
                host_audio: Arc::new(AtomicBool::new(false)),
            },
            dir,
        )
    }

    fn paired(perm: Permissions) -> PeerIdentity {
        PeerIdentity::Authenticated(PairedClient::new(
            "Test Client".into(),
            String::new(),
            "cccccccc-cccc-cccc-cccc-cccccccccccc".into(),
            perm,
        ))
    }

    fn conn() -> ConnInfo {
        ConnInfo {
            remote: "192.168.1.50:40000".parse().unwrap(),
            local: "192.168.1.2:47989".parse().unwrap(),
        }
    }

    async fn call(st: &GsState, identity: PeerIdentity, uri: &str) -> (StatusCode, String) {
        let app = build_router(st.clone())
            .layer(Extension(identity))
            .layer(Extension(conn()));
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn launch_uri(appuuid: &str) -> String {
        format!(
            "/launch?rikey=000102030405060708090a0b0c0d0e0f&rikeyid=1&localAudioPlayMode=0\
             &appuuid={appuuid}&mode=1920x1080x60&sops=1&corever=1"
        )
    }

    #[tokio::test]
    async fn serverinfo_anonymous_uses_placeholders() {
        let (st, _dir) = state().await;
        let (status, body) = call(&st, PeerIdentity::Anonymous, "/serverinfo").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<hostname>Test Host</hostname>"));
        assert!(body.contains("<mac>00:00:00:00:00:00</mac>"));
        assert!(body.contains("<PairStatus>0</PairStatus>"));
        assert!(body.contains("<Permission>0</Permission>"));
        assert!(body.contains("SUNSHINE_SERVER_FREE"));
    }

    #[tokio::test]
    async fn serverinfo_unverified_cert_is_401() {
        let (st, _dir) = state().await;
        let (_, body) = call(&st, PeerIdentity::Unverified, "/serverinfo").await;
        assert!(body.contains("status_code=\"401\""));
        assert!(body.contains("Certificate verification failed"));
    }

    #[tokio::test]
    async fn applist_respects_permissions() {
        let (st, _dir) = state().await;

        let (_, body) = call(&st, paired(Permissions::DEFAULT), "/applist").await;
        assert!(body.contains("Desktop"));
        assert!(!body.contains("Permission Denied"));

        let (_, body) = call(&st, paired(Permissions::empty()), "/applist").await;
        assert!(body.contains("Permission Denied"));
        assert!(body.contains("<ID>114514</ID>"));
    }

    #[tokio::test]
    async fn launch_conflict_and_resume_flags() {
        let (st, _dir) = state().await;
        let desktop_uuid = st.ctx.apps.read().unwrap().apps[0].uuid.clone();

        // First launch starts the (placebo) desktop app.
        let (_, body) = call(&st, paired(Permissions::ALL), &launch_uri(&desktop_uuid)).await;
        assert!(body.contains("<gamesession>1</gamesession>"), "{body}");
        assert!(body.contains("sessionUrl0"));
        assert!(body.contains("rtspenc://"));

        // A different app while one runs: explicit conflict.
        let (_, body) = call(
            &st,
            paired(Permissions::ALL),
            &launch_uri("dddddddd-dddd-dddd-dddd-dddddddddddd"),
        )
        .await;
        assert!(body.contains("status_code=\"400\""));
        assert!(body.contains("An app is already running on this host"));

        // Launching the same app again behaves as a resume.
        let (_, body) = call(&st, paired(Permissions::ALL), &launch_uri(&desktop_uuid)).await;
        assert!(body.contains("status_code=\"200\""));
        assert!(body.contains("<resume>1</resume>"));

        st.ctx.shutdown().await;
    }

    #[tokio::test]
    async fn launch_without_permission_is_403() {
        let (st, _dir) = state().await;
        let desktop_uuid = st.ctx.apps.read().unwrap().apps[0].uuid.clone();
        let (_, body) = call(&st, paired(Permissions::DEFAULT), &launch_uri(&desktop_uuid)).await;
        assert!(body.contains("status_code=\"403\""));
        assert!(body.contains("Permission denied"));
    }

    #[tokio::test]
    async fn launch_missing_params_is_400() {
        let (st, _dir) = state().await;
        let (_, body) = call(
            &st,
            paired(Permissions::ALL),
            "/launch?appuuid=eeeeeeee-eeee-eeee-eeee-eeeeeeeeeeee",
        )
        .await;
        assert!(body.contains("Missing a required launch parameter"));
    }

    #[tokio::test]
    async fn resume_without_running_app_is_503() {
        let (st, _dir) = state().await;
        let (_, body) = call(
            &st,
            paired(Permissions::ALL),
            "/resume?rikey=000102030405060708090a0b0c0d0e0f&rikeyid=1",
        )
        .await;
        assert!(body.contains("status_code=\"503\""));
        assert!(body.contains("No running app to resume"));
    }

    #[tokio::test]
    async fn mandatory_encryption_rejects_legacy_clients() {
        let (st, _dir) = state().await;
        st.ctx.config.write().unwrap().encryption_mode =
            lumen_protocol::EncryptionMode::Mandatory;
        let desktop_uuid = st.ctx.apps.read().unwrap().apps[0].uuid.clone();

        // corever=0: no GCM capability.
        let uri = format!(
            "/launch?rikey=000102030405060708090a0b0c0d0e0f&rikeyid=1&localAudioPlayMode=0\
             &appuuid={desktop_uuid}&mode=1920x1080x60&corever=0"
        );
        let (_, body) = call(&st, paired(Permissions::ALL), &uri).await;
        assert!(body.contains("status_code=\"403\""));
        assert!(body.contains("<gamesession>0</gamesession>"));
    }

    #[tokio::test]
    async fn clipboard_requires_connected_session() {
        let (st, _dir) = state().await;
        let perm = Permissions::VIEW | Permissions::LIST | Permissions::CLIPBOARD_READ;
        let (status, _) = call(&st, paired(perm), "/actions/clipboard?type=text").await;
        // Permitted but not streaming: forbidden.
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &st,
            paired(Permissions::DEFAULT),
            "/actions/clipboard?type=text",
        )
        .await;
        // Missing the clipboard permission entirely.
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cancel_requires_launch_permission() {
        let (st, _dir) = state().await;
        let (_, body) = call(&st, paired(Permissions::DEFAULT), "/cancel").await;
        assert!(body.contains("status_code=\"403\""));

        let (_, body) = call(&st, paired(Permissions::ALL), "/cancel").await;
        assert!(body.contains("<cancel>1</cancel>"));
    }

    #[tokio::test]
    async fn unknown_route_is_xml_404() {
        let (st, _dir) = state().await;
        let (status, body) = call(&st, PeerIdentity::Anonymous, "/nonsense").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("status_code=\"404\""));
    }
}
