//! Lumen game-streaming host daemon.
//!
//! Wires the host context to three listeners: plain gamestream HTTP
//! (pairing + serverinfo), mutual-TLS gamestream HTTPS, and the admin
//! HTTPS API. Shuts down on SIGINT or an admin request, with exit codes
//! telling the supervisor whether to respawn.

mod backends;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use lumen_protocol::{Collaborators, Config, HostContext, Paths};

use web::{AdminState, ExitKind, GsState, PinGate};

/// Clean shutdown; the supervisor may respawn.
const EXIT_CLEAN: i32 = 0;
/// Shutdown in progress; the supervisor must not respawn.
const EXIT_SHUTDOWN_IN_PROGRESS: i32 = 2;
/// Restart requested; the supervisor should respawn immediately.
const EXIT_RESTART: i32 = 3;

/// Watchdog timeout for the virtual-display driver.
const VDISPLAY_PING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "lumen", about = "Game-streaming host")]
struct Args {
    /// Config file (defaults to <data-dir>/lumen.conf)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State directory (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Read pairing PINs from stdin instead of the admin API
    #[arg(long)]
    pin_stdin: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    let data_dir = args
        .data_dir
        .or_else(|| dirs::data_dir().map(|dir| dir.join("lumen")))
        .unwrap_or_else(|| PathBuf::from("lumen-data"));
    let paths = Paths::new(data_dir);

    let config_file = args.config.unwrap_or_else(|| paths.config_file.clone());
    let mut config = Config::load(&config_file).context("loading configuration")?;
    if args.pin_stdin {
        config.pin_stdin = true;
    }

    info!("starting Lumen host [{}]", config.host_name);
    let (port_http, port_https, port_admin) =
        (config.port_http(), config.port_https(), config.port_admin());

    let ctx = HostContext::init(
        paths,
        config,
        Collaborators {
            display: Arc::new(backends::PassiveDisplayDevice),
            encoders: backends::DefaultEncoderProbe::new(),
            virtual_display_driver: Arc::new(backends::MissingVirtualDisplayDriver),
            clipboard: Arc::new(backends::MemoryClipboard::default()),
        },
        VDISPLAY_PING_TIMEOUT,
    )
    .context("initializing host context")?;

    let pin_gate = PinGate::new();
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

    // One gamestream router serves both transports; the per-connection
    // peer identity decides what each request may do.
    let gs_state = GsState {
        ctx: Arc::clone(&ctx),
        pin_gate: Arc::clone(&pin_gate),
        host_audio: Arc::new(AtomicBool::new(false)),
    };
    let gs_router = web::gamestream::build_router(gs_state);

    let admin_state = AdminState {
        ctx: Arc::clone(&ctx),
        pin_gate,
        cookie: Arc::new(Mutex::new(None)),
        exit_tx,
    };
    let admin_router = web::admin::build_router(admin_state);

    let gs_acceptor = Arc::new(
        web::build_tls_acceptor(&ctx.identity.cert_pem, &ctx.identity.key_pem, true)
            .context("building gamestream TLS acceptor")?,
    );
    let admin_acceptor = Arc::new(
        web::build_tls_acceptor(&ctx.identity.cert_pem, &ctx.identity.key_pem, false)
            .context("building admin TLS acceptor")?,
    );

    let bind = |port: u16| SocketAddr::from(([0, 0, 0, 0], port));
    let plain_listener = TcpListener::bind(bind(port_http))
        .await
        .with_context(|| format!("binding plain listener on port {port_http}"))?;
    let tls_listener = TcpListener::bind(bind(port_https))
        .await
        .with_context(|| format!("binding TLS listener on port {port_https}"))?;
    let admin_listener = TcpListener::bind(bind(port_admin))
        .await
        .with_context(|| format!("binding admin listener on port {port_admin}"))?;

    info!("gamestream on :{port_http} (plain) and :{port_https} (TLS), admin API on :{port_admin}");

    tokio::spawn(web::serve_plain(plain_listener, gs_router.clone()));
    tokio::spawn(web::serve_tls(
        tls_listener,
        gs_acceptor,
        gs_router,
        Arc::clone(&ctx),
        true,
    ));
    tokio::spawn(web::serve_tls(
        admin_listener,
        admin_acceptor,
        admin_router,
        Arc::clone(&ctx),
        false,
    ));

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            EXIT_CLEAN
        }
        kind = exit_rx.recv() => match kind {
            Some(ExitKind::Quit) => EXIT_SHUTDOWN_IN_PROGRESS,
            Some(ExitKind::Restart) => EXIT_RESTART,
            None => EXIT_CLEAN,
        },
    };

    ctx.shutdown().await;
    info!("shutdown complete");
    Ok(code)
}
