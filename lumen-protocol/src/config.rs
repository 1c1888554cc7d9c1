//! Host configuration.
//!
//! The config file is line-oriented `key = value`. Lines starting with `#`
//! are comments; unknown keys log a warning and are skipped so newer files
//! keep working on older hosts. A handful of structured values (global prep
//! commands, server commands) are JSON arrays embedded in the value.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Default base port. Plain gamestream HTTP listens here; the other
/// listeners are derived offsets of it.
pub const DEFAULT_BASE_PORT: u16 = 47989;

/// Offset of the gamestream TLS listener from the base port.
pub const PORT_HTTPS_OFFSET: i32 = -5;
/// Offset of the admin HTTPS listener from the base port.
pub const PORT_ADMIN_OFFSET: i32 = 1;
/// Offset of the RTSP setup port from the base port.
pub const PORT_RTSP_OFFSET: i32 = 21;

/// How the host treats clients that cannot negotiate GCM encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Encrypt when the client supports it, stream cleartext otherwise.
    Opportunistic,
    /// Reject clients that cannot comply.
    Mandatory,
}

/// HDR handling after a display mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrOption {
    /// Toggle HDR to match the client request.
    Automatic,
    /// Leave the display's HDR state alone (re-toggle to settle it).
    Keep,
}

/// Remote address classes allowed to reach the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    /// Loopback only.
    Pc,
    /// Loopback + RFC1918 ranges.
    Lan,
    /// Anyone.
    Wan,
}

/// A prep command with its paired undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrepCmd {
    #[serde(rename = "do", default)]
    pub do_cmd: String,
    #[serde(rename = "undo", default)]
    pub undo_cmd: String,
    #[serde(default)]
    pub elevated: bool,
}

/// A named command exposed to clients holding `server_cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCmd {
    pub name: String,
    pub cmd: String,
}

/// Filesystem layout for all persistent host state.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub file_state: PathBuf,
    pub file_apps: PathBuf,
    pub credentials: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub covers_dir: PathBuf,
    pub log_file: PathBuf,
}

impl Paths {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            config_file: data_dir.join("lumen.conf"),
            file_state: data_dir.join("state.json"),
            file_apps: data_dir.join("apps.json"),
            credentials: data_dir.join("credentials.json"),
            cert: data_dir.join("cert.pem"),
            key: data_dir.join("key.pem"),
            covers_dir: data_dir.join("covers"),
            log_file: data_dir.join("lumen.log"),
            data_dir,
        }
    }
}

/// Runtime configuration, loaded once at startup and mutable through the
/// admin API (which persists and re-applies it).
#[derive(Debug, Clone)]
pub struct Config {
    /// Host name advertised in `serverinfo`.
    pub host_name: String,
    /// Base port; the other listeners derive from it.
    pub port: u16,
    /// Display output the capture pipeline uses. Rewritten while a virtual
    /// display is active, restored on teardown.
    pub output_name: String,
    /// Fallback "WxHxFPS" mode when a client sends none.
    pub fallback_mode: String,
    /// Always stream through a virtual display, never a physical one.
    pub headless_mode: bool,
    /// Drive the created virtual display at twice the requested refresh.
    pub double_refreshrate: bool,
    /// Rearrange displays so the virtual display is isolated.
    pub isolated_virtual_display: bool,
    pub hdr_option: HdrOption,
    pub encryption_mode: EncryptionMode,
    /// Whether new clients may pair at all.
    pub enable_pairing: bool,
    /// Expose the input-only and terminate pseudo apps.
    pub enable_input_only_mode: bool,
    /// Allow zero-width-space name padding for legacy client sorting.
    pub legacy_ordering: bool,
    /// Emit integer FPS in legacy env vars instead of fractional.
    pub envvar_compatibility_mode: bool,
    /// Read the pairing PIN from stdin instead of parking the request.
    pub pin_stdin: bool,
    /// Remote classes allowed on the admin API.
    pub origin_web_ui_allowed: Origin,
    /// Prep commands applied to every app unless it opts out.
    pub global_prep_cmds: Vec<PrepCmd>,
    /// Commands broadcast to privileged clients in `serverinfo`.
    pub server_cmds: Vec<ServerCmd>,
    /// Gamepad kind forced for sessions ("" = client choice).
    pub gamepad: String,
    /// Whether controller input is enabled at all.
    pub controller: bool,

    // Adaptive bitrate overrides. The shipped defaults match the
    // controller's; the legacy 0.5/2.0 pair is accepted here.
    pub auto_bitrate_min_kbps: u32,
    pub auto_bitrate_max_kbps: u32,
    pub auto_bitrate_decrease_factor: f32,
    pub auto_bitrate_increase_factor: f32,

    /// Raw key/value pairs as loaded, preserved for round-tripping the
    /// admin config editor.
    pub raw: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_name: hostname_or("Lumen"),
            port: DEFAULT_BASE_PORT,
            output_name: String::new(),
            fallback_mode: "1920x1080x60".into(),
            headless_mode: false,
            double_refreshrate: false,
            isolated_virtual_display: false,
            hdr_option: HdrOption::Automatic,
            encryption_mode: EncryptionMode::Opportunistic,
            enable_pairing: true,
            enable_input_only_mode: true,
            legacy_ordering: true,
            envvar_compatibility_mode: false,
            pin_stdin: false,
            origin_web_ui_allowed: Origin::Lan,
            global_prep_cmds: Vec::new(),
            server_cmds: Vec::new(),
            gamepad: String::new(),
            controller: true,
            auto_bitrate_min_kbps: 500,
            auto_bitrate_max_kbps: 150_000,
            auto_bitrate_decrease_factor: 0.8,
            auto_bitrate_increase_factor: 1.2,
            raw: BTreeMap::new(),
        }
    }
}

fn hostname_or(fallback: &str) -> String {
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "on" | "yes" | "1" | "enabled"
    )
}

impl Config {
    /// Load from a `key = value` file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parse config text. Unknown keys warn; malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("config line {} has no '=', skipping: {line:?}", lineno + 1);
                continue;
            };
            config.apply(key.trim(), value.trim());
        }
        config
    }

    /// Apply a single key/value pair.
    pub fn apply(&mut self, key: &str, value: &str) {
        self.raw.insert(key.to_string(), value.to_string());
        match key {
            "sunshine_name" | "host_name" => self.host_name = value.to_string(),
            "port" => match value.parse() {
                Ok(p) => self.port = p,
                Err(_) => warn!("invalid port {value:?}, keeping {}", self.port),
            },
            "output_name" => self.output_name = value.to_string(),
            "fallback_mode" => self.fallback_mode = value.to_string(),
            "headless_mode" => self.headless_mode = parse_bool(value),
            "double_refreshrate" => self.double_refreshrate = parse_bool(value),
            "isolated_virtual_display_option" => {
                self.isolated_virtual_display = parse_bool(value)
            }
            "hdr_option" => {
                self.hdr_option = if value.eq_ignore_ascii_case("keep") {
                    HdrOption::Keep
                } else {
                    HdrOption::Automatic
                }
            }
            "lan_encryption_mode" | "encryption_mode" => {
                self.encryption_mode = match value {
                    "2" | "mandatory" => EncryptionMode::Mandatory,
                    _ => EncryptionMode::Opportunistic,
                }
            }
            "enable_pairing" => self.enable_pairing = parse_bool(value),
            "enable_input_only_mode" => self.enable_input_only_mode = parse_bool(value),
            "legacy_ordering" => self.legacy_ordering = parse_bool(value),
            "envvar_compatibility_mode" => self.envvar_compatibility_mode = parse_bool(value),
            "pin_stdin" => self.pin_stdin = parse_bool(value),
            "origin_web_ui_allowed" => {
                self.origin_web_ui_allowed = match value {
                    "pc" => Origin::Pc,
                    "wan" => Origin::Wan,
                    _ => Origin::Lan,
                }
            }
            "global_prep_cmd" => match serde_json::from_str(value) {
                Ok(cmds) => self.global_prep_cmds = cmds,
                Err(e) => warn!("invalid global_prep_cmd: {e}"),
            },
            "server_cmd" => match serde_json::from_str(value) {
                Ok(cmds) => self.server_cmds = cmds,
                Err(e) => warn!("invalid server_cmd: {e}"),
            },
            "gamepad" => self.gamepad = value.to_string(),
            "controller" => self.controller = parse_bool(value),
            "auto_bitrate_min_kbps" => {
                self.auto_bitrate_min_kbps = value.parse().unwrap_or(self.auto_bitrate_min_kbps)
            }
            "auto_bitrate_max_kbps" => {
                self.auto_bitrate_max_kbps = value.parse().unwrap_or(self.auto_bitrate_max_kbps)
            }
            "auto_bitrate_decrease_factor" => {
                self.auto_bitrate_decrease_factor =
                    value.parse().unwrap_or(self.auto_bitrate_decrease_factor)
            }
            "auto_bitrate_increase_factor" => {
                self.auto_bitrate_increase_factor =
                    value.parse().unwrap_or(self.auto_bitrate_increase_factor)
            }
            _ => warn!("unknown config key {key:?}"),
        }
    }

    /// Persist the raw key/value map back to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for (key, value) in &self.raw {
            let _ = writeln!(out, "{key} = {value}");
        }
        crate::storage::write_atomic(path, out.as_bytes())
    }

    /// Replace the raw map wholesale (admin `POST /api/config`) and
    /// re-apply every entry on top of defaults.
    pub fn replace_from_map(map: BTreeMap<String, String>) -> Self {
        let mut config = Self::default();
        for (key, value) in map {
            config.apply(&key, &value);
        }
        config
    }

    fn offset_port(&self, offset: i32) -> u16 {
        (self.port as i32 + offset) as u16
    }

    /// Plain gamestream HTTP port (the base port).
    pub fn port_http(&self) -> u16 {
        self.port
    }

    /// Gamestream mutual-TLS port.
    pub fn port_https(&self) -> u16 {
        self.offset_port(PORT_HTTPS_OFFSET)
    }

    /// Admin HTTPS port.
    pub fn port_admin(&self) -> u16 {
        self.offset_port(PORT_ADMIN_OFFSET)
    }

    /// RTSP setup port advertised in `sessionUrl0`.
    pub fn port_rtsp(&self) -> u16 {
        self.offset_port(PORT_RTSP_OFFSET)
    }
}

/// Classify a remote IP for the admin origin gate.
pub fn classify_origin(addr: &std::net::IpAddr) -> Origin {
    use std::net::IpAddr;
    if addr.is_loopback() {
        return Origin::Pc;
    }
    match addr {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_link_local() {
                Origin::Lan
            } else {
                Origin::Wan
            }
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                classify_origin(&std::net::IpAddr::V4(v4))
            } else if (v6.segments()[0] & 0xffc0) == 0xfe80 || (v6.segments()[0] & 0xfe00) == 0xfc00
            {
                Origin::Lan
            } else {
                Origin::Wan
            }
        }
    }
}
