//! Application catalog.
//!
//! `apps.json` carries a `version` integer; version 1 files stored
//! booleans and integers as strings and lacked per-app UUIDs, so loading
//! always runs the v1 → v2 migration first. Parsing is tolerant: up to
//! three re-migration attempts from version 0, then a synthetic
//! "Desktop (fallback)" entry so the host never comes up empty.
//!
//! App ids are stable across restarts: CRC-32 of `name ‖ sha256(image)`,
//! truncated to the signed 32-bit range (client limitation), with the
//! catalog index appended before hashing when two apps would collide.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{Config, PrepCmd};
use crate::crypto;
use crate::error::{HostError, Result};
use crate::storage;

pub const VIRTUAL_DISPLAY_UUID: &str = "8902CB19-674A-403D-A587-41B092E900BA";
pub const FALLBACK_DESKTOP_UUID: &str = "EAAC6159-089A-46A9-9E24-6436885F6610";
pub const REMOTE_INPUT_UUID: &str = "8CB5C136-DA67-4F99-B4A1-F9CD35005CF4";
pub const TERMINATE_APP_UUID: &str = "E16CBE1B-295D-4632-9A76-EC4180C857D3";

const APPS_VERSION: i64 = 2;
const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One launchable application.
#[derive(Debug, Clone, PartialEq)]
pub struct App {
    /// Position in the catalog, as a string for the wire.
    pub idx: String,
    pub uuid: String,
    pub name: String,
    /// Main command; empty means "stream the desktop" (placebo).
    pub cmd: String,
    pub working_dir: String,
    pub output: String,
    pub image_path: String,
    /// Stable CRC-derived id, decimal string.
    pub id: String,
    /// Gamepad override: empty (client choice), "disabled", or a kind.
    pub gamepad: String,
    pub elevated: bool,
    pub auto_detach: bool,
    pub wait_all: bool,
    pub virtual_display: bool,
    pub use_app_identity: bool,
    pub per_client_app_identity: bool,
    pub allow_client_commands: bool,
    pub scale_factor: u32,
    pub exit_timeout: Duration,
    pub prep_cmds: Vec<PrepCmd>,
    pub detached: Vec<String>,
}

impl App {
    fn reserved(idx: usize, uuid: &str, name: &str, image: &str) -> Self {
        Self {
            idx: idx.to_string(),
            uuid: uuid.to_string(),
            name: name.to_string(),
            cmd: String::new(),
            working_dir: String::new(),
            output: String::new(),
            image_path: image.to_string(),
            id: String::new(),
            gamepad: String::new(),
            elevated: false,
            auto_detach: true,
            wait_all: false,
            virtual_display: false,
            use_app_identity: false,
            per_client_app_identity: false,
            allow_client_commands: false,
            scale_factor: 100,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
            prep_cmds: Vec::new(),
            detached: Vec::new(),
        }
    }

    pub fn numeric_id(&self) -> i32 {
        self.id.parse().unwrap_or(0)
    }
}

/// Parsed catalog plus the global launch environment.
pub struct AppCatalog {
    pub apps: Vec<App>,
    pub env: HashMap<String, String>,
    /// Id of the "Remote Input" pseudo app, `-1` when disabled.
    pub input_only_app_id: i32,
    /// Id of the "Terminate" pseudo app, `-1` when disabled.
    pub terminate_app_id: i32,
    assets_dir: PathBuf,
}

impl AppCatalog {
    pub fn find_by_uuid(&self, uuid: &str) -> Option<&App> {
        self.apps.iter().find(|a| a.uuid == uuid)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&App> {
        self.apps.iter().find(|a| a.id == id)
    }

    /// Image path for `appasset`, falling back to the default box art.
    pub fn app_image(&self, app_id: i32) -> PathBuf {
        let configured = self
            .apps
            .iter()
            .find(|a| a.numeric_id() == app_id)
            .map(|a| a.image_path.clone())
            .unwrap_or_default();
        validate_app_image_path(&configured, &self.assets_dir)
    }
}

/// Environment-variable expansion: `$(NAME)` substitutes, `$$` escapes.
/// Unknown variables expand to the empty string.
pub fn parse_env_val(env: &HashMap<String, String>, raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(open) = after.strip_prefix('(') {
            match open.find(')') {
                Some(close) => {
                    if let Some(value) = env.get(&open[..close]) {
                        out.push_str(value);
                    }
                    rest = &open[close + 1..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        } else if let Some(escaped) = after.strip_prefix('$') {
            out.push('$');
            rest = escaped;
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// Resolve an app image path: PNGs that exist are used as-is, everything
/// else falls back to the default box art under the assets directory.
pub fn validate_app_image_path(image_path: &str, assets_dir: &Path) -> PathBuf {
    let default_image = assets_dir.join("box.png");
    if image_path.is_empty() {
        return default_image;
    }

    let lower = image_path.to_ascii_lowercase();
    if !lower.ends_with(".png") {
        return default_image;
    }

    let bundled = assets_dir.join(image_path);
    if bundled.exists() {
        return bundled;
    }

    let path = PathBuf::from(image_path);
    if !path.exists() {
        warn!("couldn't find app image at [{image_path}]");
        return default_image;
    }
    path
}

fn sha256_file(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    Some(crypto::hex_string(&crypto::sha256(&data)))
}

/// Stable id candidates for an app: without and with the index mixed in
/// (the latter is used on collision).
pub fn calculate_app_id(
    app_name: &str,
    image_path: &str,
    index: usize,
    assets_dir: &Path,
) -> (String, String) {
    let mut input = app_name.to_string();
    let file_path = validate_app_image_path(image_path, assets_dir);
    if file_path != assets_dir.join("box.png") {
        match sha256_file(&file_path) {
            Some(hash) => input.push_str(&hash),
            None => input.push_str(&file_path.to_string_lossy()),
        }
    }

    let no_index = (CRC32.checksum(input.as_bytes()) as i32).unsigned_abs();
    input.push_str(&index.to_string());
    let with_index = (CRC32.checksum(input.as_bytes()) as i32).unsigned_abs();

    (no_index.to_string(), with_index.to_string())
}

// --- zero-width ordering pad -----------------------------------------

const ZW0: char = '\u{200B}';
const ZW1: char = '\u{200C}';

/// Minimal pad width for `count` entries: `bit_width(count - 1)`.
pub fn pad_width_for_count(count: usize) -> usize {
    if count <= 1 {
        return 1;
    }
    (usize::BITS - (count - 1).leading_zeros()) as usize
}

/// Prefix `text` with `pad_bits` zero-width characters encoding `index`
/// (most significant bit first) so lexical order matches catalog order.
pub fn pad_for_ordering(text: &str, pad_bits: usize, index: usize) -> String {
    let mut out = String::with_capacity(pad_bits * 3 + text.len());
    for bit in 0..pad_bits {
        let one = (index >> (pad_bits - 1 - bit)) & 1 == 1;
        out.push(if one { ZW1 } else { ZW0 });
    }
    out.push_str(text);
    out
}

// --- migration --------------------------------------------------------

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            matches!(s.to_ascii_lowercase().as_str(), "true" | "on" | "yes")
        }
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Array(items) => items.first().map(coerce_bool).unwrap_or(false),
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
    }
}

/// Merge `input_app` into `file_tree["apps"]` (or just normalise the file
/// when no input is given): assign missing UUIDs, replace the entry with
/// the same UUID, drop obsolete keys.
pub fn migrate_apps(file_tree: &mut Value, input_app: Option<&mut Value>) {
    let mut new_app_uuid = String::new();

    let input_app = input_app.map(|input| {
        if let Some(obj) = input.as_object_mut() {
            let existing = obj
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            new_app_uuid = if existing.is_empty() {
                let fresh = uuid::Uuid::new_v4().to_string().to_uppercase();
                obj.insert("uuid".into(), json!(fresh.clone()));
                fresh
            } else {
                existing
            };

            for key in ["prep-cmd", "detached"] {
                let empty = obj
                    .get(key)
                    .map(|v| v.as_array().map(Vec::is_empty).unwrap_or(false))
                    .unwrap_or(false);
                if empty {
                    obj.remove(key);
                }
            }
            obj.remove("launching");
            obj.remove("index");
        }
        input
    });

    let mut new_apps: Vec<Value> = Vec::new();
    if let Some(apps) = file_tree.get_mut("apps").and_then(Value::as_array_mut) {
        for app in apps.drain(..) {
            let mut app = app;
            let uuid = app
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if uuid.is_empty() {
                if let Some(obj) = app.as_object_mut() {
                    obj.insert(
                        "uuid".into(),
                        json!(uuid::Uuid::new_v4().to_string().to_uppercase()),
                    );
                    obj.remove("launching");
                }
                new_apps.push(app);
            } else if !new_app_uuid.is_empty() && uuid == new_app_uuid {
                if let Some(input) = input_app.as_deref() {
                    new_apps.push(input.clone());
                }
                new_app_uuid.clear();
            } else {
                new_apps.push(app);
            }
        }
    }
    if !new_app_uuid.is_empty() {
        if let Some(input) = input_app.as_deref() {
            new_apps.push(input.clone());
        }
    }
    file_tree["apps"] = Value::Array(new_apps);
}

fn migration_v2(file_tree: &mut Value) {
    let file_version = file_tree.get("version").and_then(Value::as_i64).unwrap_or(1);
    if file_version >= APPS_VERSION {
        return;
    }
    info!("migrating app list from v{file_version} to v{APPS_VERSION}");
    migrate_apps(file_tree, None);

    let boolean_keys = [
        "allow-client-commands",
        "exclude-global-prep-cmd",
        "elevated",
        "auto-detach",
        "wait-all",
        "use-app-identity",
        "per-client-app-identity",
        "virtual-display",
    ];
    let integer_keys = ["exit-timeout", "scale-factor"];

    if let Some(apps) = file_tree.get_mut("apps").and_then(Value::as_array_mut) {
        for app in apps {
            for key in boolean_keys {
                if let Some(value) = app.get(key) {
                    let coerced = coerce_bool(value);
                    app[key] = json!(coerced);
                }
            }
            for key in integer_keys {
                let legacy = app.get(key).and_then(Value::as_str).map(str::to_string);
                if let Some(s) = legacy {
                    match s.trim().parse::<i64>() {
                        Ok(n) => app[key] = json!(n),
                        Err(_) => {
                            if let Some(obj) = app.as_object_mut() {
                                obj.remove(key);
                            }
                        }
                    }
                }
            }
            if let Some(preps) = app.get_mut("prep-cmd").and_then(Value::as_array_mut) {
                for prep in preps {
                    let legacy = prep.get("elevated").and_then(Value::as_str).map(str::to_string);
                    if let Some(s) = legacy {
                        prep["elevated"] = json!(s == "true");
                    }
                }
            }
        }
    }

    file_tree["version"] = json!(APPS_VERSION);
}

/// Run pending migrations, persisting the file when anything changed.
pub fn migrate(file_tree: &mut Value, path: &Path) -> Result<()> {
    let file_version = file_tree.get("version").and_then(Value::as_i64).unwrap_or(0);
    if file_version < APPS_VERSION {
        migration_v2(file_tree);
        storage::write_json_atomic(path, file_tree)?;
    }
    Ok(())
}

// --- parsing ----------------------------------------------------------

fn parse_app(
    node: &Value,
    idx: usize,
    env: &HashMap<String, String>,
    config: &Config,
) -> Result<App> {
    let obj = node
        .as_object()
        .ok_or_else(|| HostError::Config("app entry is not an object".into()))?;
    let get_str = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default();
    let get_bool =
        |key: &str, default: bool| obj.get(key).and_then(Value::as_bool).unwrap_or(default);
    let get_int =
        |key: &str, default: i64| obj.get(key).and_then(Value::as_i64).unwrap_or(default);

    let uuid = obj
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| HostError::Config("app entry is missing a uuid".into()))?
        .to_string();

    let mut prep_cmds = Vec::new();
    if !get_bool("exclude-global-prep-cmd", false) {
        for prep in &config.global_prep_cmds {
            prep_cmds.push(PrepCmd {
                do_cmd: parse_env_val(env, &prep.do_cmd),
                undo_cmd: parse_env_val(env, &prep.undo_cmd),
                elevated: prep.elevated,
            });
        }
    }
    if let Some(preps) = obj.get("prep-cmd").and_then(Value::as_array) {
        for prep in preps {
            prep_cmds.push(PrepCmd {
                do_cmd: parse_env_val(env, prep.get("do").and_then(Value::as_str).unwrap_or("")),
                undo_cmd: parse_env_val(
                    env,
                    prep.get("undo").and_then(Value::as_str).unwrap_or(""),
                ),
                elevated: prep.get("elevated").and_then(Value::as_bool).unwrap_or(false),
            });
        }
    }

    let mut detached = Vec::new();
    if let Some(cmds) = obj.get("detached").and_then(Value::as_array) {
        for cmd in cmds.iter().filter_map(Value::as_str) {
            detached.push(parse_env_val(env, cmd));
        }
    }

    Ok(App {
        idx: idx.to_string(),
        uuid,
        name: parse_env_val(env, get_str("name")),
        cmd: parse_env_val(env, get_str("cmd")),
        working_dir: parse_env_val(env, get_str("working-dir")),
        output: parse_env_val(env, get_str("output")),
        image_path: parse_env_val(env, get_str("image-path")),
        id: String::new(),
        gamepad: get_str("gamepad").to_string(),
        elevated: get_bool("elevated", false),
        auto_detach: get_bool("auto-detach", true),
        wait_all: get_bool("wait-all", true),
        virtual_display: get_bool("virtual-display", false),
        use_app_identity: get_bool("use-app-identity", false),
        per_client_app_identity: get_bool("per-client-app-identity", false),
        allow_client_commands: get_bool("allow-client-commands", true),
        scale_factor: get_int("scale-factor", 100).clamp(1, 400) as u32,
        exit_timeout: Duration::from_secs(get_int("exit-timeout", 5).max(0) as u64),
        prep_cmds,
        detached,
    })
}

fn assign_id(app: &mut App, index: usize, ids: &mut HashSet<String>, assets_dir: &Path) {
    let (no_index, with_index) = calculate_app_id(&app.name, &app.image_path, index, assets_dir);
    app.id = if ids.contains(&no_index) {
        with_index
    } else {
        no_index
    };
    ids.insert(app.id.clone());
}

/// Catalog load options resolved by the caller.
pub struct CatalogOptions {
    pub assets_dir: PathBuf,
    /// Append the "Virtual Display" entry (driver available).
    pub virtual_display_ready: bool,
}

/// Parse `apps.json`, migrating as needed. Parse failures trigger up to
/// three re-migration attempts from version 0 before falling back to a
/// synthetic desktop entry.
pub fn parse(path: &Path, config: &Config, options: &CatalogOptions) -> AppCatalog {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    let mut apps: Vec<App> = Vec::new();
    let mut ids: HashSet<String> = HashSet::new();
    let mut index = 0usize;
    let mut fail_count = 0usize;

    let mut tree = match storage::read_json_value(path) {
        Ok(Some(tree)) => Some(tree),
        Ok(None) => {
            warn!("{} doesn't exist, apps will not be loaded", path.display());
            None
        }
        Err(e) => {
            warn!("couldn't read {} properly: {e}", path.display());
            None
        }
    };

    if let Some(tree) = tree.as_mut() {
        loop {
            let attempt = (|| -> Result<(HashMap<String, String>, Vec<App>)> {
                migrate(tree, path)?;

                let mut env: HashMap<String, String> = std::env::vars().collect();
                if let Some(env_obj) = tree.get("env").and_then(Value::as_object) {
                    for (key, value) in env_obj {
                        if let Some(value) = value.as_str() {
                            let expanded = parse_env_val(&env, value);
                            env.insert(key.clone(), expanded);
                        }
                    }
                }

                let nodes = tree
                    .get("apps")
                    .and_then(Value::as_array)
                    .ok_or_else(|| HostError::Config("no apps array".into()))?;
                let mut parsed = Vec::with_capacity(nodes.len());
                for (i, node) in nodes.iter().enumerate() {
                    parsed.push(parse_app(node, i, &env, config)?);
                }
                Ok((env, parsed))
            })();

            match attempt {
                Ok((parsed_env, mut parsed)) => {
                    env = parsed_env;
                    for app in parsed.iter_mut() {
                        assign_id(app, index, &mut ids, &options.assets_dir);
                        index += 1;
                    }
                    apps = parsed;
                    fail_count = 0;
                    break;
                }
                Err(e) => {
                    warn!("error during app loading: {e}");
                    fail_count += 1;
                    if fail_count >= 3 {
                        warn!("couldn't parse/migrate {} properly", path.display());
                        break;
                    }
                    warn!("app format is still invalid, re-migrating the app list");
                    tree["version"] = json!(0);
                    ids.clear();
                    index = 0;
                }
            }
        }
    } else {
        fail_count = 1;
    }

    if fail_count > 0 {
        warn!("no applications configured, adding fallback desktop entry");
        let mut desktop = App::reserved(index, FALLBACK_DESKTOP_UUID, "Desktop (fallback)", "desktop-alt.png");
        assign_id(&mut desktop, index, &mut ids, &options.assets_dir);
        index += 1;
        apps.push(desktop);
    }

    if options.virtual_display_ready {
        let mut entry = App::reserved(index, VIRTUAL_DISPLAY_UUID, "Virtual Display", "virtual_desktop.png");
        entry.virtual_display = true;
        assign_id(&mut entry, index, &mut ids, &options.assets_dir);
        index += 1;
        apps.push(entry);
    }

    let mut input_only_app_id = -1;
    let mut terminate_app_id = -1;
    if config.enable_input_only_mode {
        let mut input_only = App::reserved(index, REMOTE_INPUT_UUID, "Remote Input", "input_only.png");
        input_only.wait_all = true;
        assign_id(&mut input_only, index, &mut ids, &options.assets_dir);
        input_only_app_id = input_only.numeric_id();
        index += 1;
        apps.push(input_only);

        let mut terminate = App::reserved(index, TERMINATE_APP_UUID, "Terminate", "terminate.png");
        terminate.wait_all = true;
        let (no_index, with_index) =
            calculate_app_id(&terminate.name, &terminate.image_path, index, &options.assets_dir);
        terminate.id = if ids.contains(&no_index) { with_index } else { no_index };
        terminate_app_id = terminate.numeric_id();
        apps.push(terminate);
    }

    debug!("loaded {} app(s)", apps.len());
    AppCatalog {
        apps,
        env,
        input_only_app_id,
        terminate_app_id,
        assets_dir: options.assets_dir.clone(),
    }
}

/// Merge a new/edited app into `apps.json` (admin `POST /api/apps`).
pub fn save_app(path: &Path, mut input: Value) -> Result<()> {
    let mut tree = storage::read_json_value(path)?
        .unwrap_or_else(|| json!({ "version": APPS_VERSION, "apps": [] }));
    migrate_apps(&mut tree, Some(&mut input));
    storage::write_json_atomic(path, &tree)
}

/// Delete an app by UUID (admin `POST /api/apps/delete`).
pub fn delete_app(path: &Path, uuid: &str) -> Result<bool> {
    let Some(mut tree) = storage::read_json_value(path)? else {
        return Ok(false);
    };
    let mut removed = false;
    if let Some(apps) = tree.get_mut("apps").and_then(Value::as_array_mut) {
        let before = apps.len();
        apps.retain(|app| app.get("uuid").and_then(Value::as_str) != Some(uuid));
        removed = apps.len() != before;
    }
    storage::write_json_atomic(path, &tree)?;
    Ok(removed)
}

/// Reorder apps by UUID list (admin `POST /api/apps/reorder`); UUIDs not
/// mentioned keep their relative order after the mentioned ones.
pub fn reorder_apps(path: &Path, order: &[String]) -> Result<()> {
    let Some(mut tree) = storage::read_json_value(path)? else {
        return Ok(());
    };
    if let Some(apps) = tree.get_mut("apps").and_then(Value::as_array_mut) {
        let mut remaining: Vec<Value> = apps.drain(..).collect();
        let mut sorted = Vec::with_capacity(remaining.len());
        for uuid in order {
            if let Some(pos) = remaining
                .iter()
                .position(|app| app.get("uuid").and_then(Value::as_str) == Some(uuid.as_str()))
            {
                sorted.push(remaining.remove(pos));
            }
        }
        sorted.extend(remaining);
        *apps = sorted;
    }
    storage::write_json_atomic(path, &tree)
}

/// Write a whole apps file from a map (used at first run).
pub fn write_default_apps(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let tree = json!({
        "version": APPS_VERSION,
        "env": {},
        "apps": [
            {
                "name": "Desktop",
                "image-path": "desktop.png",
                "uuid": uuid::Uuid::new_v4().to_string().to_uppercase(),
            }
        ]
    });
    storage::write_json_atomic(path, &tree)
}
