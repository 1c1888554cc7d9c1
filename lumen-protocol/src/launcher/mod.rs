//! Launch orchestrator.
//!
//! For each streaming session this module optionally creates a virtual
//! display, applies the requested display mode, runs ordered prep
//! commands with paired undo, spawns the application process group,
//! tracks its exit, and reverts every piece of display and process state
//! on the way out.
//!
//! Compensation is a stack of typed [`UndoAction`]s: every state change
//! pushes its inverse, and the stack is drained last-in-first-out on any
//! exit path, so undo actions run exactly in reverse order of the actions
//! that actually happened.

pub mod display;
pub mod virtual_display;

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::apps::App;
use crate::config::{Config, HdrOption, PrepCmd};
use crate::error::HostError;
use crate::platform::{self, OutputMode};
use crate::session::LaunchSession;

use display::{DisplayDevice, EncoderProbe};
use virtual_display::{DriverStatus, VirtualDisplayHost, VirtualDisplayRequest};

/// Auto-detach window: a clean exit inside it means "launcher app".
const AUTO_DETACH_WINDOW: Duration = Duration::from_secs(5);

/// Why a launch failed; maps to the control-plane status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    /// Encoder probe failed (503, retryable once a display is up).
    EncoderInit,
    /// A prep command or the app itself could not be started.
    ProcessStart,
}

/// One compensating action. Pushed as its forward action happens,
/// drained in reverse on teardown.
enum UndoAction {
    /// Run a prep command's paired undo.
    PrepUndo(PrepCmd),
    /// Remove a virtual display created for this launch.
    RemoveVirtualDisplay(Uuid),
    /// Virtual-display sessions clear persisted display state instead of
    /// reverting it.
    ResetDisplayPersistence,
    /// Revert the display-device configuration.
    RevertDisplayConfig,
    /// Restore the configured capture output name.
    RestoreOutputName(String),
    /// Restore the input configuration an app gamepad override replaced.
    RestoreInputConfig { controller: bool, gamepad: String },
}

#[derive(Default)]
struct LauncherState {
    app_id: i32,
    app_name: String,
    app_uuid: String,
    launch_env: HashMap<String, String>,
    output_mode: Option<OutputMode>,
    working_dir: String,
    child: Option<tokio::process::Child>,
    pgid: Option<u32>,
    last_exit: Option<ExitStatus>,
    placebo: bool,
    wait_all: bool,
    auto_detach: bool,
    exit_timeout: Duration,
    launch_time: Option<Instant>,
    undo: Vec<UndoAction>,
    /// Name of the display the stream runs on; filled by the virtual
    /// display path and read by the HDR settle task.
    display_name: Arc<StdMutex<String>>,
    /// `(display, initial_hdr)` recorded by the HDR settle task.
    hdr_revert: Arc<StdMutex<Option<(String, bool)>>>,
    virtual_display: bool,
    allow_client_commands: bool,
}

/// Orchestrates app startup and teardown for streaming sessions.
pub struct Launcher {
    config: Arc<RwLock<Config>>,
    display: Arc<dyn DisplayDevice>,
    encoders: Arc<dyn EncoderProbe>,
    vdisplay: Arc<VirtualDisplayHost>,
    state: Mutex<LauncherState>,
}

impl Launcher {
    pub fn new(
        config: Arc<RwLock<Config>>,
        display: Arc<dyn DisplayDevice>,
        encoders: Arc<dyn EncoderProbe>,
        vdisplay: Arc<VirtualDisplayHost>,
    ) -> Self {
        Self {
            config,
            display,
            encoders,
            vdisplay,
            state: Mutex::new(LauncherState::default()),
        }
    }

    pub fn encoders(&self) -> &Arc<dyn EncoderProbe> {
        &self.encoders
    }

    pub fn display(&self) -> &Arc<dyn DisplayDevice> {
        &self.display
    }

    pub fn vdisplay(&self) -> &Arc<VirtualDisplayHost> {
        &self.vdisplay
    }

    /// Current app id while the app is alive, else 0.
    pub async fn running(&self) -> i32 {
        let mut st = self.state.lock().await;
        if st.app_id == 0 {
            return 0;
        }
        if st.placebo {
            return st.app_id;
        }

        // Reap the direct child so zombies don't count as running.
        let child_running = match st.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    st.last_exit = Some(status);
                    false
                }
                Err(_) => false,
            },
            None => false,
        };

        if st.wait_all
            && st
                .pgid
                .map(platform::process_group_running)
                .unwrap_or(false)
        {
            return st.app_id;
        }
        if child_running {
            return st.app_id;
        }
        let within_window = st
            .launch_time
            .map(|t| t.elapsed() < AUTO_DETACH_WINDOW)
            .unwrap_or(false);
        let clean_exit = st.last_exit.map(|s| s.success()).unwrap_or(false);
        if st.auto_detach && within_window && clean_exit {
            info!(
                "app exited cleanly within {}s of launch, treating it as a detached command",
                AUTO_DETACH_WINDOW.as_secs()
            );
            st.placebo = true;
            return st.app_id;
        }

        // The app is gone: clean up now.
        self.teardown_locked(&mut st, false).await;
        0
    }

    /// UUID of the running app, empty when idle.
    pub async fn running_app_uuid(&self) -> String {
        self.state.lock().await.app_uuid.clone()
    }

    pub async fn last_run_app_name(&self) -> String {
        self.state.lock().await.app_name.clone()
    }

    pub async fn allow_client_commands(&self) -> bool {
        self.state.lock().await.allow_client_commands
    }

    /// Whether the current session streams through a virtual display.
    pub async fn virtual_display_active(&self) -> bool {
        self.state.lock().await.virtual_display
    }

    /// Join the input-only placeholder session: no process, no display
    /// change, just an active app id.
    pub async fn launch_input_only(&self, input_only_app_id: i32) {
        let mut st = self.state.lock().await;
        st.app_id = input_only_app_id;
        st.app_name = "Remote Input".into();
        st.app_uuid = crate::apps::REMOTE_INPUT_UUID.into();
        st.placebo = true;
        st.allow_client_commands = false;
        st.launch_time = Some(Instant::now());
        info!("input only session active");
    }

    /// Launch `app` for `launch`. Mutates the launch session's geometry
    /// (render scaling) and its `virtual_display` flag.
    pub async fn execute(
        &self,
        app: &App,
        launch: &mut LaunchSession,
        catalog_env: &HashMap<String, String>,
        no_active_sessions: bool,
    ) -> Result<(), LaunchError> {
        // Ensure a clean slate; switching away from the input-only
        // placeholder gets a settling pause like any session handover.
        let was_input_only = {
            let st = self.state.lock().await;
            st.app_uuid == crate::apps::REMOTE_INPUT_UUID
        };
        self.terminate(false).await;
        if was_input_only {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let mut st = self.state.lock().await;
        st.app_id = app.numeric_id();
        st.app_name = app.name.clone();
        st.app_uuid = app.uuid.clone();
        st.wait_all = app.wait_all;
        st.auto_detach = app.auto_detach;
        st.exit_timeout = app.exit_timeout;
        st.allow_client_commands = app.allow_client_commands;
        st.working_dir = app.working_dir.clone();
        st.output_mode = Some(OutputMode::from_config(&app.output));
        st.last_exit = None;

        // Render geometry: client mode scaled by the effective factor,
        // chopped to even numbers.
        let client_width = if launch.width > 0 { launch.width } else { 1920 };
        let client_height = if launch.height > 0 { launch.height } else { 1080 };
        let mut render_width = client_width;
        let mut render_height = client_height;
        let scale_factor = if app.scale_factor != 100 {
            app.scale_factor
        } else {
            launch.scale_factor
        };
        if scale_factor != 100 {
            render_width = ((client_width as f32 * scale_factor as f32 / 100.0) as u32) & !1;
            render_height = ((client_height as f32 * scale_factor as f32 / 100.0) as u32) & !1;
        }
        launch.width = render_width;
        launch.height = render_height;

        let initial_display = self.config.read().unwrap().output_name.clone();
        st.undo.push(UndoAction::RestoreOutputName(initial_display));

        if !app.gamepad.is_empty() {
            let mut config = self.config.write().unwrap();
            st.undo.push(UndoAction::RestoreInputConfig {
                controller: config.controller,
                gamepad: config.gamepad.clone(),
            });
            if app.gamepad == "disabled" {
                config.controller = false;
            } else {
                config.controller = true;
                config.gamepad = app.gamepad.clone();
            }
        }

        let needs_virtual_display = {
            let config = self.config.read().unwrap();
            config.headless_mode
                || launch.virtual_display
                || app.virtual_display
                || !self.encoders.capture_ready()
        };
        if needs_virtual_display {
            self.setup_virtual_display(&mut st, app, launch, render_width, render_height);
        }

        {
            let config = self.config.read().unwrap();
            if let Err(e) = self.display.configure(launch, &config) {
                warn!("display configuration failed: {e}");
            }
        }
        if st.virtual_display {
            // Virtual displays are transient; persisted display state
            // must not survive them.
            self.display.reset_persistence();
            st.undo.push(UndoAction::ResetDisplayPersistence);
        } else {
            st.undo.push(UndoAction::RevertDisplayConfig);
        }

        // Re-probe encoders so the chosen encoder matches the active GPU,
        // which may have changed since the last session.
        if no_active_sessions && self.encoders.probe().is_err() {
            warn!("encoder probe failed, aborting launch");
            self.teardown_locked(&mut st, false).await;
            return Err(LaunchError::EncoderInit);
        }

        let envvar_compat = self.config.read().unwrap().envvar_compatibility_mode;
        st.launch_env = build_launch_env(catalog_env, app, launch, scale_factor, envvar_compat);

        if let Err(e) = self.run_prep_commands(&mut st, app).await {
            warn!("prep command failed: {e}");
            self.teardown_locked(&mut st, false).await;
            return Err(LaunchError::ProcessStart);
        }

        for cmd in &app.detached {
            self.spawn_detached(&st, cmd);
        }

        if app.cmd.is_empty() {
            info!("no command configured, showing desktop");
            st.placebo = true;
        } else {
            let working_dir = effective_working_dir(&st.working_dir, &app.cmd);
            info!("executing [{}] in [{:?}]", app.cmd, working_dir);
            let output = st.output_mode.clone().unwrap_or(OutputMode::Inherit);
            match platform::run_command(
                app.elevated,
                &app.cmd,
                working_dir.as_deref(),
                &st.launch_env,
                &output,
            ) {
                Ok(child) => {
                    st.pgid = child.id();
                    st.child = Some(child);
                }
                Err(e) => {
                    warn!("couldn't run [{}]: {e}", app.cmd);
                    self.teardown_locked(&mut st, false).await;
                    return Err(LaunchError::ProcessStart);
                }
            }
        }

        st.launch_time = Some(Instant::now());
        self.spawn_hdr_task(&st, launch.enable_hdr);
        Ok(())
    }

    fn setup_virtual_display(
        &self,
        st: &mut LauncherState,
        app: &App,
        launch: &mut LaunchSession,
        render_width: u32,
        render_height: u32,
    ) {
        if self.vdisplay.ensure_open() != DriverStatus::Ok {
            // Driver unusable: nothing to track or remove later.
            launch.virtual_display = false;
            return;
        }

        let parse_or_random =
            |raw: &str| Uuid::parse_str(raw).unwrap_or_else(|_| Uuid::new_v4());
        let (device_name, device_uuid) = if app.use_app_identity {
            let app_uuid = parse_or_random(&app.uuid);
            if app.per_client_app_identity {
                // Mix the client into the app identity so each client
                // gets its own stable display device.
                let client_uuid = parse_or_random(&launch.unique_id);
                (
                    app.name.clone(),
                    Uuid::from_u128(client_uuid.as_u128() ^ app_uuid.as_u128()),
                )
            } else {
                (app.name.clone(), app_uuid)
            }
        } else {
            (launch.device_name.clone(), parse_or_random(&launch.unique_id))
        };

        let mut target_fps = if launch.fps_milli > 0 { launch.fps_milli } else { 60_000 };
        if target_fps < 1000 {
            target_fps *= 1000;
        }

        // The display may exist even when name retrieval fails below, so
        // removal is tracked from this point on.
        launch.virtual_display = true;
        st.undo.push(UndoAction::RemoveVirtualDisplay(device_uuid));

        let request = VirtualDisplayRequest {
            device_uuid,
            device_name,
            width: render_width,
            height: render_height,
            fps_milli: target_fps,
        };
        let driver = self.vdisplay.driver();
        match driver.create_display(&request) {
            Ok(name) if !name.is_empty() => {
                info!("virtual display created at {name}");
                let (double_refresh, isolated) = {
                    let config = self.config.read().unwrap();
                    (config.double_refreshrate, config.isolated_virtual_display)
                };
                if double_refresh {
                    target_fps *= 2;
                }
                if launch.width > 0 && launch.height > 0 && launch.fps_milli > 0 {
                    if let Err(e) =
                        driver.change_mode(&name, render_width, render_height, target_fps, false)
                    {
                        warn!("couldn't apply mode to {name}: {e}");
                    }
                }
                if isolated {
                    if let Err(e) =
                        driver.change_mode(&name, render_width, render_height, target_fps, true)
                    {
                        warn!("couldn't isolate {name}: {e}");
                    }
                }

                st.virtual_display = true;
                *st.display_name.lock().unwrap() = name.clone();
                // Capture must follow the virtual display no matter what
                // output the user configured.
                self.config.write().unwrap().output_name =
                    self.display.map_display_name(&name);
            }
            Ok(_) | Err(_) => {
                warn!("virtual display creation failed, or its name wasn't available in time");
            }
        }
    }

    async fn run_prep_commands(
        &self,
        st: &mut LauncherState,
        app: &App,
    ) -> crate::error::Result<()> {
        let output = st.output_mode.clone().unwrap_or(OutputMode::Inherit);
        for prep in &app.prep_cmds {
            if prep.do_cmd.is_empty() {
                // Nothing to run, but a configured undo still belongs to
                // the teardown sequence.
                st.undo.push(UndoAction::PrepUndo(prep.clone()));
                continue;
            }

            let working_dir = effective_working_dir(&st.working_dir, &prep.do_cmd);
            info!("executing do cmd [{}] elevated: {}", prep.do_cmd, prep.elevated);
            let mut child = match platform::run_command(
                prep.elevated,
                &prep.do_cmd,
                working_dir.as_deref(),
                &st.launch_env,
                &output,
            ) {
                Ok(child) => child,
                Err(e) => {
                    // Don't let prep commands block the desktop at early
                    // boot, where impersonation yields permission-denied.
                    let permission_denied = matches!(
                        &e,
                        HostError::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied
                    );
                    if app.cmd.is_empty() && permission_denied {
                        st.undo.push(UndoAction::PrepUndo(prep.clone()));
                        continue;
                    }
                    return Err(e);
                }
            };

            let status = child.wait().await?;
            if !status.success() {
                return Err(HostError::Process(format!(
                    "[{}] failed with {status}",
                    prep.do_cmd
                )));
            }
            st.undo.push(UndoAction::PrepUndo(prep.clone()));
        }
        Ok(())
    }

    fn spawn_detached(&self, st: &LauncherState, cmd: &str) {
        let working_dir = effective_working_dir(&st.working_dir, cmd);
        info!("spawning detached [{cmd}] in [{working_dir:?}]");
        let output = st.output_mode.clone().unwrap_or(OutputMode::Inherit);
        match platform::run_command(false, cmd, working_dir.as_deref(), &st.launch_env, &output) {
            Ok(mut child) => {
                // Reap in the background; exit status is ignored.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => warn!("couldn't spawn [{cmd}]: {e}"),
        }
    }

    /// Background task: once the streaming display has settled, record
    /// its HDR state and toggle it per the configured policy.
    fn spawn_hdr_task(&self, st: &LauncherState, enable_hdr: bool) {
        let display_name = Arc::clone(&st.display_name);
        let hdr_revert = Arc::clone(&st.hdr_revert);
        let vdisplay = Arc::clone(&self.vdisplay);
        let hdr_option = self.config.read().unwrap().hdr_option;

        tokio::spawn(async move {
            let mut retry = Duration::from_millis(200);
            let name = loop {
                let name = display_name.lock().unwrap().clone();
                if !name.is_empty() {
                    break name;
                }
                if retry > Duration::from_secs(2) {
                    debug!("no streaming display in time, HDR will not be toggled");
                    return;
                }
                tokio::time::sleep(retry).await;
                retry *= 2;
            };

            let driver = vdisplay.driver();
            let initial = driver.hdr_state(&name).unwrap_or(false);

            match hdr_option {
                HdrOption::Automatic => {
                    *hdr_revert.lock().unwrap() = Some((name.clone(), initial));
                    if !driver.set_hdr(&name, false) {
                        return;
                    }
                    if enable_hdr {
                        if driver.set_hdr(&name, true) {
                            info!("HDR enabled for display {name}");
                        } else {
                            info!("HDR enable failed for display {name}");
                        }
                    }
                }
                HdrOption::Keep => {
                    // Displays freshly connected or mode-switched need a
                    // toggle before HDR sticks.
                    if initial {
                        if driver.set_hdr(&name, false) && driver.set_hdr(&name, true) {
                            info!("HDR toggled for display {name}");
                        } else {
                            info!("HDR toggle failed for display {name}");
                        }
                    }
                }
            }
        });
    }

    /// Terminate the running app and revert every change this launch
    /// made. Idempotent; a stopped launcher is left untouched.
    pub async fn terminate(&self, immediate: bool) {
        let mut st = self.state.lock().await;
        self.teardown_locked(&mut st, immediate).await;
    }

    async fn teardown_locked(&self, st: &mut LauncherState, immediate: bool) {
        st.placebo = false;

        if immediate {
            if let Some(mut child) = st.child.take() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        } else {
            platform::terminate_process_group(&mut st.child, st.pgid, st.exit_timeout).await;
        }
        st.pgid = None;

        // Revert HDR before unwinding display state, while the display
        // still exists.
        let hdr = st.hdr_revert.lock().unwrap().take();
        if let Some((hdr_display, initial)) = hdr {
            if self.vdisplay.status() == DriverStatus::Ok {
                if self.vdisplay.driver().set_hdr(&hdr_display, initial) {
                    info!("HDR reverted for display {hdr_display}");
                } else {
                    info!("HDR revert failed for display {hdr_display}");
                }
            }
        }

        let output = st.output_mode.clone().unwrap_or(OutputMode::Inherit);
        while let Some(action) = st.undo.pop() {
            match action {
                UndoAction::PrepUndo(prep) => {
                    if prep.undo_cmd.is_empty() {
                        continue;
                    }
                    let working_dir = effective_working_dir(&st.working_dir, &prep.undo_cmd);
                    info!("executing undo cmd [{}]", prep.undo_cmd);
                    match platform::run_command(
                        prep.elevated,
                        &prep.undo_cmd,
                        working_dir.as_deref(),
                        &st.launch_env,
                        &output,
                    ) {
                        Ok(mut child) => match child.wait().await {
                            Ok(status) if !status.success() => {
                                warn!("undo cmd [{}] returned {status}", prep.undo_cmd)
                            }
                            Err(e) => warn!("undo cmd [{}] failed: {e}", prep.undo_cmd),
                            _ => {}
                        },
                        Err(e) => warn!("couldn't run undo cmd [{}]: {e}", prep.undo_cmd),
                    }
                }
                UndoAction::RemoveVirtualDisplay(guid) => {
                    if self.vdisplay.status() == DriverStatus::Ok {
                        if self.vdisplay.driver().remove_display(&guid) {
                            info!("virtual display removed");
                        } else if st.virtual_display {
                            warn!("virtual display removal failed");
                        } else {
                            warn!("virtual display removal failed, it may never have been created");
                        }
                    }
                }
                UndoAction::ResetDisplayPersistence => self.display.reset_persistence(),
                UndoAction::RevertDisplayConfig => self.display.revert(),
                UndoAction::RestoreOutputName(previous) => {
                    self.config.write().unwrap().output_name = previous;
                }
                UndoAction::RestoreInputConfig { controller, gamepad } => {
                    let mut config = self.config.write().unwrap();
                    config.controller = controller;
                    config.gamepad = gamepad;
                }
            }
        }

        if st.app_id != 0 {
            info!("app [{}] stopped", st.app_name);
        }
        st.app_id = 0;
        st.app_name.clear();
        st.app_uuid.clear();
        st.launch_env.clear();
        st.output_mode = None;
        st.working_dir.clear();
        st.launch_time = None;
        st.last_exit = None;
        st.virtual_display = false;
        st.allow_client_commands = false;
        st.display_name.lock().unwrap().clear();
    }
}

fn effective_working_dir(configured: &str, cmd: &str) -> Option<std::path::PathBuf> {
    if configured.is_empty() {
        platform::find_working_directory(cmd)
    } else {
        Some(std::path::PathBuf::from(configured))
    }
}

/// Build the environment injected into every spawned command.
fn build_launch_env(
    base: &HashMap<String, String>,
    app: &App,
    launch: &LaunchSession,
    scale_factor: u32,
    envvar_compat: bool,
) -> HashMap<String, String> {
    let mut env = base.clone();
    let fps = launch.fps_milli as f32 / 1000.0;
    let fps_str = format!("{fps:.3}");
    let legacy_fps = if envvar_compat {
        format!("{}", fps.round() as u32)
    } else {
        fps_str.clone()
    };
    let bool_str = |b: bool| if b { "true" } else { "false" }.to_string();

    // Legacy variable family, kept for script compatibility.
    env.insert("SUNSHINE_APP_ID".into(), app.id.clone());
    env.insert("SUNSHINE_APP_NAME".into(), app.name.clone());
    env.insert("SUNSHINE_CLIENT_WIDTH".into(), launch.width.to_string());
    env.insert("SUNSHINE_CLIENT_HEIGHT".into(), launch.height.to_string());
    env.insert("SUNSHINE_CLIENT_FPS".into(), legacy_fps);
    env.insert("SUNSHINE_CLIENT_HDR".into(), bool_str(launch.enable_hdr));
    env.insert("SUNSHINE_CLIENT_GCMAP".into(), launch.gcmap.to_string());
    env.insert("SUNSHINE_CLIENT_HOST_AUDIO".into(), bool_str(launch.host_audio));
    env.insert("SUNSHINE_CLIENT_ENABLE_SOPS".into(), bool_str(launch.enable_sops));

    env.insert("APOLLO_APP_ID".into(), app.id.clone());
    env.insert("APOLLO_APP_NAME".into(), app.name.clone());
    env.insert("APOLLO_APP_UUID".into(), app.uuid.clone());
    env.insert("APOLLO_CLIENT_UUID".into(), launch.unique_id.clone());
    env.insert("APOLLO_CLIENT_NAME".into(), launch.device_name.clone());
    env.insert("APOLLO_CLIENT_WIDTH".into(), launch.width.to_string());
    env.insert("APOLLO_CLIENT_HEIGHT".into(), launch.height.to_string());
    env.insert("APOLLO_CLIENT_RENDER_WIDTH".into(), launch.width.to_string());
    env.insert("APOLLO_CLIENT_RENDER_HEIGHT".into(), launch.height.to_string());
    env.insert("APOLLO_CLIENT_SCALE_FACTOR".into(), scale_factor.to_string());
    env.insert("APOLLO_CLIENT_FPS".into(), fps_str);
    env.insert("APOLLO_CLIENT_HDR".into(), bool_str(launch.enable_hdr));
    env.insert("APOLLO_CLIENT_GCMAP".into(), launch.gcmap.to_string());
    env.insert("APOLLO_CLIENT_HOST_AUDIO".into(), bool_str(launch.host_audio));
    env.insert("APOLLO_CLIENT_ENABLE_SOPS".into(), bool_str(launch.enable_sops));

    let channel_count = launch.surround_info & 65535;
    let audio_configuration = match channel_count {
        2 => Some("2.0"),
        6 => Some("5.1"),
        8 => Some("7.1"),
        _ => None,
    };
    if let Some(audio) = audio_configuration {
        env.insert("SUNSHINE_CLIENT_AUDIO_CONFIGURATION".into(), audio.into());
        env.insert("APOLLO_CLIENT_AUDIO_CONFIGURATION".into(), audio.into());
    }
    env.insert(
        "SUNSHINE_CLIENT_AUDIO_SURROUND_PARAMS".into(),
        launch.surround_params.clone(),
    );
    env.insert(
        "APOLLO_CLIENT_AUDIO_SURROUND_PARAMS".into(),
        launch.surround_params.clone(),
    );

    env
}
