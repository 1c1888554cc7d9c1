//! Process-wide host state.
//!
//! Host identity, paired-client registry, pairing sessions, the app
//! catalog, live streaming sessions, and the launcher are all owned by a
//! single [`HostContext`] passed around by `Arc`. Persistence and
//! mutation go through its methods, never through ambient globals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::apps::{self, AppCatalog, CatalogOptions};
use crate::clients::{ClientRegistry, ClientUpdate};
use crate::config::{Config, Paths};
use crate::error::Result;
use crate::identity::HostIdentity;
use crate::launcher::display::{DisplayDevice, EncoderProbe};
use crate::launcher::virtual_display::{DriverStatus, VirtualDisplayHost, VirtualDisplayDriver};
use crate::launcher::Launcher;
use crate::pairing::PairingEngine;
use crate::perm::Permissions;
use crate::platform::Clipboard;
use crate::session::SessionRegistry;

/// External collaborators the host is wired with at startup.
pub struct Collaborators {
    pub display: Arc<dyn DisplayDevice>,
    pub encoders: Arc<dyn EncoderProbe>,
    pub virtual_display_driver: Arc<dyn VirtualDisplayDriver>,
    pub clipboard: Arc<dyn Clipboard>,
}

/// Everything a request handler needs, behind one `Arc`.
pub struct HostContext {
    pub paths: Paths,
    pub config: Arc<RwLock<Config>>,
    pub identity: HostIdentity,
    pub clients: ClientRegistry,
    pub pairing: PairingEngine,
    pub sessions: SessionRegistry,
    pub apps: RwLock<AppCatalog>,
    pub launcher: Launcher,
    pub clipboard: Arc<dyn Clipboard>,
    session_id_counter: AtomicU32,
}

impl HostContext {
    /// Load persistent state and assemble the context.
    pub fn init(
        paths: Paths,
        config: Config,
        collaborators: Collaborators,
        vdisplay_ping_timeout: std::time::Duration,
    ) -> Result<Arc<Self>> {
        let clients = ClientRegistry::load(paths.file_state.clone())?;
        let identity = HostIdentity::load_or_create(&paths, clients.unique_id())?;
        apps::write_default_apps(&paths.file_apps)?;

        let config = Arc::new(RwLock::new(config));
        let vdisplay =
            VirtualDisplayHost::new(collaborators.virtual_display_driver, vdisplay_ping_timeout);
        let vdisplay_ready = vdisplay.ensure_open() == DriverStatus::Ok;

        let catalog = {
            let config = config.read().unwrap();
            apps::parse(
                &paths.file_apps,
                &config,
                &CatalogOptions {
                    assets_dir: paths.data_dir.join("assets"),
                    virtual_display_ready: vdisplay_ready,
                },
            )
        };

        let launcher = Launcher::new(
            Arc::clone(&config),
            collaborators.display,
            collaborators.encoders,
            vdisplay,
        );

        info!(
            "host context ready: {} paired client(s), {} app(s)",
            clients.len(),
            catalog.apps.len()
        );

        Ok(Arc::new(Self {
            paths,
            config,
            identity,
            clients,
            pairing: PairingEngine::new(),
            sessions: SessionRegistry::new(),
            apps: RwLock::new(catalog),
            launcher,
            clipboard: collaborators.clipboard,
            session_id_counter: AtomicU32::new(0),
        }))
    }

    /// Monotonic launch-session id.
    pub fn next_session_id(&self) -> u32 {
        self.session_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Re-read the app catalog, giving the virtual-display driver a
    /// chance to come back first.
    pub async fn reload_apps(&self) {
        let vdisplay_ready =
            self.launcher.vdisplay().reopen_with_retries(5).await == DriverStatus::Ok;
        let config = self.config.read().unwrap().clone();
        let catalog = apps::parse(
            &self.paths.file_apps,
            &config,
            &CatalogOptions {
                assets_dir: self.paths.data_dir.join("assets"),
                virtual_display_ready: vdisplay_ready,
            },
        );
        *self.apps.write().unwrap() = catalog;
    }

    /// Terminate the running app (and optionally refresh the catalog,
    /// the default after a user-driven close).
    pub async fn terminate_app(&self, immediate: bool, needs_refresh: bool) {
        self.launcher.terminate(immediate).await;
        if needs_refresh {
            self.reload_apps().await;
        }
    }

    /// Unpair one client: registry removal, live-session stop, and app
    /// shutdown when the last client is gone.
    pub async fn unpair_client(&self, uuid: &str) -> Result<bool> {
        let removed = self.clients.unpair(uuid)?;
        if removed {
            self.sessions.stop(uuid, true).await;
            if self.clients.is_empty() && self.launcher.running().await > 0 {
                self.terminate_app(false, true).await;
            }
        }
        Ok(removed)
    }

    /// Unpair every client and stop whatever is streaming.
    pub async fn unpair_all(&self) -> Result<()> {
        self.clients.unpair_all()?;
        self.sessions.terminate_all().await;
        self.terminate_app(false, true).await;
        Ok(())
    }

    /// Apply an admin client edit, propagating name/permission changes
    /// into any live session.
    pub async fn update_client(&self, uuid: &str, update: ClientUpdate) -> Result<bool> {
        let name = update.name.clone();
        let perm = update.perm & Permissions::ALL;
        self.sessions.update_info(uuid, &name, perm).await;
        self.clients.update(uuid, update)
    }

    /// Full shutdown: sessions drained, app reverted, driver closed.
    pub async fn shutdown(&self) {
        info!("shutting down host context");
        self.pairing.clear_sessions();
        self.sessions.terminate_all().await;
        self.launcher.terminate(false).await;
        self.launcher.vdisplay().shutdown();
    }

    pub fn input_only_app_id(&self) -> i32 {
        self.apps.read().unwrap().input_only_app_id
    }

    pub fn terminate_app_id(&self) -> i32 {
        self.apps.read().unwrap().terminate_app_id
    }
}
