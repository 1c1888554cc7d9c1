//! Streaming session state and registry.
//!
//! A [`StreamSession`] is allocated when a paired client launches or
//! resumes an app and lives until its data-plane task has been joined.
//! The registry keys sessions by the paired-client UUID; the RTSP
//! handshake drives the state transitions externally, the registry only
//! enforces monotonicity and single-writer semantics.

pub mod bitrate;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::CommandEntry;
use crate::perm::Permissions;
use crate::stream::{StreamConfig, StreamPlane};

/// Session lifecycle.
///
/// `STOPPED → STARTING → RUNNING → STOPPING → STOPPED`; `stop()` on a
/// stopped or stopping session is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Stopped = 0,
    Stopping = 1,
    Starting = 2,
    Running = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Stopping,
            2 => SessionState::Starting,
            3 => SessionState::Running,
            _ => SessionState::Stopped,
        }
    }
}

/// Everything negotiated at `/launch` time, handed to the data plane.
#[derive(Debug, Clone)]
pub struct LaunchSession {
    /// Monotonic id assigned at creation.
    pub id: u32,
    pub gcm_key: Vec<u8>,
    /// 16-byte IV; the first four bytes carry the big-endian `rikeyid`.
    pub iv: Vec<u8>,
    /// Hex payload the client echoes on the AV ping.
    pub av_ping_payload: String,
    pub control_connect_data: u32,
    pub device_name: String,
    /// Paired-client UUID this session belongs to.
    pub unique_id: String,
    pub perm: Permissions,
    pub host_audio: bool,
    pub width: u32,
    pub height: u32,
    /// Frames per second times 1000.
    pub fps_milli: u32,
    pub gcmap: i32,
    pub surround_info: i32,
    pub surround_params: String,
    pub enable_hdr: bool,
    pub enable_sops: bool,
    pub virtual_display: bool,
    pub scale_factor: u32,
    /// `rtsp://` or `rtspenc://`, depending on GCM negotiation.
    pub rtsp_url_scheme: String,
    pub client_do_cmds: Vec<CommandEntry>,
    pub client_undo_cmds: Vec<CommandEntry>,
    pub input_only: bool,
}

impl LaunchSession {
    /// Whether the RTSP control stream is encrypted for this session.
    pub fn encrypted(&self) -> bool {
        self.rtsp_url_scheme == "rtspenc://"
    }
}

/// One live streaming session.
pub struct StreamSession {
    pub launch_session_id: u32,
    client_uuid: String,
    device_name: Mutex<String>,
    perm: Mutex<Permissions>,
    state: AtomicU8,
    plane: StreamPlane,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn uuid(&self) -> &str {
        &self.client_uuid
    }

    pub fn device_name(&self) -> String {
        self.device_name.lock().unwrap().clone()
    }

    pub fn permissions(&self) -> Permissions {
        *self.perm.lock().unwrap()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Access to the data-plane boundary (loss reports, events, stats).
    pub fn plane(&self) -> &StreamPlane {
        &self.plane
    }

    /// RTSP handshake completed; only valid from `Starting`.
    pub fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Starting as u8,
                SessionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Rename / re-permission a live session (registry edit propagation).
    fn update_device_info(&self, name: &str, perm: Permissions) {
        *self.device_name.lock().unwrap() = name.to_string();
        *self.perm.lock().unwrap() = perm;
    }

    /// Move to `Stopping` unless already stopped/stopping. Returns whether
    /// this call won the transition.
    fn begin_stop(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == SessionState::Stopped as u8 || current == SessionState::Stopping as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    SessionState::Stopping as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    async fn finish_stop(&self, graceful: bool) {
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            if graceful {
                self.plane.signal_shutdown();
                if let Err(e) = join.await {
                    warn!("session {} pump task failed: {e}", self.client_uuid);
                }
            } else {
                join.abort();
                let _ = join.await;
            }
        }
        self.state
            .store(SessionState::Stopped as u8, Ordering::Release);
        debug!("session {} stopped", self.client_uuid);
    }
}

/// All live sessions, keyed by paired-client UUID.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a session for `launch` and spawn its data-plane task.
    ///
    /// A lingering session for the same client is stopped first so a
    /// client UUID maps to at most one live session.
    pub async fn alloc(&self, config: StreamConfig, launch: &LaunchSession) -> Arc<StreamSession> {
        if let Some(previous) = self.remove(&launch.unique_id) {
            if previous.begin_stop() {
                previous.finish_stop(false).await;
            }
        }

        let (plane, join) = StreamPlane::spawn(&config);
        let session = Arc::new(StreamSession {
            launch_session_id: launch.id,
            client_uuid: launch.unique_id.clone(),
            device_name: Mutex::new(launch.device_name.clone()),
            perm: Mutex::new(launch.perm),
            state: AtomicU8::new(SessionState::Starting as u8),
            plane,
            join: Mutex::new(Some(join)),
        });

        info!(
            "session {} allocated for [{}] ({})",
            launch.id, launch.device_name, launch.unique_id
        );
        self.sessions
            .lock()
            .unwrap()
            .insert(launch.unique_id.clone(), Arc::clone(&session));
        session
    }

    fn remove(&self, uuid: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().unwrap().remove(uuid)
    }

    pub fn find(&self, uuid: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().unwrap().get(uuid).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn all_uuids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Stop one session. Idempotent; returns whether a session existed.
    pub async fn stop(&self, uuid: &str, graceful: bool) -> bool {
        let Some(session) = self.remove(uuid) else {
            return false;
        };
        if session.begin_stop() {
            session.finish_stop(graceful).await;
        }
        true
    }

    /// Gracefully stop every session. When this returns, each member has
    /// observed `Stopping` and its data-plane task has been joined.
    pub async fn terminate_all(&self) {
        let sessions: Vec<Arc<StreamSession>> = {
            let mut map = self.sessions.lock().unwrap();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            if session.begin_stop() {
                session.finish_stop(true).await;
            }
        }
    }

    /// Propagate a registry edit into a live session. A client stripped of
    /// its view permission is disconnected.
    pub async fn update_info(&self, uuid: &str, name: &str, perm: Permissions) -> bool {
        let Some(session) = self.find(uuid) else {
            return false;
        };
        session.update_device_info(name, perm);
        if !perm.check_any(Permissions::ALLOW_VIEW) {
            info!("client {uuid} lost view permission, disconnecting its session");
            self.stop(uuid, true).await;
        }
        true
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_session(uuid: &str, id: u32) -> LaunchSession {
        LaunchSession {
            id,
            gcm_key: vec![0; 16],
            iv: vec![0; 16],
            av_ping_payload: "00".repeat(8),
            control_connect_data: 7,
            device_name: "Test Client".into(),
            unique_id: uuid.into(),
            perm: Permissions::ALL,
            host_audio: false,
            width: 1920,
            height: 1080,
            fps_milli: 60_000,
            gcmap: 0,
            surround_info: 196_610,
            surround_params: String::new(),
            enable_hdr: false,
            enable_sops: true,
            virtual_display: false,
            scale_factor: 100,
            rtsp_url_scheme: "rtsp://".into(),
            client_do_cmds: Vec::new(),
            client_undo_cmds: Vec::new(),
            input_only: false,
        }
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let registry = SessionRegistry::new();
        let session = registry
            .alloc(StreamConfig::default(), &launch_session("client-1", 1))
            .await;

        assert_eq!(session.state(), SessionState::Starting);
        assert!(session.mark_running());
        assert_eq!(session.state(), SessionState::Running);
        // Second transition attempt is refused.
        assert!(!session.mark_running());

        assert!(registry.stop("client-1", true).await);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry
            .alloc(StreamConfig::default(), &launch_session("client-1", 1))
            .await;
        session.mark_running();

        assert!(registry.stop("client-1", true).await);
        // Session already removed; a second stop is a no-op.
        assert!(!registry.stop("client-1", true).await);
        assert_eq!(session.state(), SessionState::Stopped);

        // begin_stop on a stopped session refuses.
        assert!(!session.begin_stop());
    }

    #[tokio::test]
    async fn one_session_per_client_uuid() {
        let registry = SessionRegistry::new();
        let first = registry
            .alloc(StreamConfig::default(), &launch_session("client-1", 1))
            .await;
        let second = registry
            .alloc(StreamConfig::default(), &launch_session("client-1", 2))
            .await;

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.find("client-1").unwrap().launch_session_id, 2);
        assert_eq!(first.state(), SessionState::Stopped);
        assert_eq!(second.state(), SessionState::Starting);
    }

    #[tokio::test]
    async fn terminate_all_joins_everything() {
        let registry = SessionRegistry::new();
        let a = registry
            .alloc(StreamConfig::default(), &launch_session("a", 1))
            .await;
        let b = registry
            .alloc(StreamConfig::default(), &launch_session("b", 2))
            .await;
        a.mark_running();
        b.mark_running();

        registry.terminate_all().await;
        assert_eq!(registry.count(), 0);
        assert_eq!(a.state(), SessionState::Stopped);
        assert_eq!(b.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn permission_revocation_disconnects() {
        let registry = SessionRegistry::new();
        let session = registry
            .alloc(StreamConfig::default(), &launch_session("client-1", 1))
            .await;
        session.mark_running();

        // Rename keeps the session alive.
        assert!(
            registry
                .update_info("client-1", "Renamed", Permissions::ALL)
                .await
        );
        assert_eq!(session.device_name(), "Renamed");
        assert_eq!(registry.count(), 1);

        // Dropping view|launch disconnects.
        assert!(
            registry
                .update_info("client-1", "Renamed", Permissions::LIST)
                .await
        );
        assert_eq!(registry.count(), 0);
        assert_eq!(session.state(), SessionState::Stopped);

        assert!(!registry.update_info("missing", "x", Permissions::ALL).await);
    }
}
