//! Paired-client registry and state-file persistence.
//!
//! The registry owns `state.json`: the host unique id plus the
//! insertion-ordered list of paired clients. Mutations are serialised
//! behind one mutex, and every mutation is persisted and reloaded so a
//! crash immediately after the call cannot lose the change. Reads hand
//! out value snapshots.
//!
//! File format:
//!
//! ```json
//! { "root": { "uniqueid": "…", "named_devices": [ { "name": "…", … } ] } }
//! ```
//!
//! Legacy files stored `devices[].certs[]`; those entries are migrated at
//! load, each assigned a fresh UUID and full permissions.

use std::path::PathBuf;
use std::sync::Mutex;

use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::crypto::CertChain;
use crate::error::Result;
use crate::perm::Permissions;
use crate::storage;

/// One client-supplied command with its elevation flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommandEntry {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub elevated: bool,
}

/// A remote peer whose certificate the host has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedClient {
    pub name: String,
    pub uuid: String,
    /// PEM certificate presented during pairing.
    pub cert: String,
    /// Forced display mode ("WxHxFPS"), empty for client choice.
    pub display_mode: String,
    pub perm: Permissions,
    pub do_cmds: Vec<CommandEntry>,
    pub undo_cmds: Vec<CommandEntry>,
    pub enable_legacy_ordering: bool,
    pub allow_client_commands: bool,
    pub always_use_virtual_display: bool,
}

impl PairedClient {
    pub fn new(name: String, cert: String, uuid: String, perm: Permissions) -> Self {
        Self {
            name,
            uuid,
            cert,
            display_mode: String::new(),
            perm,
            do_cmds: Vec::new(),
            undo_cmds: Vec::new(),
            enable_legacy_ordering: true,
            allow_client_commands: true,
            always_use_virtual_display: false,
        }
    }

    fn from_value(value: &Value) -> Self {
        let str_of = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let bool_of = |key: &str, default: bool| {
            value.get(key).and_then(Value::as_bool).unwrap_or(default)
        };
        let cmds_of = |key: &str| -> Vec<CommandEntry> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| {
                            serde_json::from_value(item.clone())
                                .map_err(|e| warn!("skipping bad command entry: {e}"))
                                .ok()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let perm_raw = value
            .get("perm")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(Permissions::ALL.bits());

        Self {
            name: str_of("name"),
            uuid: str_of("uuid"),
            cert: str_of("cert"),
            display_mode: str_of("display_mode"),
            perm: Permissions::from_raw(perm_raw),
            do_cmds: cmds_of("do"),
            undo_cmds: cmds_of("undo"),
            enable_legacy_ordering: bool_of("enable_legacy_ordering", true),
            allow_client_commands: bool_of("allow_client_commands", true),
            always_use_virtual_display: bool_of("always_use_virtual_display", false),
        }
    }

    fn to_value(&self, name_override: &str) -> Value {
        let mut node = json!({
            "name": name_override,
            "cert": self.cert,
            "uuid": self.uuid,
            "display_mode": self.display_mode,
            "perm": self.perm.bits(),
            "enable_legacy_ordering": self.enable_legacy_ordering,
            "allow_client_commands": self.allow_client_commands,
            "always_use_virtual_display": self.always_use_virtual_display,
        });
        if !self.do_cmds.is_empty() {
            node["do"] = json!(self.do_cmds);
        }
        if !self.undo_cmds.is_empty() {
            node["undo"] = json!(self.undo_cmds);
        }
        node
    }
}

/// Admin-editable client fields (see `POST /api/clients/update`).
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    pub name: String,
    pub display_mode: String,
    pub perm: Permissions,
    pub do_cmds: Vec<CommandEntry>,
    pub undo_cmds: Vec<CommandEntry>,
    pub enable_legacy_ordering: bool,
    pub allow_client_commands: bool,
    pub always_use_virtual_display: bool,
}

struct Inner {
    unique_id: String,
    clients: Vec<PairedClient>,
    chain: CertChain,
}

impl Inner {
    fn rebuild_chain(&mut self) {
        self.chain.clear();
        for client in &self.clients {
            if let Err(e) = self.chain.add(&client.uuid, &client.cert) {
                warn!("unparsable certificate for client {}: {e}", client.uuid);
            }
        }
    }
}

/// Process-wide paired-client store.
pub struct ClientRegistry {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    /// Load the registry (migrating legacy layouts), creating a fresh
    /// unique id when the state file is missing or incomplete.
    pub fn load(path: PathBuf) -> Result<Self> {
        let (unique_id, clients) = match storage::read_json_value(&path) {
            Ok(Some(tree)) => Self::parse_state(&tree),
            Ok(None) => {
                info!("state file {} doesn't exist", path.display());
                (uuid::Uuid::new_v4().to_string(), Vec::new())
            }
            Err(e) => {
                warn!("couldn't read {}: {e}", path.display());
                (uuid::Uuid::new_v4().to_string(), Vec::new())
            }
        };

        info!("loaded {} paired client(s)", clients.len());
        let mut inner = Inner {
            unique_id,
            clients,
            chain: CertChain::new(),
        };
        inner.rebuild_chain();

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn parse_state(tree: &Value) -> (String, Vec<PairedClient>) {
        let root = tree.get("root").cloned().unwrap_or(Value::Null);
        let unique_id = root
            .get("uniqueid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut clients = Vec::new();

        // Legacy format: devices[].certs[] — each cert becomes a named
        // device with a fresh UUID and full permissions.
        if let Some(devices) = root.get("devices").and_then(Value::as_array) {
            for device in devices {
                if let Some(certs) = device.get("certs").and_then(Value::as_array) {
                    for cert in certs.iter().filter_map(Value::as_str) {
                        debug!("migrating legacy device certificate");
                        clients.push(PairedClient::new(
                            String::new(),
                            cert.to_string(),
                            uuid::Uuid::new_v4().to_string(),
                            Permissions::ALL,
                        ));
                    }
                }
            }
        }

        if let Some(devices) = root.get("named_devices").and_then(Value::as_array) {
            for device in devices {
                clients.push(PairedClient::from_value(device));
            }
        }

        (unique_id, clients)
    }

    fn save_locked(&self, inner: &Inner) -> Result<()> {
        let mut nodes = Vec::new();
        let mut seen_certs = std::collections::HashSet::new();
        let mut name_counts: std::collections::HashMap<String, usize> = Default::default();

        for client in &inner.clients {
            // Only persist each unique certificate once.
            if !seen_certs.insert(client.cert.clone()) {
                continue;
            }
            // Strip a pending " (N)" suffix before recounting duplicates.
            let base_name = match client.name.find(" (") {
                Some(pos) => &client.name[..pos],
                None => client.name.as_str(),
            };
            let count = name_counts.entry(base_name.to_string()).or_insert(0);
            let final_name = if *count > 0 {
                format!("{base_name} ({})", *count + 1)
            } else {
                base_name.to_string()
            };
            *count += 1;
            nodes.push(client.to_value(&final_name));
        }

        let tree = json!({
            "root": {
                "uniqueid": inner.unique_id,
                "named_devices": nodes,
            }
        });
        storage::write_json_atomic(&self.path, &tree)
    }

    /// Persist then reload, guaranteeing crash-recoverability of the
    /// mutation that just happened.
    fn save_and_reload(&self, inner: &mut Inner) -> Result<()> {
        self.save_locked(inner)?;
        if let Some(tree) = storage::read_json_value(&self.path)? {
            let (unique_id, clients) = Self::parse_state(&tree);
            inner.unique_id = unique_id;
            inner.clients = clients;
        }
        inner.rebuild_chain();
        Ok(())
    }

    /// The host unique id stored alongside the clients.
    pub fn unique_id(&self) -> String {
        self.inner.lock().unwrap().unique_id.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().clients.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    /// Value snapshot of every paired client, in insertion order.
    pub fn snapshot(&self) -> Vec<PairedClient> {
        self.inner.lock().unwrap().clients.clone()
    }

    pub fn find(&self, uuid: &str) -> Option<PairedClient> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
    }

    /// Commit a newly paired client.
    pub fn add(&self, client: PairedClient) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        info!("authorizing client [{}] ({})", client.name, client.uuid);
        inner.clients.push(client);
        self.save_and_reload(&mut inner)
    }

    /// Apply an admin edit. Returns `false` for an unknown UUID.
    pub fn update(&self, uuid: &str, update: ClientUpdate) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(client) = inner.clients.iter_mut().find(|c| c.uuid == uuid) else {
            return Ok(false);
        };
        client.name = update.name;
        client.display_mode = update.display_mode;
        client.perm = update.perm;
        client.do_cmds = update.do_cmds;
        client.undo_cmds = update.undo_cmds;
        client.enable_legacy_ordering = update.enable_legacy_ordering;
        client.allow_client_commands = update.allow_client_commands;
        client.always_use_virtual_display = update.always_use_virtual_display;
        self.save_and_reload(&mut inner)?;
        Ok(true)
    }

    /// Remove one client. Returns whether anything was removed.
    pub fn unpair(&self, uuid: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.clients.len();
        inner.clients.retain(|c| c.uuid != uuid);
        let removed = inner.clients.len() != before;
        self.save_and_reload(&mut inner)?;
        if removed {
            info!("unpaired client {uuid}");
        }
        Ok(removed)
    }

    /// Drop every paired client.
    pub fn unpair_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.clients.clear();
        info!("unpaired all clients");
        self.save_and_reload(&mut inner)
    }

    /// Match a TLS peer certificate against the registry.
    pub fn verify_peer(&self, peer: &X509) -> Option<PairedClient> {
        let inner = self.inner.lock().unwrap();
        let uuid = inner.chain.verify(peer)?;
        inner.clients.iter().find(|c| c.uuid == uuid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use tempfile::TempDir;

    fn registry() -> (TempDir, ClientRegistry) {
        let dir = TempDir::new().unwrap();
        let reg = ClientRegistry::load(dir.path().join("state.json")).unwrap();
        (dir, reg)
    }

    fn client(name: &str, cert: &str) -> PairedClient {
        PairedClient::new(
            name.into(),
            cert.into(),
            uuid::Uuid::new_v4().to_string(),
            Permissions::DEFAULT,
        )
    }

    #[test]
    fn fresh_registry_gets_unique_id() {
        let (_dir, reg) = registry();
        assert!(!reg.unique_id().is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn add_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let first_uuid;
        {
            let reg = ClientRegistry::load(path.clone()).unwrap();
            let c = client("Living Room", "cert-a");
            first_uuid = c.uuid.clone();
            reg.add(c).unwrap();
            assert_eq!(reg.len(), 1);
        }
        let reg = ClientRegistry::load(path).unwrap();
        assert_eq!(reg.len(), 1);
        let found = reg.find(&first_uuid).unwrap();
        assert_eq!(found.name, "Living Room");
        assert_eq!(found.perm, Permissions::DEFAULT);
    }

    #[test]
    fn uuid_appears_at_most_once() {
        let (_dir, reg) = registry();
        let c = client("Tablet", "cert-b");
        let uuid = c.uuid.clone();
        reg.add(c).unwrap();
        assert!(reg.unpair(&uuid).unwrap());
        assert!(!reg.unpair(&uuid).unwrap());
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_names_get_suffixes() {
        let (_dir, reg) = registry();
        reg.add(client("Phone", "cert-1")).unwrap();
        reg.add(client("Phone", "cert-2")).unwrap();
        reg.add(client("Phone (2)", "cert-3")).unwrap();

        let names: Vec<String> = reg.snapshot().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Phone", "Phone (2)", "Phone (3)"]);
    }

    #[test]
    fn update_edits_fields() {
        let (_dir, reg) = registry();
        let c = client("Old Name", "cert-c");
        let uuid = c.uuid.clone();
        reg.add(c).unwrap();

        let updated = reg
            .update(
                &uuid,
                ClientUpdate {
                    name: "New Name".into(),
                    display_mode: "2560x1440x120".into(),
                    perm: Permissions::ALL,
                    do_cmds: vec![CommandEntry { cmd: "echo hi".into(), elevated: false }],
                    undo_cmds: vec![],
                    enable_legacy_ordering: false,
                    allow_client_commands: false,
                    always_use_virtual_display: true,
                },
            )
            .unwrap();
        assert!(updated);

        let c = reg.find(&uuid).unwrap();
        assert_eq!(c.name, "New Name");
        assert_eq!(c.display_mode, "2560x1440x120");
        assert_eq!(c.perm, Permissions::ALL);
        assert_eq!(c.do_cmds.len(), 1);
        assert!(c.always_use_virtual_display);
        assert!(!reg.update("missing", ClientUpdate {
            name: String::new(),
            display_mode: String::new(),
            perm: Permissions::DEFAULT,
            do_cmds: vec![],
            undo_cmds: vec![],
            enable_legacy_ordering: true,
            allow_client_commands: true,
            always_use_virtual_display: false,
        }).unwrap());
    }

    #[test]
    fn migrates_legacy_device_certs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let legacy = serde_json::json!({
            "root": {
                "uniqueid": "11111111-2222-3333-4444-555555555555",
                "devices": [
                    { "certs": ["legacy-cert-pem"] }
                ]
            }
        });
        storage::write_json_atomic(&path, &legacy).unwrap();

        let reg = ClientRegistry::load(path).unwrap();
        assert_eq!(reg.unique_id(), "11111111-2222-3333-4444-555555555555");
        assert_eq!(reg.len(), 1);
        let migrated = &reg.snapshot()[0];
        assert_eq!(migrated.cert, "legacy-cert-pem");
        assert_eq!(migrated.perm, Permissions::ALL);
        assert!(!migrated.uuid.is_empty());
    }

    #[test]
    fn verify_peer_resolves_client() {
        let (_dir, reg) = registry();
        let creds = crypto::gen_creds("peer-device", 2048).unwrap();
        let c = PairedClient::new(
            "Peer".into(),
            creds.cert_pem.clone(),
            uuid::Uuid::new_v4().to_string(),
            Permissions::ALL,
        );
        let uuid = c.uuid.clone();
        reg.add(c).unwrap();

        let peer = openssl::x509::X509::from_pem(creds.cert_pem.as_bytes()).unwrap();
        let resolved = reg.verify_peer(&peer).unwrap();
        assert_eq!(resolved.uuid, uuid);

        let stranger = crypto::gen_creds("stranger", 2048).unwrap();
        let other = openssl::x509::X509::from_pem(stranger.cert_pem.as_bytes()).unwrap();
        assert!(reg.verify_peer(&other).is_none());
    }
}
