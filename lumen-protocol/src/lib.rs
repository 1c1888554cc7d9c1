//! Core library for the Lumen game-streaming host.
//!
//! Lumen emulates a proprietary gamestream protocol: it pairs remote
//! clients through a four-phase cryptographic handshake, serves an
//! HTTP-over-TLS control plane, orchestrates app launches (virtual
//! displays, prep commands, process groups), and manages streaming
//! sessions with adaptive bitrate feedback. The encoder backends, input
//! injection, audio capture, and the platform virtual-display driver are
//! external collaborators behind traits.

pub mod apps;
pub mod clients;
pub mod config;
pub mod context;
pub mod crypto;
pub mod identity;
pub mod launcher;
pub mod pairing;
pub mod perm;
pub mod platform;
pub mod session;
pub mod storage;
pub mod stream;

mod error;

pub use clients::{ClientRegistry, ClientUpdate, CommandEntry, PairedClient};
pub use config::{Config, EncryptionMode, HdrOption, Origin, Paths};
pub use context::{Collaborators, HostContext};
pub use error::{HostError, Result};
pub use identity::HostIdentity;
pub use pairing::{OtpOutcome, PairingEngine, PairingReply};
pub use perm::Permissions;
pub use session::{LaunchSession, SessionRegistry, SessionState, StreamSession};
pub use stream::{LossReport, StreamConfig, StreamEvent};

/// Gamestream protocol version advertised in `serverinfo`. The negative
/// fourth component marks a non-GFE host to the clients.
pub const VERSION: &str = "7.1.431.-1";

/// GFE version string the emulated protocol replicates.
pub const GFE_VERSION: &str = "3.23.0.74";
