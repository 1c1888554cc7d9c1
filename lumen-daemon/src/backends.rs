//! Default collaborator backends.
//!
//! The encoder stack, display-device layer, virtual-display driver, and
//! clipboard are external collaborators; these are the conservative
//! built-ins the daemon wires up when no platform backend is linked in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use lumen_protocol::config::Config;
use lumen_protocol::launcher::display::{CodecSupport, DisplayDevice, EncoderProbe};
use lumen_protocol::launcher::virtual_display::{VirtualDisplayDriver, VirtualDisplayRequest};
use lumen_protocol::platform::Clipboard;
use lumen_protocol::session::LaunchSession;
use lumen_protocol::{HostError, Result};

/// Display-device layer that records intent but drives no hardware. The
/// platform backend replaces this on supported systems.
pub struct PassiveDisplayDevice;

impl DisplayDevice for PassiveDisplayDevice {
    fn configure(&self, launch: &LaunchSession, config: &Config) -> Result<()> {
        info!(
            "display configure requested: {}x{}@{} (output [{}])",
            launch.width,
            launch.height,
            launch.fps_milli / 1000,
            config.output_name
        );
        Ok(())
    }

    fn revert(&self) {
        debug!("display configuration revert requested");
    }

    fn reset_persistence(&self) {
        debug!("display persistence reset requested");
    }
}

/// Encoder probe advertising a conservative H.264 + HEVC-8bit profile.
pub struct DefaultEncoderProbe {
    support: Mutex<CodecSupport>,
    capture_ready: AtomicBool,
}

impl DefaultEncoderProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            support: Mutex::new(CodecSupport { hevc_mode: 2, av1_mode: 1, yuv444: [false; 3] }),
            capture_ready: AtomicBool::new(true),
        })
    }
}

impl EncoderProbe for DefaultEncoderProbe {
    fn probe(&self) -> Result<CodecSupport> {
        let support = *self.support.lock().unwrap();
        debug!("encoder probe: flags {:#x}", support.server_codec_mode_flags());
        Ok(support)
    }

    fn capture_ready(&self) -> bool {
        self.capture_ready.load(Ordering::Relaxed)
    }

    fn last_support(&self) -> CodecSupport {
        *self.support.lock().unwrap()
    }
}

/// Placeholder driver for platforms without the virtual-display kernel
/// module; every open attempt reports the driver missing.
pub struct MissingVirtualDisplayDriver;

impl VirtualDisplayDriver for MissingVirtualDisplayDriver {
    fn open(&self) -> Result<()> {
        Err(HostError::TransientResource(
            "virtual display driver is not installed".into(),
        ))
    }
    fn close(&self) {}
    fn ping(&self) -> bool {
        false
    }
    fn create_display(&self, _request: &VirtualDisplayRequest) -> Result<String> {
        Err(HostError::TransientResource("virtual display driver is not open".into()))
    }
    fn remove_display(&self, _guid: &uuid::Uuid) -> bool {
        false
    }
    fn change_mode(&self, _d: &str, _w: u32, _h: u32, _f: u32, _i: bool) -> Result<()> {
        Err(HostError::TransientResource("virtual display driver is not open".into()))
    }
    fn hdr_state(&self, _d: &str) -> Option<bool> {
        None
    }
    fn set_hdr(&self, _d: &str, _e: bool) -> bool {
        false
    }
}

/// Host-side clipboard buffer used until a desktop backend is wired in.
#[derive(Default)]
pub struct MemoryClipboard {
    content: Mutex<String>,
}

impl Clipboard for MemoryClipboard {
    fn get_text(&self) -> Result<String> {
        Ok(self.content.lock().unwrap().clone())
    }

    fn set_text(&self, content: &str) -> Result<()> {
        *self.content.lock().unwrap() = content.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_clipboard_round_trip() {
        let clipboard = MemoryClipboard::default();
        assert_eq!(clipboard.get_text().unwrap(), "");
        clipboard.set_text("copied").unwrap();
        assert_eq!(clipboard.get_text().unwrap(), "copied");
    }

    #[test]
    fn missing_driver_always_fails() {
        let driver = MissingVirtualDisplayDriver;
        assert!(driver.open().is_err());
        assert!(!driver.ping());
    }
}
