//! Display and encoder collaborator seams.
//!
//! The encoder backends and the display-device layer are external
//! collaborators; the launch orchestrator and the control plane only see
//! these traits. `CodecSupport` is the probe result `serverinfo` folds
//! into its `ServerCodecModeSupport` flags.

use crate::config::Config;
use crate::error::Result;
use crate::session::LaunchSession;

// Codec-mode flags as the clients understand them.
pub const SCM_H264: u32 = 0x0001;
pub const SCM_H264_HIGH8_444: u32 = 0x0002;
pub const SCM_HEVC: u32 = 0x0100;
pub const SCM_HEVC_MAIN10: u32 = 0x0200;
pub const SCM_HEVC_REXT8_444: u32 = 0x0400;
pub const SCM_HEVC_REXT10_444: u32 = 0x0800;
pub const SCM_AV1_MAIN8: u32 = 0x1_0000;
pub const SCM_AV1_MAIN10: u32 = 0x2_0000;
pub const SCM_AV1_HIGH8_444: u32 = 0x4_0000;
pub const SCM_AV1_HIGH10_444: u32 = 0x8_0000;

/// Result of an encoder probe.
///
/// `hevc_mode`/`av1_mode`: 0 = unsupported, 1 = disabled, 2 = 8-bit,
/// 3 = 8-bit + 10-bit (HDR). `yuv444` is per codec family
/// (H.264, HEVC, AV1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSupport {
    pub hevc_mode: u8,
    pub av1_mode: u8,
    pub yuv444: [bool; 3],
}

impl Default for CodecSupport {
    fn default() -> Self {
        Self { hevc_mode: 1, av1_mode: 1, yuv444: [false; 3] }
    }
}

impl CodecSupport {
    /// Fold into the client-facing `ServerCodecModeSupport` bitfield.
    pub fn server_codec_mode_flags(&self) -> u32 {
        let mut flags = SCM_H264;
        if self.yuv444[0] {
            flags |= SCM_H264_HIGH8_444;
        }
        if self.hevc_mode >= 2 {
            flags |= SCM_HEVC;
            if self.yuv444[1] {
                flags |= SCM_HEVC_REXT8_444;
            }
        }
        if self.hevc_mode >= 3 {
            flags |= SCM_HEVC_MAIN10;
            if self.yuv444[1] {
                flags |= SCM_HEVC_REXT10_444;
            }
        }
        if self.av1_mode >= 2 {
            flags |= SCM_AV1_MAIN8;
            if self.yuv444[2] {
                flags |= SCM_AV1_HIGH8_444;
            }
        }
        if self.av1_mode >= 3 {
            flags |= SCM_AV1_MAIN10;
            if self.yuv444[2] {
                flags |= SCM_AV1_HIGH10_444;
            }
        }
        flags
    }

    /// HDR streaming needs HEVC Main10.
    pub fn hdr_supported(&self) -> bool {
        self.hevc_mode >= 3
    }

    /// `MaxLumaPixelsHEVC` advertised in `serverinfo`.
    pub fn max_luma_pixels_hevc(&self) -> &'static str {
        if self.hevc_mode > 1 {
            "1869449984"
        } else {
            "0"
        }
    }
}

/// Display-device collaborator: applies and reverts display modes for a
/// launch session.
pub trait DisplayDevice: Send + Sync {
    /// Apply the display configuration the session asks for.
    fn configure(&self, launch: &LaunchSession, config: &Config) -> Result<()>;
    /// Undo whatever `configure` changed.
    fn revert(&self);
    /// Forget persisted display state (virtual displays manage their own).
    fn reset_persistence(&self);
    /// Map a driver-reported display name to the capture pipeline's name.
    fn map_display_name(&self, raw: &str) -> String {
        raw.to_string()
    }
}

/// Encoder probe collaborator.
pub trait EncoderProbe: Send + Sync {
    /// Re-probe the encoders against the active GPU/display. An error is
    /// the 503 "failed to initialize video capture/encoding" condition.
    fn probe(&self) -> Result<CodecSupport>;
    /// Whether any capture-capable display is currently present.
    fn capture_ready(&self) -> bool;
    /// The most recent successful probe result.
    fn last_support(&self) -> CodecSupport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_is_always_advertised() {
        let support = CodecSupport { hevc_mode: 0, av1_mode: 0, yuv444: [false; 3] };
        assert_eq!(support.server_codec_mode_flags(), SCM_H264);
        assert!(!support.hdr_supported());
        assert_eq!(support.max_luma_pixels_hevc(), "0");
    }

    #[test]
    fn hevc_modes_accumulate() {
        let support = CodecSupport { hevc_mode: 2, av1_mode: 1, yuv444: [false; 3] };
        assert_eq!(support.server_codec_mode_flags(), SCM_H264 | SCM_HEVC);

        let support = CodecSupport { hevc_mode: 3, av1_mode: 1, yuv444: [false; 3] };
        assert_eq!(
            support.server_codec_mode_flags(),
            SCM_H264 | SCM_HEVC | SCM_HEVC_MAIN10
        );
        assert!(support.hdr_supported());
        assert_eq!(support.max_luma_pixels_hevc(), "1869449984");
    }

    #[test]
    fn yuv444_flags_follow_codec_families() {
        let support = CodecSupport { hevc_mode: 3, av1_mode: 3, yuv444: [true; 3] };
        let flags = support.server_codec_mode_flags();
        assert!(flags & SCM_H264_HIGH8_444 != 0);
        assert!(flags & SCM_HEVC_REXT8_444 != 0);
        assert!(flags & SCM_HEVC_REXT10_444 != 0);
        assert!(flags & SCM_AV1_HIGH8_444 != 0);
        assert!(flags & SCM_AV1_HIGH10_444 != 0);
    }
}
