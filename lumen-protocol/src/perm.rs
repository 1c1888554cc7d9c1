//! Client permission model.
//!
//! Permissions are a 32-bit mask partitioned into three groups: input,
//! operation, and action. The wire format (state file, admin API,
//! `serverinfo`) carries the raw `u32`, so the bit positions are part of
//! the protocol and must not move.

use bitflags::bitflags;

bitflags! {
    /// Permission bits granted to a paired client.
    ///
    /// Serialized everywhere as the raw `u32` (see [`Permissions::from_raw`]),
    /// never as flag names.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const RESERVED          = 1;

        // Input group
        const INPUT_CONTROLLER  = 1 << 8;
        const INPUT_TOUCH       = 1 << 9;
        const INPUT_PEN         = 1 << 10;
        const INPUT_MOUSE       = 1 << 11;
        const INPUT_KEYBOARD    = 1 << 12;
        const ALL_INPUTS        = Self::INPUT_CONTROLLER.bits()
                                | Self::INPUT_TOUCH.bits()
                                | Self::INPUT_PEN.bits()
                                | Self::INPUT_MOUSE.bits()
                                | Self::INPUT_KEYBOARD.bits();

        // Operation group
        const CLIPBOARD_SET     = 1 << 16;
        const CLIPBOARD_READ    = 1 << 17;
        const FILE_UPLOAD       = 1 << 18;
        const FILE_DOWNLOAD     = 1 << 19;
        const SERVER_CMD        = 1 << 20;
        const ALL_OPERATIONS    = Self::CLIPBOARD_SET.bits()
                                | Self::CLIPBOARD_READ.bits()
                                | Self::FILE_UPLOAD.bits()
                                | Self::FILE_DOWNLOAD.bits()
                                | Self::SERVER_CMD.bits();

        // Action group
        const LIST              = 1 << 24;
        const VIEW              = 1 << 25;
        const LAUNCH            = 1 << 26;
        /// Joining an existing stream requires view or launch.
        const ALLOW_VIEW        = Self::VIEW.bits() | Self::LAUNCH.bits();
        const ALL_ACTIONS       = Self::LIST.bits()
                                | Self::VIEW.bits()
                                | Self::LAUNCH.bits();

        /// Permissions granted to newly paired clients (after the first).
        const DEFAULT           = Self::VIEW.bits() | Self::LIST.bits();
        /// Every permission currently defined.
        const ALL               = Self::ALL_INPUTS.bits()
                                | Self::ALL_OPERATIONS.bits()
                                | Self::ALL_ACTIONS.bits();
    }
}

impl Permissions {
    /// Build from a stored `u32`, dropping any bits outside [`Self::ALL`].
    pub fn from_raw(raw: u32) -> Self {
        Self::from_bits_truncate(raw) & Self::ALL
    }

    /// Whether every bit of `required` is granted.
    pub fn check(self, required: Permissions) -> bool {
        self.contains(required)
    }

    /// Whether any bit of `wanted` is granted.
    pub fn check_any(self, wanted: Permissions) -> bool {
        self.intersects(wanted)
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_subset_of_all() {
        assert!(Permissions::ALL.contains(Permissions::DEFAULT));
        assert_ne!(Permissions::DEFAULT, Permissions::ALL);
    }

    #[test]
    fn groups_are_disjoint() {
        assert!((Permissions::ALL_INPUTS & Permissions::ALL_OPERATIONS).is_empty());
        assert!((Permissions::ALL_INPUTS & Permissions::ALL_ACTIONS).is_empty());
        assert!((Permissions::ALL_OPERATIONS & Permissions::ALL_ACTIONS).is_empty());
    }

    #[test]
    fn from_raw_masks_unknown_bits() {
        let perm = Permissions::from_raw(u32::MAX);
        assert_eq!(perm, Permissions::ALL);
        // The reserved bit is not part of ALL and must be dropped.
        assert!(!perm.contains(Permissions::RESERVED));
    }

    #[test]
    fn permission_checks() {
        let perm = Permissions::DEFAULT;
        assert!(perm.check(Permissions::LIST));
        assert!(perm.check(Permissions::VIEW));
        assert!(!perm.check(Permissions::LAUNCH));
        assert!(perm.check_any(Permissions::ALLOW_VIEW));

        let none = Permissions::empty();
        assert!(!none.check_any(Permissions::ALLOW_VIEW));
        assert!(none.is_empty());
    }

    #[test]
    fn wire_round_trip() {
        let raw = Permissions::ALL.bits();
        assert_eq!(Permissions::from_raw(raw), Permissions::ALL);
        let view_list = Permissions::VIEW | Permissions::LIST;
        assert_eq!(Permissions::from_raw(view_list.bits()), Permissions::DEFAULT);
    }
}
