// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Why a monitor's video is not playing. Playback runs only when empty.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PauseReasons: u8 {
        const USER_PAUSED = 1 << 0;
        const WINDOW_MAXIMIZED = 1 << 1;
        const BATTERY_SAVING = 1 << 2;
        const MONITOR_DETACHED = 1 << 3;
    }
}

impl PauseReasons {
    /// Kebab-case names of the set reasons.
    #[must_use]
    pub fn names(self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase().replace('_', "-"))
            .collect()
    }
}

impl fmt::Display for PauseReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join(", "))
    }
}
