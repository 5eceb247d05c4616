//! Process-wide record of which kinds of consumer are reading.
//!
//! Diagnostics only: the read path stamps the current time for its
//! [`ConsumerKind`] on every render-cache-key query and every successful
//! cached read, and UI code asks which kinds were seen recently. Nothing on
//! the data path reads it back.
//!
//! The registry starts empty when the process starts and is only reset by
//! [`ActiveConsumers::clear`].

use std::time::{Duration, Instant};

use parking_lot::{Mutex, const_mutex};
use serde::{Deserialize, Serialize};

/// Kind of consumer, as a bit in a [`ConsumerPattern`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerKind {
    /// OpenVR overlay
    OpenVr = 1 << 0,
    /// OpenXR compositor layer on Direct3D 11
    OpenXrD3D11 = 1 << 1,
    /// OpenXR compositor layer on Direct3D 12
    OpenXrD3D12 = 1 << 2,
    /// OpenXR compositor layer on Vulkan
    OpenXrVulkan = 1 << 3,
    /// Flat-screen overlay drawn into a Direct3D 11 game
    NonVrD3D11 = 1 << 4,
    /// Standalone viewer window; matches every pattern
    Viewer = u32::MAX,
}

impl ConsumerKind {
    /// Every kind, in slot order.
    pub const ALL: [Self; 6] = [
        Self::OpenVr,
        Self::OpenXrD3D11,
        Self::OpenXrD3D12,
        Self::OpenXrVulkan,
        Self::NonVrD3D11,
        Self::Viewer,
    ];

    /// The kind's bits.
    pub const fn bits(self) -> u32 {
        self as u32
    }

    const fn slot(self) -> usize {
        match self {
            Self::OpenVr => 0,
            Self::OpenXrD3D11 => 1,
            Self::OpenXrD3D12 => 2,
            Self::OpenXrVulkan => 3,
            Self::NonVrD3D11 => 4,
            Self::Viewer => 5,
        }
    }
}

/// A set of consumer kinds a frame is intended for.
///
/// A pattern matches a kind when every bit of the pattern is present in
/// the kind, so the empty pattern matches everything and
/// [`ConsumerKind::Viewer`] matches every pattern.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerPattern(u32);

impl ConsumerPattern {
    /// Create a pattern from a raw mask.
    pub const fn from_mask(mask: u32) -> Self {
        Self(mask)
    }

    /// Whether `kind` is covered by this pattern.
    pub const fn matches(self, kind: ConsumerKind) -> bool {
        self.0 & kind.bits() == self.0
    }

    /// Raw mask, for logs.
    pub const fn raw_mask_for_debugging(self) -> u32 {
        self.0
    }
}

impl From<ConsumerKind> for ConsumerPattern {
    fn from(kind: ConsumerKind) -> Self {
        Self(kind.bits())
    }
}

/// Last time each consumer kind was seen in this process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveConsumers {
    last_seen: [Option<Instant>; ConsumerKind::ALL.len()],
}

static REGISTRY: Mutex<ActiveConsumers> = const_mutex(ActiveConsumers::new());

impl ActiveConsumers {
    const fn new() -> Self {
        Self {
            last_seen: [None; ConsumerKind::ALL.len()],
        }
    }

    /// A copy of the current registry.
    pub fn get() -> Self {
        *REGISTRY.lock()
    }

    /// Record that `kind` is reading now.
    pub fn set(kind: ConsumerKind) {
        REGISTRY.lock().last_seen[kind.slot()] = Some(Instant::now());
    }

    /// Forget every kind.
    pub fn clear() {
        *REGISTRY.lock() = Self::new();
    }

    /// When `kind` was last recorded, in this copy.
    pub const fn last_seen(&self, kind: ConsumerKind) -> Option<Instant> {
        self.last_seen[kind.slot()]
    }

    /// Kinds recorded within `window` of now, in this copy.
    pub fn active_within(&self, window: Duration) -> Vec<ConsumerKind> {
        let now = Instant::now();
        ConsumerKind::ALL
            .into_iter()
            .filter(|kind| {
                self.last_seen(*kind)
                    .is_some_and(|seen| now.saturating_duration_since(seen) <= window)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_pattern_matching() {
        let vr = ConsumerPattern::from(ConsumerKind::OpenXrD3D11);
        assert!(vr.matches(ConsumerKind::OpenXrD3D11));
        assert!(!vr.matches(ConsumerKind::NonVrD3D11));
        assert!(vr.matches(ConsumerKind::Viewer));
        assert!(ConsumerPattern::default().matches(ConsumerKind::OpenVr));

        let both = ConsumerPattern::from_mask(
            ConsumerKind::OpenVr.bits() | ConsumerKind::NonVrD3D11.bits(),
        );
        assert!(!both.matches(ConsumerKind::OpenVr));
        assert!(both.matches(ConsumerKind::Viewer));
    }

    #[test]
    fn test_slots_are_distinct() {
        let slots: HashSet<usize> = ConsumerKind::ALL.iter().map(|k| k.slot()).collect();
        assert_eq!(slots.len(), ConsumerKind::ALL.len());
        assert!(slots.iter().all(|&slot| slot < ConsumerKind::ALL.len()));
    }

    // The registry is process-wide; keep every assertion about it in one
    // test so parallel tests cannot interleave.
    #[test]
    fn test_registry_set_and_clear() {
        ActiveConsumers::set(ConsumerKind::OpenXrVulkan);
        let snapshot = ActiveConsumers::get();
        assert!(snapshot.last_seen(ConsumerKind::OpenXrVulkan).is_some());
        assert!(
            snapshot
                .active_within(Duration::from_secs(60))
                .contains(&ConsumerKind::OpenXrVulkan)
        );

        ActiveConsumers::clear();
        let cleared = ActiveConsumers::get();
        assert!(cleared.last_seen(ConsumerKind::OpenXrVulkan).is_none());
    }
}
