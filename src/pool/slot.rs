//! Scanout slot type and its lifecycle state machine.

use std::fmt;

/// Base value for synthesized connector identifiers.
const CONNECTOR_ID_BASE: u32 = 32;

/// Base value for synthesized display controller identifiers.
const CONTROLLER_ID_BASE: u32 = 64;

/// Lifecycle state of a scanout slot.
///
/// ```text
///   Disabled -> Enabling -> Enabled <-> Leased
///      ^           |           |
///      |           v           v
///      +------ (unwind)    Disabling
///      |                       |
///      +-----------------------+
/// ```
///
/// `Leased` is reachable only from `Enabled`. `Enabling -> Disabled` is the
/// unwind edge taken when an enable fails partway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Not scanned out, available for allocation
    Disabled,
    /// Allocation reserved, enable in flight
    Enabling,
    /// Scanning out, no lease attached
    Enabled,
    /// Scanning out on behalf of a leased workload
    Leased,
    /// Teardown in flight; not allocatable until it completes
    Disabling,
}

impl SlotState {
    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Disabled, Enabling)
                | (Enabling, Enabled)
                | (Enabling, Disabled)
                | (Enabled, Leased)
                | (Leased, Enabled)
                | (Enabled, Disabling)
                | (Disabling, Disabled)
        )
    }

    /// Whether the slot is currently producing scanout (enabled or leased).
    pub fn is_active(self) -> bool {
        matches!(self, SlotState::Enabled | SlotState::Leased)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Disabled => "disabled",
            SlotState::Enabling => "enabling",
            SlotState::Enabled => "enabled",
            SlotState::Leased => "leased",
            SlotState::Disabling => "disabling",
        };
        f.write_str(s)
    }
}

/// A single scanout slot.
///
/// `connector_id` and `controller_id` are synthesized, stable per index, and
/// exist for operator-facing listings only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanoutSlot {
    pub index: u32,
    pub state: SlotState,
    pub width: u32,
    pub height: u32,
    pub connector_id: u32,
    pub controller_id: u32,
}

impl ScanoutSlot {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            state: SlotState::Disabled,
            width: 0,
            height: 0,
            connector_id: CONNECTOR_ID_BASE + index,
            controller_id: CONTROLLER_ID_BASE + index,
        }
    }

    /// Connector name shown in listings, e.g. `Virtual-1` for slot 0.
    pub fn connector_name(&self) -> String {
        format!("Virtual-{}", self.index + 1)
    }
}
