//! Fixed-size slot table with compare-and-transition semantics.

use tokio::sync::RwLock;

use crate::error::PoolError;

use super::slot::{ScanoutSlot, SlotState};

/// Default number of slots in a pool.
pub const DEFAULT_POOL_SIZE: usize = 15;

/// Fixed table of scanout slots.
///
/// The table never grows or shrinks after construction. Mutation goes
/// through [`allocate_free_slot`](Self::allocate_free_slot) and
/// [`transition`](Self::transition), both of which are compare-and-set
/// style so a stale caller gets an error instead of clobbering state.
pub struct SlotTable {
    size: usize,
    slots: RwLock<Vec<ScanoutSlot>>,
}

impl SlotTable {
    /// Create a table with `size` slots, all `Disabled`.
    pub fn new(size: usize) -> Self {
        let slots = (0..size as u32).map(ScanoutSlot::new).collect();
        Self {
            size,
            slots: RwLock::new(slots),
        }
    }

    /// Number of slots in the table.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Reserve the lowest-index `Disabled` slot and move it to `Enabling`,
    /// recording the requested mode.
    pub async fn allocate_free_slot(&self, width: u32, height: u32) -> Result<u32, PoolError> {
        let mut slots = self.slots.write().await;

        let slot = slots
            .iter_mut()
            .find(|s| s.state == SlotState::Disabled)
            .ok_or(PoolError::Exhausted)?;

        slot.state = SlotState::Enabling;
        slot.width = width;
        slot.height = height;

        tracing::debug!(
            slot = slot.index,
            width = width,
            height = height,
            "Allocated scanout slot"
        );

        Ok(slot.index)
    }

    /// Move `slot` from `from` to `to`.
    ///
    /// Fails with [`PoolError::InvalidTransition`] when the slot is not in
    /// `from`, or when `from -> to` is not an edge of the lifecycle. The
    /// error carries the actual current state.
    pub async fn transition(
        &self,
        slot: u32,
        from: SlotState,
        to: SlotState,
    ) -> Result<(), PoolError> {
        let mut slots = self.slots.write().await;

        let entry = slots
            .get_mut(slot as usize)
            .ok_or(PoolError::UnknownSlot(slot))?;

        if entry.state != from || !from.can_transition_to(to) {
            return Err(PoolError::InvalidTransition {
                slot,
                from: entry.state,
                to,
            });
        }

        entry.state = to;
        tracing::debug!(slot = slot, from = %from, to = %to, "Slot transition");
        Ok(())
    }

    /// Current state of `slot`.
    pub async fn state(&self, slot: u32) -> Result<SlotState, PoolError> {
        let slots = self.slots.read().await;
        slots
            .get(slot as usize)
            .map(|s| s.state)
            .ok_or(PoolError::UnknownSlot(slot))
    }

    /// Clone of a single slot entry.
    pub async fn slot(&self, index: u32) -> Result<ScanoutSlot, PoolError> {
        let slots = self.slots.read().await;
        slots
            .get(index as usize)
            .cloned()
            .ok_or(PoolError::UnknownSlot(index))
    }

    /// Cloned view of the whole table.
    pub async fn snapshot(&self) -> Vec<ScanoutSlot> {
        self.slots.read().await.clone()
    }

    /// Number of slots currently in an active (scanning-out) state.
    pub async fn active_count(&self) -> usize {
        let slots = self.slots.read().await;
        slots.iter().filter(|s| s.state.is_active()).count()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_lowest_index() {
        let table = SlotTable::new(4);

        let slot = table.allocate_free_slot(1920, 1080).await.unwrap();
        assert_eq!(slot, 0);
        assert_eq!(table.state(0).await.unwrap(), SlotState::Enabling);

        let entry = table.slot(0).await.unwrap();
        assert_eq!(entry.width, 1920);
        assert_eq!(entry.height, 1080);

        // Next allocation skips the reserved slot.
        let slot = table.allocate_free_slot(1280, 720).await.unwrap();
        assert_eq!(slot, 1);
    }

    #[tokio::test]
    async fn test_allocate_reuses_freed_slot() {
        let table = SlotTable::new(3);

        let a = table.allocate_free_slot(800, 600).await.unwrap();
        let _b = table.allocate_free_slot(800, 600).await.unwrap();

        // Walk slot a back to Disabled through the unwind edge.
        table
            .transition(a, SlotState::Enabling, SlotState::Disabled)
            .await
            .unwrap();

        // Lowest free index is a again.
        let c = table.allocate_free_slot(800, 600).await.unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let table = SlotTable::new(2);

        table.allocate_free_slot(640, 480).await.unwrap();
        table.allocate_free_slot(640, 480).await.unwrap();

        let err = table.allocate_free_slot(640, 480).await.unwrap_err();
        assert_eq!(err, PoolError::Exhausted);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let table = SlotTable::new(1);

        let slot = table.allocate_free_slot(1920, 1080).await.unwrap();
        table
            .transition(slot, SlotState::Enabling, SlotState::Enabled)
            .await
            .unwrap();
        table
            .transition(slot, SlotState::Enabled, SlotState::Leased)
            .await
            .unwrap();
        table
            .transition(slot, SlotState::Leased, SlotState::Enabled)
            .await
            .unwrap();
        table
            .transition(slot, SlotState::Enabled, SlotState::Disabling)
            .await
            .unwrap();
        table
            .transition(slot, SlotState::Disabling, SlotState::Disabled)
            .await
            .unwrap();

        assert_eq!(table.state(slot).await.unwrap(), SlotState::Disabled);
    }

    #[tokio::test]
    async fn test_invalid_transition_reports_actual_state() {
        let table = SlotTable::new(1);

        let err = table
            .transition(0, SlotState::Enabled, SlotState::Leased)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PoolError::InvalidTransition {
                slot: 0,
                from: SlotState::Disabled,
                to: SlotState::Leased,
            }
        );
    }

    #[tokio::test]
    async fn test_disabling_slot_not_allocatable() {
        let table = SlotTable::new(1);

        let slot = table.allocate_free_slot(1920, 1080).await.unwrap();
        table
            .transition(slot, SlotState::Enabling, SlotState::Enabled)
            .await
            .unwrap();
        table
            .transition(slot, SlotState::Enabled, SlotState::Disabling)
            .await
            .unwrap();

        // Teardown not finished; the slot must not be handed out.
        let err = table.allocate_free_slot(1920, 1080).await.unwrap_err();
        assert_eq!(err, PoolError::Exhausted);

        table
            .transition(slot, SlotState::Disabling, SlotState::Disabled)
            .await
            .unwrap();
        assert_eq!(table.allocate_free_slot(1920, 1080).await.unwrap(), slot);
    }

    #[tokio::test]
    async fn test_unknown_slot() {
        let table = SlotTable::new(2);

        assert_eq!(table.state(7).await.unwrap_err(), PoolError::UnknownSlot(7));
        let err = table
            .transition(7, SlotState::Disabled, SlotState::Enabling)
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::UnknownSlot(7));
    }

    #[tokio::test]
    async fn test_snapshot_and_active_count() {
        let table = SlotTable::new(3);
        assert_eq!(table.active_count().await, 0);

        let slot = table.allocate_free_slot(1024, 768).await.unwrap();
        table
            .transition(slot, SlotState::Enabling, SlotState::Enabled)
            .await
            .unwrap();

        let snap = table.snapshot().await;
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].state, SlotState::Enabled);
        assert_eq!(snap[1].state, SlotState::Disabled);
        assert_eq!(table.active_count().await, 1);
    }
}
