//! Trigger-model wiring between channels and leased event-blender slots.
//!
//! Dual-channel wiring (lead = current-source role):
//!
//! ```text
//!  *trg ──► lead.arm
//!  blender#1 = OR(lead.armed, lead.pulse_complete) ──► lead.source
//!  lead.source_complete ──► lead.measure, follower.measure
//!  blender#2 = AND(lead.measure_complete, follower.measure_complete) ──► lead.endpulse
//! ```
//!
//! The AND blender keeps the lead from re-sourcing while the follower is
//! still measuring the previous point.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{SmuChannel, SmuInstrument};
use crate::hardware::trigger::{BlendMode, BlenderSlot, TriggerEvent, TriggerStage};

// =============================================================================
// Slot pool
// =============================================================================

/// Free event-blender slots of one instrument.
#[derive(Debug, Clone)]
pub struct SlotPool {
    free: Arc<Mutex<BTreeSet<BlenderSlot>>>,
}

impl SlotPool {
    /// Pool holding slots `1..=count`.
    pub fn new(count: u8) -> Self {
        Self {
            free: Arc::new(Mutex::new((1..=count).map(BlenderSlot::new).collect())),
        }
    }

    fn slots(&self) -> MutexGuard<'_, BTreeSet<BlenderSlot>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the `count` lowest free slots.
    pub fn lease(&self, count: usize) -> AppResult<SlotLease> {
        let mut free = self.slots();
        if free.len() < count {
            return Err(DaqError::configuration(format!(
                "Need {count} event-blender slots, only {} free",
                free.len()
            )));
        }
        let taken: Vec<BlenderSlot> = free.iter().take(count).copied().collect();
        for slot in &taken {
            free.remove(slot);
        }
        Ok(SlotLease {
            slots: taken,
            pool: self.clone(),
        })
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.slots().len()
    }
}

/// Exclusively owned blender slots; returned to the pool on drop.
#[derive(Debug)]
pub struct SlotLease {
    slots: Vec<BlenderSlot>,
    pool: SlotPool,
}

impl SlotLease {
    /// Leased slots in ascending order.
    pub fn slots(&self) -> &[BlenderSlot] {
        &self.slots
    }

    fn slot(&self, index: usize) -> AppResult<BlenderSlot> {
        self.slots.get(index).copied().ok_or_else(|| {
            DaqError::configuration(format!(
                "Wiring needs blender slot #{} but only {} leased",
                index + 1,
                self.slots.len()
            ))
        })
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut free = self.pool.slots();
        free.extend(self.slots.drain(..));
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// Slots needed by [`wire_dual`] and [`wire_single`].
pub const SLOTS_PER_SWEEP: usize = 2;

/// Wire `lead` and `follower` so both measure after each lead source step
/// and the lead only advances once both measurements are complete.
pub async fn wire_dual(
    instrument: &dyn SmuInstrument,
    lead: &dyn SmuChannel,
    follower: &dyn SmuChannel,
    lease: &SlotLease,
) -> AppResult<()> {
    let entry_gate = lease.slot(0)?;
    let advance_gate = lease.slot(1)?;
    let lead_name = lead.name().to_string();
    debug!(
        lead = %lead_name,
        follower = follower.name(),
        entry_gate = entry_gate.number(),
        advance_gate = advance_gate.number(),
        "Wiring dual-channel trigger model"
    );

    let source_complete = TriggerEvent::SourceComplete(lead_name.clone());
    lead.set_trigger_stimulus(TriggerStage::Measure, &source_complete)
        .await?;
    follower
        .set_trigger_stimulus(TriggerStage::Measure, &source_complete)
        .await?;

    lead.set_trigger_stimulus(TriggerStage::Arm, &TriggerEvent::GlobalTrigger)
        .await?;

    instrument
        .configure_blender(
            entry_gate,
            BlendMode::Or,
            &[
                TriggerEvent::Armed(lead_name.clone()),
                TriggerEvent::PulseComplete(lead_name.clone()),
            ],
        )
        .await?;
    lead.set_trigger_stimulus(TriggerStage::Source, &TriggerEvent::Blender(entry_gate))
        .await?;

    instrument
        .configure_blender(
            advance_gate,
            BlendMode::And,
            &[
                TriggerEvent::MeasureComplete(lead_name),
                TriggerEvent::MeasureComplete(follower.name().to_string()),
            ],
        )
        .await?;
    lead.set_trigger_stimulus(TriggerStage::EndPulse, &TriggerEvent::Blender(advance_gate))
        .await?;
    Ok(())
}

/// Single-channel variant: the advance gate only waits for the channel itself.
pub async fn wire_single(
    instrument: &dyn SmuInstrument,
    channel: &dyn SmuChannel,
    lease: &SlotLease,
) -> AppResult<()> {
    let entry_gate = lease.slot(0)?;
    let advance_gate = lease.slot(1)?;
    let name = channel.name().to_string();
    debug!(channel = %name, "Wiring single-channel trigger model");

    channel
        .set_trigger_stimulus(
            TriggerStage::Measure,
            &TriggerEvent::SourceComplete(name.clone()),
        )
        .await?;
    channel
        .set_trigger_stimulus(TriggerStage::Arm, &TriggerEvent::GlobalTrigger)
        .await?;

    instrument
        .configure_blender(
            entry_gate,
            BlendMode::Or,
            &[
                TriggerEvent::Armed(name.clone()),
                TriggerEvent::PulseComplete(name.clone()),
            ],
        )
        .await?;
    channel
        .set_trigger_stimulus(TriggerStage::Source, &TriggerEvent::Blender(entry_gate))
        .await?;

    instrument
        .configure_blender(
            advance_gate,
            BlendMode::Or,
            &[TriggerEvent::MeasureComplete(name)],
        )
        .await?;
    channel
        .set_trigger_stimulus(TriggerStage::EndPulse, &TriggerEvent::Blender(advance_gate))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSmu;

    #[test]
    fn lease_takes_lowest_slots_and_returns_them_on_drop() {
        let pool = SlotPool::new(6);
        {
            let lease = pool.lease(2).unwrap();
            assert_eq!(lease.slots(), &[BlenderSlot::new(1), BlenderSlot::new(2)]);
            assert_eq!(pool.available(), 4);

            let second = pool.lease(2).unwrap();
            assert_eq!(second.slots(), &[BlenderSlot::new(3), BlenderSlot::new(4)]);
        }
        assert_eq!(pool.available(), 6);
    }

    #[test]
    fn exhausted_pool_is_a_configuration_error() {
        let pool = SlotPool::new(3);
        let _held = pool.lease(2).unwrap();
        assert!(pool.lease(2).unwrap_err().is_configuration());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn dual_wiring_links_both_channels_to_lead_events() {
        let smu = MockSmu::new("sim");
        let pool = SlotPool::new(smu.blender_count());
        let lease = pool.lease(SLOTS_PER_SWEEP).unwrap();
        let lead = smu.channel("smub").unwrap();
        let follower = smu.channel("smua").unwrap();

        wire_dual(&smu, lead.as_ref(), follower.as_ref(), &lease)
            .await
            .unwrap();

        let source_complete = Some(TriggerEvent::SourceComplete("smub".into()));
        assert_eq!(smu.stimulus("smub", TriggerStage::Measure), source_complete);
        assert_eq!(smu.stimulus("smua", TriggerStage::Measure), source_complete);
        assert_eq!(
            smu.stimulus("smub", TriggerStage::Arm),
            Some(TriggerEvent::GlobalTrigger)
        );
        assert_eq!(
            smu.stimulus("smub", TriggerStage::Source),
            Some(TriggerEvent::Blender(BlenderSlot::new(1)))
        );
        assert_eq!(
            smu.stimulus("smub", TriggerStage::EndPulse),
            Some(TriggerEvent::Blender(BlenderSlot::new(2)))
        );
        assert_eq!(
            smu.blender(1),
            Some((
                BlendMode::Or,
                vec![
                    TriggerEvent::Armed("smub".into()),
                    TriggerEvent::PulseComplete("smub".into())
                ]
            ))
        );
        assert_eq!(
            smu.blender(2),
            Some((
                BlendMode::And,
                vec![
                    TriggerEvent::MeasureComplete("smub".into()),
                    TriggerEvent::MeasureComplete("smua".into())
                ]
            ))
        );
        assert_eq!(smu.stimulus("smua", TriggerStage::EndPulse), None);
    }

    #[tokio::test]
    async fn single_wiring_uses_or_gate_on_own_measurement() {
        let smu = MockSmu::new("sim");
        let pool = SlotPool::new(6);
        let lease = pool.lease(SLOTS_PER_SWEEP).unwrap();
        let channel = smu.channel("smua").unwrap();

        wire_single(&smu, channel.as_ref(), &lease).await.unwrap();

        assert_eq!(
            smu.blender(2),
            Some((
                BlendMode::Or,
                vec![TriggerEvent::MeasureComplete("smua".into())]
            ))
        );
    }

    #[tokio::test]
    async fn wiring_with_short_lease_fails_before_hardware_writes() {
        let smu = MockSmu::new("sim");
        let pool = SlotPool::new(6);
        let lease = pool.lease(1).unwrap();
        let a = smu.channel("smua").unwrap();
        let b = smu.channel("smub").unwrap();

        let err = wire_dual(&smu, a.as_ref(), b.as_ref(), &lease)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(smu.calls().is_empty());
    }
}
