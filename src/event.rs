use std::time::Duration;

use tracing::{debug, info, warn};

use crate::round::{Role, RoundStatistics};

/// Things that happen during a round that an operator may want to see.
///
/// The coordinator reports these to an [`EventSink`] rather than writing logs itself, so the
/// caller decides where they go.
///
/// # Examples
///
/// ```ignore
/// match event {
///     RoundEvent::Collision { slot, attempt } => { /* count it */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    /// A round has started with this many data slots before any pruning.
    RoundStarted { role: Role, slots: usize },
    /// The control phase finished.
    ControlResolved {
        control_bytes: usize,
        won_slots: usize,
        elapsed: Duration,
    },
    /// Periodic data phase progress.
    Progress { slot: usize, slots_per_sec: f64 },
    /// A non-empty slot failed its checksum.
    Collision { slot: usize, attempt: usize },
    /// A slot revealed a single valid element.
    Revealed { slot: usize, attempt: usize, length: usize },
    RoundCompleted(RoundStatistics),
}

/// Receives round events.
pub trait EventSink {
    fn record(&mut self, event: RoundEvent);
}

impl<T: EventSink + ?Sized> EventSink for &mut T {
    fn record(&mut self, event: RoundEvent) {
        (**self).record(event)
    }
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn record(&mut self, event: RoundEvent) {
        (**self).record(event)
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&mut self, event: RoundEvent) {
        match event {
            RoundEvent::RoundStarted { role, slots } => {
                info!("{} round started with {} slots", role, slots)
            }
            RoundEvent::ControlResolved {
                control_bytes,
                won_slots,
                elapsed,
            } => info!(
                "control phase: {} bytes, {} slots won in {:?}",
                control_bytes, won_slots, elapsed
            ),
            RoundEvent::Progress {
                slot,
                slots_per_sec,
            } => debug!("slot #{}: {:.2} slots/sec", slot, slots_per_sec),
            RoundEvent::Collision { slot, attempt } => {
                warn!("collision in slot {} (attempt {})", slot, attempt)
            }
            RoundEvent::Revealed {
                slot,
                attempt,
                length,
            } => debug!("slot {} attempt {}: {} bytes", slot, attempt, length),
            RoundEvent::RoundCompleted(stats) => info!("{}", stats),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub events: Vec<RoundEvent>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collisions(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, RoundEvent::Collision { .. }))
            .count()
    }
}

impl EventSink for MemorySink {
    fn record(&mut self, event: RoundEvent) {
        self.events.push(event);
    }
}
