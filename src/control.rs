//! Collision avoidance ahead of the data phase.
//!
//! A control slot lets at most one intending client win each data slot without revealing who
//! it is. Three strategies share the [`ControlSlot`] interface:
//!
//! - [`DummyControlSlot`] runs no control phase. Every attempt of every slot flips a fair coin
//!   to decide whether to send, and collisions are left to the slot checksum.
//! - [`BinaryControlSlot`] exchanges one bit per (slot, attempt). Clients holding data flip a
//!   coin for every bit of their slots; once the XOR of all vectors is revealed, the first set
//!   bit of a slot picks the winning attempt and only clients whose own flip there was 1 send.
//! - [`PruningControlSlot`] wraps a binary slot and compacts the won slots into a dense index
//!   space, so the data phase skips every slot nobody won.
//!
//! Bit `n = slot * attempts + attempt` of a control vector lives in byte `n / 8` at bit
//! position `n % 8`, least significant bit first.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{DcNetError, Result};
use crate::scheduler::Scheduler;

/// Which control slot strategy a deployment runs. Every party must use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    #[default]
    Dummy,
    Binary,
    Pruning,
}

impl ControlMode {
    /// Whether this mode exchanges a control vector.
    pub fn has_control_phase(&self) -> bool {
        !matches!(self, ControlMode::Dummy)
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlMode::Dummy => "dummy",
            ControlMode::Binary => "binary",
            ControlMode::Pruning => "pruning",
        };
        f.write_str(name)
    }
}

impl FromStr for ControlMode {
    type Err = DcNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dummy" | "false" | "off" => Ok(ControlMode::Dummy),
            "binary" => Ok(ControlMode::Binary),
            "pruning" | "true" | "on" => Ok(ControlMode::Pruning),
            other => Err(DcNetError::Configuration(format!(
                "unknown control mode: {}",
                other
            ))),
        }
    }
}

/// The outcome of the control phase for one slot, from one client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlDecision {
    /// This client held data for the slot and took part in the coin flips.
    pub intends: bool,
    /// First attempt whose combined bit was set, if any.
    pub winning_attempt: Option<usize>,
    /// This client's own flip at the winning attempt; it sends only when this is set.
    pub coin: bool,
}

/// Interface the round coordinator drives for every strategy.
pub trait ControlSlot {
    /// Length of the control vector in bytes; 0 means there is no control phase.
    fn control_len(&self) -> usize;

    /// Writes this participant's control vector into `buffer`.
    fn control_message(&self, buffer: &mut [u8]);

    /// Takes the combined control vector of all participants.
    fn set_result(&mut self, result: &[u8]) -> Result<()>;

    /// Number of data slots to run. For a pruning strategy this is only known once the
    /// control result is in.
    fn slot_count(&self) -> usize;

    /// Number of slots the underlying schedule holds, before any pruning.
    fn scheduled_slot_count(&self) -> usize {
        self.slot_count()
    }

    /// Attempts to run per data slot.
    fn attempts(&self) -> usize;

    fn is_empty(&self, index: usize) -> bool;

    fn length(&self, index: usize) -> usize;

    /// Writes slot `index` into `buffer` if this participant should send in the current
    /// attempt, returning whether it did.
    fn write_slot(&mut self, index: usize, buffer: &mut [u8]) -> bool;

    /// Control phase outcome for slot `index`, for strategies that have one.
    fn decision(&self, _index: usize) -> Option<ControlDecision> {
        None
    }
}

/// Builds the strategy `mode` over `scheduler`.
///
/// # Errors
///
/// Returns `Configuration` when a binary mode is asked for with `attempts` that is zero or
/// not a multiple of 8.
pub fn control_slot<'a, S>(
    mode: ControlMode,
    scheduler: &'a S,
    attempts: usize,
    mut rng: StdRng,
) -> Result<Box<dyn ControlSlot + 'a>>
where
    S: Scheduler + ?Sized,
{
    Ok(match mode {
        ControlMode::Dummy => Box::new(DummyControlSlot::new(scheduler, attempts, rng)),
        ControlMode::Binary => Box::new(BinaryControlSlot::new(scheduler, attempts, &mut rng)?),
        ControlMode::Pruning => Box::new(PruningControlSlot::new(scheduler, attempts, &mut rng)?),
    })
}

fn bit(bytes: &[u8], n: usize) -> bool {
    bytes.get(n / 8).map_or(false, |byte| (byte >> (n % 8)) & 1 == 1)
}

pub struct DummyControlSlot<'a, S: ?Sized> {
    scheduler: &'a S,
    attempts: usize,
    rng: StdRng,
}

impl<'a, S: Scheduler + ?Sized> DummyControlSlot<'a, S> {
    pub fn new(scheduler: &'a S, attempts: usize, rng: StdRng) -> Self {
        DummyControlSlot {
            scheduler,
            attempts: attempts.max(1),
            rng,
        }
    }
}

impl<'a, S: Scheduler + ?Sized> ControlSlot for DummyControlSlot<'a, S> {
    fn control_len(&self) -> usize {
        0
    }

    fn control_message(&self, _buffer: &mut [u8]) {}

    fn set_result(&mut self, _result: &[u8]) -> Result<()> {
        Ok(())
    }

    fn slot_count(&self) -> usize {
        self.scheduler.slot_count()
    }

    fn attempts(&self) -> usize {
        self.attempts
    }

    fn is_empty(&self, index: usize) -> bool {
        self.scheduler.is_empty(index)
    }

    fn length(&self, index: usize) -> usize {
        self.scheduler.length(index)
    }

    fn write_slot(&mut self, index: usize, buffer: &mut [u8]) -> bool {
        if self.scheduler.is_empty(index) || !self.rng.gen_bool(0.5) {
            return false;
        }
        self.scheduler.write_slot(index, buffer);
        true
    }
}

pub struct BinaryControlSlot<'a, S: ?Sized> {
    scheduler: &'a S,
    attempts: usize,
    coin_flips: Vec<u8>,
    decisions: Vec<ControlDecision>,
}

impl<'a, S: Scheduler + ?Sized> BinaryControlSlot<'a, S> {
    /// Flips the coins for every slot `scheduler` holds data for.
    ///
    /// # Arguments
    ///
    /// * `scheduler` - The schedule whose non-empty slots take part in the flips.
    /// * `attempts` - Attempts per slot, one control bit each.
    /// * `rng` - Source of the coin flips.
    ///
    /// # Returns
    ///
    /// The strategy, with a control vector of `attempts * slot_count / 8` bytes, or
    /// `Configuration` when `attempts` is zero or not a multiple of 8.
    pub fn new<R: RngCore>(scheduler: &'a S, attempts: usize, rng: &mut R) -> Result<Self> {
        if attempts == 0 || attempts % 8 != 0 {
            return Err(DcNetError::Configuration(format!(
                "attempts per slot must be a non-zero multiple of 8, got {}",
                attempts
            )));
        }

        let slot_count = scheduler.slot_count();
        let bytes_per_slot = attempts / 8;
        let mut coin_flips = vec![0u8; slot_count * bytes_per_slot];
        rng.fill_bytes(&mut coin_flips);

        for (slot, flips) in coin_flips.chunks_mut(bytes_per_slot).enumerate() {
            if scheduler.is_empty(slot) {
                flips.iter_mut().for_each(|b| *b = 0);
            }
        }

        let decisions = (0..slot_count)
            .map(|slot| ControlDecision {
                intends: !scheduler.is_empty(slot),
                ..ControlDecision::default()
            })
            .collect();

        Ok(BinaryControlSlot {
            scheduler,
            attempts,
            coin_flips,
            decisions,
        })
    }

    /// This client's own coin flip for `attempt` of `slot`.
    pub fn coin_flip(&self, slot: usize, attempt: usize) -> bool {
        bit(&self.coin_flips, slot * self.attempts + attempt)
    }

    /// Whether any attempt of `index` came back set.
    pub fn is_won(&self, index: usize) -> bool {
        self.decisions
            .get(index)
            .map_or(false, |d| d.winning_attempt.is_some())
    }

    fn sends(&self, index: usize) -> bool {
        self.decisions.get(index).map_or(false, |d| d.coin)
    }
}

impl<'a, S: Scheduler + ?Sized> ControlSlot for BinaryControlSlot<'a, S> {
    fn control_len(&self) -> usize {
        self.coin_flips.len()
    }

    fn control_message(&self, buffer: &mut [u8]) {
        buffer[..self.coin_flips.len()].copy_from_slice(&self.coin_flips);
    }

    fn set_result(&mut self, result: &[u8]) -> Result<()> {
        if result.len() != self.coin_flips.len() {
            return Err(DcNetError::Configuration(format!(
                "control result has {} bytes, expected {}",
                result.len(),
                self.coin_flips.len()
            )));
        }

        for slot in 0..self.decisions.len() {
            let base = slot * self.attempts;
            let winner = (0..self.attempts).find(|&attempt| bit(result, base + attempt));
            let coin = winner.map_or(false, |attempt| bit(&self.coin_flips, base + attempt));

            let decision = &mut self.decisions[slot];
            decision.winning_attempt = winner;
            decision.coin = coin;
        }
        Ok(())
    }

    fn slot_count(&self) -> usize {
        self.scheduler.slot_count()
    }

    fn attempts(&self) -> usize {
        1
    }

    fn is_empty(&self, index: usize) -> bool {
        !self.sends(index) || self.scheduler.is_empty(index)
    }

    fn length(&self, index: usize) -> usize {
        if self.sends(index) {
            self.scheduler.length(index)
        } else {
            0
        }
    }

    fn write_slot(&mut self, index: usize, buffer: &mut [u8]) -> bool {
        if self.is_empty(index) {
            return false;
        }
        self.scheduler.write_slot(index, buffer);
        true
    }

    fn decision(&self, index: usize) -> Option<ControlDecision> {
        self.decisions.get(index).copied()
    }
}

/// A binary control slot whose data phase only visits won slots.
pub struct PruningControlSlot<'a, S: ?Sized> {
    binary: BinaryControlSlot<'a, S>,
    index_map: Vec<usize>,
}

impl<'a, S: Scheduler + ?Sized> PruningControlSlot<'a, S> {
    pub fn new<R: RngCore>(scheduler: &'a S, attempts: usize, rng: &mut R) -> Result<Self> {
        Ok(PruningControlSlot {
            binary: BinaryControlSlot::new(scheduler, attempts, rng)?,
            index_map: Vec::new(),
        })
    }

    /// The original slot index behind compacted index `index`.
    pub fn original_index(&self, index: usize) -> usize {
        self.index_map[index]
    }

    pub fn binary(&self) -> &BinaryControlSlot<'a, S> {
        &self.binary
    }
}

impl<'a, S: Scheduler + ?Sized> ControlSlot for PruningControlSlot<'a, S> {
    fn control_len(&self) -> usize {
        self.binary.control_len()
    }

    fn control_message(&self, buffer: &mut [u8]) {
        self.binary.control_message(buffer)
    }

    fn set_result(&mut self, result: &[u8]) -> Result<()> {
        self.binary.set_result(result)?;
        self.index_map = (0..self.binary.slot_count())
            .filter(|&slot| self.binary.is_won(slot))
            .collect();
        Ok(())
    }

    fn slot_count(&self) -> usize {
        self.index_map.len()
    }

    fn scheduled_slot_count(&self) -> usize {
        self.binary.slot_count()
    }

    fn attempts(&self) -> usize {
        self.binary.attempts()
    }

    fn is_empty(&self, index: usize) -> bool {
        self.binary.is_empty(self.index_map[index])
    }

    fn length(&self, index: usize) -> usize {
        self.binary.length(self.index_map[index])
    }

    fn write_slot(&mut self, index: usize, buffer: &mut [u8]) -> bool {
        let original = self.index_map[index];
        self.binary.write_slot(original, buffer)
    }

    fn decision(&self, index: usize) -> Option<ControlDecision> {
        self.binary.decision(self.index_map[index])
    }
}
