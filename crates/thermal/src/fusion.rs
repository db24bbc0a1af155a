//! Redundant thermocouple fusion.
//!
//! The furnace carries two thermocouples. Each tick both channels are read and
//! combined into a single control temperature: the mean when both are valid,
//! the surviving channel when one faults, and the previous value while neither
//! reads. Persistent bilateral loss is escalated to the caller.

use num_traits::Float;

/// The fault kinds a thermocouple read can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SensorFault {
    /// The converter reports a broken or disconnected thermocouple.
    OpenCircuit,
    /// The decoded temperature is outside the plausible measurement range.
    OutOfRange,
    /// The bus read back all-ones or all-zeros.
    BusError,
    /// Reserved frame bits were set.
    BadFrame,
}

/// One thermocouple read: either a temperature in °C or a fault.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Sample<F> {
    Temperature(F),
    Fault(SensorFault),
}

impl<F: Float> Sample<F> {
    /// The temperature if this sample is valid.
    pub fn temperature(&self) -> Option<F> {
        match self {
            Sample::Temperature(t) => Some(*t),
            Sample::Fault(_) => None,
        }
    }

    /// The fault if this sample is not valid.
    pub fn fault(&self) -> Option<SensorFault> {
        match self {
            Sample::Temperature(_) => None,
            Sample::Fault(f) => Some(*f),
        }
    }
}

/// The fused result for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fused<F> {
    /// The control temperature: fresh when possible, otherwise held.
    pub value: F,
    /// False when this tick produced no valid sample on either channel.
    pub fresh: bool,
    /// True once the consecutive-miss threshold has been reached.
    pub lost: bool,
}

/// Two-channel fusion state.
#[derive(Debug, Clone)]
pub struct Fusion<F> {
    last: F,
    misses: u32,
    loss_after: u32,
}

impl<F: Float> Fusion<F> {
    /// Creates fusion state holding `initial` until the first valid read.
    ///
    /// `loss_after` is the number of consecutive all-invalid ticks after which
    /// [`Fused::lost`] is raised.
    pub fn new(initial: F, loss_after: u32) -> Self {
        Self {
            last: initial,
            misses: 0,
            loss_after,
        }
    }

    /// Folds one tick's channel samples into the fused temperature.
    pub fn update(&mut self, tc1: &Sample<F>, tc2: &Sample<F>) -> Fused<F> {
        match (tc1.temperature(), tc2.temperature()) {
            (Some(a), Some(b)) => {
                self.misses = 0;
                self.last = (a + b) / F::from(2.0).unwrap();
            }
            (Some(t), None) | (None, Some(t)) => {
                self.misses = 0;
                self.last = t;
            }
            (None, None) => {
                self.misses = self.misses.saturating_add(1);
            }
        }
        Fused {
            value: self.last,
            fresh: self.misses == 0,
            lost: self.misses >= self.loss_after,
        }
    }

    /// Consecutive ticks without a valid sample on either channel.
    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Forgets accumulated misses, e.g. when a new run begins.
    pub fn clear(&mut self) {
        self.misses = 0;
    }
}
