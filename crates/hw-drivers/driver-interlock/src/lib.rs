//! A `no_std` driver for debounced active-low safety inputs.
//!
//! Door switches and emergency-stop buttons are wired active-low with
//! pull-ups: the line reads high until the contact closes to ground. A raw
//! level change is accepted only after two consecutive polls agree, so a
//! single-poll glitch never reaches the control logic.

#![no_std]

use embedded_hal::digital::InputPin;

/// A debounced active-low input.
///
/// `poll()` is expected to be called once per control tick.
pub struct DebouncedInput<PIN> {
    pin: PIN,
    last_raw: bool,
    stable: bool,
}

impl<PIN, E> DebouncedInput<PIN>
where
    PIN: InputPin<Error = E>,
{
    /// Creates a debounced input assumed released (line high) until polled.
    pub fn new(pin: PIN) -> Self {
        Self {
            pin,
            last_raw: false,
            stable: false,
        }
    }

    /// Samples the pin and returns the debounced asserted state.
    ///
    /// Asserted means the line is low (contact closed). The debounced state
    /// only changes once two consecutive samples agree.
    pub fn poll(&mut self) -> Result<bool, E> {
        let raw = self.pin.is_low()?;
        if raw == self.last_raw {
            self.stable = raw;
        }
        self.last_raw = raw;
        Ok(self.stable)
    }

    /// The debounced state from the most recent poll.
    pub fn is_asserted(&self) -> bool {
        self.stable
    }

    /// Releases the pin.
    pub fn free(self) -> PIN {
        self.pin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction};

    #[test]
    fn test_assertion_requires_two_consecutive_samples() {
        let pin = PinMock::new(&[
            Transaction::get(State::Low),
            Transaction::get(State::Low),
        ]);
        let mut input = DebouncedInput::new(pin);

        // First low sample alone is not enough.
        assert!(!input.poll().unwrap());
        // Second consecutive low sample flips the debounced state.
        assert!(input.poll().unwrap());

        input.free().done();
    }

    #[test]
    fn test_single_tick_glitch_rejected() {
        let pin = PinMock::new(&[
            Transaction::get(State::High),
            Transaction::get(State::High),
            Transaction::get(State::Low), // glitch
            Transaction::get(State::High),
            Transaction::get(State::High),
        ]);
        let mut input = DebouncedInput::new(pin);

        for _ in 0..5 {
            assert!(!input.poll().unwrap());
        }

        input.free().done();
    }

    #[test]
    fn test_release_also_debounced() {
        let pin = PinMock::new(&[
            Transaction::get(State::Low),
            Transaction::get(State::Low),
            Transaction::get(State::High), // first high sample: still asserted
            Transaction::get(State::High), // second: released
        ]);
        let mut input = DebouncedInput::new(pin);

        input.poll().unwrap();
        assert!(input.poll().unwrap());
        assert!(input.poll().unwrap());
        assert!(!input.poll().unwrap());

        input.free().done();
    }
}
