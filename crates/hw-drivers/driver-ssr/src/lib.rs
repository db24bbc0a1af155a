//! A `no_std` driver for switching loads through solid-state and plain relays.
//!
//! An [`Ssr`] gates a resistive load from a duty-percentage command: below the
//! switch-on threshold the relay is held off, at or above it the relay is held
//! on, and the last commanded duty is retained for display and safety checks.
//! A [`Relay`] is a plain on/off output for pumps and fans.

#![no_std]

use embedded_hal::digital::OutputPin;

/// Duty percentage below which the SSR is held off.
pub const MIN_ON_DUTY: f32 = 5.0;

/// A solid-state relay gated by a duty percentage.
pub struct Ssr<PIN> {
    pin: PIN,
    duty: f32,
}

impl<PIN, E> Ssr<PIN>
where
    PIN: OutputPin<Error = E>,
{
    /// Creates the driver and forces the relay off.
    pub fn new(mut pin: PIN) -> Result<Self, E> {
        pin.set_low()?;
        Ok(Self { pin, duty: 0.0 })
    }

    /// Applies a duty command in percent.
    ///
    /// The value is clamped to `[0, 100]`. Below [`MIN_ON_DUTY`] the relay
    /// opens; otherwise it closes. Returns the clamped duty that was stored.
    pub fn set_duty(&mut self, duty: f32) -> Result<f32, E> {
        let duty = duty.clamp(0.0, 100.0);
        if duty < MIN_ON_DUTY {
            self.pin.set_low()?;
        } else {
            self.pin.set_high()?;
        }
        self.duty = duty;
        Ok(duty)
    }

    /// The last commanded duty in percent.
    pub fn duty(&self) -> f32 {
        self.duty
    }

    /// Whether the relay is currently closed.
    pub fn is_energized(&self) -> bool {
        self.duty >= MIN_ON_DUTY
    }

    /// Releases the pin.
    pub fn free(self) -> PIN {
        self.pin
    }
}

/// A plain on/off relay output.
pub struct Relay<PIN> {
    pin: PIN,
    on: bool,
}

impl<PIN, E> Relay<PIN>
where
    PIN: OutputPin<Error = E>,
{
    /// Creates the driver and forces the relay off.
    pub fn new(mut pin: PIN) -> Result<Self, E> {
        pin.set_low()?;
        Ok(Self { pin, on: false })
    }

    /// Drives the relay.
    pub fn set(&mut self, on: bool) -> Result<(), E> {
        if on {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        self.on = on;
        Ok(())
    }

    /// Whether the relay is currently closed.
    pub fn is_on(&self) -> bool {
        self.on
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
    fn test_ssr_threshold() {
        let pin = PinMock::new(&[
            Transaction::set(State::Low),  // new()
            Transaction::set(State::Low),  // 4.9 %
            Transaction::set(State::High), // 5.0 %
            Transaction::set(State::High), // 73.5 %
            Transaction::set(State::Low),  // 0 %
        ]);
        let mut ssr = Ssr::new(pin).unwrap();

        assert_eq!(ssr.set_duty(4.9).unwrap(), 4.9);
        assert!(!ssr.is_energized());

        assert_eq!(ssr.set_duty(5.0).unwrap(), 5.0);
        assert!(ssr.is_energized());

        assert_eq!(ssr.set_duty(73.5).unwrap(), 73.5);
        assert_eq!(ssr.duty(), 73.5);

        ssr.set_duty(0.0).unwrap();
        assert!(!ssr.is_energized());

        ssr.free().done();
    }

    #[test]
    fn test_ssr_clamps_duty() {
        let pin = PinMock::new(&[
            Transaction::set(State::Low),
            Transaction::set(State::High), // 150 -> 100
            Transaction::set(State::Low),  // -20 -> 0
        ]);
        let mut ssr = Ssr::new(pin).unwrap();

        assert_eq!(ssr.set_duty(150.0).unwrap(), 100.0);
        assert_eq!(ssr.set_duty(-20.0).unwrap(), 0.0);

        ssr.free().done();
    }

    #[test]
    fn test_relay_switching() {
        let pin = PinMock::new(&[
            Transaction::set(State::Low),
            Transaction::set(State::High),
            Transaction::set(State::Low),
        ]);
        let mut relay = Relay::new(pin).unwrap();

        relay.set(true).unwrap();
        assert!(relay.is_on());
        relay.set(false).unwrap();
        assert!(!relay.is_on());

        relay.free().done();
    }
}
