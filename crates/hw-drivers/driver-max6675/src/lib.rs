//! A `no_std` driver for two MAX6675 thermocouple converters on a shared clock.
//!
//! The MAX6675 speaks a read-only synchronous serial protocol: pull `CS` low,
//! wait out the conversion latch, then clock 16 bits out of `DO` MSB-first.
//! This driver bit-bangs that protocol over plain GPIO lines. Both converters
//! hang off one `CLK` line, so the pair owns the clock and serializes reads.

#![cfg_attr(not(test), no_std)]

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

/// Time the converter needs after `CS` falls before the frame is valid.
pub const CONVERSION_DELAY_MS: u32 = 5;
/// Half-cycle time of the bit-banged clock. User-space sleeps below a
/// millisecond are unreliable, so the clock runs no faster than this.
pub const HALF_CYCLE_US: u32 = 1_000;

/// Degrees Celsius per ADC count (12-bit reading, D14..D3).
pub const CELSIUS_PER_COUNT: f32 = 0.25;
/// Lowest temperature accepted as a real measurement.
pub const TEMP_MIN_C: f32 = -50.0;
/// Highest temperature accepted as a real measurement.
pub const TEMP_MAX_C: f32 = 1400.0;

const OPEN_CIRCUIT_BIT: u16 = 1 << 2;
const DUMMY_SIGN_BIT: u16 = 1 << 15;
const DEVICE_ID_BIT: u16 = 1 << 1;

/// Which converter of the pair to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    One,
    Two,
}

/// Ways a 16-bit frame can fail to carry a temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The frame was all-ones or all-zeros; nothing is driving the bus.
    BusError,
    /// The converter's thermocouple-input fault flag (D2) is set.
    OpenCircuit,
    /// A reserved bit (D15 dummy sign or D1 device id) was set.
    BadFrame,
    /// The decoded value falls outside `[TEMP_MIN_C, TEMP_MAX_C]`.
    OutOfRange,
}

/// Errors returned by [`Max6675Pair::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError<E> {
    /// A GPIO operation failed.
    Pin(E),
    /// The frame was clocked in but did not decode to a temperature.
    Frame(FrameError),
}

/// Decodes one raw 16-bit frame into a temperature in °C.
///
/// Every possible bit pattern maps to exactly one outcome: a temperature in
/// the accepted range or one of the four [`FrameError`] kinds.
pub fn decode_frame(raw: u16) -> Result<f32, FrameError> {
    if raw == 0x0000 || raw == 0xFFFF {
        return Err(FrameError::BusError);
    }
    if raw & OPEN_CIRCUIT_BIT != 0 {
        return Err(FrameError::OpenCircuit);
    }
    if raw & (DUMMY_SIGN_BIT | DEVICE_ID_BIT) != 0 {
        return Err(FrameError::BadFrame);
    }
    let temperature = ((raw >> 3) & 0x0FFF) as f32 * CELSIUS_PER_COUNT;
    if !(TEMP_MIN_C..=TEMP_MAX_C).contains(&temperature) {
        return Err(FrameError::OutOfRange);
    }
    Ok(temperature)
}

/// Two MAX6675 converters sharing one bit-banged clock line.
pub struct Max6675Pair<CLK, CS1, CS2, DO1, DO2, D> {
    clk: CLK,
    cs1: CS1,
    cs2: CS2,
    do1: DO1,
    do2: DO2,
    delay: D,
}

impl<CLK, CS1, CS2, DO1, DO2, D, E> Max6675Pair<CLK, CS1, CS2, DO1, DO2, D>
where
    CLK: OutputPin<Error = E>,
    CS1: OutputPin<Error = E>,
    CS2: OutputPin<Error = E>,
    DO1: InputPin<Error = E>,
    DO2: InputPin<Error = E>,
    D: DelayNs,
{
    /// Creates the pair and parks the bus: both converters deselected, clock
    /// low.
    pub fn new(
        mut clk: CLK,
        mut cs1: CS1,
        mut cs2: CS2,
        do1: DO1,
        do2: DO2,
        delay: D,
    ) -> Result<Self, E> {
        cs1.set_high()?;
        cs2.set_high()?;
        clk.set_low()?;
        Ok(Self {
            clk,
            cs1,
            cs2,
            do1,
            do2,
            delay,
        })
    }

    /// Reads and decodes one channel.
    ///
    /// Blocks for roughly `CONVERSION_DELAY_MS + 16 × 2 × HALF_CYCLE_US`.
    pub fn read(&mut self, channel: Channel) -> Result<f32, ReadError<E>> {
        let raw = self.read_raw(channel).map_err(ReadError::Pin)?;
        decode_frame(raw).map_err(ReadError::Frame)
    }

    /// Clocks one undecoded 16-bit frame out of a channel.
    pub fn read_raw(&mut self, channel: Channel) -> Result<u16, E> {
        match channel {
            Channel::One => clock_in_frame(
                &mut self.clk,
                &mut self.cs1,
                &mut self.do1,
                &mut self.delay,
            ),
            Channel::Two => clock_in_frame(
                &mut self.clk,
                &mut self.cs2,
                &mut self.do2,
                &mut self.delay,
            ),
        }
    }

    /// Releases the pins.
    pub fn free(self) -> (CLK, CS1, CS2, DO1, DO2, D) {
        (self.clk, self.cs1, self.cs2, self.do1, self.do2, self.delay)
    }
}

fn clock_in_frame<CLK, CS, DO, D, E>(
    clk: &mut CLK,
    cs: &mut CS,
    dout: &mut DO,
    delay: &mut D,
) -> Result<u16, E>
where
    CLK: OutputPin<Error = E>,
    CS: OutputPin<Error = E>,
    DO: InputPin<Error = E>,
    D: DelayNs,
{
    cs.set_low()?;
    delay.delay_ms(CONVERSION_DELAY_MS);

    let mut raw: u16 = 0;
    for _ in 0..16 {
        clk.set_high()?;
        delay.delay_us(HALF_CYCLE_US);
        raw = (raw << 1) | u16::from(dout.is_high()?);
        clk.set_low()?;
        delay.delay_us(HALF_CYCLE_US);
    }

    cs.set_high()?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction};

    fn frame_for(counts: u16) -> u16 {
        (counts & 0x0FFF) << 3
    }

    #[test]
    fn test_decode_plain_temperature() {
        // 400 counts × 0.25 °C = 100.0 °C
        assert_eq!(decode_frame(frame_for(400)), Ok(100.0));
    }

    #[test]
    fn test_decode_bus_error() {
        assert_eq!(decode_frame(0x0000), Err(FrameError::BusError));
        assert_eq!(decode_frame(0xFFFF), Err(FrameError::BusError));
    }

    #[test]
    fn test_decode_open_circuit() {
        assert_eq!(
            decode_frame(frame_for(400) | 0x0004),
            Err(FrameError::OpenCircuit)
        );
    }

    #[test]
    fn test_decode_bad_frame_bits() {
        assert_eq!(
            decode_frame(frame_for(400) | 0x8000),
            Err(FrameError::BadFrame)
        );
        assert_eq!(
            decode_frame(frame_for(400) | 0x0002),
            Err(FrameError::BadFrame)
        );
    }

    #[test]
    fn test_decode_full_scale_reading() {
        // The 12-bit field tops out at 4095 counts = 1023.75 °C, well inside
        // the accepted range.
        assert_eq!(decode_frame(frame_for(4095)), Ok(1023.75));
    }

    #[test]
    fn test_decode_is_total() {
        // Every raw pattern must decode to exactly one defined outcome.
        for raw in 0..=u16::MAX {
            match decode_frame(raw) {
                Ok(t) => {
                    assert!((TEMP_MIN_C..=TEMP_MAX_C).contains(&t), "raw {raw:#06x} -> {t}");
                }
                Err(
                    FrameError::BusError
                    | FrameError::OpenCircuit
                    | FrameError::BadFrame
                    | FrameError::OutOfRange,
                ) => {}
            }
        }
    }

    #[test]
    fn test_read_clocks_sixteen_bits_msb_first() {
        let raw = frame_for(400); // 100.0 °C
        let mut clk_expect = vec![Transaction::set(State::Low)]; // parked in new()
        let mut do_expect = Vec::new();
        for bit in (0..16).rev() {
            clk_expect.push(Transaction::set(State::High));
            do_expect.push(Transaction::get(if raw & (1 << bit) != 0 {
                State::High
            } else {
                State::Low
            }));
            clk_expect.push(Transaction::set(State::Low));
        }

        let clk = PinMock::new(&clk_expect);
        let cs1 = PinMock::new(&[
            Transaction::set(State::High), // parked in new()
            Transaction::set(State::Low),
            Transaction::set(State::High),
        ]);
        let cs2 = PinMock::new(&[Transaction::set(State::High)]);
        let do1 = PinMock::new(&do_expect);
        let do2 = PinMock::new(&[]);

        let mut pair = Max6675Pair::new(clk, cs1, cs2, do1, do2, NoopDelay::new()).unwrap();
        let temp = pair.read(Channel::One).unwrap();
        assert_eq!(temp, 100.0);

        let (mut clk, mut cs1, mut cs2, mut do1, mut do2, _) = pair.free();
        clk.done();
        cs1.done();
        cs2.done();
        do1.done();
        do2.done();
    }

    #[test]
    fn test_read_second_channel_uses_its_own_select() {
        let mut clk_expect = vec![Transaction::set(State::Low)];
        let mut do_expect = Vec::new();
        for _ in 0..16 {
            clk_expect.push(Transaction::set(State::High));
            do_expect.push(Transaction::get(State::High));
            clk_expect.push(Transaction::set(State::Low));
        }

        let clk = PinMock::new(&clk_expect);
        let cs1 = PinMock::new(&[Transaction::set(State::High)]);
        let cs2 = PinMock::new(&[
            Transaction::set(State::High),
            Transaction::set(State::Low),
            Transaction::set(State::High),
        ]);
        let do1 = PinMock::new(&[]);
        let do2 = PinMock::new(&do_expect);

        let mut pair = Max6675Pair::new(clk, cs1, cs2, do1, do2, NoopDelay::new()).unwrap();
        // All-ones is a dead bus.
        assert_eq!(
            pair.read(Channel::Two),
            Err(ReadError::Frame(FrameError::BusError))
        );

        let (mut clk, mut cs1, mut cs2, mut do1, mut do2, _) = pair.free();
        clk.done();
        cs1.done();
        cs2.done();
        do1.done();
        do2.done();
    }
}
