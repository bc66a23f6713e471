//! PWM channel abstraction sitting between the registry/engine and the
//! physical hopper-gate/auger servo actuators, plus the power gate that
//! repurposes the same rail to pull up the tank EEPROMs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::error::Error;

/// Mechanical settle the driver waits for after muting, before the power
/// gate is cut - shared by [`TankRegistry::stop_all_servos`] and the
/// safety supervisor's direct preemption path, so both agree on how long a
/// commanded-neutral servo needs before it is safe to de-energize.
///
/// [`TankRegistry::stop_all_servos`]: crate::components::dispenser::registry::TankRegistry::stop_all_servos
pub const STOP_SETTLE: Duration = Duration::from_millis(100);

/// A channel can be driven either as a servo (microsecond pulse width
/// selects position/speed) or as a switched bus-power rail (every channel
/// held fully on, repurposed to supply EEPROM pull-ups). Moving between
/// modes mutes every channel for one full 50 Hz frame and then waits a
/// fixed settling period before the new mode is trusted, since a pulse
/// width meaningful in one mode can momentarily be a meaningless or unsafe
/// value in the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Servo,
    BusPower,
}

/// One full frame at 50 Hz - the mute window a mode transition holds every
/// channel neutral for before applying the new mode.
pub const MODE_SWITCH_MUTE: Duration = Duration::from_millis(20);
/// Fixed settle the driver waits after a mode transition before bus
/// traffic or servo motion may begin.
pub const MODE_SWITCH_SETTLE: Duration = Duration::from_millis(100);

/// Behaviour every PWM backend must provide. Kept as a trait so tests (and
/// the calibration CLI) can substitute an in-memory fake for real
/// hardware, the same seam the registry and engine use for the bus bridge.
#[async_trait]
pub trait PwmDriver: Send + Sync {
    /// Commands `channel` to output `pulse_us` microseconds.
    async fn set_microseconds(&mut self, channel: u8, pulse_us: u16) -> Result<(), Error>;
    /// Drives `channel` fully on/off (used only in bus-power mode).
    async fn set_full(&mut self, channel: u8, on: bool) -> Result<(), Error>;
    /// Sets the PWM frequency shared by every channel.
    async fn set_frequency(&mut self, hz: u16) -> Result<(), Error>;
    /// Gates external servo power. Active-low: `true` means power applied.
    async fn set_power_gate(&mut self, on: bool) -> Result<(), Error>;
    /// Reads back the last pulse width commanded to `channel`.
    fn current_pulse(&self, channel: u8) -> Option<u16>;
    /// Current driver mode.
    fn mode(&self) -> ChannelMode;

    /// Switches the driver's mode: mutes every channel for
    /// [`MODE_SWITCH_MUTE`], applies `mode`, then waits
    /// [`MODE_SWITCH_SETTLE`] before returning. Per spec section 4.3 this
    /// must precede any bus traffic or servo motion in the new mode.
    async fn set_mode(&mut self, mode: ChannelMode) -> Result<(), Error> {
        self.mute_all().await?;
        sleep(MODE_SWITCH_MUTE).await;
        self.apply_mode(mode).await?;
        sleep(MODE_SWITCH_SETTLE).await;
        Ok(())
    }

    /// Commands every channel to a neutral/off value without changing
    /// mode. Used directly by emergency stop and `stop_all_servos`, and as
    /// the first step of [`Self::set_mode`].
    async fn mute_all(&mut self) -> Result<(), Error>;

    /// Applies `mode` to the driver's internal bookkeeping; called only by
    /// the default [`Self::set_mode`] after muting.
    async fn apply_mode(&mut self, mode: ChannelMode) -> Result<(), Error>;
}

/// Mutes every channel, waits [`STOP_SETTLE`] for mechanical settle, then
/// cuts servo power - the same sequence [`TankRegistry::stop_all_servos`]
/// runs, exposed as a free function over a bare `Mutex<P>` so a caller that
/// does not otherwise hold the registry (the safety supervisor, which must
/// preempt a feed in progress without waiting for the registry's own lock
/// to free up) can still force every channel to neutral directly.
///
/// [`TankRegistry::stop_all_servos`]: crate::components::dispenser::registry::TankRegistry::stop_all_servos
pub async fn emergency_stop<P: PwmDriver>(pwm: &Mutex<P>) -> Result<(), Error> {
    pwm.lock().await.mute_all().await?;
    sleep(STOP_SETTLE).await;
    pwm.lock().await.set_power_gate(false).await
}

/// In-process PWM driver tracking commanded state without touching real
/// hardware. This is the default implementation `feederd` wires up; a
/// hardware-backed driver writing to a real PWM chip would implement the
/// same [`PwmDriver`] trait.
pub struct SoftPwmDriver {
    pulses: HashMap<u8, u16>,
    mode: ChannelMode,
    frequency_hz: u16,
    power_gate_on: bool,
}

impl Default for SoftPwmDriver {
    fn default() -> Self {
        SoftPwmDriver {
            pulses: HashMap::new(),
            mode: ChannelMode::Servo,
            frequency_hz: 50,
            power_gate_on: false,
        }
    }
}

impl SoftPwmDriver {
    pub fn new() -> Self {
        SoftPwmDriver::default()
    }

    pub fn power_gate_on(&self) -> bool {
        self.power_gate_on
    }

    pub fn frequency_hz(&self) -> u16 {
        self.frequency_hz
    }
}

#[async_trait]
impl PwmDriver for SoftPwmDriver {
    async fn set_microseconds(&mut self, channel: u8, pulse_us: u16) -> Result<(), Error> {
        self.pulses.insert(channel, pulse_us);
        Ok(())
    }

    async fn set_full(&mut self, channel: u8, on: bool) -> Result<(), Error> {
        self.pulses.insert(channel, if on { u16::MAX } else { 0 });
        Ok(())
    }

    async fn set_frequency(&mut self, hz: u16) -> Result<(), Error> {
        self.frequency_hz = hz;
        Ok(())
    }

    async fn set_power_gate(&mut self, on: bool) -> Result<(), Error> {
        self.power_gate_on = on;
        Ok(())
    }

    fn current_pulse(&self, channel: u8) -> Option<u16> {
        self.pulses.get(&channel).copied()
    }

    fn mode(&self) -> ChannelMode {
        self.mode
    }

    async fn mute_all(&mut self) -> Result<(), Error> {
        for pulse in self.pulses.values_mut() {
            *pulse = 0;
        }
        Ok(())
    }

    async fn apply_mode(&mut self, mode: ChannelMode) -> Result<(), Error> {
        self.mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_microseconds_is_read_back_exactly() {
        let mut driver = SoftPwmDriver::new();
        driver.set_microseconds(2, 1500).await.unwrap();
        assert_eq!(driver.current_pulse(2), Some(1500));
    }

    #[tokio::test]
    async fn switching_mode_mutes_every_channel_then_applies_the_new_mode() {
        let mut driver = SoftPwmDriver::new();
        driver.set_microseconds(0, 1800).await.unwrap();
        driver.set_microseconds(1, 1800).await.unwrap();
        driver.set_mode(ChannelMode::BusPower).await.unwrap();
        assert_eq!(driver.mode(), ChannelMode::BusPower);
        assert_eq!(driver.current_pulse(0), Some(0));
        assert_eq!(driver.current_pulse(1), Some(0));
    }

    #[tokio::test]
    async fn power_gate_tracks_the_last_commanded_value() {
        let mut driver = SoftPwmDriver::new();
        driver.set_power_gate(true).await.unwrap();
        assert!(driver.power_gate_on());
        driver.set_power_gate(false).await.unwrap();
        assert!(!driver.power_gate_on());
    }

    #[tokio::test]
    async fn unset_channel_reads_back_as_none() {
        let driver = SoftPwmDriver::new();
        assert_eq!(driver.current_pulse(9), None);
    }
}
