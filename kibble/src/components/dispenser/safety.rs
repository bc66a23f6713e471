//! Safety supervisor: an independent 10Hz task that polls a snapshot of
//! device state and latches the shared safety flag on a stall or an
//! overfill condition. Never holds the hub lock across its own wait - it
//! copies out a snapshot, inspects it, and acts, exactly once per tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::devices::hardware::pwm::{self, PwmDriver};
use crate::error::Error;
use crate::state::{DeviceStateHub, FeedingStatus};

const SUPERVISOR_TICK: Duration = Duration::from_millis(100);
/// How long the weight reading may stay within [`STALL_RESET_DELTA_G`] of
/// its anchor while feeding before the auger is treated as stalled.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);
/// A weight change at least this large resets the stall watchdog's anchor.
const STALL_RESET_DELTA_G: f32 = 0.2;
/// Absolute bowl weight past which a feed is treated as an overfill/spill
/// regardless of how it got there.
const OVERFILL_WEIGHT_G: f32 = 500.0;

/// Tracks the running state the supervisor needs across ticks, kept
/// separate from [`crate::state::DeviceState`] since it is supervisor-only
/// bookkeeping nobody else reads. The stall watchdog only arms once
/// feeding starts, and re-arms fresh every time feeding starts again.
struct Watchdog {
    anchor: Option<(f32, Instant)>,
}

impl Watchdog {
    fn new() -> Self {
        Watchdog { anchor: None }
    }

    /// Feeds one new weight reading, returning a latch reason if either
    /// the stall or the overfill rule fires.
    fn observe(&mut self, weight_g: f32, feeding: bool) -> Option<&'static str> {
        if weight_g > OVERFILL_WEIGHT_G {
            return Some("bowl_overfill");
        }

        if !feeding {
            self.anchor = None;
            return None;
        }

        match self.anchor {
            None => {
                self.anchor = Some((weight_g, Instant::now()));
                None
            }
            Some((anchor_weight, armed_at)) => {
                if (weight_g - anchor_weight).abs() > STALL_RESET_DELTA_G {
                    self.anchor = Some((weight_g, Instant::now()));
                    None
                } else if armed_at.elapsed() > STALL_TIMEOUT {
                    Some("motor_stall")
                } else {
                    None
                }
            }
        }
    }
}

/// Runs the supervisor loop forever (until `hub` is dropped / the task is
/// cancelled), the function `feederd` spawns as the safety task.
///
/// Holds its own clone of the registry's PWM handle so it can force every
/// channel to neutral the instant it latches, without waiting on the
/// registry's outer lock - the dispatcher holds that lock for the entire
/// duration of a feed cycle, so a supervisor that only set the hub flag
/// would not actually stop a motor already in motion (spec section 4.7).
pub async fn run<P: PwmDriver>(hub: &DeviceStateHub, pwm: Arc<Mutex<P>>) -> Result<(), Error> {
    let mut ticker = interval(SUPERVISOR_TICK);
    let mut watchdog = Watchdog::new();

    loop {
        ticker.tick().await;
        let snapshot = hub.snapshot().await?;
        if snapshot.safety_mode_engaged {
            continue;
        }
        let feeding = snapshot.feeding_status == FeedingStatus::Processing;
        if let Some(reason) = watchdog.observe(snapshot.current_weight_g, feeding) {
            warn!("safety supervisor latching: {reason}");
            pwm::emergency_stop(&pwm).await?;
            hub.latch_safety(reason).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_weight_changes_never_latch() {
        let mut watchdog = Watchdog::new();
        for g in [5.0, 10.0, 20.0, 35.0] {
            assert!(watchdog.observe(g, true).is_none());
        }
    }

    #[test]
    fn absolute_overfill_latches_regardless_of_feeding_state() {
        let mut watchdog = Watchdog::new();
        let reason = watchdog.observe(OVERFILL_WEIGHT_G + 1.0, false);
        assert_eq!(reason, Some("bowl_overfill"));
    }

    #[test]
    fn stall_watchdog_only_arms_while_feeding() {
        let mut watchdog = Watchdog::new();
        assert!(watchdog.observe(10.0, false).is_none());
        assert!(watchdog.anchor.is_none());
    }

    #[test]
    fn small_drift_within_the_reset_delta_does_not_clear_the_anchor() {
        let mut watchdog = Watchdog::new();
        watchdog.observe(10.0, true);
        let (anchor_before, armed_at_before) = watchdog.anchor.unwrap();
        watchdog.observe(10.1, true);
        let (anchor_after, armed_at_after) = watchdog.anchor.unwrap();
        assert_eq!(anchor_before, anchor_after);
        assert_eq!(armed_at_before, armed_at_after);
    }

    #[test]
    fn a_real_jump_resets_the_stall_anchor() {
        let mut watchdog = Watchdog::new();
        watchdog.observe(10.0, true);
        watchdog.observe(12.0, true);
        assert_eq!(watchdog.anchor.unwrap().0, 12.0);
    }

    #[test]
    fn unchanged_weight_past_timeout_while_feeding_latches_as_stall() {
        let mut watchdog = Watchdog::new();
        watchdog.observe(10.0, true);
        watchdog.anchor = Some((10.0, Instant::now() - STALL_TIMEOUT - Duration::from_secs(1)));
        let reason = watchdog.observe(10.0, true);
        assert_eq!(reason, Some("motor_stall"));
    }

    #[tokio::test]
    async fn run_latches_the_hub_on_overfill() {
        let hub = DeviceStateHub::new(Duration::from_millis(200));
        hub.set_weight(OVERFILL_WEIGHT_G + 50.0, 0, true, true).await.unwrap();
        hub.set_feeding_status(FeedingStatus::Processing).await.unwrap();

        let snapshot = hub.snapshot().await.unwrap();
        let mut watchdog = Watchdog::new();
        let reason = watchdog.observe(snapshot.current_weight_g, true);
        assert_eq!(reason, Some("bowl_overfill"));
    }

    #[tokio::test]
    async fn run_cuts_pwm_power_directly_when_it_latches() {
        use crate::devices::hardware::pwm::SoftPwmDriver;

        let hub = Arc::new(DeviceStateHub::new(Duration::from_millis(200)));
        let pwm = Arc::new(Mutex::new(SoftPwmDriver::new()));
        pwm.lock().await.set_microseconds(0, 1800).await.unwrap();
        pwm.lock().await.set_power_gate(true).await.unwrap();
        hub.set_weight(OVERFILL_WEIGHT_G + 50.0, 0, true, true).await.unwrap();

        let run_hub = hub.clone();
        let run_pwm = pwm.clone();
        let task = tokio::spawn(async move { run(&run_hub, run_pwm).await });

        tokio::time::sleep(SUPERVISOR_TICK * 3).await;
        task.abort();

        assert!(hub.snapshot().await.unwrap().safety_mode_engaged);
        assert_eq!(pwm.lock().await.current_pulse(0), Some(0));
        assert!(!pwm.lock().await.power_gate_on());
    }
}
