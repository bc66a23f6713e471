//! Dispensing engine: runs a feed as a sequence of three-phase cycles
//! (purge, close-with-spike-detection, proportional dispense) bounded by
//! the hopper's physical volume, until the requested mass is delivered or
//! the cycle errors out.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::warn;
use strum_macros::EnumString;
use tokio::time::sleep;

use crate::error::Error;
use crate::messages::control::event::Event;
use crate::settings::Settings;
use crate::state::DeviceStateHub;

/// PWM channel the hopper gate servo is wired to; matches
/// [`crate::components::dispenser::registry::HOPPER_CHANNEL`].
const HOPPER_CHANNEL: u8 = 6;

const PURGE_OPEN_WAIT: Duration = Duration::from_millis(100);
const WIGGLE_CYCLES: u8 = 4;
const WIGGLE_DELTA_US: i32 = 150;
const WIGGLE_HALF_PERIOD: Duration = Duration::from_millis(200);
const PURGE_SETTLE: Duration = Duration::from_millis(2000);

const CLOSE_STEP_US: i32 = 25;
const CLOSE_STEP_WAIT: Duration = Duration::from_millis(100);
const CLOSE_MAX_STEPS: u32 = 60;
const SPIKE_THRESHOLD_G: f32 = 3.0;
const CLOSE_BACKOFF_US: i32 = 50;
const POST_CLOSE_WAIT: Duration = Duration::from_millis(300);
const POST_TARE_WAIT: Duration = Duration::from_millis(300);

/// Largest volume of ingredient the hopper can hold for one dispense cycle.
pub const MAX_HOPPER_VOLUME_L: f32 = 0.01;
/// Density assumed for a tank the registry hasn't calibrated yet.
const DEFAULT_DENSITY_G_PER_L: f32 = 500.0;
const BATCH_MIN_G: f32 = 0.5;
const INGREDIENT_MIN_G: f32 = 0.5;
const DISPENSE_PERIOD: Duration = Duration::from_millis(250);
const SLOW_THRESHOLD_G: f32 = 2.0;
const SLOW_SPEED: f32 = 0.2;
const FULL_SPEED: f32 = 1.0;
const FINAL_SETTLE: Duration = Duration::from_millis(500);
const COMPLETE_EPSILON_G: f32 = 0.5;
/// Cycles in a row with no measurable progress before the whole feed is
/// abandoned rather than retried forever.
const MAX_STALLED_CYCLES: u32 = 2;

/// Hardware seam the engine drives the hopper gate and augers through.
/// Implemented directly by [`crate::components::dispenser::registry::TankRegistry`];
/// every method takes `&self` since the registry serialises access to the
/// PWM driver behind its own lock.
#[async_trait]
pub trait HopperActuator: Send + Sync {
    async fn open_hopper(&self, open_pulse_us: u16) -> Result<(), Error>;
    async fn close_hopper(&self, closed_pulse_us: u16) -> Result<(), Error>;
    async fn set_servo_us(&self, channel: u8, us: u16) -> Result<(), Error>;
    async fn set_continuous_servo(&self, channel: u8, speed: f32) -> Result<(), Error>;
    async fn stop_all_servos(&self) -> Result<(), Error>;
    /// The bus index a tank currently occupies, if it is present.
    fn channel_for_tank(&self, uid: u64) -> Option<u8>;
    /// A tank's calibrated density, if known.
    fn density_kg_per_l(&self, uid: u64) -> Option<f32>;
}

/// Hardware seam the engine reads the scale through.
#[async_trait]
pub trait WeightSource: Send + Sync {
    async fn current_weight_g(&self) -> Result<f32, Error>;
    async fn tare(&self) -> Result<(), Error>;
}

/// One ingredient in a recipe or a single-tank immediate feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ingredient {
    pub tank_uid: u64,
    pub percentage: f32,
}

/// Every phase the engine moves through for one dispensing cycle, in
/// order. `Complete`/`Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum_macros::IntoStaticStr)]
pub enum DispensingPhase {
    Idle,
    PurgeOpen,
    PurgeWiggle,
    PurgeSettle,
    CloseMoving,
    CloseDetectSpike,
    CloseBackoff,
    Tare,
    DispenseAuger,
    DispenseSettle,
    Complete,
    Error,
}

/// Full state of one feed in progress, carried across however many
/// hopper-bounded cycles it takes to deliver `total_target_g`.
#[derive(Debug, Clone)]
pub struct DispensingContext {
    pub recipe_uid: Option<u32>,
    pub ingredients: Vec<Ingredient>,
    pub total_target_g: f32,
    pub dispensed_g: f32,
    pub servings: u16,
    pub batch_target_g: f32,
    pub batch_dispensed_g: f32,
    /// Remaining grams owed to each ingredient, indexed parallel to
    /// `ingredients`.
    pub per_ingredient_remaining_g: Vec<f32>,
    pub learned_close_us: Option<u16>,
    pub close_calibrated: bool,
    pub phase: DispensingPhase,
    pub error: Option<String>,
    pub phase_started_at: Instant,
    pub wiggle_count: u8,
    pub close_attempts: u32,
    pub pre_close_weight: f32,
}

impl DispensingContext {
    pub fn immediate(tank_uid: u64, grams: f32) -> Self {
        DispensingContext::new(None, vec![Ingredient { tank_uid, percentage: 100.0 }], grams, 1)
    }

    pub fn recipe(recipe_uid: u32, ingredients: Vec<Ingredient>, total_target_g: f32, servings: u16) -> Self {
        DispensingContext::new(Some(recipe_uid), ingredients, total_target_g, servings)
    }

    fn new(recipe_uid: Option<u32>, ingredients: Vec<Ingredient>, total_target_g: f32, servings: u16) -> Self {
        let per_ingredient_remaining_g = ingredients
            .iter()
            .map(|i| total_target_g * i.percentage / 100.0)
            .collect();
        DispensingContext {
            recipe_uid,
            ingredients,
            total_target_g,
            dispensed_g: 0.0,
            servings,
            batch_target_g: 0.0,
            batch_dispensed_g: 0.0,
            per_ingredient_remaining_g,
            learned_close_us: None,
            close_calibrated: false,
            phase: DispensingPhase::Idle,
            error: None,
            phase_started_at: Instant::now(),
            wiggle_count: 0,
            close_attempts: 0,
            pre_close_weight: 0.0,
        }
    }
}

enum CycleOutcome {
    Continue,
    Complete,
}

pub struct DispensingEngine {
    settings: Settings,
}

impl DispensingEngine {
    pub fn new(settings: Settings) -> Self {
        DispensingEngine { settings }
    }

    /// Runs `ctx` to completion, one hopper-bounded cycle at a time.
    /// Returns the final context with `phase` set to `Complete` or `Error`
    /// and, on error, `error` filled in.
    pub async fn run<H: HopperActuator, W: WeightSource>(
        &self,
        hopper: &H,
        scale: &W,
        hub: &DeviceStateHub,
        mut ctx: DispensingContext,
    ) -> DispensingContext {
        let mut stalled_cycles: u32 = 0;
        loop {
            if self.check_emergency(hopper, hub).await {
                ctx.phase = DispensingPhase::Error;
                ctx.error = Some("user_stopped".into());
                return ctx;
            }

            let before = ctx.dispensed_g;
            match self.run_cycle(hopper, scale, hub, &mut ctx).await {
                Ok(CycleOutcome::Complete) => {
                    ctx.phase = DispensingPhase::Complete;
                    hub.publish(Event::FeedingComplete { success: true, dispensed: ctx.dispensed_g });
                    return ctx;
                }
                Ok(CycleOutcome::Continue) => {
                    if ctx.dispensed_g - before < INGREDIENT_MIN_G {
                        stalled_cycles += 1;
                    } else {
                        stalled_cycles = 0;
                    }
                    if stalled_cycles >= MAX_STALLED_CYCLES {
                        ctx.phase = DispensingPhase::Error;
                        ctx.error = Some("no ingredient made further progress".into());
                        hub.publish(Event::FeedingComplete { success: false, dispensed: ctx.dispensed_g });
                        return ctx;
                    }
                }
                Err(e) => {
                    ctx.phase = DispensingPhase::Error;
                    ctx.error = Some(e.to_string());
                    hub.publish(Event::FeedingComplete { success: false, dispensed: ctx.dispensed_g });
                    return ctx;
                }
            }
        }
    }

    /// Consumes a pending emergency stop, if any, cutting servo power on
    /// the way out. Also honors a safety latch set directly by the
    /// supervisor (which already cut power itself) rather than only the
    /// inbox command, so a feed aborts the instant the flag is set even if
    /// no explicit stop command was ever queued. Checked between every
    /// phase and inside every inner wait loop so a stop preempts a feed
    /// already in progress.
    async fn check_emergency<H: HopperActuator>(&self, hopper: &H, hub: &DeviceStateHub) -> bool {
        if let Ok(true) = hub.try_take_emergency_stop().await {
            let _ = hopper.stop_all_servos().await;
            hub.publish(Event::Error {
                code: "user_stopped".into(),
                message: "feed aborted by emergency stop".into(),
            });
            return true;
        }
        matches!(hub.snapshot().await, Ok(snapshot) if snapshot.safety_mode_engaged)
    }

    async fn run_cycle<H: HopperActuator, W: WeightSource>(
        &self,
        hopper: &H,
        scale: &W,
        hub: &DeviceStateHub,
        ctx: &mut DispensingContext,
    ) -> Result<CycleOutcome, Error> {
        self.purge(hopper, hub, ctx).await?;
        self.close_with_spike_detection(hopper, scale, hub, ctx).await?;

        ctx.phase = DispensingPhase::Tare;
        ctx.phase_started_at = Instant::now();
        sleep(POST_CLOSE_WAIT).await;
        scale.tare().await?;
        sleep(POST_TARE_WAIT).await;
        let post_tare_weight = scale.current_weight_g().await?;
        if post_tare_weight.is_nan() {
            return Err(Error::DispensingAborted("scale unresponsive after tare".into()));
        }

        ctx.phase = DispensingPhase::DispenseAuger;
        ctx.phase_started_at = Instant::now();
        self.dispense_batch(hopper, scale, hub, ctx).await?;

        ctx.phase = DispensingPhase::DispenseSettle;
        sleep(FINAL_SETTLE).await;

        let total_remaining: f32 = ctx.per_ingredient_remaining_g.iter().sum();
        if ctx.dispensed_g + COMPLETE_EPSILON_G >= ctx.total_target_g || total_remaining < INGREDIENT_MIN_G {
            hopper.open_hopper(self.settings.hopper_open_pulse_us).await?;
            sleep(PURGE_OPEN_WAIT).await;
            hopper.close_hopper(self.settings.hopper_closed_pulse_us).await?;
            Ok(CycleOutcome::Complete)
        } else {
            Ok(CycleOutcome::Continue)
        }
    }

    async fn purge<H: HopperActuator>(&self, hopper: &H, hub: &DeviceStateHub, ctx: &mut DispensingContext) -> Result<(), Error> {
        ctx.phase = DispensingPhase::PurgeOpen;
        ctx.phase_started_at = Instant::now();
        hopper.open_hopper(self.settings.hopper_open_pulse_us).await?;
        sleep(PURGE_OPEN_WAIT).await;
        if self.check_emergency(hopper, hub).await {
            return Err(Error::DispensingAborted("user_stopped".into()));
        }

        ctx.phase = DispensingPhase::PurgeWiggle;
        ctx.phase_started_at = Instant::now();
        let center = self.settings.hopper_open_pulse_us as i32;
        for _ in 0..WIGGLE_CYCLES {
            if self.check_emergency(hopper, hub).await {
                return Err(Error::DispensingAborted("user_stopped".into()));
            }
            hopper.set_servo_us(HOPPER_CHANNEL, clamp_us(center + WIGGLE_DELTA_US)).await?;
            sleep(WIGGLE_HALF_PERIOD).await;
            hopper.set_servo_us(HOPPER_CHANNEL, clamp_us(center - WIGGLE_DELTA_US)).await?;
            sleep(WIGGLE_HALF_PERIOD).await;
            ctx.wiggle_count += 1;
        }
        hopper.set_servo_us(HOPPER_CHANNEL, clamp_us(center)).await?;

        ctx.phase = DispensingPhase::PurgeSettle;
        ctx.phase_started_at = Instant::now();
        sleep(PURGE_SETTLE).await;
        if self.check_emergency(hopper, hub).await {
            return Err(Error::DispensingAborted("user_stopped".into()));
        }
        Ok(())
    }

    /// Steps the gate closed in small increments, watching for the weight
    /// spike a seed falling free of the gate produces. The step at which
    /// that spike is seen, backed off slightly, becomes the learned close
    /// pulse; missing the spike within `CLOSE_MAX_STEPS` falls back to the
    /// configured closed pulse and leaves `close_calibrated` false - a
    /// recoverable miss, not a cycle failure.
    async fn close_with_spike_detection<H: HopperActuator, W: WeightSource>(
        &self,
        hopper: &H,
        scale: &W,
        hub: &DeviceStateHub,
        ctx: &mut DispensingContext,
    ) -> Result<(), Error> {
        ctx.phase = DispensingPhase::CloseMoving;
        ctx.phase_started_at = Instant::now();
        ctx.pre_close_weight = scale.current_weight_g().await?;
        if ctx.pre_close_weight.is_nan() {
            return Err(Error::DispensingAborted("scale unresponsive before close".into()));
        }

        let open = self.settings.hopper_open_pulse_us as i32;
        let closed = self.settings.hopper_closed_pulse_us as i32;
        let direction: i32 = if closed >= open { 1 } else { -1 };
        let mut pulse = open;
        let mut spiked = false;

        for step in 0..CLOSE_MAX_STEPS {
            if self.check_emergency(hopper, hub).await {
                return Err(Error::DispensingAborted("user_stopped".into()));
            }
            pulse += direction * CLOSE_STEP_US;
            hopper.set_servo_us(HOPPER_CHANNEL, clamp_us(pulse)).await?;
            sleep(CLOSE_STEP_WAIT).await;
            ctx.close_attempts = step + 1;

            ctx.phase = DispensingPhase::CloseDetectSpike;
            let weight = scale.current_weight_g().await?;
            if weight.is_nan() {
                return Err(Error::DispensingAborted("scale unresponsive during close".into()));
            }
            if weight - ctx.pre_close_weight >= SPIKE_THRESHOLD_G {
                ctx.phase = DispensingPhase::CloseBackoff;
                pulse -= direction * CLOSE_BACKOFF_US;
                hopper.set_servo_us(HOPPER_CHANNEL, clamp_us(pulse)).await?;
                ctx.learned_close_us = Some(clamp_us(pulse));
                ctx.close_calibrated = true;
                spiked = true;
                break;
            }
            ctx.phase = DispensingPhase::CloseMoving;
        }

        if !spiked {
            warn!("close-detection spike missed after {CLOSE_MAX_STEPS} steps, falling back to configured closed pulse");
            ctx.close_calibrated = false;
            hopper.close_hopper(self.settings.hopper_closed_pulse_us).await?;
        }
        Ok(())
    }

    /// Dispenses at most one hopper-volume's worth of ingredient, split
    /// proportionally across whatever ingredients still owe weight. Each
    /// ingredient's auger run is its own stall-timeout domain: one tank
    /// running dry doesn't abort the ones still making progress.
    async fn dispense_batch<H: HopperActuator, W: WeightSource>(
        &self,
        hopper: &H,
        scale: &W,
        hub: &DeviceStateHub,
        ctx: &mut DispensingContext,
    ) -> Result<(), Error> {
        let total_remaining: f32 = ctx.per_ingredient_remaining_g.iter().sum();
        if total_remaining < INGREDIENT_MIN_G {
            return Ok(());
        }

        let min_density_g_per_l = ctx
            .ingredients
            .iter()
            .zip(&ctx.per_ingredient_remaining_g)
            .filter(|(_, remaining)| **remaining >= INGREDIENT_MIN_G)
            .filter_map(|(ingredient, _)| hopper.density_kg_per_l(ingredient.tank_uid))
            .map(|kg_per_l| kg_per_l * 1000.0)
            .fold(None, |min: Option<f32>, d| Some(min.map_or(d, |m| m.min(d))))
            .unwrap_or(DEFAULT_DENSITY_G_PER_L);

        let batch_target = total_remaining.min(MAX_HOPPER_VOLUME_L * min_density_g_per_l);
        if batch_target < BATCH_MIN_G {
            return Ok(());
        }
        ctx.batch_target_g = batch_target;
        ctx.batch_dispensed_g = 0.0;

        for i in 0..ctx.ingredients.len() {
            if self.check_emergency(hopper, hub).await {
                return Err(Error::DispensingAborted("user_stopped".into()));
            }
            if ctx.per_ingredient_remaining_g[i] < INGREDIENT_MIN_G {
                continue;
            }
            let percentage = ctx.ingredients[i].percentage / 100.0;
            let ingredient_target = (batch_target * percentage).min(ctx.per_ingredient_remaining_g[i]);
            if ingredient_target < INGREDIENT_MIN_G {
                continue;
            }

            let tank_uid = ctx.ingredients[i].tank_uid;
            let Some(channel) = hopper.channel_for_tank(tank_uid) else {
                warn!("tank {tank_uid:#018x} not present on any bus, skipping this batch");
                continue;
            };

            let dispensed = self.run_auger(hopper, scale, hub, channel, tank_uid, ingredient_target).await?;
            ctx.per_ingredient_remaining_g[i] -= dispensed;
            ctx.batch_dispensed_g += dispensed;
            ctx.dispensed_g += dispensed;
            hub.publish(Event::FeedingProgress {
                weight: scale.current_weight_g().await.unwrap_or(ctx.dispensed_g),
                target: ctx.total_target_g,
            });
        }
        Ok(())
    }

    /// Spins one auger until `target_g` has been dispensed, slowing near
    /// the end and stopping outright if no progress is seen within the
    /// configured stall timeout. Returns however much actually made it
    /// out, which may be less than `target_g` on a contained stall.
    async fn run_auger<H: HopperActuator, W: WeightSource>(
        &self,
        hopper: &H,
        scale: &W,
        hub: &DeviceStateHub,
        channel: u8,
        tank_uid: u64,
        target_g: f32,
    ) -> Result<f32, Error> {
        let weight_at_start = scale.current_weight_g().await?;
        let mut last_weight = weight_at_start;
        let mut last_progress_at = Instant::now();
        let mut dispensed = 0.0f32;

        hopper.set_continuous_servo(channel, FULL_SPEED).await?;
        loop {
            if self.check_emergency(hopper, hub).await {
                return Err(Error::DispensingAborted("user_stopped".into()));
            }
            sleep(DISPENSE_PERIOD).await;
            let current = scale.current_weight_g().await?;
            dispensed = (current - weight_at_start).max(0.0);
            let remaining = target_g - dispensed;

            if (current - last_weight).abs() >= self.settings.dispensing_progress_threshold_g {
                last_progress_at = Instant::now();
                last_weight = current;
            } else if last_progress_at.elapsed() >= self.settings.dispensing_stall_timeout {
                hopper.set_continuous_servo(channel, 0.0).await?;
                warn!("tank {tank_uid:#018x} stalled mid-dispense, containing to this ingredient");
                hub.publish(Event::Error {
                    code: "tank_empty".into(),
                    message: format!(
                        "tank {tank_uid:#018x} made no progress for {:?}",
                        self.settings.dispensing_stall_timeout
                    ),
                });
                break;
            }

            if remaining < SLOW_THRESHOLD_G {
                hopper.set_continuous_servo(channel, SLOW_SPEED).await?;
            }
            if dispensed >= target_g {
                hopper.set_continuous_servo(channel, 0.0).await?;
                break;
            }
        }
        Ok(dispensed.min(target_g))
    }
}

fn clamp_us(us: i32) -> u16 {
    us.clamp(0, u16::MAX as i32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    struct FakeHopper {
        pulses: StdMutex<std::collections::HashMap<u8, u16>>,
        speeds: StdMutex<std::collections::HashMap<u8, f32>>,
        stopped: AtomicU32,
        density: f32,
        density_overrides: std::collections::HashMap<u64, f32>,
    }

    impl FakeHopper {
        fn new(density: f32) -> Self {
            FakeHopper {
                pulses: StdMutex::new(std::collections::HashMap::new()),
                speeds: StdMutex::new(std::collections::HashMap::new()),
                stopped: AtomicU32::new(0),
                density,
                density_overrides: std::collections::HashMap::new(),
            }
        }

        /// A hopper whose per-tank density varies, for exercising the batch
        /// target computation's use of the least dense ingredient present.
        fn with_densities(overrides: std::collections::HashMap<u64, f32>) -> Self {
            FakeHopper { density_overrides: overrides, ..FakeHopper::new(0.0) }
        }
    }

    #[async_trait]
    impl HopperActuator for FakeHopper {
        async fn open_hopper(&self, open_pulse_us: u16) -> Result<(), Error> {
            self.pulses.lock().unwrap().insert(HOPPER_CHANNEL, open_pulse_us);
            Ok(())
        }
        async fn close_hopper(&self, closed_pulse_us: u16) -> Result<(), Error> {
            self.pulses.lock().unwrap().insert(HOPPER_CHANNEL, closed_pulse_us);
            Ok(())
        }
        async fn set_servo_us(&self, channel: u8, us: u16) -> Result<(), Error> {
            self.pulses.lock().unwrap().insert(channel, us);
            Ok(())
        }
        async fn set_continuous_servo(&self, channel: u8, speed: f32) -> Result<(), Error> {
            self.speeds.lock().unwrap().insert(channel, speed);
            Ok(())
        }
        async fn stop_all_servos(&self) -> Result<(), Error> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn channel_for_tank(&self, uid: u64) -> Option<u8> {
            Some((uid % 6) as u8)
        }
        fn density_kg_per_l(&self, uid: u64) -> Option<f32> {
            self.density_overrides.get(&uid).copied().or(Some(self.density))
        }
    }

    /// Scripted scale that climbs by a fixed amount every time
    /// `current_weight_g` is polled, simulating steady dispensing without
    /// a real load cell.
    struct ClimbingScale {
        weight: StdMutex<f32>,
        step_g: f32,
    }

    impl ClimbingScale {
        fn new(step_g: f32) -> Self {
            ClimbingScale { weight: StdMutex::new(0.0), step_g }
        }
    }

    #[async_trait]
    impl WeightSource for ClimbingScale {
        async fn current_weight_g(&self) -> Result<f32, Error> {
            let mut w = self.weight.lock().unwrap();
            *w += self.step_g;
            Ok(*w)
        }
        async fn tare(&self) -> Result<(), Error> {
            *self.weight.lock().unwrap() = 0.0;
            Ok(())
        }
    }

    struct FlatScale {
        weight: f32,
    }

    #[async_trait]
    impl WeightSource for FlatScale {
        async fn current_weight_g(&self) -> Result<f32, Error> {
            Ok(self.weight)
        }
        async fn tare(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn fast_settings() -> Settings {
        let mut s = Settings::default();
        s.dispensing_stall_timeout = StdDuration::from_millis(50);
        s
    }

    #[tokio::test]
    async fn immediate_feed_completes_once_target_weight_is_reached() {
        let engine = DispensingEngine::new(fast_settings());
        let hopper = FakeHopper::new(500.0);
        let scale = ClimbingScale::new(1.0);
        let hub = DeviceStateHub::new(StdDuration::from_millis(200));
        let ctx = DispensingContext::immediate(3, 5.0);

        let result = engine.run(&hopper, &scale, &hub, ctx).await;
        assert_eq!(result.phase, DispensingPhase::Complete);
        assert!(result.dispensed_g >= 5.0);
    }

    #[tokio::test]
    async fn stalled_auger_is_contained_and_reported_without_crashing_the_cycle() {
        let engine = DispensingEngine::new(fast_settings());
        let hopper = FakeHopper::new(500.0);
        let scale = FlatScale { weight: 0.0 };
        let hub = DeviceStateHub::new(StdDuration::from_millis(200));
        let ctx = DispensingContext::immediate(1, 5.0);

        let result = engine.run(&hopper, &scale, &hub, ctx).await;
        assert_eq!(result.phase, DispensingPhase::Error);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn close_detection_falls_back_to_configured_pulse_when_no_spike_is_seen() {
        let engine = DispensingEngine::new(fast_settings());
        let hopper = FakeHopper::new(500.0);
        let scale = FlatScale { weight: 0.0 };
        let hub = DeviceStateHub::new(StdDuration::from_millis(200));
        let mut ctx = DispensingContext::immediate(1, 5.0);

        let _ = engine.close_with_spike_detection(&hopper, &scale, &hub, &mut ctx).await;
        assert!(!ctx.close_calibrated);
        assert_eq!(
            hopper.pulses.lock().unwrap().get(&HOPPER_CHANNEL).copied(),
            Some(fast_settings().hopper_closed_pulse_us)
        );
    }

    #[tokio::test]
    async fn wiggle_returns_the_gate_to_its_open_center() {
        let engine = DispensingEngine::new(fast_settings());
        let hopper = FakeHopper::new(500.0);
        let hub = DeviceStateHub::new(StdDuration::from_millis(200));
        let mut ctx = DispensingContext::immediate(1, 5.0);

        engine.purge(&hopper, &hub, &mut ctx).await.unwrap();
        assert_eq!(ctx.wiggle_count, WIGGLE_CYCLES);
        assert_eq!(
            hopper.pulses.lock().unwrap().get(&HOPPER_CHANNEL).copied(),
            Some(engine.settings.hopper_open_pulse_us)
        );
    }

    #[tokio::test]
    async fn batch_target_stays_within_the_hopper_volume_at_the_least_dense_ingredient() {
        let engine = DispensingEngine::new(fast_settings());
        // kg/L, as the `HopperActuator::density_kg_per_l` contract specifies.
        let densities = std::collections::HashMap::from([(1u64, 0.5), (2u64, 1.5)]);
        let hopper = FakeHopper::with_densities(densities);
        let scale = ClimbingScale::new(50.0);
        let hub = DeviceStateHub::new(StdDuration::from_millis(200));
        let ingredients = vec![Ingredient { tank_uid: 1, percentage: 50.0 }, Ingredient { tank_uid: 2, percentage: 50.0 }];
        let mut ctx = DispensingContext::recipe(1, ingredients, 1_000.0, 1);

        engine.dispense_batch(&hopper, &scale, &hub, &mut ctx).await.unwrap();

        let least_dense_g_per_l = 0.5_f32 * 1000.0;
        let bound = MAX_HOPPER_VOLUME_L * least_dense_g_per_l;
        assert!(
            ctx.batch_target_g <= bound + 1e-3,
            "batch_target_g {} exceeded the least-dense-ingredient bound {bound}",
            ctx.batch_target_g
        );
    }
}
