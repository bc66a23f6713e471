//! Load-cell sampling: a power-cycled state machine that samples a noisy
//! load-cell amplifier in short bursts, publishes an average, then powers
//! the chip down between bursts rather than holding it on continuously.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use ringbuffer::{AllocRingBuffer, RingBuffer};
use tokio::time::sleep;

use crate::components::dispenser::engine::WeightSource;
use crate::error::Error;
use crate::settings::Settings;

/// Pace of one non-blocking conversion attempt while in `Sampling`.
const SAMPLE_TICK: Duration = Duration::from_millis(13);
/// Conversions attempted per published average (~247 ms window).
const WINDOW_LEN: usize = 19;
/// Backing capacity for the window's ring buffer. A power of two, as
/// `AllocRingBuffer` wants, comfortably larger than `WINDOW_LEN` - the
/// buffer is drained and rebuilt every window, so the slack capacity never
/// holds a stale sample from a previous window.
const WINDOW_BUFFER_CAPACITY: usize = 32;
/// How long the chip stays powered down between windows.
const IDLE_DURATION: Duration = Duration::from_millis(195);
/// Settling wait after re-powering, before sampling resumes.
const SETTLE_DURATION: Duration = Duration::from_millis(52);
/// Weight delta under which two consecutive averages count as stable.
const STABILITY_THRESHOLD_G: f32 = 0.5;

/// Source of raw ADC counts, decoupled from the concrete load-cell
/// amplifier so tests and the calibration CLI can substitute a scripted
/// source.
#[async_trait]
pub trait RawScaleSource: Send + Sync {
    /// Attempts one non-blocking conversion. `Ok(None)` means the chip was
    /// not ready this tick; a reported `0` is itself a failed conversion,
    /// not a legitimate zero reading.
    async fn try_read(&mut self) -> Result<Option<i32>, Error>;
    async fn power_up(&mut self) -> Result<(), Error>;
    async fn power_down(&mut self) -> Result<(), Error>;
}

/// One published average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleReading {
    pub raw: i32,
    pub weight_g: f32,
    pub stable: bool,
    pub responding: bool,
}

pub struct ScaleSampler<S> {
    source: S,
    factor: f64,
    zero_offset: i32,
    previous_weight_g: f32,
    tare_samples: usize,
}

impl<S: RawScaleSource> ScaleSampler<S> {
    pub fn new(source: S, settings: &Settings) -> Self {
        ScaleSampler {
            source,
            factor: settings.scale_factor,
            zero_offset: settings.scale_zero_offset,
            previous_weight_g: 0.0,
            tare_samples: settings.scale_tare_samples,
        }
    }

    fn to_weight(&self, raw: i32) -> f32 {
        ((raw - self.zero_offset) as f64 / self.factor) as f32
    }

    /// Runs one full sampling window: `WINDOW_LEN` non-blocking conversion
    /// attempts paced at [`SAMPLE_TICK`], folding any successful reads into
    /// an average. Zero readings count as failures, matching the hardware
    /// behaviour of this chip family. Successful reads accumulate in a
    /// fixed-capacity ring buffer rather than a growable `Vec` - the window
    /// length is bounded at compile time and every reading is folded into
    /// the published average once the window closes, never retained past it.
    async fn sample_window(&mut self) -> Result<ScaleReading, Error> {
        let mut samples: AllocRingBuffer<i32> = AllocRingBuffer::new(WINDOW_BUFFER_CAPACITY);
        for _ in 0..WINDOW_LEN {
            sleep(SAMPLE_TICK).await;
            if let Some(raw) = self.source.try_read().await? {
                if raw != 0 {
                    samples.push(raw);
                }
            }
        }
        let count = samples.len() as i64;
        let sum: i64 = samples.iter().map(|&r| r as i64).sum();
        let raw = if count > 0 { (sum / count) as i32 } else { 0 };
        let weight_g = if count > 0 { self.to_weight(raw) } else { self.previous_weight_g };
        let stable = (weight_g - self.previous_weight_g).abs() < STABILITY_THRESHOLD_G;
        let responding = count > 0;
        self.previous_weight_g = weight_g;
        Ok(ScaleReading { raw, weight_g, stable, responding })
    }

    /// Runs one full publish cycle: sample window, power down for
    /// [`IDLE_DURATION`], power up and settle for [`SETTLE_DURATION`].
    /// Callers loop this rather than the sampler looping internally, so the
    /// lock guarding a shared sampler is only held for one cycle at a time
    /// and the dispensing engine's `tare`/`current_weight_g` calls can
    /// interleave between windows.
    pub async fn sample_and_publish(&mut self) -> Result<ScaleReading, Error> {
        let reading = self.sample_window().await?;
        debug!("scale window: raw={} weight={:.2}g stable={} responding={}", reading.raw, reading.weight_g, reading.stable, reading.responding);

        self.source.power_down().await?;
        sleep(IDLE_DURATION).await;
        self.source.power_up().await?;
        sleep(SETTLE_DURATION).await;
        Ok(reading)
    }

    /// Powers the chip up, blocks for `samples` fresh readings, and uses
    /// their average as the new zero offset. Bounded by roughly
    /// `samples * 13ms + 150ms` as the settling overhead is fixed.
    pub async fn tare(&mut self, samples: usize) -> Result<i32, Error> {
        self.source.power_up().await?;
        sleep(SETTLE_DURATION).await;
        let (sum, count) = self.blocking_average(samples).await?;
        let offset = if count > 0 { (sum / count) as i32 } else { self.zero_offset };
        self.zero_offset = offset;
        Ok(offset)
    }

    /// Powers the chip up, blocks for `samples` fresh readings with a known
    /// reference weight on the scale, and derives a new counts-per-gram
    /// calibration factor from the delta against the current zero offset.
    pub async fn calibrate(&mut self, reference_weight_g: f32, samples: usize) -> Result<f64, Error> {
        if reference_weight_g <= 0.0 {
            return Err(Error::ScaleBadReference);
        }
        self.source.power_up().await?;
        sleep(SETTLE_DURATION).await;
        let (sum, count) = self.blocking_average(samples).await?;
        if count == 0 {
            return Err(Error::ScaleBadReference);
        }
        let avg_counts = sum as f64 / count as f64;
        let delta_counts = avg_counts - self.zero_offset as f64;
        if delta_counts.abs() < f64::EPSILON {
            return Err(Error::ScaleBadReference);
        }
        self.factor = delta_counts / reference_weight_g as f64;
        Ok(self.factor)
    }

    async fn blocking_average(&mut self, samples: usize) -> Result<(i64, i64), Error> {
        let mut sum: i64 = 0;
        let mut count: i64 = 0;
        for _ in 0..samples {
            sleep(SAMPLE_TICK).await;
            if let Some(raw) = self.source.try_read().await? {
                if raw != 0 {
                    sum += raw as i64;
                    count += 1;
                }
            }
        }
        Ok((sum, count))
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn zero_offset(&self) -> i32 {
        self.zero_offset
    }

    pub fn current_weight(&self) -> f32 {
        self.previous_weight_g
    }
}

/// Lets the dispensing engine read and tare the scale through a shared
/// handle while the sampler's own `run` loop keeps publishing windows on
/// whatever task owns it - the engine never needs raw ADC access, only the
/// latest published weight and the ability to request a tare.
#[async_trait]
impl<S: RawScaleSource> WeightSource for std::sync::Arc<tokio::sync::Mutex<ScaleSampler<S>>> {
    async fn current_weight_g(&self) -> Result<f32, Error> {
        Ok(self.lock().await.current_weight())
    }

    async fn tare(&self) -> Result<(), Error> {
        let samples = {
            let guard = self.lock().await;
            guard.tare_samples
        };
        self.lock().await.tare(samples).await?;
        Ok(())
    }
}
