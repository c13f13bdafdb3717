//! Oscilloscope sampler.
//!
//! Reduces the beam monitor's waveform capture to a single scalar through
//! the [`InstrumentIo`] transport trait. Commands are plain SCPI strings;
//! the session behind the trait decides how they reach the instrument.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::InstrumentSettings;
use crate::error::{AlignError, AlignResult};
use crate::hardware::bus::InstrumentIo;

// Spacing between capture-buffer polls inside `sample`.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Scalar sampler over a waveform instrument.
pub struct ScopeSampler {
    io: Arc<dyn InstrumentIo>,
    fill_timeout: Duration,
    sample_rate: RwLock<Option<f64>>,
}

impl ScopeSampler {
    /// Create a sampler over `io`.
    ///
    /// `fill_timeout` bounds how long [`Self::sample`] waits for the
    /// capture buffer to hold enough points.
    pub fn new(io: Arc<dyn InstrumentIo>, fill_timeout: Duration) -> Self {
        Self {
            io,
            fill_timeout,
            sample_rate: RwLock::new(None),
        }
    }

    /// Open the session, identify the instrument and clear its status.
    pub async fn connect(&self) -> AlignResult<()> {
        self.io
            .connect()
            .await
            .map_err(|e| AlignError::Connection(format!("instrument session failed: {e}")))?;
        let idn = self.io.query("*IDN?").await?;
        info!(instrument = %idn, "oscilloscope connected");
        self.io.write("*CLS").await?;
        Ok(())
    }

    /// Push the acquisition setup and cache the reported sample rate.
    ///
    /// Mode strings pass through unvalidated; the instrument rejects what
    /// it does not support.
    pub async fn configure(&self, settings: &InstrumentSettings) -> AlignResult<()> {
        self.io.write("RUN").await?;
        self.io
            .write(&format!("ACQ:MDEP {}", settings.memory_depth))
            .await?;
        self.io
            .write(&format!("WAV:MODE {}", settings.waveform_mode))
            .await?;
        self.io
            .write(&format!("WAV:FORM {}", settings.waveform_format))
            .await?;
        self.io
            .write(&format!("TIM:MODE {}", settings.timebase_mode))
            .await?;

        let reply = self.io.query("ACQ:SRAT?").await?;
        let rate: f64 = reply
            .trim()
            .parse()
            .map_err(|_| AlignError::Acquisition(format!("unparseable sample rate: '{reply}'")))?;
        *self.sample_rate.write().await = Some(rate);
        debug!(sample_rate = rate, "oscilloscope configured");
        Ok(())
    }

    /// Resume continuous acquisition.
    pub async fn start_acquisition(&self) -> AlignResult<()> {
        self.io.write("RUN").await
    }

    /// Halt acquisition, freezing the capture buffer.
    pub async fn stop_acquisition(&self) -> AlignResult<()> {
        self.io.write("STOP").await
    }

    /// Sample rate cached by the last [`Self::configure`] call.
    pub async fn sample_rate(&self) -> Option<f64> {
        *self.sample_rate.read().await
    }

    /// Take one scalar sample: settle, select the source, wait for the
    /// capture buffer to fill, then average the newest points.
    ///
    /// Returns `AlignError::Acquisition` if the buffer never reaches
    /// `min_samples` points within the fill timeout.
    pub async fn sample(
        &self,
        channel: Option<&str>,
        min_samples: usize,
        settle_delay: Duration,
    ) -> AlignResult<f64> {
        tokio::time::sleep(settle_delay).await;

        if let Some(source) = channel {
            self.io.write(&format!("WAV:SOUR {source}")).await?;
        }

        let start = tokio::time::Instant::now();
        loop {
            let points = self.io.query_binary("WAV:DATA?").await?;
            if points.len() >= min_samples {
                let tail = &points[points.len() - min_samples..];
                return Ok(tail.iter().sum::<f64>() / min_samples as f64);
            }

            if start.elapsed() > self.fill_timeout {
                return Err(AlignError::Acquisition(format!(
                    "capture buffer held {} of {} points after {:?}",
                    points.len(),
                    min_samples,
                    self.fill_timeout
                )));
            }

            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }
    }

    /// Close the session.
    pub async fn close(&self) -> AlignResult<()> {
        self.io.close().await
    }
}
