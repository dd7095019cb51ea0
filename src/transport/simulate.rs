//! Synthetic signal source
//!
//! Feeds a [`MemoryStream`] from a dedicated thread at the stream's nominal
//! rate, so the whole pipeline can run without an LSL network.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::MemoryStream;
use crate::clock::local_clock;
use crate::error::StreamError;
use crate::types::ChannelFormat;

/// Sine-wave (or marker) generator for one stream
pub struct SimulatedSource {
    stream: Arc<MemoryStream>,
    running: Arc<AtomicBool>,
    samples_generated: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SimulatedSource {
    pub fn new(stream: Arc<MemoryStream>) -> Self {
        Self {
            stream,
            running: Arc::new(AtomicBool::new(false)),
            samples_generated: Arc::new(AtomicU64::new(0)),
            thread_handle: None,
        }
    }

    /// Start generating samples
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(StreamError::AlreadyRunning);
        }

        let descriptor = self.stream.descriptor().clone();
        let rate = if descriptor.nominal_srate > 0.0 {
            descriptor.nominal_srate
        } else {
            1.0
        };
        let period = Duration::from_secs_f64(1.0 / rate);
        let channels = descriptor.channel_count.max(1);
        let is_text = descriptor.channel_format == ChannelFormat::String;

        let stream = self.stream.clone();
        let running = self.running.clone();
        let generated = self.samples_generated.clone();
        self.samples_generated.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("simulate-{}", descriptor.name))
            .spawn(move || {
                let mut n: u64 = 0;
                while running.load(Ordering::Relaxed) {
                    let t = n as f64 / rate;
                    let timestamp = local_clock();
                    if is_text {
                        let markers = (0..channels).map(|_| format!("marker-{}", n)).collect::<Vec<_>>();
                        stream.push(markers, timestamp);
                    } else {
                        let values = (0..channels)
                            .map(|ch| (TAU * (1.0 + ch as f64) * t).sin())
                            .collect::<Vec<f64>>();
                        stream.push(values, timestamp);
                    }
                    n += 1;
                    generated.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(period);
                }
            })
            .map_err(|e| StreamError::Spawn(e.to_string()))?;

        self.thread_handle = Some(handle);
        tracing::info!("Simulated source started for {}", self.stream.descriptor().name);
        Ok(())
    }

    /// Stop generating samples
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn samples_generated(&self) -> u64 {
        self.samples_generated.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.stop();
    }
}
