use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::queue::{DropCounter, QueueProducer};
use crate::record::LogRecord;
use crate::sensors::SensorFacade;
use crate::shutdown::ShutdownListener;

/// Milliseconds since boot, truncated to 32 bits. Wraps after ~49.7 days;
/// the wrap is carried into the log as-is.
#[derive(Debug, Clone, Copy)]
pub struct BootClock {
    boot: Instant,
}

impl BootClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }

    pub fn starting_at(boot: Instant) -> Self {
        Self { boot }
    }

    pub fn now_ms(&self) -> u32 {
        self.boot.elapsed().as_millis() as u32
    }

    pub fn uptime(&self) -> Duration {
        self.boot.elapsed()
    }
}

impl Default for BootClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplerState {
    Uninitialized,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SamplerSummary {
    pub samples: u64,
    pub drops: u64,
    pub next_sequence: u32,
}

/// Periodic producer: stamps, reads every sensor, enqueues.
pub struct Sampler {
    facade: SensorFacade,
    producer: QueueProducer,
    drops: DropCounter,
    clock: BootClock,
    period: Duration,
    next_sequence: u32,
    samples: u64,
    state: SamplerState,
}

impl Sampler {
    pub fn new(
        facade: SensorFacade,
        producer: QueueProducer,
        drops: DropCounter,
        clock: BootClock,
        period: Duration,
    ) -> Self {
        Self {
            facade,
            producer,
            drops,
            clock,
            period,
            next_sequence: 0,
            samples: 0,
            state: SamplerState::Uninitialized,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn summary(&self) -> SamplerSummary {
        SamplerSummary {
            samples: self.samples,
            drops: self.drops.get(),
            next_sequence: self.next_sequence,
        }
    }

    /// Take one sample. Returns false if the queue was full and the record
    /// was shed.
    pub async fn sample_once(&mut self) -> bool {
        let mut record = LogRecord::stamped(self.clock.now_ms(), self.next_sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.samples += 1;

        self.facade.fill(&mut record).await;

        if self.producer.try_push(record) {
            true
        } else {
            let total = self.drops.increment();
            debug!("[sampler] queue full, dropped seq {} ({} total)", record.sequence, total);
            false
        }
    }

    /// Sample on absolute deadlines until shutdown is requested. Deadline
    /// N+1 is deadline N plus one period, so slow reads never add drift;
    /// overdue deadlines fire back to back.
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> SamplerSummary {
        self.state = SamplerState::Running;
        info!("[sampler] running every {:?}", self.period);

        let mut ticker = interval_at(Instant::now(), self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                _ = ticker.tick() => {
                    self.sample_once().await;
                    if self.samples % 1000 == 0 {
                        debug!("[sampler] {} samples, {} drops", self.samples, self.drops.get());
                    }
                }
            }
        }

        self.state = SamplerState::Terminated;
        let summary = self.summary();
        info!(
            "[sampler] terminated after {} samples ({} dropped)",
            summary.samples, summary.drops
        );
        summary
    }
}
