//! Real-time pulse loop.
//!
//! One cycle per period:
//!
//! ```text
//! Idle -> WaitGenerate -> Generating -> WaitRelease -> Releasing -> Idle
//! ```
//!
//! Generation starts Δ before the nominal timestamp of the next pulse. The
//! pulse is released at its timestamp + δ; a pulse that misses that deadline
//! is still released, carrying the gap status bit. Deadlines follow the wall
//! clock, generation time is measured on the monotonic clock.

pub mod timing;

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::events::{now_millis, BeaconEvent, EventLog};
use crate::chain::{ChainError, PulseChainBuilder};
use crate::crypto::Signer;
use crate::entropy::{EntropyError, EntropyPool};
use crate::storage::{PulseSink, StorageError};
use crate::types::{ByteHash, Pulse, StatusCode};

pub use timing::{Timings, TimingError};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid timing configuration: {0}")]
    Timing(#[from] TimingError),
    #[error("Entropy error: {0}")]
    Entropy(#[from] EntropyError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Signing did not finish within {0:?}")]
    SigningTimeout(Duration),
    #[error("Pulse period {pulse_ms}ms differs from the scheduling period {schedule_ms}ms")]
    PeriodMismatch { pulse_ms: i64, schedule_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    WaitGenerate,
    Generating,
    WaitRelease,
    Releasing,
}

/// Outcome of one released pulse.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub chain_index: u64,
    pub pulse_index: u64,
    pub output_value: ByteHash,
    /// Released after timestamp + δ
    pub late: bool,
    pub generation_time: TimeDelta,
    /// Real generation start minus ideal start
    pub start_offset: TimeDelta,
    pub tuning_slack: TimeDelta,
    pub time_accuracy: TimeDelta,
}

fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

pub struct Scheduler {
    timings: Timings,
    builder: PulseChainBuilder,
    signer: Arc<dyn Signer>,
    entropy: EntropyPool,
    sink: Arc<dyn PulseSink>,
    events: EventLog,
    signing_timeout: Duration,
    state: SchedulerState,
    chain_index: u64,
    previous: Option<Pulse>,
    /// Local random value committed to by `previous`
    current_value: Option<ByteHash>,
}

impl Scheduler {
    /// Fails when `builder` stamps pulses with a different period than the
    /// one `timings` schedules them at.
    pub fn new(
        timings: Timings,
        builder: PulseChainBuilder,
        signer: Arc<dyn Signer>,
        entropy: EntropyPool,
        sink: Arc<dyn PulseSink>,
        signing_timeout: Duration,
    ) -> Result<Self, SchedulerError> {
        if builder.period() != timings.period() {
            return Err(SchedulerError::PeriodMismatch {
                pulse_ms: builder.period().num_milliseconds(),
                schedule_ms: timings.period().num_milliseconds(),
            });
        }
        Ok(Self {
            timings,
            builder,
            signer,
            entropy,
            sink,
            events: EventLog::new(),
            signing_timeout,
            state: SchedulerState::Idle,
            chain_index: 0,
            previous: None,
            current_value: None,
        })
    }

    /// Record scheduler events in `events` instead of a private log.
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn chain_index(&self) -> u64 {
        self.chain_index
    }

    pub fn previous(&self) -> Option<&Pulse> {
        self.previous.as_ref()
    }

    /// Pick up from the sink's last pulse.
    ///
    /// The local random value the last pulse committed to is never
    /// persisted, so the chain cannot be continued: a new chain starts after
    /// the last stored one.
    pub async fn recall_state(&mut self) -> Result<(), SchedulerError> {
        self.sink.register_certificate(&self.signer.certificate().record()).await?;

        self.chain_index = match self.sink.latest_pulse().await? {
            Some(last) => {
                info!(
                    "🔗 Last stored pulse is {} of chain {}, starting chain {}",
                    last.pulse_index,
                    last.chain_index,
                    last.chain_index + 1
                );
                last.chain_index + 1
            }
            None => {
                info!("🔗 Store is empty, starting chain 0");
                0
            }
        };
        self.previous = None;
        self.current_value = None;
        self.state = SchedulerState::Idle;

        self.events
            .push(BeaconEvent::ChainStarted {
                timestamp: now_millis(),
                chain_index: self.chain_index,
                certificate_id: self.signer.certificate_id().to_hex(),
            })
            .await;
        Ok(())
    }

    /// Time until the next generation should start: Δ before the next
    /// nominal timestamp, or immediately for a chain's first pulse.
    pub fn generation_delay(&self, now: DateTime<Utc>) -> TimeDelta {
        match &self.previous {
            Some(prev) => {
                let start = prev.time_stamp + self.timings.period() - self.timings.anticipation();
                (start - now).max(TimeDelta::zero())
            }
            None => TimeDelta::zero(),
        }
    }

    /// Time left until `pulse` must be released; negative once it is late.
    pub fn release_delay(&self, pulse: &Pulse, now: DateTime<Utc>) -> TimeDelta {
        pulse.time_stamp + self.timings.delay() - now
    }

    /// Generate, finalize and store one pulse.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SchedulerError> {
        self.state = SchedulerState::WaitGenerate;
        let now = Utc::now();
        let ideal_start = match &self.previous {
            Some(prev) => prev.time_stamp + self.timings.period() - self.timings.anticipation(),
            None => now,
        };
        tokio::time::sleep(to_std(self.generation_delay(now))).await;

        self.state = SchedulerState::Generating;
        let started = Instant::now();
        let start_offset = Utc::now() - ideal_start;

        let value = match self.current_value.take() {
            Some(value) => value,
            None => self.entropy.local_random_value()?,
        };
        let next_value = self.entropy.local_random_value()?;
        let mut pulse = self.builder.init(
            self.signer.as_ref(),
            self.chain_index,
            value,
            self.previous.as_ref(),
            Utc::now(),
        )?;
        if self.previous.is_none() {
            // leave the first pulse of a chain time to be computed
            pulse.time_stamp += self.timings.anticipation();
        }
        let generation_time = TimeDelta::from_std(started.elapsed()).unwrap_or(TimeDelta::zero());

        self.state = SchedulerState::WaitRelease;
        let release_in = self.release_delay(&pulse, Utc::now());
        let late = release_in < TimeDelta::zero();
        if late {
            pulse.status_code.insert(StatusCode::GAP);
            let late_by_ms = -release_in.num_milliseconds();
            warn!(
                chain = pulse.chain_index,
                pulse = pulse.pulse_index,
                late_by_ms,
                "⏰ Pulse missed its release deadline, releasing now"
            );
            self.events
                .push(BeaconEvent::PulseLate {
                    timestamp: now_millis(),
                    chain_index: pulse.chain_index,
                    pulse_index: pulse.pulse_index,
                    late_by_ms,
                })
                .await;
        } else {
            tokio::time::sleep(to_std(release_in)).await;
        }

        self.state = SchedulerState::Releasing;
        let finalize = self.builder.finalize(
            self.signer.as_ref(),
            &mut pulse,
            self.previous.as_ref(),
            &next_value,
        );
        tokio::time::timeout(self.signing_timeout, finalize)
            .await
            .map_err(|_| SchedulerError::SigningTimeout(self.signing_timeout))??;
        self.sink.append(&pulse).await?;

        let tuning_slack = self.timings.tuning_slack(Some(generation_time));
        let time_accuracy = self.timings.time_accuracy(Some(generation_time));
        info!(
            "💓 Pulse {} of chain {} released: {}...",
            pulse.pulse_index,
            pulse.chain_index,
            pulse.output_value.short()
        );
        info!(
            generation_ms = generation_time.num_milliseconds(),
            start_offset_ms = start_offset.num_milliseconds(),
            tuning_slack_ms = tuning_slack.num_milliseconds(),
            max_tuning_slack_ms = self.timings.tuning_slack(None).num_milliseconds(),
            time_accuracy_ms = time_accuracy.num_milliseconds(),
            max_time_accuracy_ms = self.timings.time_accuracy(None).num_milliseconds(),
            "cycle timing"
        );
        self.events
            .push(BeaconEvent::PulseReleased {
                timestamp: now_millis(),
                chain_index: pulse.chain_index,
                pulse_index: pulse.pulse_index,
                output_value: pulse.output_value.to_hex(),
                status_code: pulse.status_code.bits(),
                generation_ms: generation_time.num_milliseconds(),
                tuning_slack_ms: tuning_slack.num_milliseconds(),
                time_accuracy_ms: time_accuracy.num_milliseconds(),
            })
            .await;

        let report = CycleReport {
            chain_index: pulse.chain_index,
            pulse_index: pulse.pulse_index,
            output_value: pulse.output_value.clone(),
            late,
            generation_time,
            start_offset,
            tuning_slack,
            time_accuracy,
        };
        self.previous = Some(pulse);
        self.current_value = Some(next_value);
        self.state = SchedulerState::Idle;
        Ok(report)
    }

    /// Recall state, then release pulses until `shutdown` flips to true.
    /// Any cycle error ends the loop.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        self.recall_state().await?;
        info!(
            "⏱️ Scheduler running: period {}ms, anticipation {}ms, delay {}ms",
            self.timings.period().num_milliseconds(),
            self.timings.anticipation().num_milliseconds(),
            self.timings.delay().num_milliseconds()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let result = tokio::select! {
                result = self.run_cycle() => result,
                // in-flight pulse is dropped unstored
                _ = shutdown.changed() => break,
            };
            if let Err(e) = result {
                error!("Scheduler cycle failed in state {:?}: {}", self.state, e);
                return Err(e);
            }
        }

        info!("🛑 Scheduler stopped in state {:?}", self.state);
        self.state = SchedulerState::Idle;
        Ok(())
    }
}
