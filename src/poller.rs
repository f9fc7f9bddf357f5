//! The poll-decode-persist cycle.
//!
//! One tick reads the configured register block, decodes it and stores the
//! result. Every failure is confined to its tick: it is logged and counted,
//! and the loop carries on at the next deadline.

use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_modbus::Quantity;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{DecodeError, RegisterLayout};
use crate::config::RegisterKind;
use crate::db::{PersistenceError, Reading, ReadingSink};
use crate::session::{EndpointAddress, ModbusError, ModbusSession};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("read failed: {0}")]
    Read(#[from] ModbusError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("persist failed: {0}")]
    Persist(#[from] PersistenceError),
}

/// What to poll and how often.
#[derive(Debug, Clone)]
pub struct PollJob {
    pub endpoint: EndpointAddress,
    pub register_kind: RegisterKind,
    pub count: Quantity,
    pub layout: RegisterLayout,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub ticks: u64,
    pub persisted: u64,
    pub read_failures: u64,
    pub decode_failures: u64,
    pub persist_failures: u64,
    /// Ticks interrupted by shutdown before they finished.
    pub abandoned: u64,
}

pub struct PollLoop<S, K> {
    job: PollJob,
    session: S,
    sink: K,
    state: PollState,
    stats: PollStats,
}

impl<S: ModbusSession, K: ReadingSink> PollLoop<S, K> {
    pub fn new(job: PollJob, session: S, sink: K) -> Self {
        Self {
            job,
            session,
            sink,
            state: PollState::Running,
            stats: PollStats::default(),
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Run one cycle and account for its outcome.
    pub async fn tick(&mut self) -> Result<Reading, PollError> {
        self.stats.ticks += 1;
        let result = self.poll_once().await;
        match &result {
            Ok(_) => self.stats.persisted += 1,
            Err(PollError::Read(_)) => self.stats.read_failures += 1,
            Err(PollError::Decode(_)) => self.stats.decode_failures += 1,
            Err(PollError::Persist(_)) => self.stats.persist_failures += 1,
        }
        result
    }

    async fn poll_once(&mut self) -> Result<Reading, PollError> {
        let job = &self.job;
        let words = match job.register_kind {
            RegisterKind::Holding => {
                self.session
                    .read_holding_registers(&job.endpoint, job.count)
                    .await?
            }
            RegisterKind::Input => {
                self.session
                    .read_input_registers(&job.endpoint, job.count)
                    .await?
            }
        };

        let reading = Reading::new(job.layout.decode(&words)?);
        debug!("PLC data: {:?}", reading.values);

        self.sink.persist(&reading).await?;
        Ok(reading)
    }

    /// Poll until `shutdown` is cancelled, then return the final counters.
    ///
    /// Ticks are scheduled on fixed deadlines from the first tick, so the
    /// time spent polling does not push later ticks back. Cancellation is
    /// observed while waiting and while a tick is in flight; an interrupted
    /// tick is dropped along with its connections.
    pub async fn run(&mut self, shutdown: CancellationToken) -> PollStats {
        if self.state == PollState::Stopped {
            return self.stats;
        }

        let mut interval = time::interval(self.job.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Starting poller for {} unit {} @ {} (interval: {:?})",
            self.job.endpoint.socket_addr,
            self.job.endpoint.unit,
            self.job.endpoint.offset,
            self.job.interval
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!("shutdown requested mid-poll, abandoning tick");
                    self.stats.abandoned += 1;
                    break;
                }
                result = self.tick() => {
                    if let Err(e) = result {
                        error!("Polling error: {}", e);
                    }
                }
            }
        }

        self.state = PollState::Stopped;
        info!(
            "Poller stopped after {} ticks ({} persisted, {} read, {} decode, {} persist failures, {} abandoned)",
            self.stats.ticks,
            self.stats.persisted,
            self.stats.read_failures,
            self.stats.decode_failures,
            self.stats.persist_failures,
            self.stats.abandoned
        );
        self.stats
    }
}
