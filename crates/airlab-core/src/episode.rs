//! Single bounded collection episode.
//!
//! ```text
//! Idle -> Subscribed -> Collecting -> Completed
//!                                 \-> TimedOut
//! ```
//!
//! Two deadlines govern an episode: the overall deadline fixed at start, and a
//! collection window opened by the first accepted message. The episode
//! completes when the window closes, or times out when the overall deadline
//! passes first. Whatever the outcome, the bus is disconnected exactly once.
//!
//! Messages reach the controller through the bus's single-consumer queue, so
//! [`EpisodeState`] has exactly one owner and is never shared.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusClient, BusMessage};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::normalize::{Normalized, Normalizer};
use crate::reading::Reading;

/// Lifecycle of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodePhase {
    Idle,
    Subscribed,
    Collecting,
    Completed,
    TimedOut,
}

/// Timing and subscription parameters for an episode.
#[derive(Debug, Clone)]
pub struct EpisodeConfig {
    /// Wildcard pattern to subscribe to.
    pub subscribe_pattern: String,
    /// Overall deadline, measured from the start of collection.
    pub timeout: Duration,
    /// Extra time allowed after the first accepted message.
    pub collect_window: Duration,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EpisodeConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            subscribe_pattern: config.bus.subscribe_pattern(),
            timeout: config.collect.timeout(),
            collect_window: config.collect.collect_window(),
        }
    }
}

/// What the stop policy says at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Continue,
    Complete,
    TimeOut,
}

/// Mutable state of one episode, owned by its controller.
#[derive(Debug, Clone)]
pub struct EpisodeState {
    started_at: Instant,
    deadline: Instant,
    collect_window: Duration,
    first_accepted_at: Option<Instant>,
    reading: Reading,
    accepted_messages: u32,
    ignored_messages: u32,
}

impl EpisodeState {
    #[must_use]
    pub fn new(started_at: Instant, timeout: Duration, collect_window: Duration) -> Self {
        Self {
            started_at,
            deadline: started_at + timeout,
            collect_window,
            first_accepted_at: None,
            reading: Reading::new(),
            accepted_messages: 0,
            ignored_messages: 0,
        }
    }

    /// Merge a non-empty partial reading. Returns true for the first
    /// accepted message, which opens the collection window.
    pub fn accept(&mut self, now: Instant, partial: &Reading) -> bool {
        if partial.is_empty() {
            self.ignored_messages += 1;
            return false;
        }
        self.reading.merge(partial);
        self.accepted_messages += 1;
        if self.first_accepted_at.is_none() {
            self.first_accepted_at = Some(now);
            return true;
        }
        false
    }

    /// Count a message that contributed nothing.
    pub fn ignore(&mut self) {
        self.ignored_messages += 1;
    }

    #[must_use]
    pub fn any_accepted(&self) -> bool {
        self.first_accepted_at.is_some()
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// End of the collection window; absent until a message is accepted.
    #[must_use]
    pub fn window_deadline(&self) -> Option<Instant> {
        self.first_accepted_at.map(|first| first + self.collect_window)
    }

    /// Nearest instant at which the stop policy may change its answer.
    #[must_use]
    pub fn next_wakeup(&self) -> Instant {
        self.window_deadline()
            .map_or(self.deadline, |window| window.min(self.deadline))
    }

    /// Stop policy. The overall deadline wins unless the window closed first.
    #[must_use]
    pub fn decide(&self, now: Instant) -> StopDecision {
        if let Some(window) = self.window_deadline() {
            if now >= window && window <= self.deadline {
                return StopDecision::Complete;
            }
        }
        if now >= self.deadline {
            return StopDecision::TimeOut;
        }
        StopDecision::Continue
    }

    #[must_use]
    pub fn reading(&self) -> &Reading {
        &self.reading
    }
}

/// Result of a finished episode.
#[derive(Debug, Clone)]
pub struct EpisodeReport {
    /// Merged reading; never empty.
    pub reading: Reading,
    /// `Completed`, or `TimedOut` when the window was still open at the deadline.
    pub phase: EpisodePhase,
    pub accepted_messages: u32,
    pub ignored_messages: u32,
    pub elapsed: Duration,
}

/// Drives one episode against a bus.
#[derive(Debug)]
pub struct EpisodeController {
    config: EpisodeConfig,
    normalizer: Normalizer,
    phase: EpisodePhase,
}

impl EpisodeController {
    #[must_use]
    pub fn new(config: EpisodeConfig, normalizer: Normalizer) -> Self {
        Self {
            config,
            normalizer,
            phase: EpisodePhase::Idle,
        }
    }

    #[must_use]
    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    /// Subscribe, collect until a terminal phase, then disconnect.
    ///
    /// `shutdown` resolving mid-episode cancels it: the bus is still
    /// disconnected and `Error::Cancelled` is returned.
    pub async fn run<B, S>(&mut self, bus: &mut B, shutdown: S) -> Result<EpisodeReport>
    where
        B: BusClient + ?Sized,
        S: Future<Output = ()> + Send,
    {
        let collected = self.collect(bus, shutdown).await;

        if let Err(e) = bus.disconnect().await {
            warn!(error = %e, "Bus disconnect failed");
        }

        let (state, started_at) = collected?;
        self.finish(&state, started_at)
    }

    async fn collect<B, S>(&mut self, bus: &mut B, shutdown: S) -> Result<(EpisodeState, Instant)>
    where
        B: BusClient + ?Sized,
        S: Future<Output = ()> + Send,
    {
        if self.phase != EpisodePhase::Idle {
            return Err(Error::Runtime(format!(
                "episode already ran (phase {:?})",
                self.phase
            )));
        }

        let mut rx = bus.subscribe(&self.config.subscribe_pattern).await?;
        self.phase = EpisodePhase::Subscribed;

        let started_at = Instant::now();
        let mut state = EpisodeState::new(started_at, self.config.timeout, self.config.collect_window);
        self.phase = EpisodePhase::Collecting;
        debug!(
            timeout_secs = self.config.timeout.as_secs(),
            window_secs = self.config.collect_window.as_secs(),
            "Collecting"
        );

        tokio::pin!(shutdown);
        let mut queue_open = true;

        loop {
            match state.decide(Instant::now()) {
                StopDecision::Continue => {}
                StopDecision::Complete => {
                    self.phase = EpisodePhase::Completed;
                    break;
                }
                StopDecision::TimeOut => {
                    self.phase = EpisodePhase::TimedOut;
                    break;
                }
            }

            tokio::select! {
                biased;
                () = &mut shutdown => {
                    warn!("Shutdown requested, abandoning episode");
                    return Err(Error::Cancelled(
                        "shutdown signal received during collection".to_string(),
                    ));
                }
                () = sleep_until(state.next_wakeup()) => {}
                message = rx.recv(), if queue_open => match message {
                    Some(message) => self.handle_message(&mut state, &message),
                    None => {
                        warn!("Bus delivery stopped, waiting out the deadline");
                        queue_open = false;
                    }
                },
            }
        }

        Ok((state, started_at))
    }

    fn handle_message(&self, state: &mut EpisodeState, message: &BusMessage) {
        match self.normalizer.classify(&message.channel, &message.payload) {
            Normalized::Metadata => {
                trace!(channel = %message.channel, "Skipping discovery metadata");
                state.ignore();
            }
            Normalized::Unrecognized => {
                debug!(channel = %message.channel, "No canonical fields in message");
                state.ignore();
            }
            Normalized::Accepted { shape, reading } => {
                if state.accept(Instant::now(), &reading) {
                    debug!(
                        window_secs = self.config.collect_window.as_secs(),
                        "First reading accepted, collection window open"
                    );
                }
                info!(channel = %message.channel, shape, "Received: {reading}");
            }
        }
    }

    fn finish(&self, state: &EpisodeState, started_at: Instant) -> Result<EpisodeReport> {
        let report = EpisodeReport {
            reading: state.reading().clone(),
            phase: self.phase,
            accepted_messages: state.accepted_messages,
            ignored_messages: state.ignored_messages,
            elapsed: Instant::now().saturating_duration_since(started_at),
        };

        match self.phase {
            EpisodePhase::Completed => Ok(report),
            EpisodePhase::TimedOut if state.any_accepted() && !report.reading.is_empty() => {
                warn!(
                    metrics = report.reading.len(),
                    "Overall deadline hit inside the collection window, using partial reading"
                );
                Ok(report)
            }
            _ => Err(Error::NoData {
                timeout: self.config.timeout,
            }),
        }
    }
}
