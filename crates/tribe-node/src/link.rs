//! Links to member clusters.
//!
//! Each configured member gets one background task that connects through a
//! [`ClusterConnector`], waits for the member's state publications and turns
//! them into [`LinkEvent`]s for the aggregator. Connection failures never
//! reach callers: the link reports the member unreachable and keeps
//! reconnecting with exponential backoff until it is closed.

use crate::aggregator::{AggregatorCommand, EventSender};
use crate::config::LinkConfig;
use crate::error::Result;
use crate::router::RemoteClient;
use crate::state::{ClusterFacts, MemberState, StateDelta};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event emitted by a link for its member cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A connection attempt started.
    Connecting,
    /// Full state after a (re)connect; replaces everything known about the member.
    Resync(ClusterFacts),
    /// Changes since the previous publication.
    Delta(StateDelta),
    /// The connection is down; the member's facts are no longer valid.
    Unreachable {
        /// Why the member is unreachable.
        reason: String,
    },
    /// The link was closed; the member leaves the tribe.
    Closed,
}

/// Stream of full state publications from one connected member.
#[async_trait]
pub trait StateSource: Send {
    /// Wait for the member's next state publication.
    ///
    /// The first call returns the current state. An error means the
    /// connection is lost.
    async fn next_state(&mut self) -> Result<ClusterFacts>;
}

/// Opens connections to member clusters.
#[async_trait]
pub trait ClusterConnector: Send + Sync + 'static {
    /// Connect to the member `alias` through one of its seeds.
    async fn connect(&self, alias: &str, seeds: &[String]) -> Result<Box<dyn StateSource>>;

    /// Client for forwarding requests to the member `alias`.
    fn client(&self, alias: &str, seeds: &[String]) -> Result<Arc<dyn RemoteClient>>;
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff from the link settings.
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.reconnect_delay_ms),
            max: Duration::from_millis(config.max_reconnect_delay_ms),
            jitter: config.jitter,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; doubles on every call up to the max.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(20));
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.initial.saturating_mul(factor).min(self.max);

        if self.jitter && delay > Duration::ZERO {
            let ms = delay.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
        } else {
            delay
        }
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Default)]
struct LinkStatsInner {
    connects: AtomicU64,
    reconnects: AtomicU64,
    connect_failures: AtomicU64,
    publications: AtomicU64,
    events_emitted: AtomicU64,
}

/// Counters for one link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Successful connections, including the first.
    pub connects: u64,
    /// Successful connections after a loss.
    pub reconnects: u64,
    /// Failed or timed-out connection attempts.
    pub connect_failures: u64,
    /// State publications received.
    pub publications: u64,
    /// Events handed to the aggregator.
    pub events_emitted: u64,
}

/// Link to one member cluster. Runs in its own task; see [`RemoteClusterLink::spawn`].
pub struct RemoteClusterLink {
    alias: String,
    seeds: Vec<String>,
    config: LinkConfig,
    connector: Arc<dyn ClusterConnector>,
    sink: EventSender,
    cancel: CancellationToken,
    stats: Arc<LinkStatsInner>,
    reported: MemberState,
    announced_down: bool,
}

impl RemoteClusterLink {
    /// Start the link task for `alias`, sending events to `sink`.
    pub fn spawn(
        alias: &str,
        seeds: Vec<String>,
        config: LinkConfig,
        connector: Arc<dyn ClusterConnector>,
        sink: EventSender,
    ) -> LinkHandle {
        let cancel = CancellationToken::new();
        let stats = Arc::new(LinkStatsInner::default());
        let link = RemoteClusterLink {
            alias: alias.to_string(),
            seeds,
            config,
            connector,
            sink,
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            reported: MemberState::Disconnected,
            announced_down: false,
        };
        let task = tokio::spawn(link.run());
        LinkHandle {
            alias: alias.to_string(),
            cancel,
            task,
            stats,
        }
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(&self.config);
        let mut ever_connected = false;

        'outer: loop {
            // Retries during a reported outage leave the member disconnected.
            if !self.announced_down
                && self.reported != MemberState::Connecting
                && !self.emit(LinkEvent::Connecting).await
            {
                return;
            }

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break 'outer,
                r = tokio::time::timeout(
                    self.config.connect_timeout(),
                    self.connector.connect(&self.alias, &self.seeds),
                ) => r,
            };

            let mut source = match attempt {
                Ok(Ok(source)) => source,
                Ok(Err(e)) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    if !self.connection_lost(e.to_string()).await {
                        return;
                    }
                    if !self.sleep(backoff.next_delay()).await {
                        break 'outer;
                    }
                    continue;
                }
                Err(_) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    let reason = format!(
                        "connect timed out after {}ms",
                        self.config.connect_timeout_ms
                    );
                    if !self.connection_lost(reason).await {
                        return;
                    }
                    if !self.sleep(backoff.next_delay()).await {
                        break 'outer;
                    }
                    continue;
                }
            };

            let mut last: Option<ClusterFacts> = None;
            loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => break 'outer,
                    r = source.next_state() => r,
                };

                let facts = match next {
                    Ok(facts) => facts,
                    Err(e) => {
                        if !self.connection_lost(e.to_string()).await {
                            return;
                        }
                        break;
                    }
                };
                self.stats.publications.fetch_add(1, Ordering::Relaxed);

                let event = match last.as_ref().map(|prev| prev.diff(&facts)) {
                    None => {
                        backoff.reset();
                        self.stats.connects.fetch_add(1, Ordering::Relaxed);
                        if ever_connected {
                            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            info!(alias = %self.alias, version = facts.version, "reconnected to member cluster");
                        } else {
                            info!(alias = %self.alias, version = facts.version, "connected to member cluster");
                        }
                        ever_connected = true;
                        self.announced_down = false;
                        LinkEvent::Resync(facts.clone())
                    }
                    Some(delta) if delta.is_empty() => {
                        debug!(alias = %self.alias, version = facts.version, "publication without changes");
                        last = Some(facts);
                        continue;
                    }
                    Some(delta) => LinkEvent::Delta(delta),
                };
                last = Some(facts);

                if !self.emit(event).await {
                    return;
                }
            }

            if !self.sleep(backoff.next_delay()).await {
                break 'outer;
            }
        }

        debug!(alias = %self.alias, "link closed");
        self.emit(LinkEvent::Closed).await;
    }

    /// Report a lost or failed connection once per outage. Returns false if
    /// the aggregator is gone.
    async fn connection_lost(&mut self, reason: String) -> bool {
        if self.announced_down {
            debug!(alias = %self.alias, reason = %reason, "member cluster still unreachable");
            return true;
        }
        warn!(alias = %self.alias, reason = %reason, "lost connection to member cluster");
        self.announced_down = true;
        self.emit(LinkEvent::Unreachable { reason }).await
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn emit(&mut self, event: LinkEvent) -> bool {
        match &event {
            LinkEvent::Connecting => self.reported = MemberState::Connecting,
            LinkEvent::Unreachable { .. } | LinkEvent::Closed => {
                self.reported = MemberState::Disconnected
            }
            LinkEvent::Resync(_) | LinkEvent::Delta(_) => self.reported = MemberState::Synced,
        }
        let command = AggregatorCommand::Event {
            alias: self.alias.clone(),
            event,
        };
        if self.sink.send(command).await.is_err() {
            debug!(alias = %self.alias, "aggregator gone, stopping link");
            return false;
        }
        self.stats.events_emitted.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl LinkStatsInner {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            publications: self.publications.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running link task.
pub struct LinkHandle {
    alias: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<LinkStatsInner>,
}

impl LinkHandle {
    /// Alias of the member cluster.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Counters snapshot.
    pub fn stats(&self) -> LinkStats {
        self.stats.snapshot()
    }

    /// True once the link task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the link and wait for it to emit `Closed` and exit.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(alias = %self.alias, error = %e, "link task failed");
        }
    }
}
