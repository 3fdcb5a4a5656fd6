//! Scheduler module for running probes on independent timers.
//!
//! Each of the ping, HTTP and address-refresh timers dispatches its work as a
//! separate task, so a slow probe never delays the other timers or the next
//! tick of its own timer. Shutdown cancels a token shared with every ping
//! session and then waits for in-flight tasks to log their results.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::address::{AddressLookup, LookupError, PublicAddressCache, RefreshOutcome};
use crate::config::{ConfigError, ScheduleConfig};
use crate::probe::{
    run_http_probe, run_ping_probe, HttpStatus, HttpTiming, PingOptions, PingStatistics,
    ProbeError, Target,
};

/// Extra time a ping tick gets on top of its session timeout for resolving
/// the target and opening the socket.
const PING_SETUP_SLACK: Duration = Duration::from_secs(5);

/// Errors that stop the monitor before it starts scheduling.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("target validation failed: {0}")]
    Target(#[source] ProbeError),
    #[error("initial public address lookup failed: {0}")]
    PublicAddress(#[from] LookupError),
    #[error("cannot open log destination: {0}")]
    LogDestination(#[source] io::Error),
}

/// The kinds of periodic work the scheduler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Ping,
    Http,
    AddressRefresh,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeKind::Ping => "ping",
            ProbeKind::Http => "http",
            ProbeKind::AddressRefresh => "address_refresh",
        })
    }
}

/// Lifecycle of one tick's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Dispatched,
    Running,
    Completed,
    Failed,
}

/// Executes probes. Implementations must bound every call in time.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn ping(
        &self,
        target: &Target,
        options: &PingOptions,
        stop: CancellationToken,
    ) -> Result<PingStatistics, ProbeError>;

    async fn http(&self, url: &str, timeout: Duration) -> HttpTiming;
}

/// Probes that go over the network.
pub struct NetworkProbes;

#[async_trait]
impl ProbeRunner for NetworkProbes {
    async fn ping(
        &self,
        target: &Target,
        options: &PingOptions,
        stop: CancellationToken,
    ) -> Result<PingStatistics, ProbeError> {
        run_ping_probe(target, options, &stop).await
    }

    async fn http(&self, url: &str, timeout: Duration) -> HttpTiming {
        run_http_probe(url, timeout).await
    }
}

/// Counters for one probe kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    pub dispatched: u64,
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

struct KindTracker {
    kind: ProbeKind,
    ticks: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    limit: Option<Arc<Semaphore>>,
}

impl KindTracker {
    fn new(kind: ProbeKind, max_in_flight: Option<usize>) -> Self {
        Self {
            kind,
            ticks: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            limit: max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    fn transition(&self, tick: u64, state: ProbeState) {
        tracing::debug!(kind = %self.kind, tick, state = ?state, "{} #{} {:?}", self.kind, tick, state);
    }

    fn finish(&self, tick: u64, ok: bool) {
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.transition(tick, ProbeState::Completed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.transition(tick, ProbeState::Failed);
        }
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.transition(tick, ProbeState::Idle);
        }
    }

    fn stats(&self) -> KindStats {
        KindStats {
            dispatched: self.ticks.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Validate the target and learn the public address, then build the scheduler.
///
/// Nothing is scheduled when either step fails.
pub async fn bootstrap(
    config: ScheduleConfig,
    lookup: Box<dyn AddressLookup>,
    probes: Arc<dyn ProbeRunner>,
) -> Result<Scheduler, StartupError> {
    let ip = config.target.resolve().await.map_err(StartupError::Target)?;
    tracing::debug!("PING {} ({}):", config.target.hostname(), ip);

    let cache = PublicAddressCache::initialize(lookup).await?;

    tracing::debug!("Trying http request...");
    let warm_up = probes.http(&config.http_url, config.http_timeout).await;
    match &warm_up.status {
        HttpStatus::Success { .. } => tracing::debug!("Done http request"),
        HttpStatus::Failed { message, .. } => {
            tracing::error!("Error while http requesting {}: {}", config.http_url, message)
        }
    }

    Ok(Scheduler::new(config, cache, probes))
}

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    config: Arc<ScheduleConfig>,
    cache: Arc<PublicAddressCache>,
    probes: Arc<dyn ProbeRunner>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    ping: Arc<KindTracker>,
    http: Arc<KindTracker>,
    refresh: Arc<KindTracker>,
}

impl Scheduler {
    pub fn new(
        config: ScheduleConfig,
        cache: Arc<PublicAddressCache>,
        probes: Arc<dyn ProbeRunner>,
    ) -> Self {
        let limit = config.max_in_flight;
        Self {
            config: Arc::new(config),
            cache,
            probes,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            ping: Arc::new(KindTracker::new(ProbeKind::Ping, limit)),
            http: Arc::new(KindTracker::new(ProbeKind::Http, limit)),
            // Refreshes are already exclusive through the cache's busy flag.
            refresh: Arc::new(KindTracker::new(ProbeKind::AddressRefresh, None)),
        }
    }

    /// Stop the timers and every running ping session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self, kind: ProbeKind) -> KindStats {
        self.tracker(kind).stats()
    }

    pub fn public_address(&self) -> &PublicAddressCache {
        &self.cache
    }

    fn tracker(&self, kind: ProbeKind) -> &Arc<KindTracker> {
        match kind {
            ProbeKind::Ping => &self.ping,
            ProbeKind::Http => &self.http,
            ProbeKind::AddressRefresh => &self.refresh,
        }
    }

    /// Run the timers until shutdown, then wait for in-flight work.
    pub async fn run(&self) {
        let mut ping_tick = ticker(self.config.ping_interval);
        let mut http_tick = ticker(self.config.http_interval);
        let mut refresh_tick = ticker(self.config.refresh_interval);

        tracing::info!(
            target_host = %self.config.target,
            public_ip = %self.cache.current(),
            "Starting scheduler: ping every {:?}, http every {:?}, address refresh every {:?}",
            self.config.ping_interval,
            self.config.http_interval,
            self.config.refresh_interval
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ping_tick.tick() => self.dispatch(ProbeKind::Ping),
                _ = http_tick.tick() => self.dispatch(ProbeKind::Http),
                _ = refresh_tick.tick() => self.dispatch(ProbeKind::AddressRefresh),
            }
        }

        self.tasks.close();
        tracing::info!("Scheduler stopping, waiting for {} in-flight probes", self.tasks.len());

        let grace = self.config.longest_probe() + PING_SETUP_SLACK;
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                "Gave up waiting for {} probes after {:?}",
                self.tasks.len(),
                grace
            );
        }
        for kind in [ProbeKind::Ping, ProbeKind::Http, ProbeKind::AddressRefresh] {
            let stats = self.stats(kind);
            tracing::info!(
                kind = %kind,
                dispatched = stats.dispatched,
                skipped = stats.skipped,
                completed = stats.completed,
                failed = stats.failed,
                in_flight = stats.in_flight,
                "{} probes summary",
                kind
            );
        }
        tracing::info!("Scheduler stopped");
    }

    fn dispatch(&self, kind: ProbeKind) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let tracker = self.tracker(kind).clone();

        let permit = match &tracker.limit {
            Some(limit) => match limit.clone().try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => {
                    tracker.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(kind = %kind, "Skipping {} tick due to overlap limit", kind);
                    return;
                }
            },
            None => None,
        };

        let tick = tracker.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        tracker.in_flight.fetch_add(1, Ordering::AcqRel);
        tracker.transition(tick, ProbeState::Dispatched);

        let config = self.config.clone();
        let cache = self.cache.clone();
        let probes = self.probes.clone();
        let stop = self.shutdown.child_token();

        self.tasks.spawn(async move {
            let _permit = permit; // Hold permit until done
            tracker.transition(tick, ProbeState::Running);

            let ok = match kind {
                ProbeKind::Ping => ping_tick_task(&*probes, &config, &cache, stop).await,
                ProbeKind::Http => http_tick_task(&*probes, &config, &cache).await,
                ProbeKind::AddressRefresh => refresh_tick_task(&cache).await,
            };

            tracker.finish(tick, ok);
        });
    }
}

/// Interval whose first tick is one full period after start.
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

async fn ping_tick_task(
    probes: &dyn ProbeRunner,
    config: &ScheduleConfig,
    cache: &PublicAddressCache,
    stop: CancellationToken,
) -> bool {
    tracing::debug!("Beginning ping...");
    let bound = config.ping.timeout + PING_SETUP_SLACK;
    let result = match tokio::time::timeout(bound, probes.ping(&config.target, &config.ping, stop)).await {
        Ok(r) => r,
        Err(_) => Err(ProbeError::Timeout(bound)),
    };

    match result {
        Ok(stats) => {
            tracing::info!(
                public_ip = %cache.current(),
                target_host = %config.target,
                addr = %stats.addr,
                packets_sent = stats.packets_sent,
                packets_recv = stats.packets_recv,
                packets_recv_duplicates = stats.packets_recv_duplicates,
                packet_loss = stats.packet_loss,
                min_rtt_ms = millis(stats.min_rtt),
                avg_rtt_ms = millis(stats.avg_rtt),
                max_rtt_ms = millis(stats.max_rtt),
                stddev_rtt_ms = millis(stats.stddev_rtt),
                stopped = stats.stopped,
                "ping session completed"
            );
            true
        }
        Err(e) => {
            tracing::error!(
                public_ip = %cache.current(),
                target_host = %config.target,
                error = %e,
                "ping session failed"
            );
            false
        }
    }
}

async fn http_tick_task(
    probes: &dyn ProbeRunner,
    config: &ScheduleConfig,
    cache: &PublicAddressCache,
) -> bool {
    tracing::debug!("Beginning request of http...");
    let timing = probes.http(&config.http_url, config.http_timeout).await;
    let tls_ms = timing.tls_handshake.map(millis);
    let ok = timing.is_success();

    match &timing.status {
        HttpStatus::Success {
            status_code,
            body_bytes,
        } => {
            tracing::info!(
                public_ip = %cache.current(),
                url = %timing.url,
                status_code,
                body_bytes,
                dns_lookup_ms = millis(timing.dns_lookup),
                tcp_connection_ms = millis(timing.tcp_connection),
                tls_handshake_ms = ?tls_ms,
                server_processing_ms = millis(timing.server_processing),
                content_transfer_ms = millis(timing.content_transfer),
                time_to_first_byte_ms = millis(timing.start_transfer()),
                total_ms = millis(timing.total),
                "http probe completed"
            );
        }
        HttpStatus::Failed {
            kind,
            phase,
            message,
        } => {
            tracing::warn!(
                public_ip = %cache.current(),
                url = %timing.url,
                failure = ?kind,
                phase = %phase,
                error = %message,
                dns_lookup_ms = millis(timing.dns_lookup),
                tcp_connection_ms = millis(timing.tcp_connection),
                tls_handshake_ms = ?tls_ms,
                total_ms = millis(timing.total),
                "http probe failed"
            );
        }
    }
    ok
}

async fn refresh_tick_task(cache: &PublicAddressCache) -> bool {
    match cache.refresh().await {
        Ok(RefreshOutcome::Updated { changed }) => {
            tracing::debug!(public_ip = %cache.current(), changed, "Public address refreshed");
            true
        }
        Ok(RefreshOutcome::Skipped) => true,
        Err(e) => {
            tracing::warn!(
                public_ip = %cache.current(),
                error = %e,
                "Public address refresh failed, keeping previous value"
            );
            false
        }
    }
}
