//! Ping session driver.
//!
//! A session sends a fixed number of echo requests spaced by a per-echo
//! interval and aggregates the replies. The session ends when every echo has
//! been answered, when the session timeout elapses, or when the stop token is
//! cancelled; in every case the statistics gathered so far are returned.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{IcmpTransport, ProbeError, Target};

/// Parameters of one ping session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PingOptions {
    /// Number of echo requests per session.
    pub count: u16,
    /// Spacing between echo requests.
    pub interval: Duration,
    /// Upper bound on the whole session. Must exceed `count * interval`.
    pub timeout: Duration,
}

impl PingOptions {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.count == 0 {
            return Err(ProbeError::Config("ping count must be positive".to_string()));
        }
        if self.interval.is_zero() {
            return Err(ProbeError::Config("ping interval must be positive".to_string()));
        }
        if self.timeout <= self.interval * u32::from(self.count) {
            return Err(ProbeError::Config(format!(
                "ping session timeout {:?} must exceed {} x {:?}",
                self.timeout, self.count, self.interval
            )));
        }
        Ok(())
    }
}

/// An echo reply as seen by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoReply {
    pub seq: u16,
    pub bytes: usize,
    pub from: IpAddr,
    pub ttl: Option<u8>,
}

/// Sends echo requests and receives replies for a single destination.
///
/// `recv` must be cancel safe: dropping the future before it completes must
/// not lose a reply.
#[async_trait]
pub trait EchoTransport: Send + Sync {
    async fn send(&self, seq: u16) -> Result<(), ProbeError>;
    async fn recv(&self) -> Result<EchoReply, ProbeError>;
}

/// Aggregate result of one ping session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingStatistics {
    pub started_at: DateTime<Utc>,
    pub addr: IpAddr,
    pub packets_sent: u32,
    pub packets_recv: u32,
    pub packets_recv_duplicates: u32,
    /// Percentage in 0..=100.
    pub packet_loss: f64,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub stddev_rtt: Duration,
    /// True when the session was ended by a stop request.
    pub stopped: bool,
}

/// Accumulates per-echo observations for a session.
#[derive(Debug)]
pub(crate) struct SessionStats {
    started_at: DateTime<Utc>,
    addr: IpAddr,
    sent: u32,
    duplicates: u32,
    rtts: Vec<Duration>,
}

impl SessionStats {
    pub(crate) fn new(addr: IpAddr) -> Self {
        Self {
            started_at: Utc::now(),
            addr,
            sent: 0,
            duplicates: 0,
            rtts: Vec::new(),
        }
    }

    pub(crate) fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub(crate) fn record_reply(&mut self, rtt: Duration) {
        self.rtts.push(rtt);
    }

    pub(crate) fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub(crate) fn received(&self) -> u32 {
        self.rtts.len() as u32
    }

    pub(crate) fn finish(self, stopped: bool) -> PingStatistics {
        let received = self.received();
        let packet_loss = if self.sent == 0 {
            0.0
        } else {
            100.0 * f64::from(self.sent - received) / f64::from(self.sent)
        };

        let (min_rtt, avg_rtt, max_rtt, stddev_rtt) = if self.rtts.is_empty() {
            (Duration::ZERO, Duration::ZERO, Duration::ZERO, Duration::ZERO)
        } else {
            let min = self.rtts.iter().copied().min().unwrap_or_default();
            let max = self.rtts.iter().copied().max().unwrap_or_default();
            let total: Duration = self.rtts.iter().sum();
            let avg = total / received;
            let mean = avg.as_secs_f64();
            let variance = self
                .rtts
                .iter()
                .map(|rtt| (rtt.as_secs_f64() - mean).powi(2))
                .sum::<f64>()
                / f64::from(received);
            (min, avg, max, Duration::from_secs_f64(variance.sqrt()))
        };

        PingStatistics {
            started_at: self.started_at,
            addr: self.addr,
            packets_sent: self.sent,
            packets_recv: received,
            packets_recv_duplicates: self.duplicates,
            packet_loss,
            min_rtt,
            avg_rtt,
            max_rtt,
            stddev_rtt,
            stopped,
        }
    }
}

/// Drive one session over `transport`.
///
/// At most `count` echoes are attempted. A failed send is logged and not
/// counted as transmitted; receive failures are logged. Neither aborts the
/// session.
pub async fn run_session<T: EchoTransport + ?Sized>(
    transport: &T,
    addr: IpAddr,
    options: &PingOptions,
    stop: &CancellationToken,
) -> PingStatistics {
    let mut stats = SessionStats::new(addr);
    let mut sent_at: HashMap<u16, Instant> = HashMap::new();
    let mut answered: HashSet<u16> = HashSet::new();
    let mut next_seq: u16 = 0;
    // Send attempts; only the successful ones count as transmitted.
    let mut attempts: u16 = 0;

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    let mut send_tick = tokio::time::interval(options.interval);
    send_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stopped = false;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                stopped = true;
                break;
            }
            _ = &mut deadline => break,
            _ = send_tick.tick(), if attempts < options.count => {
                let seq = next_seq;
                next_seq = next_seq.wrapping_add(1);
                attempts += 1;
                match transport.send(seq).await {
                    Ok(()) => {
                        stats.record_sent();
                        sent_at.insert(seq, Instant::now());
                    }
                    Err(e) => tracing::warn!("Ping {}: failed to send icmp_seq={}: {}", addr, seq, e),
                }
            }
            reply = transport.recv() => {
                let reply = match reply {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Ping {}: receive failed: {}", addr, e);
                        // Avoid spinning on a persistently failing socket.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };

                let Some(sent) = sent_at.get(&reply.seq) else {
                    continue;
                };
                let rtt = sent.elapsed();

                if !answered.insert(reply.seq) {
                    stats.record_duplicate();
                    tracing::debug!(
                        bytes = reply.bytes,
                        from = %reply.from,
                        icmp_seq = reply.seq,
                        rtt = ?rtt,
                        ttl = ?reply.ttl,
                        "{} bytes from {}: icmp_seq={} time={:?} (DUP!)",
                        reply.bytes, reply.from, reply.seq, rtt
                    );
                    continue;
                }

                stats.record_reply(rtt);
                tracing::debug!(
                    bytes = reply.bytes,
                    from = %reply.from,
                    icmp_seq = reply.seq,
                    rtt = ?rtt,
                    ttl = ?reply.ttl,
                    "{} bytes from {}: icmp_seq={} time={:?}",
                    reply.bytes, reply.from, reply.seq, rtt
                );

                if stats.received() >= u32::from(options.count) {
                    break;
                }
            }
        }
    }

    stats.finish(stopped)
}

/// Run a ping probe against `target` using native ICMP.
///
/// Fails before any echo is sent when the target cannot be resolved or no
/// ICMP socket can be opened. Packet loss is reported in the statistics,
/// never as an error.
pub async fn run_ping_probe(
    target: &Target,
    options: &PingOptions,
    stop: &CancellationToken,
) -> Result<PingStatistics, ProbeError> {
    options.validate()?;
    let ip = target.resolve().await?;
    tracing::debug!("PING {} ({}):", target.hostname(), ip);

    let transport = IcmpTransport::open(ip)?;
    Ok(run_session(&transport, ip, options, stop).await)
}
