//! Configuration module for linkwatch.
//!
//! Flags can also be supplied through `LINKWATCH_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;

use crate::probe::{PingOptions, ProbeError, Target};

/// Multiple of the base interval used for the ping and HTTP cadence and the
/// ping session timeout.
pub const CADENCE_FACTOR: u32 = 6;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Command line arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "linkwatch", version, about = "Network reachability and latency monitor")]
pub struct Cli {
    /// Output path of the log (opened in append mode).
    #[arg(long, env = "LINKWATCH_LOG", default_value = "linkwatch.log")]
    pub log: PathBuf,

    /// Destination host, address or http(s) URL.
    #[arg(long, env = "LINKWATCH_DEST", default_value = "www.google.com")]
    pub dest: String,

    /// Seconds between echoes; probe cadence and session timeout are 6x this.
    #[arg(long, env = "LINKWATCH_INTERVAL", default_value_t = 10)]
    pub interval: u64,

    /// Echo requests per ping session.
    #[arg(long, env = "LINKWATCH_COUNT", default_value_t = 5)]
    pub count: u16,

    /// Overall bound on one HTTP probe, in seconds.
    #[arg(long, env = "LINKWATCH_HTTP_TIMEOUT", default_value_t = 5)]
    pub http_timeout: u64,

    /// Seconds between public address refreshes.
    #[arg(long, env = "LINKWATCH_REFRESH_INTERVAL", default_value_t = 300)]
    pub refresh_interval: u64,

    /// Service answering with the caller's public IP.
    #[arg(
        long,
        env = "LINKWATCH_IP_LOOKUP_URL",
        default_value = "https://api.ipify.org?format=json"
    )]
    pub ip_lookup_url: String,

    /// Skip a tick when this many probes of the same kind are still running.
    #[arg(long, env = "LINKWATCH_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,

    /// Verbose output (debug level).
    #[arg(short, long, env = "LINKWATCH_VERBOSE")]
    pub verbose: bool,
}

/// Immutable schedule settings, fixed at startup.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleConfig {
    #[serde(serialize_with = "serialize_target")]
    pub target: Target,
    pub ping_interval: Duration,
    pub ping: PingOptions,
    pub http_interval: Duration,
    pub http_url: String,
    pub http_timeout: Duration,
    pub refresh_interval: Duration,
    pub ip_lookup_url: String,
    pub max_in_flight: Option<usize>,
    pub verbose: bool,
}

fn serialize_target<S: serde::Serializer>(target: &Target, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(target.host())
}

impl ScheduleConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if cli.interval == 0 {
            return Err(ConfigError::NotPositive("interval"));
        }
        if cli.http_timeout == 0 {
            return Err(ConfigError::NotPositive("http timeout"));
        }
        if cli.refresh_interval == 0 {
            return Err(ConfigError::NotPositive("refresh interval"));
        }
        if cli.max_in_flight == Some(0) {
            return Err(ConfigError::NotPositive("max in flight"));
        }

        let target = Target::new(cli.dest.clone())?;
        let interval = Duration::from_secs(cli.interval);
        let cadence = interval * CADENCE_FACTOR;

        let ping = PingOptions {
            count: cli.count,
            interval,
            timeout: cadence,
        };
        ping.validate()?;

        Ok(Self {
            http_url: target.http_url(),
            target,
            ping_interval: cadence,
            ping,
            http_interval: cadence,
            http_timeout: Duration::from_secs(cli.http_timeout),
            refresh_interval: Duration::from_secs(cli.refresh_interval),
            ip_lookup_url: cli.ip_lookup_url.clone(),
            max_in_flight: cli.max_in_flight,
            verbose: cli.verbose,
        })
    }

    /// Longest time a single probe may legitimately run.
    pub fn longest_probe(&self) -> Duration {
        self.ping.timeout.max(self.http_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["linkwatch"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let cfg = ScheduleConfig::from_cli(&cli(&[])).unwrap();
        assert_eq!(cfg.target.host(), "www.google.com");
        assert_eq!(cfg.http_url, "http://www.google.com/");
        assert_eq!(cfg.ping.count, 5);
        assert_eq!(cfg.ping.interval, Duration::from_secs(10));
        assert_eq!(cfg.ping.timeout, Duration::from_secs(60));
        assert_eq!(cfg.ping_interval, Duration::from_secs(60));
        assert_eq!(cfg.http_interval, Duration::from_secs(60));
        assert_eq!(cfg.http_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_in_flight, None);
        assert!(!cfg.verbose);
    }

    #[test]
    fn test_flags() {
        let cfg = ScheduleConfig::from_cli(&cli(&[
            "--dest",
            "1.1.1.1",
            "--interval",
            "3",
            "--max-in-flight",
            "1",
            "-v",
        ]))
        .unwrap();
        assert_eq!(cfg.ping.timeout, Duration::from_secs(18));
        assert_eq!(cfg.max_in_flight, Some(1));
        assert!(cfg.verbose);
        assert_eq!(cfg.longest_probe(), Duration::from_secs(18));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = ScheduleConfig::from_cli(&cli(&["--interval", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive("interval")));
    }

    #[test]
    fn test_rejects_session_that_cannot_finish() {
        // 7 echoes 10s apart cannot complete inside a 60s session.
        let err = ScheduleConfig::from_cli(&cli(&["--count", "7"])).unwrap_err();
        assert!(matches!(err, ConfigError::Probe(ProbeError::Config(_))));
    }

    #[test]
    fn test_serializes_for_startup_log() {
        let cfg = ScheduleConfig::from_cli(&cli(&[])).unwrap();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["target"], "www.google.com");
    }
}
