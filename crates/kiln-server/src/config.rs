//! Server configuration.
//!
//! CLI/environment surface parsed with clap, plus conversion from
//! human-friendly strings ("100mb", "allkeys-lru", "everysec") to the
//! engine's config types.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use kiln_core::keyspace::{EvictionPolicy, StoreConfig};
use kiln_persistence::aof::SyncPolicy;

/// An in-memory, Redis-protocol key-value store with optional
/// replication and persistence.
#[derive(Debug, Clone, Parser)]
#[command(name = "kiln-server", version)]
pub struct Config {
    /// Address to bind the RESP listener on.
    #[arg(long, default_value = "127.0.0.1", env = "KILN_BIND_ADDR")]
    pub bind_addr: String,

    /// RESP listener port.
    #[arg(long, default_value_t = 7878, env = "KILN_PORT")]
    pub port: u16,

    /// Enable TLS on the RESP listener.
    #[arg(long, default_value_t = false)]
    pub tls: bool,

    /// Require client certificates (mTLS). Implies --tls.
    #[arg(long, default_value_t = false)]
    pub mtls: bool,

    /// Server certificate/key PEM pairs, as "cert.pem,key.pem".
    /// May be passed multiple times.
    #[arg(long = "cert-key-pair")]
    pub cert_key_pairs: Vec<String>,

    /// CA certificates for verifying client certs. May be passed
    /// multiple times.
    #[arg(long = "client-ca")]
    pub client_cas: Vec<String>,

    /// Raft port for cluster mode.
    #[arg(long, default_value_t = 7946)]
    pub raft_port: u16,

    /// Memberlist gossip port for cluster mode.
    #[arg(long, default_value_t = 7947)]
    pub memberlist_port: u16,

    /// Stable server ID in the cluster.
    #[arg(long, default_value_t = 1)]
    pub server_id: u64,

    /// Address of a cluster member to join through.
    #[arg(long)]
    pub join_addr: Option<String>,

    /// Bootstrap a new cluster with this node as the initial leader.
    #[arg(long, default_value_t = false)]
    pub bootstrap_cluster: bool,

    /// Directory for persistence files.
    #[arg(long, default_value = "./data", env = "KILN_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Run without any disk persistence.
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,

    /// Require AUTH before other commands.
    #[arg(long, default_value_t = false)]
    pub require_pass: bool,

    /// Password for the default user when --require-pass is set.
    #[arg(long, env = "KILN_PASSWORD")]
    pub password: Option<String>,

    /// Path to a JSON ACL user-config file.
    #[arg(long)]
    pub acl_config: Option<PathBuf>,

    /// Forward write commands to the leader instead of rejecting them
    /// on followers.
    #[arg(long, default_value_t = false)]
    pub forward_commands: bool,

    /// Mutation count that triggers an automatic snapshot.
    #[arg(long, default_value_t = 1000)]
    pub snapshot_threshold: u64,

    /// Minimum interval between automatic snapshots.
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub snapshot_interval: Duration,

    /// Restore from the newest snapshot on startup.
    #[arg(long, default_value_t = false)]
    pub restore_snapshot: bool,

    /// Replay the AOF on startup.
    #[arg(long, default_value_t = false)]
    pub restore_aof: bool,

    /// AOF fsync strategy: always, everysec, or no.
    #[arg(long, default_value = "everysec", value_parser = parse_sync_policy)]
    pub aof_sync_strategy: SyncPolicy,

    /// Memory limit with optional suffix (kb, mb, gb, tb, pb).
    /// 0 disables the limit.
    #[arg(long, default_value = "0", value_parser = parse_byte_size)]
    pub max_memory: usize,

    /// Eviction policy under memory pressure.
    #[arg(long, default_value = "noeviction", value_parser = parse_eviction_policy)]
    pub eviction_policy: EvictionPolicy,

    /// Keys the TTL sweeper samples per tick.
    #[arg(long, default_value_t = 20)]
    pub eviction_sample: usize,

    /// TTL sweeper interval.
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub eviction_interval: Duration,
}

impl Config {
    /// The engine config slice of this server config.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_memory: self.max_memory,
            eviction_policy: self.eviction_policy,
            eviction_sample: self.eviction_sample,
            eviction_interval: self.eviction_interval,
        }
    }

    /// Whether this node participates in a replicated cluster.
    pub fn in_cluster(&self) -> bool {
        self.bootstrap_cluster || self.join_addr.is_some()
    }

    /// The AOF log path.
    pub fn aof_path(&self) -> PathBuf {
        self.data_dir.join("kiln.aof")
    }
}

/// Parses a human-readable byte size string into a number of bytes.
///
/// Supports suffixes kb, mb, gb, tb, pb — with or without the trailing
/// `b`, case insensitive. Plain numbers are bytes.
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty byte size string".into());
    }

    let lower = input.to_ascii_lowercase();

    let (num_str, multiplier): (&str, usize) = if let Some(n) = lower.strip_suffix("pb") {
        (n, 1 << 50)
    } else if let Some(n) = lower.strip_suffix("tb") {
        (n, 1 << 40)
    } else if let Some(n) = lower.strip_suffix("gb") {
        (n, 1 << 30)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1 << 20)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1 << 10)
    } else if let Some(n) = lower.strip_suffix('p') {
        (n, 1 << 50)
    } else if let Some(n) = lower.strip_suffix('t') {
        (n, 1 << 40)
    } else if let Some(n) = lower.strip_suffix('g') {
        (n, 1 << 30)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1 << 20)
    } else if let Some(n) = lower.strip_suffix('k') {
        (n, 1 << 10)
    } else {
        (lower.as_str(), 1)
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size: '{input}'"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("byte size overflow: '{input}'"))
}

/// Parses an eviction policy name.
pub fn parse_eviction_policy(input: &str) -> Result<EvictionPolicy, String> {
    match input.to_ascii_lowercase().as_str() {
        "noeviction" => Ok(EvictionPolicy::NoEviction),
        "allkeys-lru" => Ok(EvictionPolicy::AllKeysLru),
        "allkeys-lfu" => Ok(EvictionPolicy::AllKeysLfu),
        "allkeys-random" => Ok(EvictionPolicy::AllKeysRandom),
        "volatile-lru" => Ok(EvictionPolicy::VolatileLru),
        "volatile-lfu" => Ok(EvictionPolicy::VolatileLfu),
        "volatile-random" => Ok(EvictionPolicy::VolatileRandom),
        "volatile-ttl" => Ok(EvictionPolicy::VolatileTtl),
        _ => Err(format!(
            "unknown eviction policy '{input}'. valid options: noeviction, allkeys-lru, \
             allkeys-lfu, allkeys-random, volatile-lru, volatile-lfu, volatile-random, \
             volatile-ttl"
        )),
    }
}

/// Parses an AOF sync strategy name.
pub fn parse_sync_policy(input: &str) -> Result<SyncPolicy, String> {
    match input.to_ascii_lowercase().as_str() {
        "always" => Ok(SyncPolicy::Always),
        "everysec" => Ok(SyncPolicy::EverySec),
        "no" => Ok(SyncPolicy::No),
        _ => Err(format!(
            "unknown aof sync strategy '{input}'. valid options: always, everysec, no"
        )),
    }
}

/// Parses a duration with ms/s/m/h suffixes ("100ms", "5m").
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (num, unit): (&str, &str) = match input.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => (&input[..idx], &input[idx..]),
        None => (input, "s"),
    };
    let value: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit: '{unit}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parse_suffixed_sizes() {
        assert_eq!(parse_byte_size("100kb").unwrap(), 100 << 10);
        assert_eq!(parse_byte_size("100K").unwrap(), 100 << 10);
        assert_eq!(parse_byte_size("50mb").unwrap(), 50 << 20);
        assert_eq!(parse_byte_size("1MB").unwrap(), 1 << 20);
        assert_eq!(parse_byte_size("2gb").unwrap(), 2usize << 30);
        assert_eq!(parse_byte_size("1tb").unwrap(), 1usize << 40);
        assert_eq!(parse_byte_size("1pb").unwrap(), 1usize << 50);
    }

    #[test]
    fn parse_empty_is_error() {
        assert!(parse_byte_size("").is_err());
    }

    #[test]
    fn parse_invalid_is_error() {
        assert!(parse_byte_size("abc").is_err());
        assert!(parse_byte_size("mb").is_err());
    }

    #[test]
    fn parse_eviction_policies() {
        assert_eq!(
            parse_eviction_policy("noeviction").unwrap(),
            EvictionPolicy::NoEviction
        );
        assert_eq!(
            parse_eviction_policy("ALLKEYS-LRU").unwrap(),
            EvictionPolicy::AllKeysLru
        );
        assert_eq!(
            parse_eviction_policy("volatile-ttl").unwrap(),
            EvictionPolicy::VolatileTtl
        );
        assert_eq!(
            parse_eviction_policy("allkeys-random").unwrap(),
            EvictionPolicy::AllKeysRandom
        );
    }

    #[test]
    fn parse_unknown_policy_is_error() {
        assert!(parse_eviction_policy("random").is_err());
    }

    #[test]
    fn parse_sync_policies() {
        assert_eq!(parse_sync_policy("always").unwrap(), SyncPolicy::Always);
        assert_eq!(parse_sync_policy("EVERYSEC").unwrap(), SyncPolicy::EverySec);
        assert_eq!(parse_sync_policy("no").unwrap(), SyncPolicy::No);
        assert!(parse_sync_policy("sometimes").is_err());
    }

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn cluster_detection() {
        let base = Config::parse_from(["kiln-server"]);
        assert!(!base.in_cluster());

        let boot = Config::parse_from(["kiln-server", "--bootstrap-cluster"]);
        assert!(boot.in_cluster());

        let join = Config::parse_from(["kiln-server", "--join-addr", "10.0.0.1:7946"]);
        assert!(join.in_cluster());
    }

    #[test]
    fn store_config_mapping() {
        let cfg = Config::parse_from([
            "kiln-server",
            "--max-memory",
            "1mb",
            "--eviction-policy",
            "allkeys-lru",
            "--eviction-sample",
            "32",
        ]);
        let store = cfg.store_config();
        assert_eq!(store.max_memory, 1 << 20);
        assert_eq!(store.eviction_policy, EvictionPolicy::AllKeysLru);
        assert_eq!(store.eviction_sample, 32);
    }
}
