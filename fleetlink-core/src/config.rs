use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Largest message cache a bus will keep, whatever the configuration says
pub const MAX_MESSAGE_CACHE_CAPACITY: i64 = 500;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub redis: RedisConfig,
    pub magic_link: MagicLinkConfig,
    pub families: Vec<FamilyConfig>,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
    /// Extra `target=level` filter directives, e.g.
    /// `fleetlink_cluster::matchmaking=debug`
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            directives: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Pub/sub channel shared by the front-end and every worker
    pub channel: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            channel: "fleetlink:packets".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

/// Magic link (heartbeat + registration) settings, front-end side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MagicLinkConfig {
    /// Shared secret every worker must present. Empty or unset disables the check.
    pub secret: Option<String>,
    /// Dedup cache size; clamped to `0..=500`
    pub message_cache_capacity: i64,
    /// Ping interval handed to workers in the handshake response
    pub heartbeat_interval_seconds: u64,
    /// Liveness countdown a worker starts with and is reset to on every ping
    pub countdown: u32,
    /// Amount removed from every countdown on each decay tick
    pub decay_amount: u32,
    pub decay_period_seconds: u64,
    /// Upper bound for physically moving a client onto a worker
    pub connect_timeout_seconds: u64,
    /// Named worker profiles, referenced by the `magic_config` field of a ping
    pub magic_configs: HashMap<String, MagicConfigEntry>,
}

impl Default for MagicLinkConfig {
    fn default() -> Self {
        Self {
            secret: None,
            message_cache_capacity: 50,
            heartbeat_interval_seconds: 5,
            countdown: 15,
            decay_amount: 5,
            decay_period_seconds: 5,
            connect_timeout_seconds: 5,
            magic_configs: HashMap::new(),
        }
    }
}

impl MagicLinkConfig {
    #[must_use]
    pub fn message_cache_capacity(&self) -> usize {
        // The clamp guarantees a value in 0..=500, so the cast is lossless
        self.message_cache_capacity
            .clamp(0, MAX_MESSAGE_CACHE_CAPACITY) as usize
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    #[must_use]
    pub const fn decay_period(&self) -> Duration {
        Duration::from_secs(self.decay_period_seconds)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Worker profile adopted by a worker on registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MagicConfigEntry {
    pub family: String,
    pub soft_cap: u32,
    pub hard_cap: u32,
    pub weight: u32,
}

impl Default for MagicConfigEntry {
    fn default() -> Self {
        Self {
            family: "lobby".to_string(),
            soft_cap: 20,
            hard_cap: 30,
            weight: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub id: String,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub matchmaker: Option<MatchmakerConfig>,
    /// Send returning players back to the worker they were first placed on
    #[serde(default)]
    pub residence: Option<ResidenceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidenceConfig {
    /// Forget a home after this long. Homes are kept until their worker
    /// leaves when unset.
    pub expiration_seconds: Option<u64>,
}

impl ResidenceConfig {
    #[must_use]
    pub fn expiration(&self) -> Option<Duration> {
        self.expiration_seconds.map(Duration::from_secs)
    }
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Ascending player count
    #[default]
    LeastConnection,
    /// Ascending player count, biased towards heavier-weighted workers
    WeightedLeastConnection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: BalancingStrategy,
    /// Period of the full re-sort
    pub rebalance_interval_seconds: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::LeastConnection,
            rebalance_interval_seconds: 20,
        }
    }
}

impl LoadBalancerConfig {
    #[must_use]
    pub const fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_seconds)
    }
}

/// How queued players are scored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingSchema {
    WinLoss,
    WinRate,
    #[default]
    Randomized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    pub name: String,
    pub min: u32,
    pub max: u32,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            name: "team".to_string(),
            min: 1,
            max: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerConfig {
    pub ranking: RankingSchema,
    pub teams: Vec<TeamConfig>,
    pub sort_interval_seconds: u64,
    pub session_interval_seconds: u64,
    pub connect_interval_seconds: u64,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            ranking: RankingSchema::Randomized,
            teams: vec![
                TeamConfig {
                    name: "red".to_string(),
                    min: 1,
                    max: 4,
                },
                TeamConfig {
                    name: "blue".to_string(),
                    min: 1,
                    max: 4,
                },
            ],
            sort_interval_seconds: 30,
            session_interval_seconds: 20,
            connect_interval_seconds: 10,
        }
    }
}

impl MatchmakerConfig {
    #[must_use]
    pub const fn sort_interval(&self) -> Duration {
        Duration::from_secs(self.sort_interval_seconds)
    }

    #[must_use]
    pub const fn session_interval(&self) -> Duration {
        Duration::from_secs(self.session_interval_seconds)
    }

    #[must_use]
    pub const fn connect_interval(&self) -> Duration {
        Duration::from_secs(self.connect_interval_seconds)
    }
}

/// Worker-side identity, used by `fleetlink worker`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub address: String,
    pub display_name: Option<String>,
    pub magic_config: String,
    pub secret: Option<String>,
    /// Interval used until the front-end hands out its own
    pub heartbeat_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:25565".to_string(),
            display_name: None,
            magic_config: "default".to_string(),
            secret: None,
            heartbeat_interval_seconds: 5,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // FLEETLINK_REDIS__URL, FLEETLINK_MAGIC_LINK__COUNTDOWN, ...
        builder = builder.add_source(
            Environment::with_prefix("FLEETLINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn family(&self, id: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|f| f.id == id)
    }

    /// Check the configuration for values the services cannot run with.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if self.redis.channel.is_empty() {
            errors.push("redis.channel must not be empty".to_string());
        }

        let link = &self.magic_link;
        if link.countdown == 0 {
            errors.push("magic_link.countdown must be greater than 0".to_string());
        }
        if link.decay_amount == 0 {
            errors.push("magic_link.decay_amount must be greater than 0".to_string());
        }
        if link.decay_period_seconds == 0 {
            errors.push("magic_link.decay_period_seconds must be greater than 0".to_string());
        }
        if link.heartbeat_interval_seconds == 0 {
            errors.push("magic_link.heartbeat_interval_seconds must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for family in &self.families {
            if family.id.is_empty() {
                errors.push("families[].id must not be empty".to_string());
            } else if !seen.insert(family.id.as_str()) {
                errors.push(format!("family `{}` is declared twice", family.id));
            }
            if family.load_balancer.rebalance_interval_seconds == 0 {
                errors.push(format!(
                    "family `{}`: load_balancer.rebalance_interval_seconds must be greater than 0",
                    family.id
                ));
            }
            if let Some(matchmaker) = &family.matchmaker {
                errors.extend(
                    matchmaker
                        .problems()
                        .into_iter()
                        .map(|p| format!("family `{}`: matchmaker {p}", family.id)),
                );
            }
            if family
                .residence
                .as_ref()
                .is_some_and(|r| r.expiration_seconds == Some(0))
            {
                errors.push(format!(
                    "family `{}`: residence.expiration_seconds must be greater than 0",
                    family.id
                ));
            }
        }

        for (name, entry) in &link.magic_configs {
            if !seen.contains(entry.family.as_str()) {
                errors.push(format!(
                    "magic config `{name}` points at unknown family `{}`",
                    entry.family
                ));
            }
            if entry.hard_cap == 0 {
                errors.push(format!("magic config `{name}` has a hard cap of 0"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl MatchmakerConfig {
    /// Settings a matchmaker cannot run with. Empty when usable.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.teams.is_empty() {
            problems.push("needs at least one team".to_string());
        }
        for team in &self.teams {
            if team.min > team.max {
                problems.push(format!(
                    "team `{}` has min {} above max {}",
                    team.name, team.min, team.max
                ));
            }
        }
        if self.teams.iter().map(|t| t.min).sum::<u32>() == 0 {
            problems.push("teams must require at least one player in total".to_string());
        }
        if self.sort_interval_seconds == 0
            || self.session_interval_seconds == 0
            || self.connect_interval_seconds == 0
        {
            problems.push("intervals must be greater than 0".to_string());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn family(id: &str) -> FamilyConfig {
        FamilyConfig {
            id: id.to_string(),
            load_balancer: LoadBalancerConfig::default(),
            matchmaker: None,
            residence: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.magic_link.countdown, 15);
        assert_eq!(config.magic_link.message_cache_capacity(), 50);
        assert_eq!(config.magic_link.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.redis.channel, "fleetlink:packets");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_message_cache_capacity_is_clamped() {
        let mut link = MagicLinkConfig {
            message_cache_capacity: -10,
            ..MagicLinkConfig::default()
        };
        assert_eq!(link.message_cache_capacity(), 0);

        link.message_cache_capacity = 9000;
        assert_eq!(link.message_cache_capacity(), 500);

        link.message_cache_capacity = 120;
        assert_eq!(link.message_cache_capacity(), 120);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.families = vec![family("lobby"), family("lobby")];
        config.magic_link.countdown = 0;
        config.magic_link.magic_configs.insert(
            "arena".to_string(),
            MagicConfigEntry {
                family: "arena".to_string(),
                hard_cap: 0,
                ..MagicConfigEntry::default()
            },
        );

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("declared twice")));
        assert!(errors.iter().any(|e| e.contains("countdown")));
        assert!(errors.iter().any(|e| e.contains("unknown family `arena`")));
        assert!(errors.iter().any(|e| e.contains("hard cap of 0")));
    }

    #[test]
    fn test_validate_matchmaker_teams() {
        let mut config = Config::default();
        let mut arena = family("arena");
        arena.matchmaker = Some(MatchmakerConfig {
            teams: vec![TeamConfig {
                name: "solo".to_string(),
                min: 3,
                max: 2,
            }],
            ..MatchmakerConfig::default()
        });
        config.families.push(arena);

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("min 3 above max 2")));
    }

    #[test]
    fn test_validate_residence_expiration() {
        let mut config = Config::default();
        let mut hub = family("hub");
        hub.residence = Some(ResidenceConfig {
            expiration_seconds: Some(0),
        });
        config.families.push(hub);

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("residence.expiration_seconds")));

        config.families[0].residence = Some(ResidenceConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.families[0].residence.as_ref().unwrap().expiration(), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[magic_link]
countdown = 30
secret = "hunter2"

[magic_link.magic_configs.default]
family = "lobby"
soft_cap = 10
hard_cap = 12

[[families]]
id = "lobby"

[families.load_balancer]
strategy = "weighted_least_connection"

[families.residence]
expiration_seconds = 3600
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.magic_link.countdown, 30);
        assert_eq!(config.magic_link.secret.as_deref(), Some("hunter2"));
        assert_eq!(
            config.family("lobby").unwrap().load_balancer.strategy,
            BalancingStrategy::WeightedLeastConnection
        );
        assert_eq!(config.magic_link.magic_configs["default"].hard_cap, 12);
        assert_eq!(
            config.family("lobby").unwrap().residence.as_ref().unwrap().expiration(),
            Some(Duration::from_secs(3600))
        );
        assert!(config.validate().is_ok());
    }
}
