use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, Error},
    watchdog::WatchdogConfig,
};

/// The two outgoing ports of a deployment.
///
/// These are fixed, only the incoming port is chosen by the operator.
pub const OUTGOING_PORTS: [&str; 2] = ["COM131", "COM141"];

/// Settings for a single serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// The port, e.g. `COM3` or `/dev/ttyUSB0`.
    pub name: String,

    /// Baud rate.
    pub baud: u32,

    /// How long a single read may wait for data.
    pub timeout: Duration,
}

impl PortConfig {
    /// A port config.
    pub fn new(name: impl Into<String>, baud: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            baud,
            timeout,
        }
    }
}

/// Normalize a port name so that different spellings of the same port compare equal.
///
/// Windows device prefixes are removed and `COMn` names are upper cased,
/// since Windows treats them case insensitively.
/// Other names (e.g. unix device paths) are kept as they are.
pub fn normalize_port(name: &str) -> String {
    let name = name.trim();
    let name = name.strip_prefix(r"\\.\").unwrap_or(name);

    let is_com = match (name.get(..3), name.get(3..)) {
        (Some(prefix), Some(number)) => {
            prefix.eq_ignore_ascii_case("com")
                && !number.is_empty()
                && number.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    };

    if is_com {
        name.to_ascii_uppercase()
    } else {
        name.to_owned()
    }
}

/// True if both names refer to the same port.
pub fn same_port(a: &str, b: &str) -> bool {
    normalize_port(a) == normalize_port(b)
}

/// Which ports are the two ends of a loopback pair.
///
/// Virtual port drivers create ports in pairs where whatever is written to one end
/// is read on the other.
/// Routing between both ends of a pair would feed the router its own output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct PairingTable {
    counterparts: BTreeMap<String, String>,
}

impl PairingTable {
    /// Build from a list of pairs.
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: AsRef<str>,
        B: AsRef<str>,
    {
        let mut counterparts = BTreeMap::new();

        for (a, b) in pairs {
            let (a, b) = (normalize_port(a.as_ref()), normalize_port(b.as_ref()));
            counterparts.insert(a.clone(), b.clone());
            counterparts.insert(b, a);
        }

        Self { counterparts }
    }

    /// The other end of `port`'s pair, if it has one.
    pub fn counterpart(&self, port: &str) -> Option<&str> {
        self.counterparts
            .get(&normalize_port(port))
            .map(String::as_str)
    }

    /// True if the two ports are each other's counterpart.
    pub fn are_paired(&self, a: &str, b: &str) -> bool {
        self.counterpart(a)
            .map(|counterpart| same_port(counterpart, b))
            .unwrap_or(false)
    }

    /// Every pair, each listed once.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.counterparts
            .iter()
            .filter(|(a, b)| a < b)
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect()
    }
}

impl From<Vec<(String, String)>> for PairingTable {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self::from_pairs(pairs)
    }
}

impl From<PairingTable> for Vec<(String, String)> {
    fn from(table: PairingTable) -> Self {
        table.pairs()
    }
}

/// Everything a router needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// The externally facing port.
    pub incoming: PortConfig,

    /// The two ports traffic is fanned out to.
    pub outgoing: [PortConfig; 2],

    /// Reconnect backoff never waits longer than this.
    pub max_backoff: Duration,

    /// Loopback pairs to refuse.
    pub pairing: PairingTable,

    /// Supervision settings.
    pub watchdog: WatchdogConfig,
}

impl RouterConfig {
    /// A config with default pairing and supervision.
    pub fn new(incoming: PortConfig, outgoing: [PortConfig; 2], max_backoff: Duration) -> Self {
        Self {
            incoming,
            outgoing,
            max_backoff,
            pairing: PairingTable::default(),
            watchdog: WatchdogConfig::default(),
        }
    }

    /// Set the pairing table.
    pub fn with_pairing(mut self, pairing: PairingTable) -> Self {
        self.pairing = pairing;
        self
    }

    /// Set supervision settings.
    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    fn check_values(&self) -> Result<(), ConfigError> {
        for port in std::iter::once(&self.incoming).chain(&self.outgoing) {
            if port.name.trim().is_empty() {
                return Err(ConfigError::BadValue {
                    field: "port name",
                    problem: "must not be empty".into(),
                });
            }
            if port.baud == 0 {
                return Err(ConfigError::BadValue {
                    field: "baud",
                    problem: format!("`{}` has a baud rate of zero", port.name),
                });
            }
        }

        if self.max_backoff.is_zero() {
            return Err(ConfigError::BadValue {
                field: "retry_delay_max",
                problem: "must be positive".into(),
            });
        }

        Ok(())
    }

    fn check_distinct(&self) -> Result<(), ConfigError> {
        let [a, b] = &self.outgoing;

        if same_port(&a.name, &b.name) {
            return Err(ConfigError::SameOutgoing(normalize_port(&a.name)));
        }

        for outgoing in &self.outgoing {
            if same_port(&outgoing.name, &self.incoming.name) {
                return Err(ConfigError::OutgoingIsIncoming(normalize_port(
                    &outgoing.name,
                )));
            }
        }

        Ok(())
    }

    fn check_pairing(&self) -> Result<(), ConfigError> {
        let [a, b] = &self.outgoing;

        if self.pairing.are_paired(&a.name, &b.name) {
            return Err(ConfigError::OutgoingPaired(
                normalize_port(&a.name),
                normalize_port(&b.name),
            ));
        }

        for outgoing in &self.outgoing {
            if self.pairing.are_paired(&outgoing.name, &self.incoming.name) {
                return Err(ConfigError::IncomingPairedWithOutgoing {
                    incoming: normalize_port(&self.incoming.name),
                    outgoing: normalize_port(&outgoing.name),
                });
            }
        }

        Ok(())
    }

    /// Check that this config may be started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_values()?;
        self.check_distinct()?;
        self.check_pairing()?;

        Ok(())
    }
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Everything, including each connect attempt.
    Debug,

    /// State changes and restarts.
    #[default]
    Info,

    /// Only problems.
    Warning,

    /// Only serious problems.
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// The configuration file.
///
/// Every field is optional in the file, missing ones take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The externally facing port.
    pub incoming_port: String,

    /// Baud rate of the incoming port.
    pub incoming_baud: u32,

    /// Baud rate shared by both outgoing ports.
    pub outgoing_baud: u32,

    /// Seconds a single read may wait for data.
    pub timeout: f64,

    /// Ceiling for the reconnect backoff, in seconds.
    pub retry_delay_max: f64,

    /// Log verbosity.
    pub log_level: LogLevel,

    /// If set, logs are also written to a daily rotated file in this directory.
    pub log_dir: Option<PathBuf>,

    /// Loopback port pairs.
    pub pairs: PairingTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            incoming_port: "COM88".into(),
            incoming_baud: 115_200,
            outgoing_baud: 115_200,
            timeout: 0.1,
            retry_delay_max: 30.0,
            log_level: LogLevel::Info,
            log_dir: None,
            pairs: PairingTable::from_pairs([("COM131", "COM132"), ("COM141", "COM142")]),
        }
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::BadValue {
        field,
        problem: format!("`{value}` is not a usable number of seconds ({e})"),
    })
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Ok(Self::ron().from_str::<Config>(input)?)
    }

    /// Deserialize a .json file's contents.
    pub fn deserialize_json(input: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(input)?)
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            incoming_port: "COM3".into(),
            log_dir: Some(PathBuf::from("logs")),
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Ok(Self::ron().to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    /// Load a configuration file.
    ///
    /// Files ending in `.json` are read as JSON, anything else as RON.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .map(|extension| extension.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::deserialize_json(&s)
        } else {
            Self::deserialize(&s)
        }
    }

    /// The router configuration this file describes, validated.
    pub fn router_config(&self) -> Result<RouterConfig, ConfigError> {
        let timeout = seconds("timeout", self.timeout)?;
        let max_backoff = seconds("retry_delay_max", self.retry_delay_max)?;

        let [a, b] = OUTGOING_PORTS;
        let config = RouterConfig::new(
            PortConfig::new(normalize_port(&self.incoming_port), self.incoming_baud, timeout),
            [
                PortConfig::new(a, self.outgoing_baud, timeout),
                PortConfig::new(b, self.outgoing_baud, timeout),
            ],
            max_backoff,
        )
        .with_pairing(self.pairs.clone());

        config.validate()?;

        Ok(config)
    }
}
