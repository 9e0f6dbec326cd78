use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::log::log_sink::LogSink;
use crate::sink_warn;

#[derive(Debug)]
pub struct Config {
    pub globals: HashMap<String, String>,
    pub sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("Error reading file {path}: {e}"))?;
        Ok(Self::parse(&content))
    }

    /// Parses INI-style text: `key = value` lines, `[Section]` headers and
    /// `#` comments. Keys before the first header are globals.
    pub fn parse(content: &str) -> Self {
        let mut globals = HashMap::new();
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = &line[1..line.len() - 1];
                current_section = Some(name.trim().to_string());
                continue;
            }

            if let Some(pos) = line.find('=') {
                let key = line[..pos].trim().to_string();
                let value = line[pos + 1..].trim().trim_matches('"').to_string();

                match &current_section {
                    None => {
                        globals.insert(key, value);
                    }
                    Some(sec) => {
                        sections.entry(sec.clone()).or_default().insert(key, value);
                    }
                }
            }
        }
        Config { globals, sections }
    }

    pub fn empty() -> Self {
        Self {
            globals: HashMap::new(),
            sections: HashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|sec| sec.get(key))
            .map(|s| s.as_str())
    }

    #[must_use]
    pub fn get_non_empty(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key).filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn get_global(&self, key: &str) -> Option<&str> {
        self.globals.get(key).map(|s| s.as_str())
    }

    #[must_use]
    pub fn get_non_empty_or_default<'a>(
        &'a self,
        section: &str,
        key: &str,
        default: &'a str,
    ) -> &'a str {
        self.get_non_empty(section, key)
            .or_else(|| self.get_global(key).filter(|s| !s.is_empty()))
            .unwrap_or(default)
    }

    /// Reads an unsigned integer, falling back to `default` (with a warning)
    /// when the value is missing or malformed.
    pub fn get_u64_or(&self, section: &str, key: &str, default: u64, log: &dyn LogSink) -> u64 {
        let Some(raw) = self.get_non_empty(section, key) else {
            return default;
        };
        match raw.parse::<u64>() {
            Ok(v) => v,
            Err(e) => {
                sink_warn!(
                    log,
                    "config [{}] {}={:?} is not a number ({}); using {}",
                    section,
                    key,
                    raw,
                    e,
                    default
                );
                default
            }
        }
    }

    pub fn get_millis_or(
        &self,
        section: &str,
        key: &str,
        default_ms: u64,
        log: &dyn LogSink,
    ) -> Duration {
        Duration::from_millis(self.get_u64_or(section, key, default_ms, log))
    }

    pub fn get_bool_or(&self, section: &str, key: &str, default: bool, log: &dyn LogSink) -> bool {
        match self.get_non_empty(section, key) {
            None => default,
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
            Some(v) => {
                sink_warn!(
                    log,
                    "config [{}] {}={:?} is not a boolean; using {}",
                    section,
                    key,
                    v,
                    default
                );
                default
            }
        }
    }
}

/// How joiners establish media connectivity inside a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Topology {
    /// Every participant handshakes with every other participant.
    #[default]
    Mesh,
    /// Every participant handshakes with one shared relay endpoint.
    Relay { relay_id: String },
}

/// Timeouts and limits of the call core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    pub sweep_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub grace_period: Duration,
    pub join_timeout: Duration,
    pub renegotiation_timeout: Duration,
    pub exchange_timeout: Duration,
    pub topology: Topology,
    /// Cap for group calls; `None` leaves them unbounded.
    pub max_group_participants: Option<usize>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(5_000),
            heartbeat_timeout: Duration::from_millis(15_000),
            grace_period: Duration::from_millis(10_000),
            join_timeout: Duration::from_millis(20_000),
            renegotiation_timeout: Duration::from_millis(10_000),
            exchange_timeout: Duration::from_millis(30_000),
            topology: Topology::Mesh,
            max_group_participants: None,
        }
    }
}

impl CallConfig {
    pub fn from_config(cfg: &Config, log: &dyn LogSink) -> Self {
        let d = Self::default();
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);

        let topology = match cfg.get_non_empty_or_default("Negotiation", "topology", "mesh") {
            "relay" => Topology::Relay {
                relay_id: cfg
                    .get_non_empty_or_default("Negotiation", "relay_id", "relay")
                    .to_owned(),
            },
            "mesh" => Topology::Mesh,
            other => {
                sink_warn!(log, "unknown topology {:?}; using mesh", other);
                Topology::Mesh
            }
        };

        let max_group = cfg.get_u64_or("Calls", "max_group_participants", 0, log);

        Self {
            sweep_interval: cfg.get_millis_or(
                "Presence",
                "sweep_interval_ms",
                ms(d.sweep_interval),
                log,
            ),
            heartbeat_timeout: cfg.get_millis_or(
                "Presence",
                "heartbeat_timeout_ms",
                ms(d.heartbeat_timeout),
                log,
            ),
            grace_period: cfg.get_millis_or("Presence", "grace_period_ms", ms(d.grace_period), log),
            join_timeout: cfg.get_millis_or(
                "Negotiation",
                "join_timeout_ms",
                ms(d.join_timeout),
                log,
            ),
            renegotiation_timeout: cfg.get_millis_or(
                "Negotiation",
                "renegotiation_timeout_ms",
                ms(d.renegotiation_timeout),
                log,
            ),
            exchange_timeout: cfg.get_millis_or(
                "Negotiation",
                "exchange_timeout_ms",
                ms(d.exchange_timeout),
                log,
            ),
            topology,
            max_group_participants: usize::try_from(max_group).ok().filter(|n| *n > 0),
        }
    }
}

/// Listener settings of the signaling server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tls: bool,
    pub cert_path: String,
    pub key_path: String,
    pub log_dir: Option<PathBuf>,
    pub log_filename: String,
}

impl ServerConfig {
    pub fn from_config(cfg: &Config, log: &dyn LogSink) -> Self {
        Self {
            bind_addr: cfg
                .get_non_empty_or_default("Server", "bind_addr", "0.0.0.0:5000")
                .to_owned(),
            tls: cfg.get_bool_or("Server", "tls", false, log),
            cert_path: cfg
                .get_non_empty_or_default("TLS", "signaling_cert", "certs/signaling/cert.pem")
                .to_owned(),
            key_path: cfg
                .get_non_empty_or_default("TLS", "signaling_key", "certs/signaling/key.pem")
                .to_owned(),
            log_dir: cfg.get_non_empty("Logging", "server_log_path").map(PathBuf::from),
            log_filename: cfg
                .get_non_empty_or_default("Logging", "server_log_filename", "roomcall")
                .to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::log::{MemoryLogSink, NoopLogSink};

    const SAMPLE: &str = r#"
# roomcall server
bind_addr = "127.0.0.1:7000"

[Presence]
heartbeat_timeout_ms = 3000
grace_period_ms = oops

[Negotiation]
topology = relay
relay_id = "sfu-1"

[Calls]
max_group_participants = 8
"#;

    #[test]
    fn parse_reads_globals_and_sections() {
        let cfg = Config::parse(SAMPLE);
        assert_eq!(cfg.get_global("bind_addr"), Some("127.0.0.1:7000"));
        assert_eq!(cfg.get("Negotiation", "relay_id"), Some("sfu-1"));
        assert_eq!(cfg.get("Negotiation", "missing"), None);
    }

    #[test]
    fn call_config_resolves_values_and_defaults() {
        let log = MemoryLogSink::new();
        let cc = CallConfig::from_config(&Config::parse(SAMPLE), &log);

        assert_eq!(cc.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(cc.grace_period, Duration::from_secs(10));
        assert_eq!(cc.sweep_interval, Duration::from_secs(5));
        assert_eq!(
            cc.topology,
            Topology::Relay {
                relay_id: "sfu-1".into()
            }
        );
        assert_eq!(cc.max_group_participants, Some(8));
        assert!(log.contains("grace_period_ms"));
    }

    #[test]
    fn empty_config_yields_defaults() {
        let cc = CallConfig::from_config(&Config::empty(), &NoopLogSink);
        assert_eq!(cc, CallConfig::default());
    }

    #[test]
    fn server_config_falls_back_to_globals() {
        let sc = ServerConfig::from_config(&Config::parse(SAMPLE), &NoopLogSink);
        assert_eq!(sc.bind_addr, "127.0.0.1:7000");
        assert!(!sc.tls);
        assert_eq!(sc.cert_path, "certs/signaling/cert.pem");
        assert_eq!(sc.log_filename, "roomcall");
    }
}
