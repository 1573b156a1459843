//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Group relay used until the user picks another one.
pub const DEFAULT_GROUP_RELAY: &str = "wss://groups.fiatjaf.com";
/// Metadata relays tried in order.
pub const DEFAULT_METADATA_RELAYS: &[&str] = &["wss://relay.damus.io"];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Group relay adopted when nothing is persisted, e.g. `wss://groups.fiatjaf.com`.
    pub group_relay: String,
    /// Ordered metadata relays; the next one is tried when a connect fails.
    pub metadata_relays: Vec<String>,
    /// File backing the key-value store.
    pub store_path: PathBuf,
    /// Drop inbound events whose id or Schnorr signature does not check out.
    pub verify_sig: bool,
    /// Optional SOCKS5 proxy (host:port) for all relay sockets.
    pub tor_socks: Option<String>,
    /// How long to wait for the joined-groups record.
    pub membership_timeout: Duration,
    /// Poll granularity of the membership wait loop.
    pub membership_poll: Duration,
    /// Pause after the metadata relay opens before requesting membership.
    pub metadata_settle: Duration,
    /// Upper bound on opening a relay socket.
    pub connect_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            group_relay: DEFAULT_GROUP_RELAY.into(),
            metadata_relays: DEFAULT_METADATA_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            store_path: PathBuf::from("relaygroups-data/store.json"),
            verify_sig: true,
            tor_socks: None,
            membership_timeout: Duration::from_millis(5000),
            membership_poll: Duration::from_millis(500),
            metadata_settle: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load settings from the specified `.env` file. Unset keys keep their defaults.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let defaults = Self::default();
        let group_relay = non_empty("GROUP_RELAY").unwrap_or(defaults.group_relay);
        let metadata_relays = match non_empty("METADATA_RELAYS") {
            Some(v) => csv_strings(v),
            None => defaults.metadata_relays,
        };
        if metadata_relays.is_empty() {
            anyhow::bail!("METADATA_RELAYS must name at least one relay");
        }
        let store_path = non_empty("STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.store_path);
        let verify_sig = non_empty("VERIFY_SIG")
            .map(|v| v == "1")
            .unwrap_or(defaults.verify_sig);
        let tor_socks = non_empty("TOR_SOCKS");
        Ok(Self {
            group_relay,
            metadata_relays,
            store_path,
            verify_sig,
            tor_socks,
            membership_timeout: millis("MEMBERSHIP_TIMEOUT_MS", defaults.membership_timeout)?,
            membership_poll: millis("MEMBERSHIP_POLL_MS", defaults.membership_poll)?,
            metadata_settle: millis("METADATA_SETTLE_MS", defaults.metadata_settle)?,
            connect_timeout: millis("CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn millis(key: &str, default: Duration) -> Result<Duration> {
    match non_empty(key) {
        Some(v) => {
            let ms: u64 = v.parse().with_context(|| format!("{key} must be milliseconds"))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 9] = [
        "GROUP_RELAY",
        "METADATA_RELAYS",
        "STORE_PATH",
        "VERIFY_SIG",
        "TOR_SOCKS",
        "MEMBERSHIP_TIMEOUT_MS",
        "MEMBERSHIP_POLL_MS",
        "METADATA_SETTLE_MS",
        "CONNECT_TIMEOUT_MS",
    ];

    fn clear_env() {
        for v in VARS.iter() {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "GROUP_RELAY=wss://groups.example\n",
                "METADATA_RELAYS=wss://m1, wss://m2\n",
                "STORE_PATH=/tmp/rg/store.json\n",
                "VERIFY_SIG=0\n",
                "TOR_SOCKS=127.0.0.1:9050\n",
                "MEMBERSHIP_TIMEOUT_MS=250\n",
                "MEMBERSHIP_POLL_MS=25\n",
                "METADATA_SETTLE_MS=0\n",
                "CONNECT_TIMEOUT_MS=1500\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.group_relay, "wss://groups.example");
        assert_eq!(cfg.metadata_relays, vec!["wss://m1", "wss://m2"]);
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/rg/store.json"));
        assert!(!cfg.verify_sig);
        assert_eq!(cfg.tor_socks.as_deref(), Some("127.0.0.1:9050"));
        assert_eq!(cfg.membership_timeout, Duration::from_millis(250));
        assert_eq!(cfg.membership_poll, Duration::from_millis(25));
        assert_eq!(cfg.metadata_settle, Duration::ZERO);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "TOR_SOCKS=\nGROUP_RELAY=\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.group_relay, DEFAULT_GROUP_RELAY);
        assert_eq!(cfg.metadata_relays, vec![DEFAULT_METADATA_RELAYS[0]]);
        assert!(cfg.tor_socks.is_none());
        assert!(cfg.verify_sig);
        assert_eq!(cfg.membership_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.membership_poll, Duration::from_millis(500));
    }

    #[test]
    fn invalid_timeout_is_an_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "MEMBERSHIP_TIMEOUT_MS=soon\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn empty_metadata_list_is_an_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "METADATA_RELAYS= , ,\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn missing_env_file_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        assert!(Settings::from_env("/definitely/not/here/.env").is_err());
    }

    #[test]
    fn csv_strings_skip_blanks() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
