use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the data-entry web server.
///
/// Every flag can also come from the environment, so the server starts with
/// no arguments in a container.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Trial data-entry web server", long_about = None)]
pub struct ServerConfig {
    /// SQLite database file (created when missing)
    #[arg(long, env = "TRIALSHEET_DB", default_value = "trialsheet.db")]
    pub db: PathBuf,

    /// Address to listen on
    #[arg(long, env = "TRIALSHEET_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Hours a login session stays valid
    #[arg(long, env = "TRIALSHEET_SESSION_HOURS", default_value_t = 24)]
    pub session_hours: u64,
}

impl ServerConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_hours * 60 * 60)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            db: PathBuf::from("trialsheet.db"),
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            session_hours: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config =
            ServerConfig::try_parse_from(["trialsheet", "--db", "/tmp/x.db", "--session-hours", "2"])
                .unwrap();
        assert_eq!(config.db, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.session_ttl(), Duration::from_secs(7200));
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        assert!(ServerConfig::try_parse_from(["trialsheet", "--bind", "nowhere"]).is_err());
    }

    #[test]
    fn default_matches_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.session_ttl(), Duration::from_secs(24 * 3600));
    }
}
