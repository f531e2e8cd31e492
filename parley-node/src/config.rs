//! Node configuration, parsed from CLI flags and environment variables.

use std::path::PathBuf;

use clap::Parser;

/// Configuration for a parley node.
#[derive(Parser, Debug, Clone)]
#[command(name = "parley-node", version)]
#[command(about = "Decentralized peer-to-peer messaging node")]
pub struct NodeConfig {
    /// Preferred TCP listen port. Falls back to an ephemeral port when the
    /// requested one is already bound.
    #[arg(long, env = "PARLEY_PORT", default_value_t = 4001)]
    pub port: u16,

    /// Path to the message store. Defaults to `<data-dir>/parley.db`.
    #[arg(long, env = "PARLEY_DB")]
    pub db_path: Option<PathBuf>,

    /// Directory for the identity key and store.
    /// Defaults to the platform data dir (e.g. `~/.local/share/parley`).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Disable local-network (mDNS) peer discovery.
    #[arg(long)]
    pub no_mdns: bool,

    /// Peers to dial on startup, as `<multiaddr>/p2p/<peer-id>`.
    /// May be given multiple times.
    #[arg(long = "peer")]
    pub peers: Vec<String>,
}

impl NodeConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("parley.db"))
    }

    /// Create the data directory with owner-only permissions.
    pub fn ensure_data_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.data_dir();
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(dir)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_path_defaults_into_data_dir() {
        let config =
            NodeConfig::try_parse_from(["parley-node", "--data-dir", "/tmp/parley-test"]).unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/parley-test/parley.db"));

        let config = NodeConfig::try_parse_from([
            "parley-node",
            "--db-path",
            "/elsewhere/store.db",
        ])
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/elsewhere/store.db"));
    }

    #[test]
    fn repeated_peer_flags_accumulate() {
        let config = NodeConfig::try_parse_from([
            "parley-node",
            "--peer",
            "/ip4/10.0.0.1/tcp/4001/p2p/AAA",
            "--peer",
            "/ip4/10.0.0.2/tcp/4001/p2p/BBB",
        ])
        .unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.port, 4001);
    }
}
