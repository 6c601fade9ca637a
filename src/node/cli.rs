use clap::Parser;
use std::path::PathBuf;

use crate::node::config::{NodeConfig, load_node_config};

pub const DEFAULT_CONFIG: &str = "servernode.yaml";

#[derive(Debug, Parser)]
#[command(name = "servernode", version, about = "game server node daemon")]
pub struct Args {
    /// Path to node config YAML (missing default file means built-in defaults)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Override global.root_directory
    #[arg(long = "root")]
    pub root: Option<PathBuf>,

    /// Override socket.port
    #[arg(long = "port")]
    pub port: Option<u16>,

    /// Do not read commands from stdin
    #[arg(long = "no-console")]
    pub no_console: bool,

    /// Do not open the control socket
    #[arg(long = "no-socket")]
    pub no_socket: bool,
}

impl Args {
    /// Loads the config file and applies command line overrides.
    pub fn resolve_config(&self) -> anyhow::Result<NodeConfig> {
        let mut cfg = match &self.config {
            Some(path) => load_node_config(path, true)?,
            None => load_node_config(&PathBuf::from(DEFAULT_CONFIG), false)?,
        };
        if let Some(root) = &self.root {
            let installer_rel = cfg
                .installer_directory
                .strip_prefix(&cfg.root_directory)
                .map(|p| p.to_path_buf())
                .ok();
            cfg.root_directory = root.clone();
            if let Some(rel) = installer_rel {
                cfg.installer_directory = root.join(rel);
            }
        }
        if let Some(port) = self.port {
            cfg.socket.port = port;
        }
        if self.no_socket {
            cfg.socket.enabled = false;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "socket:\n  port: 12000\n").unwrap();
        let args = Args::parse_from([
            "servernode",
            "-c",
            path.to_str().unwrap(),
            "--root",
            "/srv/node",
            "--port",
            "12345",
            "--no-socket",
        ]);
        let cfg = args.resolve_config().unwrap();
        assert_eq!(cfg.socket.port, 12345);
        assert!(!cfg.socket.enabled);
        assert_eq!(cfg.root_directory, PathBuf::from("/srv/node"));
        assert!(cfg.installer_directory.starts_with("/srv/node"));
    }

    #[test]
    fn explicit_config_must_exist() {
        let args = Args::parse_from(["servernode", "-c", "/nonexistent/servernode.yaml"]);
        assert!(args.resolve_config().is_err());
    }
}
