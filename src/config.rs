//! Launch configuration: per-device host/port, the actor's listen port, and
//! the log directory (spec.md 6, "Configuration"). No environment variables
//! are required, but `clap`'s `env` support is wired up the way the teacher's
//! `ServiceArgs` does it, so operators may override flags via environment if
//! they prefer.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{ActorError, Result};

/// Host/port pair for a single remote device controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "du Pont 2.5m telescope device-mediation actor")]
pub struct ActorArgs {
    /// Optional YAML config file; flags below override values loaded from it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "TCC_TCS_HOST")]
    pub tcs_host: Option<String>,
    #[arg(long, env = "TCC_TCS_PORT")]
    pub tcs_port: Option<u16>,

    #[arg(long, env = "TCC_SCALE_HOST")]
    pub scale_host: Option<String>,
    #[arg(long, env = "TCC_SCALE_PORT")]
    pub scale_port: Option<u16>,

    #[arg(long, env = "TCC_M2_HOST")]
    pub m2_host: Option<String>,
    #[arg(long, env = "TCC_M2_PORT")]
    pub m2_port: Option<u16>,

    /// Port on which the actor listens for a single operator connection.
    #[arg(long, env = "TCC_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Directory for the actor's log file.
    #[arg(long, env = "TCC_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}

/// Fully resolved configuration, after merging an optional YAML file with
/// CLI/env overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    pub tcs: DeviceEndpoint,
    pub scale: DeviceEndpoint,
    pub m2: DeviceEndpoint,
    pub listen_port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
}

/// Partial config as read from an on-disk YAML file; every field is
/// optional so the file only needs to specify what it overrides.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    tcs_host: Option<String>,
    tcs_port: Option<u16>,
    scale_host: Option<String>,
    scale_port: Option<u16>,
    m2_host: Option<String>,
    m2_port: Option<u16>,
    listen_port: Option<u16>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

impl ActorConfig {
    pub fn from_args(args: ActorArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ActorError::Config(format!("reading {}: {e}", path.display()))
                })?;
                serde_yaml::from_str::<FileConfig>(&text)
                    .map_err(|e| ActorError::Config(format!("parsing {}: {e}", path.display())))?
            }
            None => FileConfig::default(),
        };

        let tcs_host = args.tcs_host.or(file.tcs_host).ok_or_else(|| {
            ActorError::Config("tcs host not specified (--tcs-host or config file)".into())
        })?;
        let tcs_port = args.tcs_port.or(file.tcs_port).ok_or_else(|| {
            ActorError::Config("tcs port not specified (--tcs-port or config file)".into())
        })?;
        let scale_host = args.scale_host.or(file.scale_host).ok_or_else(|| {
            ActorError::Config("scale host not specified (--scale-host or config file)".into())
        })?;
        let scale_port = args.scale_port.or(file.scale_port).ok_or_else(|| {
            ActorError::Config("scale port not specified (--scale-port or config file)".into())
        })?;
        let m2_host = args.m2_host.or(file.m2_host).ok_or_else(|| {
            ActorError::Config("m2 host not specified (--m2-host or config file)".into())
        })?;
        let m2_port = args.m2_port.or(file.m2_port).ok_or_else(|| {
            ActorError::Config("m2 port not specified (--m2-port or config file)".into())
        })?;

        Ok(Self {
            tcs: DeviceEndpoint {
                host: tcs_host,
                port: tcs_port,
            },
            scale: DeviceEndpoint {
                host: scale_host,
                port: scale_port,
            },
            m2: DeviceEndpoint {
                host: m2_host,
                port: m2_port,
            },
            // Flags override the file, and the file overrides these
            // built-in defaults (spec.md 6 ambient addition: "an optional
            // YAML config file overridable by flags").
            listen_port: args.listen_port.or(file.listen_port).unwrap_or(2600),
            log_dir: args.log_dir.or(file.log_dir).unwrap_or_else(|| PathBuf::from("logs")),
            log_level: args.log_level.or(file.log_level).unwrap_or_else(|| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> ActorArgs {
        ActorArgs {
            config: None,
            tcs_host: Some("tcshost".into()),
            tcs_port: Some(1000),
            scale_host: Some("scalehost".into()),
            scale_port: Some(1001),
            m2_host: Some("m2host".into()),
            m2_port: Some(1002),
            listen_port: None,
            log_dir: None,
            log_level: None,
        }
    }

    #[test]
    fn resolves_from_cli_args_alone() {
        let cfg = ActorConfig::from_args(base_args()).unwrap();
        assert_eq!(cfg.tcs.host, "tcshost");
        assert_eq!(cfg.scale.port, 1001);
        assert_eq!(cfg.listen_port, 2600);
    }

    #[test]
    fn explicit_listen_port_flag_overrides_default() {
        let mut args = base_args();
        args.listen_port = Some(9999);
        let cfg = ActorConfig::from_args(args).unwrap();
        assert_eq!(cfg.listen_port, 9999);
    }

    #[test]
    fn missing_host_is_a_config_error() {
        let mut args = base_args();
        args.tcs_host = None;
        assert!(ActorConfig::from_args(args).is_err());
    }
}
