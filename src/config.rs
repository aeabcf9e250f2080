//! CLI surface for the controller binary: topology/schema paths, listen
//! address, report path, and logging options.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "fabric-controller", about = "SDN control plane for a programmable-switch fabric")]
pub struct Cli {
    /// Path to the declared topology JSON document.
    #[arg(long, env = "FABRIC_TOPOLOGY")]
    pub topology: PathBuf,

    /// Path to the device schema JSON document (table/action/digest/counter/register registry).
    #[arg(long, env = "FABRIC_SCHEMA")]
    pub schema: PathBuf,

    /// Path to the device-specific forwarding-pipeline config blob pushed alongside the schema.
    #[arg(long, env = "FABRIC_DEVICE_CONFIG")]
    pub device_config: PathBuf,

    /// Address the configuration-upload HTTP endpoint listens on.
    #[arg(long, env = "FABRIC_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: std::net::SocketAddr,

    /// Path the telemetry report is appended to.
    #[arg(long, env = "FABRIC_REPORT_PATH", default_value = "report.jsonl")]
    pub report_path: PathBuf,

    /// Where the normalized last-applied configuration is persisted.
    #[arg(long, env = "FABRIC_PERSIST_PATH", default_value = "parsed_data.json")]
    pub persist_path: PathBuf,

    #[arg(long, env = "FABRIC_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[arg(long, env = "FABRIC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        match self.log_format {
            LogFormat::Json => subscriber.json().init(),
            LogFormat::Text => subscriber.init(),
        }
    }
}
