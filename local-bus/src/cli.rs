use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{BusConfig, ElectionGate};
use crate::error::BusError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory for the bus socket and lock file. Defaults to $LOCAL_BUS_DIR,
    /// then the system temp directory.
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// How the hub is chosen.
    #[arg(long, value_enum, default_value_t = Gate::Lock)]
    pub gate: Gate,

    /// Print one JSON object per event instead of plain text.
    #[arg(long)]
    pub json: bool,

    /// How long to wait for a query response.
    #[arg(long, default_value_t = 200)]
    pub timeout_ms: u64,

    /// Name of the bus to board.
    pub bus: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Broadcast stdin lines and print bus traffic. `/query <text>` asks the bus.
    Join,
    /// Send every stdin line as a query and show raw query traffic.
    Inspect,
    /// Answer every query seen on the bus.
    Respond(RespondArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RespondArgs {
    /// Text put in front of the query payload to form the answer.
    #[arg(long, default_value = "")]
    pub prefix: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Exclusive lock on `<bus>.lock` decides the hub.
    Lock,
    /// Binding the socket decides the hub.
    Endpoint,
}

impl From<Gate> for ElectionGate {
    fn from(gate: Gate) -> Self {
        match gate {
            Gate::Lock => ElectionGate::LockFile,
            Gate::Endpoint => ElectionGate::Endpoint,
        }
    }
}

impl Cli {
    pub fn bus_config(&self) -> Result<BusConfig, BusError> {
        let mut config = BusConfig::new(self.bus.clone())?
            .gate(self.gate.into())
            .query_messages(matches!(self.command, Command::Inspect));
        if let Some(dir) = &self.dir {
            config = config.socket_dir(dir);
        }
        Ok(config)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_respond_with_options() {
        let cli = Cli::try_parse_from([
            "local_bus",
            "--dir",
            "/tmp/buses",
            "--gate",
            "endpoint",
            "--timeout-ms",
            "50",
            "demo",
            "respond",
            "--prefix",
            "re:",
        ])
        .expect("valid arguments");

        assert_eq!(cli.bus, "demo");
        assert_eq!(cli.gate, Gate::Endpoint);
        assert_eq!(cli.query_timeout(), Duration::from_millis(50));
        match &cli.command {
            Command::Respond(args) => assert_eq!(args.prefix, "re:"),
            other => panic!("unexpected command: {other:?}"),
        }

        let config = cli.bus_config().unwrap();
        assert_eq!(config.dir(), std::path::Path::new("/tmp/buses"));
    }

    #[test]
    fn defaults_to_lock_gate_and_200ms() {
        let cli = Cli::try_parse_from(["local_bus", "demo", "join"]).unwrap();
        assert_eq!(cli.gate, Gate::Lock);
        assert!(!cli.json);
        assert_eq!(cli.query_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn bus_name_is_required() {
        assert!(Cli::try_parse_from(["local_bus", "join"]).is_err());
    }
}
