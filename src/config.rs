//! Startup configuration for a room server.
//!
//! Settings are layered with the `config` crate: built-in defaults, then
//! `ROOM_`-prefixed environment variables, then the positional process
//! arguments `<roomId> <roomName> [bindAddress] [port]`.

use clap::{Arg, ArgAction, Command};
use config::{Config, Environment};
use serde::Deserialize;
use std::{
    ffi::OsString,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
};

use crate::server::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::utils::error::BrokerError;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;

/// Command line arguments parsed from the supervisor's invocation.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub room_id: String,
    pub room_name: String,
    /// Optional override for the bind address
    pub bind_address: Option<String>,
    /// Raw port argument; kept as text so a bad value can fall back to the default
    pub port: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Directory for the per-room log file
    pub log_dir: Option<PathBuf>,
}

impl CliArgs {
    fn command() -> Command {
        Command::new("room-broker")
            .about("Newline-delimited JSON broadcast server for a single room")
            .arg(
                Arg::new("room_id")
                    .value_name("ROOM_ID")
                    .help("Room identifier")
                    .required(true),
            )
            .arg(
                Arg::new("room_name")
                    .value_name("ROOM_NAME")
                    .help("Display name of the room")
                    .required(true),
            )
            .arg(
                Arg::new("bind_address")
                    .value_name("BIND_ADDRESS")
                    .help("Address to listen on (default 0.0.0.0)"),
            )
            .arg(
                Arg::new("port")
                    .value_name("PORT")
                    .help("Port to listen on (default 3000)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("log-dir")
                    .long("log-dir")
                    .value_name("DIR")
                    .help("Also write logs to <DIR>/room_<ROOM_ID>_<PORT>.log"),
            )
    }

    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Parses an explicit argument list (the first item is the program name).
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Self::from_matches(&Self::command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Self {
            room_id: matches.get_one::<String>("room_id").cloned().unwrap_or_default(),
            room_name: matches.get_one::<String>("room_name").cloned().unwrap_or_default(),
            bind_address: matches.get_one::<String>("bind_address").cloned(),
            port: matches.get_one::<String>("port").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            log_dir: matches.get_one::<String>("log-dir").map(PathBuf::from),
        }
    }

    /// The port argument, if one was given and parses.
    pub fn parsed_port(&self) -> Option<u16> {
        self.port.as_deref().and_then(|p| p.trim().parse().ok())
    }

    /// The port argument, if one was given but does not parse.
    pub fn invalid_port(&self) -> Option<&str> {
        match self.port.as_deref() {
            Some(p) if self.parsed_port().is_none() => Some(p),
            _ => None,
        }
    }
}

/// Immutable settings for one room server.
#[derive(Debug, Deserialize, Clone)]
pub struct RoomServerConfig {
    pub room_id: String,
    /// Display name, echoed in `welcome` and the startup status line.
    pub room_name: String,
    pub bind_address: String,
    pub port: u16,
    /// Largest accepted frame, delimiter excluded.
    pub max_frame_length: usize,
    /// Whether a `broadcast` message is also delivered back to its sender.
    pub broadcast_includes_sender: bool,
}

impl RoomServerConfig {
    /// Builds a configuration with every optional setting at its default.
    pub fn new(room_id: impl Into<String>, room_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            room_name: room_name.into(),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            broadcast_includes_sender: false,
        }
    }

    /// Loads the configuration from defaults, `ROOM_*` environment variables and `args`.
    ///
    /// # Errors
    /// Returns a `BrokerError::ConfigurationError` if the layers cannot be merged.
    pub fn load(args: &CliArgs) -> Result<Self, BrokerError> {
        Self::build(
            args,
            Some(Environment::with_prefix("ROOM").try_parsing(true)),
        )
    }

    fn build(args: &CliArgs, env: Option<Environment>) -> Result<Self, BrokerError> {
        let mut builder = Config::builder()
            .set_default("bind_address", DEFAULT_BIND_ADDRESS)?
            .set_default("port", i64::from(DEFAULT_PORT))?
            .set_default("max_frame_length", DEFAULT_MAX_FRAME_LENGTH as i64)?
            .set_default("broadcast_includes_sender", false)?;

        if let Some(env) = env {
            builder = builder.add_source(env);
        }

        builder
            .set_override("room_id", args.room_id.clone())?
            .set_override("room_name", args.room_name.clone())?
            .set_override_option("bind_address", args.bind_address.clone())?
            .set_override_option("port", args.parsed_port().map(i64::from))?
            .build()?
            .try_deserialize()
            .map_err(BrokerError::from)
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `BrokerError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.room_id.trim().is_empty() {
            return Err(BrokerError::ConfigurationError("room_id must not be empty".into()));
        }
        if self.room_name.trim().is_empty() {
            return Err(BrokerError::ConfigurationError("room_name must not be empty".into()));
        }
        if self.max_frame_length == 0 {
            return Err(BrokerError::ConfigurationError(
                "max_frame_length must be greater than 0".into(),
            ));
        }
        self.socket_addr().map(|_| ())
    }

    /// Resolves `bind_address:port` to the address the listener binds.
    pub fn socket_addr(&self) -> Result<SocketAddr, BrokerError> {
        (self.bind_address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                BrokerError::ConfigurationError(format!(
                    "Invalid bind address {}: {}",
                    self.bind_address, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                BrokerError::ConfigurationError(format!(
                    "Bind address {} resolved to nothing",
                    self.bind_address
                ))
            })
    }

    /// File name of the per-room log.
    pub fn log_file_name(&self) -> String {
        format!("room_{}_{}.log", self.room_id, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("room-broker").chain(list.iter().copied())).unwrap()
    }

    #[test]
    fn positional_arguments_with_defaults() {
        let config = RoomServerConfig::build(&args(&["r1", "Lobby"]), None).unwrap();
        assert_eq!(config.room_id, "r1");
        assert_eq!(config.room_name, "Lobby");
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert!(!config.broadcast_includes_sender);
        config.validate().unwrap();
    }

    #[test]
    fn bind_address_and_port_override() {
        let config = RoomServerConfig::build(&args(&["r1", "Lobby", "127.0.0.1", "4100"]), None).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.port, 4100);
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:4100".parse().unwrap());
        assert_eq!(config.log_file_name(), "room_r1_4100.log");
    }

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<::config::Map<String, String>>();
        Environment::with_prefix("ROOM")
            .try_parsing(true)
            .source(Some(source))
    }

    #[test]
    fn environment_overrides_defaults() {
        let vars = [
            ("ROOM_BIND_ADDRESS", "127.0.0.1"),
            ("ROOM_PORT", "4200"),
            ("ROOM_MAX_FRAME_LENGTH", "64"),
            ("ROOM_BROADCAST_INCLUDES_SENDER", "true"),
        ];
        let config = RoomServerConfig::build(&args(&["r1", "Lobby"]), Some(env(&vars))).unwrap();

        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.port, 4200);
        assert_eq!(config.max_frame_length, 64);
        assert!(config.broadcast_includes_sender);
    }

    #[test]
    fn arguments_override_environment() {
        let vars = [("ROOM_BIND_ADDRESS", "127.0.0.1"), ("ROOM_PORT", "4200")];
        let cli = args(&["r1", "Lobby", "0.0.0.0", "4100"]);
        let config = RoomServerConfig::build(&cli, Some(env(&vars))).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 4100);
        assert_eq!(config.room_id, "r1");

        // A bad port argument leaves the environment's port in place.
        let cli = args(&["r1", "Lobby", "0.0.0.0", "nope"]);
        let config = RoomServerConfig::build(&cli, Some(env(&vars))).unwrap();
        assert_eq!(config.port, 4200);
    }

    #[test]
    fn unparsable_port_falls_back() {
        let cli = args(&["r1", "Lobby", "127.0.0.1", "not-a-port"]);
        assert_eq!(cli.invalid_port(), Some("not-a-port"));

        let config = RoomServerConfig::build(&cli, None).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn room_id_and_name_are_required() {
        assert!(CliArgs::try_parse_from(["room-broker"]).is_err());
        assert!(CliArgs::try_parse_from(["room-broker", "r1"]).is_err());
    }

    #[test]
    fn logging_flags() {
        let cli = args(&["r1", "Lobby", "--json-logs", "--log-level", "debug", "--log-dir", "/tmp/rooms"]);
        assert!(cli.json_logs);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_dir, Some(PathBuf::from("/tmp/rooms")));
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut config = RoomServerConfig::new("r1", "Lobby");
        config.bind_address = "not an address".into();
        assert!(matches!(config.validate(), Err(BrokerError::ConfigurationError(_))));

        let mut config = RoomServerConfig::new(" ", "Lobby");
        assert!(config.validate().is_err());
        config.room_id = "r1".into();
        config.max_frame_length = 0;
        assert!(config.validate().is_err());
    }
}
