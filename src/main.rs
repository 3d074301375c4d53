//! # Room Broker
//!
//! One broadcast server per room, spawned by the dashboard as
//! `room-broker <roomId> <roomName> [bindAddress] [port]`.
//!
//! On a successful bind a single JSON status line is printed to stdout:
//! `{"status":"started","room_id":...,"room_name":...,"ip":...,"port":...}`.
//! Everything else the process says goes to the log on stderr.
//!
//! Exit status is 0 after a SIGINT/SIGTERM shutdown and 1 on any startup
//! failure or panic.

use std::io::Write;
use tracing::{error, warn};

use room_broker::{config::RoomServerConfig, logging, server::signals, CliArgs, RoomServer};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();

    let args = CliArgs::parse();
    let config = RoomServerConfig::load(&args)?;
    let log_guard = logging::setup_logging(&args, &config)?;

    // A panic on any task takes the whole room down; the supervisor restarts it.
    logging::exit_on_panic(log_guard.clone());

    if let Some(port) = args.invalid_port() {
        warn!("Ignoring invalid port argument {:?}, using {}", port, config.port);
    }

    let server = match RoomServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Room server failed to start: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = signals::shutdown_signal()?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", server.status_line()?)?;
    stdout.flush()?;
    drop(stdout);

    server.serve(shutdown).await?;
    Ok(())
}
