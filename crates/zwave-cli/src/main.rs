//! zwave-cli - talk to a Z-Wave controller from the command line
//!
//! Connects to a USB stick or UART controller, runs one command through the
//! driver's transmission pipeline and prints the result.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use zwave_driver::{
    find_controller_device, list_available_devices, Driver, DriverConfig, GetControllerVersion,
    InboundFrame, InterfaceConfig, Message, NodeId, NodeStatusTable, Priority, RetryNotice,
    SerialInterface, TransmitReply,
};

#[derive(Parser)]
#[command(name = "zwave-cli")]
#[command(about = "Send commands to a Z-Wave controller")]
struct Args {
    /// Serial port of the controller (auto-detected when omitted)
    #[arg(long, short)]
    port: Option<PathBuf>,

    /// Baud rate
    #[arg(long, default_value_t = zwave_driver::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Driver configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ping one or more nodes
    Ping {
        /// Node ids
        #[arg(required = true)]
        nodes: Vec<u8>,
    },
    /// Print the controller's library version
    Version,
    /// List serial ports
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Command::List = args.command {
        let devices = list_available_devices();
        if devices.is_empty() {
            println!("No serial ports found");
        }
        for device in devices {
            let marker = if device.is_likely_controller { "*" } else { " " };
            println!("{} {}", marker, device);
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<DriverConfig>(&raw)?
        }
        None => DriverConfig::default(),
    };
    config.validate()?;

    // --port wins over the config file, which wins over detection
    let configured = match &config.interface {
        InterfaceConfig::Serial { port, .. } => port.clone(),
    };
    let port = match (args.port.clone(), args.config.is_some()) {
        (Some(port), _) => port,
        (None, true) => configured,
        (None, false) => match find_controller_device() {
            Some(found) => PathBuf::from(found),
            None => anyhow::bail!("No Z-Wave controller found, pass --port"),
        },
    };
    config.interface = InterfaceConfig::Serial {
        port: port.clone(),
        baud_rate: args.baud,
    };
    info!(port = %port.display(), baud = args.baud, "Using controller");

    let interface = SerialInterface::new(&port).with_baud_rate(args.baud);
    let (driver, handle) = Driver::new(interface, &config, Arc::new(NodeStatusTable::new()));
    let driver = driver
        .with_retry_callback(Arc::new(|notice: &RetryNotice| {
            info!(
                command = %notice.command,
                attempt = notice.attempt,
                max_attempts = notice.max_attempts,
                delay_ms = notice.delay.as_millis() as u64,
                reason = %notice.reason,
                "Retrying"
            );
        }))
        .with_unsolicited_callback(Arc::new(|frame: &InboundFrame| {
            tracing::debug!(?frame, "Unsolicited frame");
        }));
    let task = tokio::spawn(driver.run());

    let mut failures = 0;
    match args.command {
        Command::Ping { nodes } => {
            for node in nodes {
                let node = NodeId(node);
                match handle.ping(node).await {
                    Ok(TransmitReply::NodeInfo(_)) => println!("{}: alive (node information)", node),
                    Ok(_) => println!("{}: alive", node),
                    Err(e) => {
                        failures += 1;
                        println!("{}: {}", node, e);
                    }
                }
            }
        }
        Command::Version => {
            let reply = handle
                .send_with_priority(Message::controller(GetControllerVersion), Priority::Controller)
                .await;
            match reply {
                Ok(TransmitReply::Controller(frame)) => {
                    match GetControllerVersion::parse_version(&frame) {
                        Some(version) => println!("{}", version),
                        None => {
                            failures += 1;
                            warn!("Malformed version response");
                        }
                    }
                }
                Ok(other) => {
                    failures += 1;
                    warn!(?other, "Unexpected reply");
                }
                Err(e) => {
                    failures += 1;
                    println!("Version query failed: {}", e);
                }
            }
        }
        Command::List => {}
    }

    if let Ok(stats) = handle.stats().await {
        info!(
            writes = stats.pipeline.writes,
            serial_retries = stats.pipeline.serial_retries,
            send_data_retries = stats.pipeline.send_data_retries,
            "Done"
        );
    }
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Driver already stopped");
    }
    task.await??;

    if failures > 0 {
        anyhow::bail!("{} command(s) failed", failures);
    }
    Ok(())
}
