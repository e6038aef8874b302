//! rtu-poll: poll one slave on a serial port and print its register table
//!
//! Example: rtu-poll /dev/ttyUSB0 --baud 19200 --slave 3 --entries 8 --cycles 5
//!
//! Log verbosity follows `--log-level` / `RUST_LOG` (default `info`).

use std::time::Duration;

use clap::Parser;
use rtu_master::constants::DEFAULT_SLAVE_ID;
use rtu_master::transport::DEFAULT_BAUD_RATE;
use rtu_master::{
    CallbackLogger, LogLevel, MasterConfig, RegisterEntry, RtuMaster, SerialConfig,
    TokioSerialChannel,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Poll a Modbus RTU slave and print its registers")]
struct Args {
    /// Serial port (e.g., /dev/ttyUSB0, COM3)
    port: String,

    /// Baud rate
    #[clap(short = 'b', long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Slave id (1-247)
    #[clap(short = 's', long, default_value_t = DEFAULT_SLAVE_ID)]
    slave: u8,

    /// Entries polled per register kind, addressed from 0
    #[clap(short = 'n', long, default_value_t = 4)]
    entries: u16,

    /// Number of cycles to run
    #[clap(short = 'c', long, default_value_t = 1)]
    cycles: u32,

    /// Period between cycles in milliseconds
    #[clap(long, default_value_t = 1000)]
    period_ms: u64,

    /// Log every request and response frame
    #[clap(long)]
    packets: bool,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

fn print_table(entries: &[RegisterEntry]) {
    println!("{:>7}  {:<16} {:>8}  status", "address", "kind", "value");
    for entry in entries {
        let value = entry
            .value
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = match &entry.error {
            Some(err) => err.to_string(),
            None => "ok".to_string(),
        };
        println!(
            "{:>7}  {:<16} {:>8}  {}",
            entry.address,
            entry.kind.to_string(),
            value,
            status
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = MasterConfig::new()
        .with_entries_per_kind(args.entries)
        .with_slave_id(args.slave);
    if args.packets {
        config = config.with_packet_logger(CallbackLogger::tracing(LogLevel::Debug));
    }

    let master = RtuMaster::new(config)?;
    let serial = SerialConfig::new(args.baud);
    if !serial.is_standard_baud_rate() {
        tracing::warn!("{} baud is not a standard rate", args.baud);
    }
    master
        .connect(TokioSerialChannel::new(args.port.as_str()), &serial)
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(args.period_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    for _ in 0..args.cycles {
        ticker.tick().await;
        let report = master.update().await?;
        println!(
            "\ncycle {}: {} ok, {} failed in {:?}",
            report.cycle,
            report.reads_ok + report.writes_ok,
            report.failures(),
            report.elapsed
        );
        print_table(&master.registers());

        if let Some(err) = report.transport_error {
            eprintln!("serial link lost: {}", err);
            break;
        }
    }

    if let Some(stats) = master.transport_stats() {
        println!(
            "\n{} requests, {} responses, {} timeouts, {} errors",
            stats.requests_sent, stats.responses_received, stats.timeouts, stats.errors
        );
    }
    master.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["rtu-poll", "/dev/ttyUSB0"]).unwrap();
        assert_eq!(args.port, "/dev/ttyUSB0");
        assert_eq!(args.baud, 57600);
        assert_eq!(args.slave, 10);
        assert_eq!(args.cycles, 1);
        assert!(!args.packets);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::try_parse_from([
            "rtu-poll", "COM3", "--baud", "9600", "-s", "3", "--entries", "8", "--period-ms", "250",
            "--packets",
        ])
        .unwrap();
        assert_eq!(args.baud, 9600);
        assert_eq!(args.slave, 3);
        assert_eq!(args.entries, 8);
        assert_eq!(args.period_ms, 250);
        assert!(args.packets);
    }

    #[test]
    fn test_args_rejected() {
        assert!(Args::try_parse_from(["rtu-poll"]).is_err());
        assert!(Args::try_parse_from(["rtu-poll", "COM3", "--slave", "300"]).is_err());
    }
}
