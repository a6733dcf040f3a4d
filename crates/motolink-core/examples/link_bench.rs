//! Link bench tool
//!
//! Polls a few live parameters and, against the simulated ECU, runs a full
//! flash session. Useful for checking a cable or adapter before a real flash.
//!
//! Usage:
//!   cargo run --example link_bench -- [PORT]
//!
//! Without PORT a simulated ECU is used. Set `RUST_LOG=debug` for protocol
//! traces.

use motolink_core::prelude::*;
use motolink_core::sim::{SimConnector, SimulatedEcu};
use std::collections::BTreeSet;
use tracing_subscriber::EnvFilter;

const BENCH_KEY: &[u8] = &[0x4D, 0x4C, 0x01, 0x00];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port = std::env::args().nth(1);
    let (events, mut rx) = EventSender::channel(DEFAULT_EVENT_CAPACITY);

    let (link, port) = match port {
        Some(port) => (LinkManager::new(SerialConnector, events), port),
        None => {
            println!("No port given, using simulated ECU");
            println!("Physical ports:");
            for info in list_physical_ports() {
                println!("  {} ({})", info.name, info.description());
            }
            let ecu = SimulatedEcu::new()
                .with_parameter(0x10, 1450)
                .with_parameter(0x11, 42)
                .with_parameter(0x12, 1230)
                .with_parameter(0x20, 1470)
                .with_unlock_key(BENCH_KEY);
            (
                LinkManager::new(SimConnector::new("sim", ecu), events),
                "sim".to_string(),
            )
        }
    };

    if let Err(e) = link.connect(&port, LinkConfig::default()) {
        eprintln!("Connect to {port} failed: {e}");
        std::process::exit(1);
    }

    let reader = TelemetryReader::new(
        link.clone(),
        ParameterCatalog::motorcycle_defaults(),
        TelemetryConfig::default(),
    );
    let ids = BTreeSet::from([0x10, 0x11, 0x12, 0x20]);
    match reader.read_parameters(&ids) {
        Ok(reads) => {
            for read in reads {
                match read {
                    Ok(sample) => {
                        let name = reader
                            .catalog()
                            .get(sample.parameter_id)
                            .map_or("?", |def| def.name.as_str());
                        println!("  {name:<10} {:>10.2}", sample.decoded_value);
                    }
                    Err(e) => println!("  {e}"),
                }
            }
        }
        Err(e) => eprintln!("Telemetry unavailable: {e}"),
    }

    if port == "sim" {
        let flasher = FirmwareFlasher::new(
            link.clone(),
            FlashConfig {
                unlock_key: BENCH_KEY.to_vec(),
                ..FlashConfig::default()
            },
        );
        let image = FirmwareImage::new(vec![0xA5; 10_000]).padded(flasher.config().block_size);
        match flasher.flash(image, &CancellationToken::new()) {
            Ok(report) => println!(
                "Flashed {} blocks in {:?} (crc {:#010x}, {} retries)",
                report.total_blocks, report.elapsed, report.image_checksum, report.block_retries
            ),
            Err(e) => eprintln!("Flash failed: {e}"),
        }
    }

    link.disconnect();

    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    println!("{count} events received");
}
