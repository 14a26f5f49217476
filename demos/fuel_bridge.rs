//! Fuel level telemetry bridge example
//!
//! Connects to a fuel level sensor, follows its level through notifications,
//! and sends a telemetry record to the collectors for every location fix.
//! Location fixes are synthetic, one every few seconds along a short track.
//!
//! Run with: cargo run --example fuel_bridge -- --address AA:BB:CC:DD:EE:FF
//!
//! Options:
//!   --device-id 0A1B2C     Six hex character device id
//!   --host 192.168.1.20    Collector host for the override slot

use ble_fuel_telemetry::{
    callback_channel, BtleplugBackend, ConnectionStateMachine, Error, LocationFix,
    PeripheralAddress, Result, TelemetryBridge, TelemetryConfig,
};
use std::time::Duration;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,ble_fuel_telemetry=debug")),
        )
        .init();

    println!("Fuel Level Telemetry Bridge");
    println!("===========================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let address = arg_value(&args, "--address").ok_or_else(|| Error::InvalidParameter {
        name: "--address".to_string(),
        value: "<missing>".to_string(),
    })?;
    let device_id = arg_value(&args, "--device-id").unwrap_or_else(|| "0A1B2C".to_string());

    let mut config = TelemetryConfig::default().with_device_id(device_id);
    if let Some(host) = arg_value(&args, "--host") {
        config = config.with_host_override(host);
    }

    let (sink, rx) = callback_channel();
    let backend = BtleplugBackend::from_default_adapter(sink.clone())
        .await?
        .with_connect_timeout(Duration::from_secs(15));
    let machine = ConnectionStateMachine::new(backend, sink);
    let event_loop = machine.spawn_event_loop(rx);

    let bridge = TelemetryBridge::new(&machine, &config);

    let _events = machine.register_listener(|event| {
        println!("[{}] {:?}", event.address, event.kind);
    });

    let address = PeripheralAddress::from(address);
    println!("Connecting to {}...\n", address);
    bridge.connect(&address)?;

    println!("Sending to:");
    for host in bridge.roster().hosts() {
        println!("  {}:{}", host, bridge.roster().port());
    }
    println!();

    let mut latitude = 37.7749;
    let mut longitude = -122.4194;

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_secs(3)).await;

        latitude += 0.0005;
        longitude -= 0.0003;
        let fix = LocationFix::now(latitude, longitude);

        match bridge.on_location(&fix).await {
            Ok(report) => {
                println!(
                    "Fix ({:.4}, {:.4}): delivered to {} host(s)",
                    latitude,
                    longitude,
                    report.delivered.len()
                );
                for failure in &report.failures {
                    println!("  {}", failure);
                }
            }
            Err(Error::NoFuelDataYet) => println!("Waiting for fuel level..."),
            Err(e) => println!("Telemetry skipped: {}", e),
        }
    }

    println!("\nDisconnecting...");
    bridge.disconnect(&address);
    tokio::time::sleep(Duration::from_millis(500)).await;

    drop(bridge);
    drop(machine);
    let _ = tokio::time::timeout(Duration::from_secs(2), event_loop).await;

    Ok(())
}
