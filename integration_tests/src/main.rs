//! Integration tests for SPatch firmware.
//!
//! Run against a flashed device advertising as "SPatch-XXXXXX". Exercises
//! the vitals service over a real BLE link: control-point validation,
//! subscriptions, and the simulated heart-rate and battery streams.

mod ble_client;

use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use ble_client::{
    VitalsClient, BATTERY_LEVEL_UUID, CONTROL_POINT_UUID, DB_UUID,
    HEART_RATE_MEASUREMENT_UUID, LIVE_UUID, MOTION_UUID,
};

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "Integration tests for SPatch firmware")]
struct Args {
    /// Device name prefix to scan for
    #[arg(long, default_value = "SPatch-")]
    name_prefix: String,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("{}", "SPatch Integration Tests".bold());
    println!("Scanning for \"{}*\"...", args.name_prefix);

    let device = VitalsClient::connect_by_prefix(
        &args.name_prefix,
        Duration::from_secs(args.scan_timeout),
    )
    .await?;
    println!("{}", "Connected!".green());

    println!("\n{}", "Running tests...".bold());
    println!();

    let mut passed = 0;
    let mut failed = 0;

    macro_rules! run_test {
        ($name:expr, $test:expr) => {
            print!("  Test: {} ... ", $name);
            std::io::Write::flush(&mut std::io::stdout())?;
            match $test.await {
                Ok(()) => {
                    println!("{}", "PASS".green().bold());
                    passed += 1;
                }
                Err(e) => {
                    println!("{}", "FAIL".red().bold());
                    println!("    {}", e.to_string().red());
                    failed += 1;
                }
            }
        };
    }

    run_test!("Service discovery", test_discovery(&device));
    run_test!("Control point accepts LED values", test_control_accepts(&device));
    run_test!("Control point rejects long writes", test_control_rejects_length(&device));
    run_test!("Control point rejects out-of-range values", test_control_rejects_value(&device));
    run_test!("Heart rate stream", test_heart_rate(&device));
    run_test!("Battery level", test_battery(&device));
    run_test!("Data characteristic subscriptions", test_data_subscriptions(&device));

    let _ = device.disconnect().await;

    // Summary
    println!("\n{}", "=".repeat(60));
    println!(
        "  Total: {} passed, {} failed",
        passed.to_string().green(),
        if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        }
    );
    println!("{}", "=".repeat(60));

    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Test: every vitals characteristic is present after discovery.
async fn test_discovery(device: &VitalsClient) -> anyhow::Result<()> {
    for uuid in [
        CONTROL_POINT_UUID,
        LIVE_UUID,
        DB_UUID,
        MOTION_UUID,
        HEART_RATE_MEASUREMENT_UUID,
        BATTERY_LEVEL_UUID,
    ] {
        device.characteristic(uuid)?;
    }
    Ok(())
}

/// Test: single-byte 0x00/0x01 writes to the control point are accepted.
async fn test_control_accepts(device: &VitalsClient) -> anyhow::Result<()> {
    device.write_control(&[0x01]).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    device.write_control(&[0x00]).await?;
    Ok(())
}

/// Test: a two-byte write is rejected at the attribute layer.
async fn test_control_rejects_length(device: &VitalsClient) -> anyhow::Result<()> {
    match device.write_control(&[0x01, 0x00]).await {
        Ok(()) => anyhow::bail!("Two-byte write was accepted"),
        Err(_) => Ok(()),
    }
}

/// Test: values above 0x01 are rejected.
async fn test_control_rejects_value(device: &VitalsClient) -> anyhow::Result<()> {
    match device.write_control(&[0x02]).await {
        Ok(()) => anyhow::bail!("Write of 0x02 was accepted"),
        Err(_) => Ok(()),
    }
}

/// Test: heart-rate notifications arrive once per second and increment.
async fn test_heart_rate(device: &VitalsClient) -> anyhow::Result<()> {
    device.clear_notifications().await;
    device.subscribe(HEART_RATE_MEASUREMENT_UUID).await?;

    let notifications = device
        .wait_for_notifications(HEART_RATE_MEASUREMENT_UUID, 3, Duration::from_secs(5))
        .await?;

    device.unsubscribe(HEART_RATE_MEASUREMENT_UUID).await?;

    let mut rates = Vec::new();
    for payload in &notifications {
        // Measurement format: flags byte then u8 bpm
        if payload.len() < 2 {
            anyhow::bail!("Measurement payload too short: {:?}", payload);
        }
        rates.push(payload[1]);
    }

    for rate in &rates {
        if !(90..160).contains(rate) {
            anyhow::bail!("Rate {} outside simulated range 90..=159", rate);
        }
    }

    // Consecutive samples step by one unless the cycle wrapped
    for pair in rates.windows(2) {
        let expected = if pair[0] == 159 { 90 } else { pair[0] + 1 };
        if pair[1] != expected {
            anyhow::bail!("Expected {} after {}, got {}", expected, pair[0], pair[1]);
        }
    }

    println!("    Rates: {:?}", rates);
    Ok(())
}

/// Test: battery level reads back in range and counts down.
async fn test_battery(device: &VitalsClient) -> anyhow::Result<()> {
    let first = device.read(BATTERY_LEVEL_UUID).await?;
    if first.len() != 1 || first[0] == 0 || first[0] > 100 {
        anyhow::bail!("Bad battery level: {:?}", first);
    }

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let second = device.read(BATTERY_LEVEL_UUID).await?;
    if second.len() != 1 {
        anyhow::bail!("Bad battery level: {:?}", second);
    }
    // Simulation decrements once per second and wraps from 1 to 100
    if second[0] >= first[0] && first[0] > 2 {
        anyhow::bail!("Battery did not count down: {} -> {}", first[0], second[0]);
    }

    println!("    Battery: {} -> {}", first[0], second[0]);
    Ok(())
}

/// Test: live/db/motion accept subscriptions, and the control point
/// accepts indications. Sample bursts need a button press, so this only
/// checks that the CCCD writes succeed.
async fn test_data_subscriptions(device: &VitalsClient) -> anyhow::Result<()> {
    for uuid in [LIVE_UUID, DB_UUID, MOTION_UUID, CONTROL_POINT_UUID] {
        device.subscribe(uuid).await?;
    }
    for uuid in [LIVE_UUID, DB_UUID, MOTION_UUID, CONTROL_POINT_UUID] {
        device.unsubscribe(uuid).await?;
    }
    Ok(())
}
