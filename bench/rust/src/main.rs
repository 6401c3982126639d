//! Alert latency benchmark - measures updateLocation to dangerAlert
//!
//! Each trial opens a fresh connection on the live channel, reports a fix
//! outside the target zone, then one at its center, and times how long the
//! danger alert takes to come back.

use clap::Parser;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

/// Roughly 1.1 km of latitude
const OUTSIDE_OFFSET_DEG: f64 = 0.01;

#[derive(Parser)]
#[command(name = "trailguard-bench")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:7400")]
    addr: String,
    /// Center of a configured hazard zone
    #[arg(long, default_value = "12.9763")]
    zone_lat: f64,
    #[arg(long, default_value = "77.5929")]
    zone_lng: f64,
    #[arg(short, long, default_value = "20")]
    trials: u32,
    /// Pause between trials in milliseconds
    #[arg(long, default_value = "200")]
    delay_ms: u64,
}

type Lines = tokio::io::Lines<BufReader<OwnedReadHalf>>;

async fn send(writer: &mut tokio::net::tcp::OwnedWriteHalf, message: Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

/// Read until a message of `kind` arrives or the deadline passes
async fn wait_for(lines: &mut Lines, kind: &str, deadline: Instant) -> Option<Value> {
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = match tokio::time::timeout(remaining, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            _ => return None,
        };
        if let Ok(message) = serde_json::from_str::<Value>(&line) {
            if message["type"] == kind {
                return Some(message);
            }
        }
    }
    None
}

async fn run_trial(args: &Args, trial: u32) -> Result<Option<u64>, Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(&args.addr).await?;
    stream.set_nodelay(true)?;
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let deadline = Instant::now() + Duration::from_secs(5);

    let session_id = format!("bench-{}-{}", std::process::id(), trial);
    send(&mut writer, json!({"type": "join", "sessionId": session_id, "name": "bench"})).await?;
    if wait_for(&mut lines, "welcome", deadline).await.is_none() {
        return Ok(None);
    }

    send(
        &mut writer,
        json!({"type": "updateLocation", "lat": args.zone_lat + OUTSIDE_OFFSET_DEG, "lng": args.zone_lng}),
    )
    .await?;
    if wait_for(&mut lines, "touristLocationUpdate", deadline).await.is_none() {
        return Ok(None);
    }

    let sent = Instant::now();
    send(&mut writer, json!({"type": "updateLocation", "lat": args.zone_lat, "lng": args.zone_lng}))
        .await?;
    let alert = wait_for(&mut lines, "dangerAlert", deadline).await;
    let elapsed_us = sent.elapsed().as_micros() as u64;

    send(&mut writer, json!({"type": "leave"})).await?;
    Ok(alert.map(|_| elapsed_us))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Alert Latency Benchmark");
    println!("=======================");
    println!("Server: {}", args.addr);
    println!("Zone center: {}, {}", args.zone_lat, args.zone_lng);
    println!("Trials: {}", args.trials);
    println!();

    let mut results: Vec<u64> = vec![];

    for trial in 1..=args.trials {
        print!("Trial {:2}: ", trial);
        match run_trial(&args, trial).await {
            Ok(Some(us)) => {
                results.push(us);
                println!("{} us", us);
            }
            Ok(None) => println!("TIMEOUT"),
            Err(e) => println!("ERROR ({})", e),
        }

        if trial < args.trials {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    // Stats
    println!("\n=======================");
    println!("Results:");
    if !results.is_empty() {
        let sum: u64 = results.iter().sum();
        let avg = sum / results.len() as u64;
        let mut sorted = results.clone();
        sorted.sort();
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() as f64 * 0.95) as usize].min(max);

        println!("  Successful: {}/{}", results.len(), args.trials);
        println!("  Min: {} us", min);
        println!("  Max: {} us", max);
        println!("  Avg: {} us", avg);
        println!("  P50: {} us", p50);
        println!("  P95: {} us", p95);
    } else {
        println!("  No successful trials!");
    }

    Ok(())
}
