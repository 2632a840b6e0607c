//! Frame stream viewer example
//!
//! Run with: cargo run --example frame_viewer [SERVER_ADDR] [SLOT ...]
//!
//! Examples:
//!   cargo run --example frame_viewer                       # 127.0.0.1:7500, slot 0
//!   cargo run --example frame_viewer 127.0.0.1:7500 0 3    # slots 0 and 3
//!
//! Connects to a stream host's viewer endpoint, subscribes to the given
//! slots, and prints a line per received frame. Gaps in a slot's frame
//! sequence are flagged.

use std::net::SocketAddr;

use scanout_rs::{FrameSubscriber, SubscriberEvent};

fn print_usage() {
    eprintln!("Usage: frame_viewer [SERVER_ADDR] [SLOT ...]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  SERVER_ADDR    Viewer endpoint of the host (default: 127.0.0.1:7500)");
    eprintln!("  SLOT           Scanout slots to subscribe to (default: 0)");
}

fn parse_server_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 7500;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid server address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let server_addr = match args.get(1) {
        Some(addr_str) => match parse_server_addr(addr_str) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => "127.0.0.1:7500".parse().unwrap(),
    };

    let mut slots: Vec<u32> = Vec::new();
    for arg in args.iter().skip(2) {
        match arg.parse::<u32>() {
            Ok(slot) => slots.push(slot),
            Err(_) => {
                eprintln!("Error: invalid slot '{}'", arg);
                print_usage();
                std::process::exit(1);
            }
        }
    }
    if slots.is_empty() {
        slots.push(0);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scanout_rs=info".parse()?)
                .add_directive("frame_viewer=info".parse()?),
        )
        .init();

    println!("Connecting to {}...", server_addr);
    let (subscriber, mut events) = FrameSubscriber::connect(server_addr).await?;

    for &slot in &slots {
        subscriber.subscribe(slot).await?;
        println!("Subscribed to slot {}", slot);
    }

    let mut frames: u64 = 0;
    let mut gaps: u64 = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(SubscriberEvent::Frame { frame, gap }) => {
                        frames += 1;
                        if gap {
                            gaps += 1;
                        }
                        println!(
                            "slot {} seq {:>6} {} {:>8} bytes  ts {:>12}us{}",
                            frame.slot,
                            frame.sequence,
                            if frame.is_keyframe { "K" } else { "." },
                            frame.payload.len(),
                            frame.timestamp_us,
                            if gap { "  [gap]" } else { "" },
                        );
                    }
                    Some(SubscriberEvent::Disconnected { reason }) => {
                        println!("Disconnected: {}", reason);
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("{} frames received, {} gaps", frames, gaps);
    Ok(())
}
