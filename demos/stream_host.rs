//! Scanout stream host example
//!
//! Run with: cargo run --example stream_host [VIEWER_ADDR]
//!
//! Examples:
//!   cargo run --example stream_host                  # viewer endpoint on 0.0.0.0:7500
//!   cargo run --example stream_host localhost:7600   # viewer endpoint on 127.0.0.1:7600
//!
//! Boots the full host stack: slot pool, encoder sessions backed by the
//! copy encoder, lease broker, and the streaming server. A built-in demo
//! workload leases a slot and reports damage at roughly 30 fps so there
//! is something to stream.
//!
//! Watch the stream with the viewer example:
//!   cargo run --example frame_viewer 127.0.0.1:7500 0

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use scanout_rs::{
    BrokerConfig, ControlHandle, CopyEncoder, EncoderConfig, EncoderSessions, FramebufferHandle,
    Hub, LeaseBroker, LocalCapabilityIssuer, ServerConfig, ServerStats, SlotTable, StreamServer,
    DEFAULT_POOL_SIZE,
};

const DEMO_WIDTH: u32 = 640;
const DEMO_HEIGHT: u32 = 360;

/// Render loop for the built-in demo workload. Runs on its own thread
/// the way a real render path would.
fn render_loop(sessions: Arc<EncoderSessions>, slot: u32, stop: Arc<AtomicBool>) {
    let stride = DEMO_WIDTH * 4;
    let mut tick: u32 = 0;

    while !stop.load(Ordering::Relaxed) {
        // Shifting gradient so successive frames differ.
        let mut plane = vec![0u8; (stride * DEMO_HEIGHT) as usize];
        for y in 0..DEMO_HEIGHT {
            for x in 0..DEMO_WIDTH {
                let at = ((y * stride) + x * 4) as usize;
                plane[at] = (x + tick) as u8;
                plane[at + 1] = (y + tick) as u8;
                plane[at + 2] = tick as u8;
                plane[at + 3] = 0xff;
            }
        }

        let fb = FramebufferHandle::new(1, DEMO_WIDTH, DEMO_HEIGHT, stride, Bytes::from(plane));
        let fence = sessions.on_damage(slot, fb);
        if !fence.wait_timeout(Duration::from_millis(100)) {
            eprintln!("Encode fence still pending after 100ms");
        }

        tick = tick.wrapping_add(1);
        std::thread::sleep(Duration::from_millis(33));
    }
}

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:7500
/// - "localhost:7600" -> 127.0.0.1:7600
/// - "0.0.0.0:7500" -> 0.0.0.0:7500
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 7500;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: stream_host [VIEWER_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  VIEWER_ADDR    Viewer endpoint to bind (default: 0.0.0.0:7500)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let viewer_addr = match args.get(1) {
        Some(addr_str) => match parse_bind_addr(addr_str) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => "0.0.0.0:7500".parse().unwrap(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scanout_rs=debug".parse()?)
                .add_directive("stream_host=info".parse()?),
        )
        .init();

    let config = ServerConfig::default().viewer_bind(viewer_addr);

    let stats = Arc::new(ServerStats::new());
    let pool = Arc::new(SlotTable::new(DEFAULT_POOL_SIZE));
    let hub = Arc::new(Hub::new(
        pool.len(),
        config.subscriber_queue_depth,
        Arc::clone(&stats),
    ));
    let (sessions, faults) = EncoderSessions::start(
        EncoderConfig::new(),
        Arc::new(CopyEncoder::new()),
        Arc::clone(&hub),
        Arc::clone(&stats),
    );
    let control = ControlHandle::new(Arc::clone(&hub), Arc::clone(&sessions));
    let broker = LeaseBroker::start(
        BrokerConfig::default().default_mode(DEMO_WIDTH, DEMO_HEIGHT),
        Arc::clone(&pool),
        control.clone(),
        Arc::new(LocalCapabilityIssuer::new()),
        faults,
        Arc::clone(&stats),
    );

    println!("Scanout stream host");
    println!("  viewer endpoint:  {}", config.viewer_addr);
    println!("  control endpoint: {}", config.control_addr);
    println!();
    println!("=== Watch the demo stream ===");
    println!("  cargo run --example frame_viewer {} 0", config.viewer_addr);
    println!();

    // The demo workload: lease a slot and keep damaging it.
    let lease = broker.request_lease("demo-workload").await?;
    println!(
        "Demo workload leased slot {} ({} byte capability)",
        lease.slot_index,
        lease.capability.len()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let render = {
        let sessions = Arc::clone(&sessions);
        let stop = Arc::clone(&stop);
        let slot = lease.slot_index;
        std::thread::spawn(move || render_loop(sessions, slot, stop))
    };

    // Periodic stats line.
    {
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                println!("{}", stats.snapshot());
            }
        });
    }

    let server = StreamServer::new(config, hub, control, stats);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                eprintln!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    stop.store(true, Ordering::Relaxed);
    if render.join().is_err() {
        eprintln!("Render thread panicked");
    }
    broker.shutdown().await?;

    Ok(())
}
