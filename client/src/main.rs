use clap::Parser;
use client::mob_sync::SyncConfig;
use client::replication::ReplicationClient;
use log::{debug, info, warn};
use shared::{decode_batch, DeltaBatch, ResyncSnapshot};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Newline-delimited JSON delta batches, as written by the server
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Frame duration in milliseconds
    #[arg(short = 'f', long, default_value = "16")]
    frame_ms: u64,

    /// Batches delivered per frame
    #[arg(short = 'b', long, default_value = "1")]
    batches_per_frame: usize,

    /// Replay as fast as possible instead of sleeping between frames
    #[arg(long)]
    fast: bool,

    /// Log entity counts every N frames
    #[arg(long, default_value = "30")]
    report_every: u64,

    /// Interpolation backtime in milliseconds
    #[arg(long, default_value = "100")]
    backtime_ms: f64,
}

fn load_batches(contents: &str) -> Vec<DeltaBatch> {
    let mut batches = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode_batch(line.as_bytes()) {
            Ok(batch) => batches.push(batch),
            Err(e) => warn!("Skipping line {}: {}", line_no + 1, e),
        }
    }
    batches
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let contents = tokio::fs::read_to_string(&args.input).await?;
    let batches = load_batches(&contents);
    info!("Loaded {} batches from {}", batches.len(), args.input.display());

    let config = SyncConfig {
        interpolation_backtime_ms: args.backtime_ms,
        ..SyncConfig::default()
    };
    let mut client = ReplicationClient::new(config);
    let mut pending = batches.into_iter();
    let mut frame: u64 = 0;
    let mut now_ms = 0.0;
    let mut interval = tokio::time::interval(Duration::from_millis(args.frame_ms.max(1)));

    loop {
        if !args.fast {
            interval.tick().await;
        }

        let mut delivered = 0;
        for batch in pending.by_ref().take(args.batches_per_frame.max(1)) {
            client.enqueue(batch, now_ms);
            delivered += 1;
        }

        let report = client.flush(now_ms);
        for (tick_seq, event) in &report.opaque {
            debug!("Tick {} passthrough event: {}", tick_seq, event);
        }

        // No live server to ask, so the replay answers a resync from its own
        // last authoritative samples.
        if client.resync_pending() {
            let offset = client.mobs().server_clock().offset_ms().unwrap_or(0.0);
            let snapshot = ResyncSnapshot {
                tick_seq: client.last_tick_seq().unwrap_or(0),
                world_version: 0,
                server_time_ms: (now_ms - offset).max(0.0) as u64,
                mobs: client.mobs().export_pool(),
            };
            let replayed = client.apply_resync(&snapshot, now_ms);
            info!(
                "Served resync at tick {} ({} batches replayed)",
                snapshot.tick_seq, replayed
            );
        }

        frame += 1;
        if frame % args.report_every.max(1) == 0 {
            info!(
                "Frame {}: {} mobs, last tick {:?}",
                frame,
                client.mobs().len(),
                client.last_tick_seq()
            );
        }

        if delivered == 0 && client.queued() == 0 {
            break;
        }
        now_ms += args.frame_ms as f64;
    }

    info!("Replay finished after {} frames", frame);
    info!("Stats: {:?}", client.mobs().stats());
    for mob in client.mobs().render_positions() {
        debug!("Mob {} at ({:.2}, {:.2}) hp {}", mob.id, mob.x, mob.z, mob.hp);
    }

    Ok(())
}
