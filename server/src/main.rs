use clap::Parser;
use log::{debug, info};
use server::clock::{Clock, SystemClock};
use server::election::{AggressivePoll, HeartbeatConfig};
use server::store::{CoordinationStore, MemoryStore};
use server::tick_loop::{
    FollowerConfig, GateConfig, TickContext, TickHandler, TickLoopConfig, TickLoopRunner,
    TickOutcome,
};
use shared::{encode_batch, DeltaBatch, DeltaEvent, EntityDelta, MobPool, MobSample};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

const TICK_SEQ_KEY: &str = "sim:tickSeq";
const FULL_SNAPSHOT_EVERY: u64 = 50;
const SNAPSHOT_CHUNK_SIZE: usize = 8;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of invocations to start against the shared store
    #[arg(short = 'n', long, default_value = "3")]
    invocations: u32,

    /// Delay between invocation starts in milliseconds
    #[arg(long, default_value = "500")]
    stagger_ms: u64,

    /// Invocation window in milliseconds
    #[arg(short = 'w', long, default_value = "3000")]
    window_ms: u64,

    /// Tick interval in milliseconds
    #[arg(short = 't', long, default_value = "100")]
    tick_interval_ms: u64,

    /// Lock TTL in seconds
    #[arg(long, default_value = "2")]
    lock_ttl: u64,

    /// Refresh the lock every N ticks
    #[arg(long, default_value = "5")]
    refresh_ticks: u64,

    /// How long a follower waits for leadership
    #[arg(long, default_value = "4000")]
    wait_ms: u64,

    /// Coarse follower poll interval
    #[arg(long, default_value = "250")]
    poll_interval_ms: u64,

    /// Width of the fine polling window around the predicted release
    #[arg(long, default_value = "1000")]
    aggressive_window_ms: u64,

    /// Fine polling interval
    #[arg(long, default_value = "50")]
    aggressive_interval_ms: u64,

    /// Heartbeat age after which a leader is presumed dead
    #[arg(long, default_value = "1500")]
    stale_ms: u64,

    /// Number of simulated mobs
    #[arg(short = 'm', long, default_value = "12")]
    mobs: u32,

    /// Write every produced delta batch as JSON lines to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

/// Minimal stand-in simulation: mobs walking in circles.
struct DemoSimulation {
    store: MemoryStore<SystemClock>,
    mob_count: u32,
    emitted: Rc<RefCell<Vec<String>>>,
}

struct DemoState {
    tick_seq: u64,
    mobs: Vec<MobSample>,
}

impl TickHandler for DemoSimulation {
    type State = DemoState;
    type Error = Box<dyn std::error::Error>;

    async fn on_init(&mut self) -> Result<DemoState, Self::Error> {
        // Resume the sequence where the previous leader left it.
        let tick_seq = self
            .store
            .get(TICK_SEQ_KEY)
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        let mobs = (0..self.mob_count)
            .map(|id| {
                let angle = id as f32 * 0.5;
                MobSample {
                    id,
                    pos_x: angle.cos() * 10.0,
                    pos_z: angle.sin() * 10.0,
                    vel_x: -angle.sin() * 2.0,
                    vel_z: angle.cos() * 2.0,
                    hp: 100,
                    max_hp: Some(100),
                }
            })
            .collect();

        Ok(DemoState { tick_seq, mobs })
    }

    async fn on_tick(
        &mut self,
        state: &mut DemoState,
        ctx: TickContext,
    ) -> Result<TickOutcome, Self::Error> {
        let dt = 0.1;
        for mob in &mut state.mobs {
            mob.pos_x += mob.vel_x * dt;
            mob.pos_z += mob.vel_z * dt;
            // Rotate velocity a little to keep them circling.
            let (vx, vz) = (mob.vel_x, mob.vel_z);
            mob.vel_x = vx * 0.995 - vz * 0.0998;
            mob.vel_z = vx * 0.0998 + vz * 0.995;
        }
        state.tick_seq += 1;

        let batches = if state.tick_seq % FULL_SNAPSHOT_EVERY == 0 {
            snapshot_batches(state, ctx.now_ms)
        } else {
            let mut pool = MobPool::default();
            for mob in &state.mobs {
                pool.push(mob);
            }
            vec![DeltaBatch::new(state.tick_seq, 1).with_event(DeltaEvent::EntityDelta(
                EntityDelta {
                    server_time_ms: ctx.now_ms,
                    mobs: Some(pool),
                    ..Default::default()
                },
            ))]
        };

        let delta_count = batches.len();
        for batch in &batches {
            let line = encode_batch(batch)?;
            debug!("{}", line);
            self.emitted.borrow_mut().push(line);
        }

        Ok(TickOutcome {
            tick_seq: state.tick_seq,
            command_count: 0,
            delta_count,
        })
    }

    async fn on_teardown(&mut self, state: DemoState) -> Result<(), Self::Error> {
        self.store
            .set(TICK_SEQ_KEY, &state.tick_seq.to_string(), 3600)
            .await?;
        Ok(())
    }
}

/// Splits the full mob set into chunked replace-all batches sharing one tick.
fn snapshot_batches(state: &DemoState, now_ms: u64) -> Vec<DeltaBatch> {
    let chunks: Vec<&[MobSample]> = state.mobs.chunks(SNAPSHOT_CHUNK_SIZE).collect();
    let chunk_count = chunks.len().max(1) as u32;

    let mut batch = DeltaBatch::new(state.tick_seq, 1);
    for (index, chunk) in chunks.iter().enumerate() {
        let mut pool = MobPool::default();
        for mob in chunk.iter() {
            pool.push(mob);
        }
        batch.events.push(DeltaEvent::EntityDelta(EntityDelta {
            server_time_ms: now_ms,
            mobs: Some(pool),
            full_snapshot: true,
            chunk: Some(shared::ChunkInfo {
                snapshot_id: state.tick_seq,
                chunk_index: index as u32,
                chunk_count,
            }),
            ..Default::default()
        }));
    }
    vec![batch]
}

fn build_config(args: &Args) -> TickLoopConfig {
    TickLoopConfig {
        lock_key: "sim:leader".to_string(),
        window_ms: args.window_ms,
        tick_interval_ms: args.tick_interval_ms,
        lock_ttl_seconds: args.lock_ttl,
        lock_refresh_interval_ticks: args.refresh_ticks,
        heartbeat: Some(HeartbeatConfig {
            key: "sim:heartbeat".to_string(),
            ttl_seconds: args.lock_ttl * 3,
            stale_ms: args.stale_ms,
        }),
        follower: Some(FollowerConfig {
            wait_ms: args.wait_ms,
            poll_interval_ms: args.poll_interval_ms,
            aggressive_poll: Some(AggressivePoll {
                window_ms: args.aggressive_window_ms,
                interval_ms: args.aggressive_interval_ms,
            }),
            gate: Some(GateConfig {
                key: "sim:followerGate".to_string(),
                ttl_seconds: args.wait_ms.div_ceil(1000) + 1,
            }),
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = build_config(&args);
    let store = MemoryStore::new(SystemClock);
    let emitted = Rc::new(RefCell::new(Vec::new()));

    info!(
        "Starting {} invocations ({}ms window, {}ms ticks)",
        args.invocations, config.window_ms, config.tick_interval_ms
    );

    // Handlers share an Rc, so invocations run as local tasks on this thread.
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut handles = Vec::new();
            for index in 0..args.invocations {
                let store = store.clone();
                let config = config.clone();
                let emitted = Rc::clone(&emitted);
                let delay = args.stagger_ms * index as u64;
                let mob_count = args.mobs;

                handles.push(tokio::task::spawn_local(async move {
                    SystemClock.sleep(delay).await;
                    let runner = TickLoopRunner::new(store.clone(), SystemClock, config);
                    let mut handler = DemoSimulation {
                        store,
                        mob_count,
                        emitted,
                    };
                    let report = runner.run(&mut handler).await;
                    match serde_json::to_string(&report) {
                        Ok(json) => info!("Invocation {}: {}", index, json),
                        Err(_) => info!("Invocation {}: {:?}", index, report),
                    }
                }));
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    eprintln!("Invocation task panicked: {}", e);
                }
            }
        })
        .await;

    let final_seq = store.get(TICK_SEQ_KEY).await?.unwrap_or_default();
    info!("Final tick sequence: {}", final_seq);

    if let Some(path) = &args.output {
        let lines = emitted.borrow().join("\n");
        tokio::fs::write(path, lines + "\n").await?;
        info!("Wrote {} batches to {}", emitted.borrow().len(), path.display());
    }

    Ok(())
}
