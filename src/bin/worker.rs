//! NetCL AllReduce benchmark worker.
//!
//! Binds one UDP socket per thread, runs warm-up calls whose timings are
//! discarded, then measured calls, and reports per-step and averaged
//! latency/throughput.
//!
//! ```bash
//! worker --rank 1 --world 2 --threads 4 --window 8 --multiplier 64 \
//!        --device 42.42.42.42:4242 --warmup 2 --steps 10
//! ```

use std::net::{IpAddr, SocketAddr};

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use netcl::transport::open;
use netcl::{all_reduce, fill, FillMode, NetclConfig, ReduceContext, StrategyKind, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    /// One datagram per syscall.
    Datagram,
    /// Vectored sendmmsg/recvmmsg bursts.
    Batched,
}

impl From<StrategyArg> for StrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Datagram => StrategyKind::Datagram,
            StrategyArg::Batched => StrategyKind::Batched,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "worker", about = "NetCL AllReduce benchmark worker")]
struct Args {
    /// Worker rank (1-indexed).
    #[arg(short = 'R', long, default_value_t = 1)]
    rank: u8,

    /// Number of workers in the job.
    #[arg(short = 'W', long, default_value_t = 2)]
    world: u32,

    /// Local address to bind worker sockets on.
    #[arg(short = 'I', long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Base UDP port; thread t binds port + t.
    #[arg(short = 'P', long, default_value_t = 4242)]
    port: u16,

    /// Aggregation device endpoint.
    #[arg(short = 'D', long, default_value = "42.42.42.42:4242")]
    device: SocketAddr,

    /// Worker threads (one partition each).
    #[arg(short = 'j', long, default_value_t = 1)]
    threads: u16,

    /// Per-thread burst window.
    #[arg(short = 'w', long, default_value_t = 1)]
    window: u16,

    /// Payload width in 32-bit values.
    #[arg(short = 'p', long, default_value_t = 32)]
    values_per_packet: u32,

    /// Vector size multiplier: size = threads * window * values * multiplier.
    #[arg(short = 'm', long, default_value_t = 1)]
    multiplier: u32,

    /// Warm-up steps whose results are discarded.
    #[arg(long, default_value_t = 0)]
    warmup: u32,

    /// Measured AllReduce steps.
    #[arg(long, default_value_t = 1)]
    steps: u32,

    /// Fill the vector with PRNG values instead of the rank.
    #[arg(long)]
    random: bool,

    /// Seed for the PRNG fill.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Pin worker threads to CPU cores.
    #[arg(long)]
    pin: bool,

    /// Syscall granularity for the wire path.
    #[arg(long, value_enum, default_value_t = StrategyArg::Datagram)]
    strategy: StrategyArg,
}

impl Args {
    fn into_config(self) -> NetclConfig {
        let total_values =
            self.threads as u32 * self.window as u32 * self.values_per_packet * self.multiplier;
        NetclConfig {
            rank: self.rank,
            world: self.world,
            threads: self.threads,
            total_values,
            values_per_packet: self.values_per_packet,
            window: self.window,
            bind_ip: self.ip,
            base_port: self.port,
            device: self.device,
            warmup: self.warmup,
            steps: self.steps,
            fill: if self.random {
                FillMode::Random { seed: self.seed }
            } else {
                FillMode::Constant(self.rank as u32)
            },
            pin_threads: self.pin,
            strategy: self.strategy.into(),
        }
    }
}

fn main() -> netcl::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Args::parse().into_config();
    cfg.validate()?;

    let ports = format!(
        "{}-{}",
        cfg.base_port,
        cfg.base_port + cfg.threads.saturating_sub(1)
    );
    info!(
        rank = cfg.rank,
        world = cfg.world,
        threads = cfg.threads,
        ports = %ports,
        device = %cfg.device,
        "worker starting"
    );
    info!(
        values = cfg.total_values,
        bytes = cfg.total_values as u64 * 4,
        per_packet = cfg.values_per_packet,
        per_thread = cfg.values_per_thread(),
        packets = cfg.packets_per_thread() * cfg.threads as u32,
        window = cfg.window,
        strategy = ?cfg.strategy,
        "workload"
    );

    let mut data = fill::generate(cfg.total_values as usize, cfg.fill);
    let exponent = fill::pick_exponent(cfg.rank, cfg.fill);

    let mut transports: Vec<Box<dyn Transport>> = (0..cfg.threads)
        .map(|tid| open(&cfg, tid))
        .collect::<netcl::Result<_>>()?;

    let mut ctx = ReduceContext::new(cfg.threads, exponent);

    for step in 0..cfg.warmup {
        info!(step, "warm-up");
        all_reduce(&cfg, &mut ctx, &mut transports, &mut data, step + 1)?;
    }

    let reduced_values = cfg.total_values as u64 * cfg.world as u64;
    let mut total_latency_ns: u128 = 0;
    let mut total_values_per_sec = 0.0;

    for step in 0..cfg.steps {
        let elapsed = all_reduce(
            &cfg,
            &mut ctx,
            &mut transports,
            &mut data,
            cfg.warmup + step + 1,
        )?;

        let secs = elapsed.as_secs_f64();
        let values_per_sec = reduced_values as f64 / secs;
        let gbps = reduced_values as f64 * 32.0 / secs / 1e9;
        total_latency_ns += elapsed.as_nanos();
        total_values_per_sec += values_per_sec;

        info!(step, ?elapsed, values_per_sec, gbps, "AllReduce");
    }

    if cfg.steps > 0 {
        let avg_latency_ms = total_latency_ns as f64 / cfg.steps as f64 / 1e6;
        let avg_values_per_sec = total_values_per_sec / cfg.steps as f64;
        info!(
            steps = cfg.steps,
            avg_latency_ms,
            avg_values_per_sec,
            "benchmark complete"
        );
    }

    Ok(())
}
