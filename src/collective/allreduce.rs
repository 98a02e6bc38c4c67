//! AllReduce orchestration: one engine thread per partition.

use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::collective::{ReduceContext, WindowEngine};
use crate::config::NetclConfig;
use crate::error::{NetclError, Result};
use crate::partition::{plan, Partition};
use crate::transport::Transport;
use crate::types::Version;

/// Run one AllReduce call over `data`, returning the measured wall-clock
/// time.
///
/// Spawns one [`WindowEngine`] per partition on its own OS thread, all
/// gated behind a start barrier so thread-creation cost stays outside the
/// measurement, joins them, and stores each thread's next starting version
/// back into `ctx`. The vector and `ctx` persist across calls; consecutive
/// calls pipeline through the device's double buffer with no barrier in
/// between.
pub fn all_reduce(
    cfg: &NetclConfig,
    ctx: &mut ReduceContext,
    transports: &mut [Box<dyn Transport>],
    data: &mut [u32],
    call_index: u32,
) -> Result<Duration> {
    if transports.len() != cfg.threads as usize {
        return Err(NetclError::config(format!(
            "{} transports for {} threads",
            transports.len(),
            cfg.threads
        )));
    }
    if data.len() as u32 != cfg.total_values {
        return Err(NetclError::config(format!(
            "vector length {} does not match configured size {}",
            data.len(),
            cfg.total_values
        )));
    }

    let partitions: Vec<Partition> = (0..cfg.threads)
        .map(|tid| {
            plan(
                tid,
                cfg.total_values,
                cfg.values_per_thread(),
                cfg.values_per_packet,
            )
        })
        .collect();
    let slices = partition_slices(data, &partitions);

    debug!(
        call_index,
        threads = cfg.threads,
        window = cfg.window,
        "starting AllReduce"
    );

    // Threads wait on the barrier before touching the socket; the clock
    // starts when the main thread releases them.
    let barrier = Barrier::new(cfg.threads as usize + 1);
    let exponent = ctx.exponent();

    let mut outcomes: Vec<(u16, Result<Version>)> = Vec::with_capacity(cfg.threads as usize);
    let mut elapsed = Duration::ZERO;

    thread::scope(|s| {
        let barrier = &barrier;
        let mut handles = Vec::with_capacity(cfg.threads as usize);

        for (((tid, transport), partition), slice) in (0..cfg.threads)
            .zip(transports.iter_mut())
            .zip(partitions.iter().copied())
            .zip(slices)
        {
            let starting_version = ctx.version(tid);
            let handle = s.spawn(move || {
                barrier.wait();
                let mut engine =
                    WindowEngine::new(cfg, tid, partition, exponent, &mut **transport, slice);
                engine.run(starting_version)
            });
            handles.push((tid, handle));
        }

        barrier.wait();
        let clock = Instant::now();
        for (tid, handle) in handles {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(NetclError::ThreadPanicked { thread_id: tid }),
            };
            outcomes.push((tid, outcome));
        }
        elapsed = clock.elapsed();
    });

    for (tid, outcome) in outcomes {
        ctx.set_version(tid, outcome?);
    }

    debug!(call_index, ?elapsed, "AllReduce complete");
    Ok(elapsed)
}

/// Split the vector into per-thread slices along partition boundaries.
fn partition_slices<'d>(data: &'d mut [u32], partitions: &[Partition]) -> Vec<&'d mut [u32]> {
    let mut slices = Vec::with_capacity(partitions.len());
    let mut rest = data;
    for p in partitions {
        let (head, tail) = rest.split_at_mut(p.len() as usize);
        slices.push(head);
        rest = tail;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketHeader;
    use crate::transport::{RecvSlot, StrategyKind};

    struct StubTransport;

    impl Transport for StubTransport {
        fn send(&mut self, _header: &PacketHeader, payload: &[u32]) -> Result<usize> {
            Ok(crate::protocol::packet_len(payload.len()))
        }

        fn recv_burst(&mut self, _slots: &mut [RecvSlot]) -> Result<usize> {
            Ok(0)
        }
    }

    fn two_thread_config() -> NetclConfig {
        NetclConfig {
            threads: 2,
            total_values: 128,
            values_per_packet: 16,
            window: 2,
            strategy: StrategyKind::Datagram,
            ..Default::default()
        }
    }

    #[test]
    fn test_transport_count_mismatch_rejected() {
        let cfg = two_thread_config();
        let mut ctx = ReduceContext::new(cfg.threads, 1);
        let mut transports: Vec<Box<dyn Transport>> = vec![Box::new(StubTransport)];
        let mut data = vec![0u32; 128];
        let err = all_reduce(&cfg, &mut ctx, &mut transports, &mut data, 1).unwrap_err();
        assert!(matches!(err, NetclError::InvalidConfig { .. }));
    }

    #[test]
    fn test_vector_length_mismatch_rejected() {
        let cfg = two_thread_config();
        let mut ctx = ReduceContext::new(cfg.threads, 1);
        let mut transports: Vec<Box<dyn Transport>> =
            vec![Box::new(StubTransport), Box::new(StubTransport)];
        let mut data = vec![0u32; 64];
        let err = all_reduce(&cfg, &mut ctx, &mut transports, &mut data, 1).unwrap_err();
        assert!(matches!(err, NetclError::InvalidConfig { .. }));
    }

    #[test]
    fn test_partition_slices_tile_the_vector() {
        let partitions = [
            Partition {
                start: 0,
                end: 64,
                packets: 4,
            },
            Partition {
                start: 64,
                end: 128,
                packets: 4,
            },
        ];
        let mut data: Vec<u32> = (0..128).collect();
        let slices = partition_slices(&mut data, &partitions);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 64);
        assert_eq!(slices[1].len(), 64);
        assert_eq!(slices[0][0], 0);
        assert_eq!(slices[1][0], 64);
    }
}
