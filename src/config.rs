//! Benchmark worker configuration.
//!
//! Populated from CLI flags by the `worker` binary; the library only
//! consumes it. `validate()` covers the fatal-setup-error class: a config
//! that fails validation aborts the run before any socket is created.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{NetclError, Result};
use crate::fill::FillMode;
use crate::transport::StrategyKind;
use crate::types::{Rank, MAX_WORLD};

#[derive(Debug, Clone)]
pub struct NetclConfig {
    /// This worker's rank (1-indexed; selects the contribution mask bit).
    pub rank: Rank,

    /// Number of workers contributing to each slot.
    pub world: u32,

    /// Worker threads, one per partition, fixed for the process lifetime.
    pub threads: u16,

    /// Total vector length in 32-bit values.
    pub total_values: u32,

    /// Payload width of one packet in values.
    pub values_per_packet: u32,

    /// Packets a thread keeps in flight at once.
    pub window: u16,

    /// Local address worker sockets bind to.
    pub bind_ip: IpAddr,

    /// First worker UDP port; thread `t` binds `base_port + t`. Zero means
    /// an ephemeral port per thread (used by tests).
    pub base_port: u16,

    /// Aggregation device endpoint.
    pub device: SocketAddr,

    /// Warm-up AllReduce calls whose timings are discarded.
    pub warmup: u32,

    /// Measured AllReduce calls.
    pub steps: u32,

    /// Input vector fill.
    pub fill: FillMode,

    /// Pin each worker thread to a CPU core (performance only).
    pub pin_threads: bool,

    /// Syscall granularity for the wire path.
    pub strategy: StrategyKind,
}

impl Default for NetclConfig {
    fn default() -> Self {
        Self {
            rank: 1,
            world: 2,
            threads: 1,
            total_values: 32,
            values_per_packet: 32,
            window: 1,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: 4242,
            device: SocketAddr::from(([42, 42, 42, 42], 4242)),
            warmup: 0,
            steps: 1,
            fill: FillMode::Constant(1),
            pin_threads: false,
            strategy: StrategyKind::Datagram,
        }
    }
}

impl NetclConfig {
    /// Values owned by each thread.
    pub fn values_per_thread(&self) -> u32 {
        self.total_values / self.threads as u32
    }

    /// Packets each thread contributes per call.
    pub fn packets_per_thread(&self) -> u32 {
        self.values_per_thread() / self.values_per_packet
    }

    /// Device-side accumulator slots occupied by one version half.
    pub fn slots_per_version(&self) -> u16 {
        self.threads * self.window
    }

    /// UDP port for a worker thread's socket.
    pub fn port_for_thread(&self, thread_id: u16) -> u16 {
        if self.base_port == 0 {
            0
        } else {
            self.base_port + thread_id
        }
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(NetclError::config("thread count must be at least 1"));
        }
        if self.window == 0 {
            return Err(NetclError::config("window must be at least 1"));
        }
        if self.values_per_packet == 0 {
            return Err(NetclError::config("values per packet must be at least 1"));
        }
        if self.total_values == 0 {
            return Err(NetclError::config("vector size must be at least 1"));
        }
        if self.rank == 0 || self.rank as u32 > MAX_WORLD {
            return Err(NetclError::config(format!(
                "rank {} outside 1..={MAX_WORLD}",
                self.rank
            )));
        }
        if self.world == 0 || self.world > MAX_WORLD {
            return Err(NetclError::config(format!(
                "world size {} outside 1..={MAX_WORLD}",
                self.world
            )));
        }
        if self.rank as u32 > self.world {
            return Err(NetclError::config(format!(
                "rank {} exceeds world size {}",
                self.rank, self.world
            )));
        }
        if self.total_values % self.threads as u32 != 0 {
            return Err(NetclError::config(format!(
                "vector size {} not divisible by {} threads",
                self.total_values, self.threads
            )));
        }
        if self.values_per_thread() % self.values_per_packet != 0 {
            return Err(NetclError::config(format!(
                "per-thread range {} not divisible by packet width {}",
                self.values_per_thread(),
                self.values_per_packet
            )));
        }
        if self.window as u32 > self.packets_per_thread() {
            return Err(NetclError::config(format!(
                "window {} exceeds {} packets per thread",
                self.window,
                self.packets_per_thread()
            )));
        }
        // aggregation_index = bitmap_index + version * slots must fit u16 for
        // both versions.
        let slots = self.threads as u32 * self.window as u32;
        if slots * 2 > u16::MAX as u32 + 1 {
            return Err(NetclError::config(format!(
                "{slots} slots per version overflow the 16-bit aggregation index"
            )));
        }
        if self.base_port != 0 && self.base_port.checked_add(self.threads - 1).is_none() {
            return Err(NetclError::config(format!(
                "base port {} + {} threads overflows the port range",
                self.base_port, self.threads
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        NetclConfig::default().validate().unwrap();
    }

    #[test]
    fn test_derived_quantities() {
        let cfg = NetclConfig {
            threads: 2,
            window: 2,
            values_per_packet: 16,
            total_values: 128,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.values_per_thread(), 64);
        assert_eq!(cfg.packets_per_thread(), 4);
        assert_eq!(cfg.slots_per_version(), 4);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let cfg = NetclConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rank_zero_rejected() {
        let cfg = NetclConfig {
            rank: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rank_beyond_world_rejected() {
        let cfg = NetclConfig {
            rank: 3,
            world: 2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_world_beyond_mask_rejected() {
        let cfg = NetclConfig {
            world: 33,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_indivisible_vector_rejected() {
        let cfg = NetclConfig {
            threads: 3,
            total_values: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_window_larger_than_partition_rejected() {
        let cfg = NetclConfig {
            window: 2,
            total_values: 32,
            values_per_packet: 32,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_aggregation_index_injective() {
        // No (bitmap_index, version) pair may collide in the logical slot
        // space.
        let cfg = NetclConfig {
            threads: 4,
            window: 8,
            values_per_packet: 16,
            total_values: 4 * 8 * 16,
            ..Default::default()
        };
        cfg.validate().unwrap();

        let slots = cfg.slots_per_version();
        let mut seen = std::collections::HashSet::new();
        for bitmap_index in 0..slots {
            for version in 0u16..2 {
                let agg = bitmap_index + version * slots;
                assert!(seen.insert(agg), "collision at ({bitmap_index}, {version})");
            }
        }
        assert_eq!(seen.len(), slots as usize * 2);
    }

    #[test]
    fn test_ports_per_thread() {
        let cfg = NetclConfig {
            threads: 4,
            total_values: 128,
            ..Default::default()
        };
        assert_eq!(cfg.port_for_thread(0), 4242);
        assert_eq!(cfg.port_for_thread(3), 4245);

        let ephemeral = NetclConfig {
            base_port: 0,
            ..cfg
        };
        assert_eq!(ephemeral.port_for_thread(3), 0);
    }
}
