//! The windowed, double-buffered reduction engine — one per worker thread.
//!
//! State machine: BUILD the initial window, BURST_SEND it to the device,
//! then loop in AWAIT_COMPLETION processing responses one-for-one until the
//! partition's packet count is reached. Each processed response re-tags the
//! same physical slot one window ahead in the partition and flips its
//! version half, so at most `window` packets are ever in flight and a stale
//! packet from the previous half-window cannot land in a live accumulator.
//!
//! The loop never times out: a lost response stalls its slot forever.
//! Callers needing reliability must add timeout and resend above this
//! layer; doing it here would change what the benchmark measures.

use tracing::{trace, warn};

use crate::config::NetclConfig;
use crate::error::Result;
use crate::partition::Partition;
use crate::protocol::{AggHeader, NcpHeader, PacketHeader};
use crate::transport::{Frame, RecvSlot, Transport};
use crate::types::{rank_mask, Rank, Version};

/// Device id and channel the aggregation service listens on.
const DEVICE_DST: u8 = 1;
const CHANNEL: u8 = 1;

pub struct WindowEngine<'d, T> {
    transport: T,
    thread_id: u16,
    rank: Rank,
    window: usize,
    values_per_packet: u32,
    slots_per_version: u16,
    base_slot: u16,
    partition: Partition,
    exponent: u32,
    /// This thread's slice of the vector; index 0 is global element
    /// `partition.start`.
    data: &'d mut [u32],
    /// In-flight packet headers, one per window slot.
    headers: Vec<PacketHeader>,
    recv_slots: Vec<RecvSlot>,
}

impl<'d, T: Transport> WindowEngine<'d, T> {
    pub fn new(
        cfg: &NetclConfig,
        thread_id: u16,
        partition: Partition,
        exponent: u32,
        transport: T,
        data: &'d mut [u32],
    ) -> Self {
        debug_assert_eq!(data.len() as u32, partition.len());
        let window = cfg.window as usize;
        Self {
            transport,
            thread_id,
            rank: cfg.rank,
            window,
            values_per_packet: cfg.values_per_packet,
            slots_per_version: cfg.slots_per_version(),
            base_slot: thread_id * cfg.window,
            partition,
            exponent,
            data,
            headers: Vec::with_capacity(window),
            recv_slots: (0..window)
                .map(|_| RecvSlot::new(cfg.values_per_packet as usize))
                .collect(),
        }
    }

    /// Run one AllReduce call for this partition. Returns the version the
    /// thread's next call must start with.
    pub fn run(&mut self, starting_version: Version) -> Result<Version> {
        if self.partition.packets == 0 {
            return Ok(starting_version);
        }

        self.transport.prepare_thread();
        self.build(starting_version);
        self.burst_send()?;
        self.await_completion()
    }

    /// BUILD: one packet per window slot, slot `i` covering the i-th packet
    /// of the partition.
    fn build(&mut self, version: Version) {
        self.headers.clear();
        for i in 0..self.window as u16 {
            let bitmap_index = self.base_slot + i;
            self.headers.push(PacketHeader {
                ncp: NcpHeader {
                    host_src: self.rank,
                    device_dst: DEVICE_DST,
                    channel: CHANNEL,
                    ..Default::default()
                },
                agg: AggHeader {
                    version,
                    bitmap_index,
                    aggregation_index: bitmap_index + version as u16 * self.slots_per_version,
                    mask: rank_mask(self.rank),
                    offset: self.partition.start + i as u32 * self.values_per_packet,
                    exponent: self.exponent,
                },
            });
        }
    }

    /// BURST_SEND: seed the pipeline with the whole window.
    fn burst_send(&mut self) -> Result<()> {
        let vpp = self.values_per_packet as usize;
        let start = self.partition.start;
        let frames: Vec<Frame<'_>> = self
            .headers
            .iter()
            .map(|h| {
                let rel = (h.agg.offset - start) as usize;
                Frame {
                    header: h,
                    payload: &self.data[rel..rel + vpp],
                }
            })
            .collect();
        self.transport.send_burst(&frames)?;
        Ok(())
    }

    /// AWAIT_COMPLETION: self-clocked receive/advance loop.
    fn await_completion(&mut self) -> Result<Version> {
        let vpp = self.values_per_packet as usize;
        let offset_step = self.window as u32 * self.values_per_packet;
        let mut received: u32 = 0;
        let mut resend: Vec<usize> = Vec::with_capacity(self.window);

        loop {
            let n = self.transport.recv_burst(&mut self.recv_slots)?;
            if n == 0 {
                continue;
            }

            resend.clear();
            for slot in &self.recv_slots[..n] {
                let agg = slot.header.agg;

                // The decoded header is authoritative: place the aggregated
                // payload at the response's own offset, never by batch
                // position.
                if agg.offset < self.partition.start || agg.offset >= self.partition.end {
                    warn!(
                        thread_id = self.thread_id,
                        offset = agg.offset,
                        "response outside partition, dropped"
                    );
                    continue;
                }
                let rel = (agg.offset - self.partition.start) as usize;
                let take = vpp.min(self.data.len() - rel);
                self.data[rel..rel + take].copy_from_slice(&slot.payload[..take]);

                received += 1;
                if received >= self.partition.packets {
                    let next = 1 - (agg.version & 1);
                    trace!(
                        thread_id = self.thread_id,
                        received,
                        next_version = next,
                        "partition complete"
                    );
                    return Ok(next);
                }

                // Slide this slot one full window ahead in the partition.
                let next_offset = agg.offset + offset_step;
                if next_offset >= self.partition.end {
                    // A higher-indexed slot's response outran a lower one;
                    // the remaining tail is already covered by slots still
                    // in flight.
                    trace!(
                        thread_id = self.thread_id,
                        offset = agg.offset,
                        "window slid past partition end, slot retired"
                    );
                    continue;
                }

                let idx = agg.bitmap_index.wrapping_sub(self.base_slot) as usize;
                let Some(header) = self.headers.get_mut(idx) else {
                    warn!(
                        thread_id = self.thread_id,
                        bitmap_index = agg.bitmap_index,
                        "response for a slot this thread does not own, dropped"
                    );
                    continue;
                };

                let version = 1 - (agg.version & 1);
                header.agg.version = version;
                header.agg.aggregation_index =
                    header.agg.bitmap_index + version as u16 * self.slots_per_version;
                header.agg.offset = next_offset;
                resend.push(idx);
            }

            if !resend.is_empty() {
                let start = self.partition.start;
                let frames: Vec<Frame<'_>> = resend
                    .iter()
                    .map(|&i| {
                        let h = &self.headers[i];
                        let rel = (h.agg.offset - start) as usize;
                        Frame {
                            header: h,
                            payload: &self.data[rel..rel + vpp],
                        }
                    })
                    .collect();
                self.transport.send_burst(&frames)?;
            }
        }
    }
}
