//! Per-connection reliability bookkeeping: sequence numbers, ack bitmasks,
//! RTT estimation, and loss accounting over a wrapping sequence space.

use std::collections::VecDeque;

use crate::wire::RELIABLE_HEADER_SIZE;

/// Smoothing factor for the RTT exponential moving average.
const RTT_SMOOTHING: f32 = 0.1;
/// Window of received sequence numbers kept for ack-bit generation. One ack
/// plus 32 bitmask positions, with one spare.
const RECEIVED_WINDOW: u32 = 34;
const EPSILON: f32 = 0.001;

/// True when `s1` is logically after `s2` in a sequence space of size
/// `max_sequence + 1`, wraparound included.
#[inline]
pub fn sequence_more_recent(s1: u32, s2: u32, max_sequence: u32) -> bool {
    (s1 > s2 && s1 - s2 <= max_sequence / 2) || (s2 > s1 && s2 - s1 > max_sequence / 2)
}

/// Offset of `sequence` into the 32-bit ack bitmask relative to `ack`.
///
/// Callers must ensure `sequence != ack` and that `sequence` is not more
/// recent than `ack`. Wrapping arithmetic keeps the wraparound branch valid
/// for `max_sequence == u32::MAX`.
#[inline]
pub fn bit_index_for_sequence(sequence: u32, ack: u32, max_sequence: u32) -> u32 {
    debug_assert_ne!(sequence, ack);
    debug_assert!(!sequence_more_recent(sequence, ack, max_sequence));
    if sequence > ack {
        ack.wrapping_add(max_sequence).wrapping_sub(sequence)
    } else {
        ack.wrapping_sub(1).wrapping_sub(sequence)
    }
}

/// One sent, received, or acknowledged datagram. `time` is the age in
/// seconds since the event and only grows while the entry is queued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketData {
    pub sequence: u32,
    pub time: f32,
    pub size: usize,
}

/// Queue of packet records ordered oldest to newest by sequence number,
/// with wraparound. Duplicate sequences are rejected at insert.
#[derive(Debug, Default)]
pub struct PacketQueue {
    entries: VecDeque<PacketData>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn front(&self) -> Option<&PacketData> {
        self.entries.front()
    }

    pub fn back(&self) -> Option<&PacketData> {
        self.entries.back()
    }

    pub fn pop_front(&mut self) -> Option<PacketData> {
        self.entries.pop_front()
    }

    pub fn get(&self, index: usize) -> Option<&PacketData> {
        self.entries.get(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<PacketData> {
        self.entries.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PacketData> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PacketData> {
        self.entries.iter_mut()
    }

    pub fn exists(&self, sequence: u32) -> bool {
        self.entries.iter().any(|p| p.sequence == sequence)
    }

    /// Inserts preserving wraparound order; a duplicate sequence is dropped.
    pub fn insert_sorted(&mut self, data: PacketData, max_sequence: u32) {
        if self.entries.is_empty() {
            self.entries.push_back(data);
            return;
        }
        if !sequence_more_recent(
            data.sequence,
            self.entries.front().unwrap().sequence,
            max_sequence,
        ) {
            if self.entries.front().unwrap().sequence != data.sequence {
                self.entries.push_front(data);
            }
            return;
        }
        if sequence_more_recent(
            data.sequence,
            self.entries.back().unwrap().sequence,
            max_sequence,
        ) {
            self.entries.push_back(data);
            return;
        }
        for i in 0..self.entries.len() {
            if self.entries[i].sequence == data.sequence {
                return;
            }
            if sequence_more_recent(self.entries[i].sequence, data.sequence, max_sequence) {
                self.entries.insert(i, data);
                return;
            }
        }
    }

    #[cfg(debug_assertions)]
    fn verify_sorted(&self, max_sequence: u32) {
        for pair in self
            .entries
            .iter()
            .zip(self.entries.iter().skip(1))
        {
            debug_assert!(
                sequence_more_recent(pair.1.sequence, pair.0.sequence, max_sequence),
                "queue order violated: {} before {}",
                pair.0.sequence,
                pair.1.sequence
            );
        }
    }
}

/// ORs together the bitmask positions of every received sequence older than
/// `ack`. The queue is ordered, so the walk stops at the first entry that is
/// `ack` or newer.
pub fn generate_ack_bits(ack: u32, received_queue: &PacketQueue, max_sequence: u32) -> u32 {
    let mut ack_bits = 0u32;
    for packet in received_queue.iter() {
        if packet.sequence == ack || sequence_more_recent(packet.sequence, ack, max_sequence) {
            break;
        }
        let bit_index = bit_index_for_sequence(packet.sequence, ack, max_sequence);
        if bit_index <= 31 {
            ack_bits |= 1 << bit_index;
        }
    }
    ack_bits
}

/// Walks the pending-ack queue against `ack` / `ack_bits`, moving every
/// acknowledged packet to the acked queue, recording its sequence in `acks`,
/// and folding its age into the RTT moving average.
#[allow(clippy::too_many_arguments)]
pub fn process_ack(
    ack: u32,
    ack_bits: u32,
    pending_ack_queue: &mut PacketQueue,
    acked_queue: &mut PacketQueue,
    acks: &mut Vec<u32>,
    acked_packets: &mut u32,
    rtt: &mut f32,
    max_sequence: u32,
) {
    let mut i = 0;
    while i < pending_ack_queue.len() {
        let packet = *pending_ack_queue.get(i).unwrap();
        let acked = if packet.sequence == ack {
            true
        } else if !sequence_more_recent(packet.sequence, ack, max_sequence) {
            let bit_index = bit_index_for_sequence(packet.sequence, ack, max_sequence);
            bit_index <= 31 && (ack_bits >> bit_index) & 1 != 0
        } else {
            false
        };

        if acked {
            *rtt += (packet.time - *rtt) * RTT_SMOOTHING;
            acked_queue.insert_sorted(packet, max_sequence);
            acks.push(packet.sequence);
            *acked_packets += 1;
            pending_ack_queue.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Reliability state for one logical connection: local/remote sequence
/// numbers, the four packet queues, counters and bandwidth figures.
#[derive(Debug)]
pub struct ReliabilitySystem {
    max_sequence: u32,
    local_sequence: u32,
    remote_sequence: u32,
    sent_packets: u32,
    recv_packets: u32,
    lost_packets: u32,
    acked_packets: u32,
    sent_bandwidth: f32,
    acked_bandwidth: f32,
    rtt: f32,
    rtt_maximum: f32,
    acks: Vec<u32>,
    sent_queue: PacketQueue,
    pending_ack_queue: PacketQueue,
    received_queue: PacketQueue,
    acked_queue: PacketQueue,
}

impl Default for ReliabilitySystem {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl ReliabilitySystem {
    pub const HEADER_SIZE: usize = RELIABLE_HEADER_SIZE;

    pub fn new(max_sequence: u32) -> Self {
        Self {
            max_sequence,
            local_sequence: 0,
            remote_sequence: 0,
            sent_packets: 0,
            recv_packets: 0,
            lost_packets: 0,
            acked_packets: 0,
            sent_bandwidth: 0.0,
            acked_bandwidth: 0.0,
            rtt: 0.0,
            rtt_maximum: 1.0,
            acks: Vec::new(),
            sent_queue: PacketQueue::new(),
            pending_ack_queue: PacketQueue::new(),
            received_queue: PacketQueue::new(),
            acked_queue: PacketQueue::new(),
        }
    }

    pub fn reset(&mut self) {
        self.local_sequence = 0;
        self.remote_sequence = 0;
        self.sent_packets = 0;
        self.recv_packets = 0;
        self.lost_packets = 0;
        self.acked_packets = 0;
        self.sent_bandwidth = 0.0;
        self.acked_bandwidth = 0.0;
        self.rtt = 0.0;
        self.acks.clear();
        self.sent_queue.clear();
        self.pending_ack_queue.clear();
        self.received_queue.clear();
        self.acked_queue.clear();
    }

    /// Records an outbound packet under the current local sequence, then
    /// advances (and wraps) the sequence.
    pub fn packet_sent(&mut self, size: usize) {
        if self.sent_queue.exists(self.local_sequence) {
            log::warn!(
                "local sequence {} already in sent queue, dropping record",
                self.local_sequence
            );
            return;
        }
        let data = PacketData {
            sequence: self.local_sequence,
            time: 0.0,
            size,
        };
        self.sent_queue.insert_sorted(data, self.max_sequence);
        self.pending_ack_queue.insert_sorted(data, self.max_sequence);
        self.sent_packets += 1;
        self.local_sequence = self.local_sequence.wrapping_add(1);
        if self.local_sequence > self.max_sequence {
            self.local_sequence = 0;
        }
    }

    /// Records an inbound packet; duplicates are ignored. Returns false for
    /// a duplicate.
    pub fn packet_received(&mut self, sequence: u32, size: usize) -> bool {
        self.recv_packets += 1;
        if self.received_queue.exists(sequence) {
            return false;
        }
        let data = PacketData {
            sequence,
            time: 0.0,
            size,
        };
        self.received_queue.insert_sorted(data, self.max_sequence);
        if sequence_more_recent(sequence, self.remote_sequence, self.max_sequence) {
            self.remote_sequence = sequence;
        }
        true
    }

    pub fn generate_ack_bits(&self) -> u32 {
        generate_ack_bits(self.remote_sequence, &self.received_queue, self.max_sequence)
    }

    pub fn process_ack(&mut self, ack: u32, ack_bits: u32) {
        process_ack(
            ack,
            ack_bits,
            &mut self.pending_ack_queue,
            &mut self.acked_queue,
            &mut self.acks,
            &mut self.acked_packets,
            &mut self.rtt,
            self.max_sequence,
        );
    }

    pub fn update(&mut self, dt: f32) {
        self.acks.clear();
        self.advance_queue_time(dt);
        self.update_queues();
        self.update_stats();
        #[cfg(debug_assertions)]
        self.validate();
    }

    fn advance_queue_time(&mut self, dt: f32) {
        for queue in [
            &mut self.sent_queue,
            &mut self.received_queue,
            &mut self.pending_ack_queue,
            &mut self.acked_queue,
        ] {
            for packet in queue.iter_mut() {
                packet.time += dt;
            }
        }
    }

    fn update_queues(&mut self) {
        while self
            .sent_queue
            .front()
            .is_some_and(|p| p.time > self.rtt_maximum + EPSILON)
        {
            self.sent_queue.pop_front();
        }

        // A sequence space no wider than the window never needs trimming.
        if self.max_sequence > RECEIVED_WINDOW {
            if let Some(latest) = self.received_queue.back().map(|p| p.sequence) {
                let minimum = if latest >= RECEIVED_WINDOW {
                    latest - RECEIVED_WINDOW
                } else {
                    self.max_sequence - (RECEIVED_WINDOW - latest)
                };
                while self
                    .received_queue
                    .front()
                    .is_some_and(|p| !sequence_more_recent(p.sequence, minimum, self.max_sequence))
                {
                    self.received_queue.pop_front();
                }
            }
        }

        while self
            .acked_queue
            .front()
            .is_some_and(|p| p.time > self.rtt_maximum * 2.0 - EPSILON)
        {
            self.acked_queue.pop_front();
        }

        while self
            .pending_ack_queue
            .front()
            .is_some_and(|p| p.time > self.rtt_maximum + EPSILON)
        {
            let lost = self.pending_ack_queue.pop_front().unwrap();
            self.lost_packets += 1;
            log::debug!("packet {} lost", lost.sequence);
        }
    }

    fn update_stats(&mut self) {
        let sent_bytes: usize = self.sent_queue.iter().map(|p| p.size).sum();
        let acked_bytes: usize = self
            .acked_queue
            .iter()
            .filter(|p| p.time >= self.rtt_maximum)
            .map(|p| p.size)
            .sum();
        let sent_bytes_per_second = sent_bytes as f32 / self.rtt_maximum;
        let acked_bytes_per_second = acked_bytes as f32 / self.rtt_maximum;
        self.sent_bandwidth = sent_bytes_per_second * (8.0 / 1000.0);
        self.acked_bandwidth = acked_bytes_per_second * (8.0 / 1000.0);
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        self.sent_queue.verify_sorted(self.max_sequence);
        self.received_queue.verify_sorted(self.max_sequence);
        self.pending_ack_queue.verify_sorted(self.max_sequence);
        self.acked_queue.verify_sorted(self.max_sequence);
    }

    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    pub fn max_sequence(&self) -> u32 {
        self.max_sequence
    }

    /// Sequences acknowledged since the last `update`.
    pub fn acks(&self) -> &[u32] {
        &self.acks
    }

    pub fn sent_packets(&self) -> u32 {
        self.sent_packets
    }

    pub fn received_packets(&self) -> u32 {
        self.recv_packets
    }

    pub fn lost_packets(&self) -> u32 {
        self.lost_packets
    }

    pub fn acked_packets(&self) -> u32 {
        self.acked_packets
    }

    pub fn rtt(&self) -> f32 {
        self.rtt
    }

    pub fn rtt_maximum(&self) -> f32 {
        self.rtt_maximum
    }

    pub fn sent_bandwidth(&self) -> f32 {
        self.sent_bandwidth
    }

    pub fn acked_bandwidth(&self) -> f32 {
        self.acked_bandwidth
    }
}
