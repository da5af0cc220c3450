use std::collections::VecDeque;

use crate::models::domain::PacketRecord;

/// Bounded FIFO of packets waiting for the next batch. A push into a full
/// buffer drops the incoming packet.
#[derive(Debug)]
pub struct PacketBuffer {
    pending: VecDeque<PacketRecord>,
    capacity: usize,
    dropped: u64,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        PacketBuffer { pending: VecDeque::with_capacity(capacity.min(1024)), capacity, dropped: 0 }
    }

    /// Returns false when the packet was dropped.
    pub fn push(&mut self, packet: PacketRecord) -> bool {
        if self.pending.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.pending.push_back(packet);
        true
    }

    /// Remove and return up to `max` packets from the front.
    pub fn take_front(&mut self, max: usize) -> Vec<PacketRecord> {
        let n = max.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;

    fn record(n: u8) -> PacketRecord {
        PacketRecord {
            timestamp: n as f64,
            source: format!("10.0.0.{n}").parse().unwrap(),
            destination: "10.0.0.254".parse().unwrap(),
            src_port: None,
            dst_port: None,
            protocol: Protocol::Other,
            length: 60,
            flags: None,
            source_mac: None,
            dest_mac: None,
            data: Vec::new(),
            transport: None,
        }
    }

    #[test]
    fn test_overflow_drops_newest() {
        let mut buffer = PacketBuffer::new(5);
        let accepted = (0..8).filter(|n| buffer.push(record(*n))).count();
        assert_eq!(accepted, 5);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.dropped(), 3);

        let front = buffer.take_front(2);
        assert_eq!(front.iter().map(|p| p.timestamp as u8).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(buffer.len(), 3);
        assert!(buffer.push(record(9)));
    }

    #[test]
    fn test_take_front_past_end() {
        let mut buffer = PacketBuffer::new(10);
        buffer.push(record(1));
        assert_eq!(buffer.take_front(500).len(), 1);
        assert!(buffer.is_empty());
        assert!(buffer.take_front(500).is_empty());
    }
}
