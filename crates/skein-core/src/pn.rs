//! Packet number generation.
//!
//! Numbers are strictly increasing per path. Roughly every
//! [`SKIP_PACKET_AVERAGE_PERIOD`](crate::protocol::SKIP_PACKET_AVERAGE_PERIOD)
//! packets one number is skipped on purpose: a peer acknowledging a
//! skipped number proves it is acking optimistically, and the sent-packet
//! handler turns that into a protocol violation.

use crate::protocol::PacketNumber;
use rand::Rng;

/// Strictly increasing packet number source for one path.
#[derive(Debug)]
pub struct PacketNumberGenerator {
    average_period: PacketNumber,
    next: PacketNumber,
    next_to_skip: PacketNumber,
}

impl PacketNumberGenerator {
    /// Create a generator starting at packet number 1.
    #[must_use]
    pub fn new(average_period: PacketNumber) -> Self {
        let mut generator = Self {
            average_period,
            next: 1,
            next_to_skip: 0,
        };
        generator.generate_new_skip();
        generator
    }

    /// The packet number the next [`PacketNumberGenerator::pop`] will
    /// return. Stable until then.
    #[must_use]
    pub fn peek(&self) -> PacketNumber {
        self.next
    }

    /// Take the next packet number.
    pub fn pop(&mut self) -> PacketNumber {
        let next = self.next;
        self.next += 1;
        if self.next == self.next_to_skip {
            self.next += 1;
            self.generate_new_skip();
        }
        next
    }

    fn generate_new_skip(&mut self) {
        if self.average_period == 0 {
            // Skipping disabled.
            self.next_to_skip = 0;
            return;
        }
        // Uniform draw over [1, 2*period) past the next number gives an
        // average distance of one period between skips.
        let distance = rand::thread_rng().gen_range(1..2 * self.average_period);
        self.next_to_skip = self.next + distance;
    }
}
