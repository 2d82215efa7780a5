//! Port pair allocation for relay endpoints.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::{TransportResult, DEFAULT_PORT_BASE, DEFAULT_PORT_CEILING};

/// RTP and RTCP ports the transcoder listens on for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub media: u16,
    pub control: u16,
}

/// Port range configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    /// First media port.
    pub base: u16,

    /// Number of slots before the counter wraps back to `base`.
    pub ceiling: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            base: DEFAULT_PORT_BASE,
            ceiling: DEFAULT_PORT_CEILING,
        }
    }
}

/// Hands out disjoint port pairs from a wrapping counter.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    ceiling: u16,
    counter: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    /// Create an allocator. The base is clamped so at least one pair fits and
    /// the ceiling is clamped so every slot fits in the port space.
    pub fn new(range: &PortRange) -> Self {
        let base = range.base.min(u16::MAX - 1);
        if base != range.base {
            warn!(requested = range.base, base, "Port base clamped");
        }

        let max_slots = ((u16::MAX as u32 - base as u32 + 1) / 2) as u16;
        let ceiling = range.ceiling.clamp(1, max_slots.max(1));
        if ceiling != range.ceiling {
            warn!(requested = range.ceiling, ceiling, "Port ceiling clamped");
        }

        Self {
            base,
            ceiling,
            counter: 0,
            in_use: HashSet::new(),
        }
    }

    /// Reserve the next free pair, skipping slots still in use.
    pub fn allocate(&mut self) -> TransportResult<PortPair> {
        for _ in 0..self.ceiling {
            let slot = self.counter;
            self.counter = (self.counter + 1) % self.ceiling;

            let Some((media, control)) = self.pair_at(slot) else {
                continue;
            };
            if self.in_use.insert(media) {
                debug!(media, control, "Port pair allocated");
                return Ok(PortPair { media, control });
            }
        }

        Err(TransportError::PortExhausted(self.ceiling))
    }

    fn pair_at(&self, slot: u16) -> Option<(u16, u16)> {
        let media = slot.checked_mul(2)?.checked_add(self.base)?;
        let control = media.checked_add(1)?;
        Some((media, control))
    }

    /// Return a pair to the pool. Returns false if it was not allocated.
    pub fn release(&mut self, pair: PortPair) -> bool {
        self.in_use.remove(&pair.media)
    }

    /// Number of pairs currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    pub fn ceiling(&self) -> u16 {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(ceiling: u16) -> PortAllocator {
        PortAllocator::new(&PortRange {
            base: 30000,
            ceiling,
        })
    }

    #[test]
    fn test_allocates_consecutive_pairs() {
        let mut ports = allocator(100);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_eq!(a, PortPair { media: 30000, control: 30001 });
        assert_eq!(b, PortPair { media: 30002, control: 30003 });
    }

    #[test]
    fn test_counter_wraps_to_base_after_ceiling() {
        let mut ports = allocator(3);
        let first = ports.allocate().unwrap();
        let second = ports.allocate().unwrap();
        let third = ports.allocate().unwrap();
        assert!(ports.release(first));
        assert!(ports.release(third));

        // Counter is back at slot 0, which is free again.
        assert_eq!(ports.allocate().unwrap(), first);
        // Slot 1 is still held, so slot 2 is next.
        assert_eq!(ports.allocate().unwrap(), third);
        assert_ne!(second, third);
    }

    #[test]
    fn test_exhaustion_reports_error() {
        let mut ports = allocator(2);
        ports.allocate().unwrap();
        ports.allocate().unwrap();
        assert!(matches!(
            ports.allocate(),
            Err(TransportError::PortExhausted(2))
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ports = allocator(4);
        let pair = ports.allocate().unwrap();
        assert!(ports.release(pair));
        assert!(!ports.release(pair));
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn test_live_pairs_stay_disjoint() {
        let mut ports = allocator(8);
        let mut live: Vec<PortPair> = Vec::new();
        let mut seed: u32 = 7;

        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if seed % 3 == 0 && !live.is_empty() {
                let idx = (seed as usize / 3) % live.len();
                let pair = live.swap_remove(idx);
                assert!(ports.release(pair));
            } else if let Ok(pair) = ports.allocate() {
                live.push(pair);
            } else {
                assert_eq!(live.len(), 8);
            }

            let mut seen = HashSet::new();
            for pair in &live {
                assert!(seen.insert(pair.media));
                assert!(seen.insert(pair.control));
            }
        }
    }

    #[test]
    fn test_ceiling_clamped_to_port_space() {
        let ports = PortAllocator::new(&PortRange {
            base: 65530,
            ceiling: 100,
        });
        assert_eq!(ports.ceiling(), 3);

        let mut ports = ports;
        let pairs: Vec<PortPair> = (0..3).map(|_| ports.allocate().unwrap()).collect();
        assert_eq!(pairs[2], PortPair { media: 65534, control: 65535 });
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn test_base_at_top_of_port_space() {
        let mut ports = PortAllocator::new(&PortRange {
            base: 65534,
            ceiling: 100,
        });
        assert_eq!(ports.ceiling(), 1);
        assert_eq!(
            ports.allocate().unwrap(),
            PortPair { media: 65534, control: 65535 }
        );
        assert!(matches!(
            ports.allocate(),
            Err(TransportError::PortExhausted(1))
        ));

        let mut ports = PortAllocator::new(&PortRange {
            base: 65535,
            ceiling: 100,
        });
        assert_eq!(ports.ceiling(), 1);
        assert_eq!(
            ports.allocate().unwrap(),
            PortPair { media: 65534, control: 65535 }
        );
        assert!(ports.allocate().is_err());
    }
}
