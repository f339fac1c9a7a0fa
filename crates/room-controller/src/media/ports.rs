//! RTC port allocation shared by all workers on the host.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct PortState {
    next: u16,
    in_use: HashSet<u16>,
}

/// Hands out ports from an inclusive range, round-robin, never the same
/// port twice until it is released.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    state: Mutex<PortState>,
}

impl PortAllocator {
    /// `min` must not exceed `max`; config validation guarantees it.
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            state: Mutex::new(PortState {
                next: min,
                in_use: HashSet::new(),
            }),
        }
    }

    /// Allocate a free port, or `None` when the range is exhausted.
    pub fn allocate(&self) -> Option<u16> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let span = u32::from(self.max - self.min) + 1;

        for _ in 0..span {
            let candidate = state.next;
            state.next = if candidate >= self.max {
                self.min
            } else {
                candidate + 1
            };
            if state.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_use.remove(&port);
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_use.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_in_order_then_exhausts() {
        let ports = PortAllocator::new(40000, 40002);

        assert_eq!(ports.allocate(), Some(40000));
        assert_eq!(ports.allocate(), Some(40001));
        assert_eq!(ports.allocate(), Some(40002));
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.in_use(), 3);
    }

    #[test]
    fn test_released_port_is_reused() {
        let ports = PortAllocator::new(40000, 40001);
        let a = ports.allocate().unwrap();
        let _b = ports.allocate().unwrap();

        ports.release(a);
        assert_eq!(ports.allocate(), Some(a));
    }

    #[test]
    fn test_single_port_range() {
        let ports = PortAllocator::new(50000, 50000);
        assert_eq!(ports.allocate(), Some(50000));
        assert_eq!(ports.allocate(), None);
    }

    #[test]
    fn test_top_of_u16_range_does_not_overflow() {
        let ports = PortAllocator::new(u16::MAX - 1, u16::MAX);
        assert_eq!(ports.allocate(), Some(u16::MAX - 1));
        assert_eq!(ports.allocate(), Some(u16::MAX));
        assert_eq!(ports.allocate(), None);
    }
}
