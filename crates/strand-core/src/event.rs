//! Readiness events and event sets
//!
//! The reactor works with bitmasks whose bits match the Linux epoll
//! constants, so registrations translate to `epoll_event.events` without a
//! mapping table.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// A single readiness interest on a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Event {
    /// Readable (`EPOLLIN`).
    Read = 0x1,
    /// Writable (`EPOLLOUT`).
    Write = 0x4,
}

impl Event {
    /// The event as a one-bit set.
    #[inline]
    pub const fn mask(self) -> EventSet {
        EventSet(self as u32)
    }

    /// The other event of the pair.
    #[inline]
    pub const fn other(self) -> Event {
        match self {
            Event::Read => Event::Write,
            Event::Write => Event::Read,
        }
    }
}

/// A set of readiness events, stored as an epoll-compatible bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u32);

impl EventSet {
    /// The empty set.
    pub const NONE: EventSet = EventSet(0);
    /// Read interest only.
    pub const READ: EventSet = EventSet(Event::Read as u32);
    /// Write interest only.
    pub const WRITE: EventSet = EventSet(Event::Write as u32);
    /// Both interests.
    pub const BOTH: EventSet = EventSet(Event::Read as u32 | Event::Write as u32);

    /// Build a set from raw epoll bits, keeping only bits this runtime uses.
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> EventSet {
        EventSet(bits & Self::BOTH.0)
    }

    /// Raw bitmask, suitable for `epoll_event.events`.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, ev: Event) -> bool {
        self.0 & ev as u32 != 0
    }

    /// Set with `ev` removed.
    #[inline]
    pub const fn removed(self, ev: Event) -> EventSet {
        EventSet(self.0 & !(ev as u32))
    }

    /// Intersection with another set.
    #[inline]
    pub const fn intersect(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }

    /// Set difference: events in `self` that are not in `other`.
    #[inline]
    pub const fn subtract(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    /// Iterate the individual events in the set.
    pub fn iter(self) -> impl Iterator<Item = Event> {
        [Event::Read, Event::Write]
            .into_iter()
            .filter(move |ev| self.contains(*ev))
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    #[inline]
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl BitOr<Event> for EventSet {
    type Output = EventSet;
    #[inline]
    fn bitor(self, rhs: Event) -> EventSet {
        EventSet(self.0 | rhs as u32)
    }
}

impl BitOrAssign<Event> for EventSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs as u32;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::Read), self.contains(Event::Write)) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (true, true) => write!(f, "READ|WRITE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_matches_epoll_bits() {
        assert_eq!(EventSet::READ.bits(), libc_epollin());
        assert_eq!(EventSet::WRITE.bits(), libc_epollout());
    }

    // Spelled out rather than importing libc: the values are ABI constants.
    const fn libc_epollin() -> u32 {
        0x1
    }
    const fn libc_epollout() -> u32 {
        0x4
    }

    #[test]
    fn test_set_algebra() {
        let mut s = EventSet::NONE;
        assert!(s.is_empty());
        s |= Event::Read;
        assert!(s.contains(Event::Read));
        assert!(!s.contains(Event::Write));
        s = s | Event::Write;
        assert_eq!(s, EventSet::BOTH);
        assert_eq!(s.removed(Event::Read), EventSet::WRITE);
        assert_eq!(s.intersect(EventSet::READ), EventSet::READ);
        assert_eq!(EventSet::BOTH.subtract(EventSet::READ), EventSet::WRITE);
    }

    #[test]
    fn test_truncate_drops_foreign_bits() {
        // EPOLLERR | EPOLLHUP style bits must not survive.
        let s = EventSet::from_bits_truncate(0x1 | 0x8 | 0x10);
        assert_eq!(s, EventSet::READ);
    }

    #[test]
    fn test_iter_order() {
        let evs: Vec<_> = EventSet::BOTH.iter().collect();
        assert_eq!(evs, vec![Event::Read, Event::Write]);
    }
}
