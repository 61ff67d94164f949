//! Virtual-terminal allocation for local X displays. Probing `/tmp/.X%d-lock`
//! is racy against other display managers by design — the kernel doesn't
//! offer an atomic "claim the next free VT" primitive this daemon can use
//! without a logind dependency — but at least two Seats in *this* process
//! must not race each other, so allocation is serialized through a mutex
//! held by `DaemonRoot` and threaded down to whichever Display needs one.

use std::path::Path;
use std::sync::Mutex;

/// Held by `DaemonRoot`, one instance shared by every Seat.
pub struct VtAllocator {
    minimum_vt: u32,
    lock: Mutex<()>,
}

impl VtAllocator {
    pub fn new(minimum_vt: u32) -> VtAllocator {
        VtAllocator {
            minimum_vt,
            lock: Mutex::new(()),
        }
    }

    /// Returns the lowest VT number at or above `minimum_vt` with no
    /// `/tmp/.X%d-lock` present. The lock is held for the duration of the
    /// probe only — the caller is expected to create its own lockfile (via
    /// the X server itself) immediately after, so the race window is as
    /// small as it can be made without a kernel-side allocator.
    pub fn allocate(&self) -> u32 {
        let _guard = self.lock.lock().unwrap();
        let mut vt = self.minimum_vt;
        while Path::new(&format!("/tmp/.X{}-lock", vt)).exists() {
            vt += 1;
        }
        vt
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocates_minimum_vt_when_nothing_is_locked() {
        let alloc = VtAllocator::new(7);
        assert_eq!(alloc.allocate(), 7);
    }

    #[test]
    fn two_allocations_do_not_deadlock() {
        let alloc = VtAllocator::new(7);
        assert_eq!(alloc.allocate(), alloc.allocate());
    }
}
