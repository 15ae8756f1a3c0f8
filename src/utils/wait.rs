//! High-precision wait.

use std::hint::spin_loop;
use std::time::Duration;

use quanta::Instant;

/// Synchronously busy-wait for some nanoseconds.
pub fn busy_wait(nanos: u64) {
    if nanos == 0 {
        return;
    }
    let start = Instant::now();
    let end = start + Duration::from_nanos(nanos);
    while Instant::now() < end {
        // Hint the CPU to spin.
        spin_loop();
    }
}

/// Synchronously busy-wait for some duration.
pub fn busy_wait_dur(dur: Duration) {
    let start = Instant::now();
    let end = start + dur;
    while Instant::now() < end {
        // Hint the CPU to spin.
        spin_loop();
    }
}
