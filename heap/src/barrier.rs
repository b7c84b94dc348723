use parking_lot::{Condvar, Mutex};

/// A reusable sense-reversing barrier.
///
/// The stop-the-world rendezvous parks every worker here; the last
/// arrival flips the sense and wakes the rest.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    /// Protected state: (current_count, current_sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self { state: Mutex::new((0, false)), cvar: Condvar::new() }
    }

    /// Blocks the current thread until `until` threads have called this
    /// function. Returns true on the thread that arrived last.
    pub fn wait(&self, until: usize) -> bool {
        let mut state = self.state.lock();

        let my_sense = state.1;
        state.0 += 1;

        if state.0 == until {
            state.0 = 0;
            state.1 = !my_sense;
            self.cvar.notify_all();
            true
        } else {
            while state.1 == my_sense {
                self.cvar.wait(&mut state);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn all_threads_pass_and_exactly_one_is_last() {
        let barrier = Arc::new(SenseBarrier::new());
        let last_count = Arc::new(AtomicUsize::new(0));
        let n = 4;

        let mut handles = Vec::new();
        for _ in 0..n {
            let barrier = barrier.clone();
            let last_count = last_count.clone();
            handles.push(std::thread::spawn(move || {
                if barrier.wait(n) {
                    last_count.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(last_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn barrier_is_reusable() {
        let barrier = Arc::new(SenseBarrier::new());
        for _ in 0..3 {
            let b1 = barrier.clone();
            let h = std::thread::spawn(move || b1.wait(2));
            barrier.wait(2);
            h.join().unwrap();
        }
    }
}
