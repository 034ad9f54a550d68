//! Blocking primitives shared by the scheduler, worker, and IRQ paths.

use std::sync::{Condvar, Mutex};

/// A latched single-slot event.
///
/// `signal` latches the event and wakes every waiter; a `wait` that arrives
/// after the latch is set returns immediately. `reset` re-arms the event.
/// Consumers that want edge semantics reset before (or right after) waiting.
pub(crate) struct Completion {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_when_already_signaled() {
        let c = Completion::new();
        c.signal();
        c.wait();
        // Still latched until reset.
        c.wait();
    }

    #[test]
    fn reset_rearms_the_event() {
        let c = Arc::new(Completion::new());
        c.signal();
        c.wait();
        c.reset();

        let waiter = {
            let c = c.clone();
            thread::spawn(move || c.wait())
        };
        thread::sleep(Duration::from_millis(10));
        c.signal();
        waiter.join().expect("waiter should be woken by signal");
    }
}
