use crate::worker::Worker;

use std::sync::{Arc, Condvar, Mutex};

/// Capacity of the cross-thread queue. The channel is array-backed, so a
/// post never allocates, which keeps `post_message` signal safe.
pub const MESSAGE_QUEUE_CAPACITY: usize = 16384;

/// Counting semaphore used to wait for queued work to finish on another
/// worker.
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore::default()
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn wait_n(&self, n: usize) {
        for _ in 0..n {
            self.wait();
        }
    }
}

/// One cross-thread message. `User` carries plain words and may be posted
/// from a signal handler; `Task` is the queued-execution vehicle and is
/// posted only from regular code.
pub enum Message {
    User {
        id: u32,
        arg1: usize,
        arg2: usize,
    },
    Task {
        task: Box<dyn FnOnce(&mut Worker) + Send>,
        sem: Option<Arc<Semaphore>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_counts() {
        let sem = Arc::new(Semaphore::new());
        sem.post();
        sem.post();
        sem.wait_n(2);
    }

    #[test]
    fn semaphore_blocks_until_posted() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = Arc::clone(&sem);
        let handle = std::thread::spawn(move || {
            sem2.wait();
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        sem.post();
        handle.join().unwrap();
    }
}
