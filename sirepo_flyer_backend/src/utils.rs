use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};

/// Counting semaphore bounding how many copies run at the same time.
pub struct Semaphore {
    count: Mutex<usize>,
    condition: Condvar,
}

impl Semaphore {
    pub fn new(init_count: usize) -> Self {
        Semaphore {
            count: Mutex::new(init_count),
            condition: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count < 1 {
            self.condition.wait(&mut count);
        }
        *count -= 1;
    }

    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condition.notify_one();
    }

    /// Acquires a permit that is released when the returned guard drops.
    pub fn access(&self) -> SemaphorePermit<'_> {
        self.acquire();
        SemaphorePermit { sem: self }
    }

    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

/// Lowercase hex SHA-256 of a result artifact.
pub fn content_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[cfg(test)]
mod test {
    mod semaphore {
        use crate::utils::*;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        #[test]
        fn permits_are_returned_on_drop() {
            let sem = Semaphore::new(2);
            {
                let _a = sem.access();
                let _b = sem.access();
                assert_eq!(sem.available(), 0);
            }
            assert_eq!(sem.available(), 2);
        }

        #[test]
        fn bounds_concurrency() {
            let sem = Arc::new(Semaphore::new(2));
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    let (sem, running, peak) = (sem.clone(), running.clone(), peak.clone());
                    thread::spawn(move || {
                        let _permit = sem.access();
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert!(peak.load(Ordering::SeqCst) <= 2);
            assert_eq!(sem.available(), 2);
        }
    }

    mod hashing {
        use crate::utils::*;

        #[test]
        fn sha256_hex() {
            assert_eq!(
                content_hash(b"abc"),
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            );
        }
    }
}
