//! Single-shot timer service.
//!
//! A dedicated thread sleeps until the earliest deadline and fires the
//! expired callbacks outside the queue lock, so a callback may freely
//! schedule or cancel other timers. Deadlines are expressed in
//! microseconds, the unit every TCP timeout in this crate is written in.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

pub type TimerId = u64;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    id: TimerId,
    deadline: Instant,
    job: Job,
}

struct Shared {
    queue: Mutex<Vec<Entry>>,
    cv: Condvar,
    next_id: AtomicU64,
    running: AtomicBool,
}

pub struct TimerService {
    shared: Arc<Shared>,
    epoch: Instant,
    worker: Option<thread::JoinHandle<()>>,
}

impl TimerService {
    pub fn start() -> TimerService {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });

        let worker = {
            let shared = shared.clone();
            thread::spawn(move || fire_loop(shared))
        };

        TimerService {
            shared,
            epoch: Instant::now(),
            worker: Some(worker),
        }
    }

    /// Schedules `job` to run once, `delay_us` microseconds from now.
    pub fn schedule_us(&self, delay_us: u64, job: impl FnOnce() + Send + 'static) -> TimerId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            deadline: Instant::now() + Duration::from_micros(delay_us),
            job: Box::new(job),
        };

        let mut queue = self.shared.queue.lock().unwrap();
        queue.push(entry);
        self.shared.cv.notify_one();

        trace!("timer {id} armed for {delay_us}us");
        id
    }

    /// Revokes a pending timer. Returns false when the timer already
    /// fired (or was never known), in which case its callback runs or
    /// ran anyway.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|e| e.id != id);
        before != queue.len()
    }

    /// Monotonic microseconds since the service started.
    pub fn ticks_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn fire_loop(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock().unwrap();

    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();

        let mut due = Vec::new();
        let mut i = 0;
        while i < queue.len() {
            if queue[i].deadline <= now {
                due.push(queue.swap_remove(i));
            } else {
                i += 1;
            }
        }

        if !due.is_empty() {
            drop(queue);
            for entry in due {
                trace!("timer {} fired", entry.id);
                (entry.job)();
            }
            queue = shared.queue.lock().unwrap();
            continue;
        }

        queue = match queue.iter().map(|e| e.deadline).min() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                shared.cv.wait_timeout(queue, timeout).unwrap().0
            }
            None => shared.cv.wait(queue).unwrap(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_the_delay() {
        let timer = TimerService::start();
        let (tx, rx) = mpsc::channel();

        let started = Instant::now();
        timer.schedule_us(5_000, move || {
            tx.send(started.elapsed()).unwrap();
        });

        let elapsed = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(elapsed >= Duration::from_micros(5_000));
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let timer = TimerService::start();
        let (tx, rx) = mpsc::channel();

        let id = timer.schedule_us(20_000, move || {
            tx.send(()).unwrap();
        });
        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let timer = TimerService::start();
        let (tx, rx) = mpsc::channel();

        for (delay, tag) in [(30_000u64, 3u8), (10_000, 1), (20_000, 2)] {
            let tx = tx.clone();
            timer.schedule_us(delay, move || {
                tx.send(tag).unwrap();
            });
        }

        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        }
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn a_callback_may_rearm_itself() {
        let timer = Arc::new(TimerService::start());
        let (tx, rx) = mpsc::channel();

        let timer2 = timer.clone();
        timer.schedule_us(1_000, move || {
            timer2.schedule_us(1_000, move || {
                tx.send(()).unwrap();
            });
        });

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn tick_counter_is_monotonic() {
        let timer = TimerService::start();
        let a = timer.ticks_us();
        thread::sleep(Duration::from_millis(2));
        let b = timer.ticks_us();
        assert!(b > a);
    }
}
