/// State-transition timer.
///
/// Timer callbacks in the target environment run at raised priority, so the
/// fire is handed to a dedicated worker that may take sleepable locks. Each
/// arm bumps a generation counter; the worker passes the generation it saw
/// to the callback, and the owner re-checks it under its own lock; a fire
/// that lost the race to a reply or a cancel silently aborts.
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct TimerCtl {
    deadline: Option<Instant>,
    generation: u64,
    shutdown: bool,
}

pub(crate) struct StateTimer {
    ctl: Arc<(Mutex<TimerCtl>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl StateTimer {
    /// Spawns the deferred worker. `on_fire` receives the generation the
    /// deadline was armed with.
    pub fn new<F>(on_fire: F) -> Self
    where
        F: Fn(u64) + Send + 'static,
    {
        let ctl = Arc::new((
            Mutex::new(TimerCtl { deadline: None, generation: 0, shutdown: false }),
            Condvar::new(),
        ));
        let worker_ctl = Arc::clone(&ctl);
        let worker = std::thread::spawn(move || {
            let (lock, cvar) = &*worker_ctl;
            let mut ctl = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if ctl.shutdown {
                    break;
                }
                match ctl.deadline {
                    None => {
                        ctl = cvar.wait(ctl).unwrap_or_else(|e| e.into_inner());
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now < deadline {
                            let (guard, _) = cvar
                                .wait_timeout(ctl, deadline - now)
                                .unwrap_or_else(|e| e.into_inner());
                            ctl = guard;
                            continue;
                        }
                        // Fired. Capture the generation, release the timer
                        // lock, then call out; the owner re-validates the
                        // generation under its own lock.
                        let generation = ctl.generation;
                        ctl.deadline = None;
                        drop(ctl);
                        on_fire(generation);
                        ctl = lock.lock().unwrap_or_else(|e| e.into_inner());
                    }
                }
            }
        });
        Self { ctl, worker: Some(worker) }
    }

    /// Arms (or re-arms) the timer and returns the generation to validate
    /// against when the fire is delivered.
    pub fn arm(&self, after: Duration) -> u64 {
        let (lock, cvar) = &*self.ctl;
        let mut ctl = lock.lock().unwrap_or_else(|e| e.into_inner());
        ctl.generation += 1;
        ctl.deadline = Some(Instant::now() + after);
        cvar.notify_one();
        ctl.generation
    }

    /// Disarms the timer. A fire already in flight sees a newer generation
    /// at its owner and aborts.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.ctl;
        let mut ctl = lock.lock().unwrap_or_else(|e| e.into_inner());
        ctl.generation += 1;
        ctl.deadline = None;
        cvar.notify_one();
    }
}

impl Drop for StateTimer {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.ctl;
        {
            let mut ctl = lock.lock().unwrap_or_else(|e| e.into_inner());
            ctl.shutdown = true;
            ctl.deadline = None;
            cvar.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
