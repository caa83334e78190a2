//! Deferred wake scheduling
//!
//! Alarms live outside the worker queue. Arming one hands the scheduler a
//! closure that posts a message back onto the queue when the deadline passes,
//! so the state change itself still happens on the worker. Deadlines are
//! expressed on the [`Clock::elapsed_realtime`] base.

use crate::clock::Clock;
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Identifies one armed alarm; scheduling a token again replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeToken {
    /// Give up waiting for a fix and hibernate
    NoFixTimeout,
    /// Wake from hibernation and restart navigation
    HibernateWakeup,
    /// Next time-injection attempt
    TimeInjection,
    /// Next ephemeris download attempt
    XtraDownload,
}

pub type FireFn = Box<dyn FnOnce() + Send>;

/// Schedules a callback at a deadline
pub trait WakeScheduler: Send + Sync {
    fn schedule(&self, token: WakeToken, deadline: Duration, on_fire: FireFn);
    fn cancel(&self, token: WakeToken);
}

enum Command {
    Schedule(WakeToken, Duration, FireFn),
    Cancel(WakeToken),
    Shutdown,
}

/// Scheduler running its own timer thread
pub struct ThreadWakeScheduler {
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadWakeScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Command>();

        let handle = std::thread::Builder::new()
            .name("gnss-alarm".to_string())
            .spawn(move || {
                let mut pending: HashMap<WakeToken, (Duration, FireFn)> = HashMap::new();

                loop {
                    let next = pending.values().map(|(deadline, _)| *deadline).min();
                    let command = match next {
                        Some(deadline) => {
                            let wait = deadline.saturating_sub(clock.elapsed_realtime());
                            rx.recv_timeout(wait)
                        }
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match command {
                        Ok(Command::Schedule(token, deadline, on_fire)) => {
                            pending.insert(token, (deadline, on_fire));
                        }
                        Ok(Command::Cancel(token)) => {
                            pending.remove(&token);
                        }
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            let now = clock.elapsed_realtime();
                            let due: Vec<WakeToken> = pending
                                .iter()
                                .filter(|(_, (deadline, _))| *deadline <= now)
                                .map(|(token, _)| *token)
                                .collect();
                            for token in due {
                                if let Some((_, on_fire)) = pending.remove(&token) {
                                    log::debug!("Alarm {:?} fired", token);
                                    on_fire();
                                }
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            commands: tx,
            handle: Some(handle),
        })
    }
}

impl WakeScheduler for ThreadWakeScheduler {
    fn schedule(&self, token: WakeToken, deadline: Duration, on_fire: FireFn) {
        let _ = self.commands.send(Command::Schedule(token, deadline, on_fire));
    }

    fn cancel(&self, token: WakeToken) {
        let _ = self.commands.send(Command::Cancel(token));
    }
}

impl Drop for ThreadWakeScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker-side record of which alarms are armed.
///
/// Each arming gets a generation number carried by the fire message, so a
/// message from an alarm that was cancelled or re-armed after it fired is
/// recognised as stale.
pub struct Alarms {
    scheduler: Arc<dyn WakeScheduler>,
    armed: HashMap<WakeToken, (Duration, u64)>,
    generation: u64,
}

impl Alarms {
    pub fn new(scheduler: Arc<dyn WakeScheduler>) -> Self {
        Self {
            scheduler,
            armed: HashMap::new(),
            generation: 0,
        }
    }

    /// Arm `token` for `deadline`; `fire` receives the generation to post back.
    pub fn arm<F>(&mut self, token: WakeToken, deadline: Duration, fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.generation += 1;
        let generation = self.generation;
        self.armed.insert(token, (deadline, generation));
        log::debug!("Arming {:?} at {:?}", token, deadline);
        self.scheduler
            .schedule(token, deadline, Box::new(move || fire(generation)));
    }

    pub fn cancel(&mut self, token: WakeToken) {
        if self.armed.remove(&token).is_some() {
            self.scheduler.cancel(token);
        }
    }

    pub fn is_armed(&self, token: WakeToken) -> bool {
        self.armed.contains_key(&token)
    }

    pub fn deadline(&self, token: WakeToken) -> Option<Duration> {
        self.armed.get(&token).map(|(deadline, _)| *deadline)
    }

    /// Consume a fired alarm. Returns false for stale fires.
    pub fn take_fired(&mut self, token: WakeToken, generation: u64) -> bool {
        match self.armed.get(&token) {
            Some((_, armed)) if *armed == generation => {
                self.armed.remove(&token);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::mock::MockScheduler;
    use crossbeam::channel::bounded;

    #[test]
    fn test_alarms_stale_generation() {
        let scheduler = Arc::new(MockScheduler::new());
        let mut alarms = Alarms::new(scheduler.clone());

        alarms.arm(WakeToken::HibernateWakeup, Duration::from_secs(5), |_| {});
        let first = alarms.generation;
        alarms.arm(WakeToken::HibernateWakeup, Duration::from_secs(9), |_| {});

        assert_eq!(
            alarms.deadline(WakeToken::HibernateWakeup),
            Some(Duration::from_secs(9))
        );
        assert!(!alarms.take_fired(WakeToken::HibernateWakeup, first));
        assert!(alarms.take_fired(WakeToken::HibernateWakeup, alarms.generation));
        assert!(!alarms.is_armed(WakeToken::HibernateWakeup));
    }

    #[test]
    fn test_cancel_forwards_to_scheduler() {
        let scheduler = Arc::new(MockScheduler::new());
        let mut alarms = Alarms::new(scheduler.clone());

        alarms.arm(WakeToken::NoFixTimeout, Duration::from_secs(60), |_| {});
        assert!(scheduler.is_scheduled(WakeToken::NoFixTimeout));

        alarms.cancel(WakeToken::NoFixTimeout);
        assert!(!scheduler.is_scheduled(WakeToken::NoFixTimeout));
        assert!(!alarms.is_armed(WakeToken::NoFixTimeout));
    }

    #[test]
    fn test_thread_scheduler_fires() {
        let clock = Arc::new(SystemClock::new());
        let scheduler = ThreadWakeScheduler::new(clock.clone()).unwrap();
        let (tx, rx) = bounded(1);

        let deadline = clock.elapsed_realtime() + Duration::from_millis(20);
        scheduler.schedule(
            WakeToken::TimeInjection,
            deadline,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_thread_scheduler_cancel() {
        let clock = Arc::new(SystemClock::new());
        let scheduler = ThreadWakeScheduler::new(clock.clone()).unwrap();
        let (tx, rx) = bounded(1);

        let deadline = clock.elapsed_realtime() + Duration::from_millis(50);
        scheduler.schedule(
            WakeToken::XtraDownload,
            deadline,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        scheduler.cancel(WakeToken::XtraDownload);

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
