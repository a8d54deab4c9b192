use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::model::{BeanId, BeanRef};

/// Process-wide record of beans whose derived properties are still being
/// assigned, and by which thread.
///
/// Readers on other threads block until the mark is removed or the timeout
/// elapses. The timeout is a liveness valve: on expiry the reader logs and
/// carries on with whatever state the bean is in.
pub struct PartialInflation {
    beans: Mutex<HashMap<BeanId, ThreadId>>,
    changed: Condvar,
    timeout: Duration,
}

impl PartialInflation {
    pub fn new(timeout: Duration) -> Self {
        Self {
            beans: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark a bean as being inflated by the current thread
    pub fn add(&self, bean: &BeanRef) {
        self.beans.lock().insert(bean.id(), thread::current().id());
    }

    pub fn is_partially_inflated(&self, id: BeanId) -> bool {
        self.beans.lock().contains_key(&id)
    }

    pub fn owner(&self, id: BeanId) -> Option<ThreadId> {
        self.beans.lock().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.beans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove marks and wake every waiting reader
    pub fn remove_all<'a>(&self, beans: impl IntoIterator<Item = &'a BeanRef>) {
        let mut marks = self.beans.lock();
        for bean in beans {
            marks.remove(&bean.id());
        }
        self.changed.notify_all();
    }

    /// Drop every mark. Used when the load stack unwinds completely, so marks
    /// orphaned by a failed load cannot block readers.
    pub fn clear(&self) {
        let mut marks = self.beans.lock();
        if !marks.is_empty() {
            marks.clear();
        }
        self.changed.notify_all();
    }

    /// Block while another thread holds an inflation mark on the bean
    pub fn wait_for(&self, bean: &BeanRef, log_prefix: &str) {
        let me = thread::current().id();
        let deadline = Instant::now() + self.timeout;
        let mut waited = false;

        let mut marks = self.beans.lock();
        while let Some(owner) = marks.get(&bean.id()).copied() {
            if owner == me {
                break;
            }
            if !waited {
                info!(
                    "{}waiting for {} to be inflated by {:?}",
                    log_prefix, bean, owner
                );
                waited = true;
            }
            if self.changed.wait_until(&mut marks, deadline).timed_out() {
                warn!(
                    "{}timed out after {:?} waiting for {} to be inflated, continuing with partial data",
                    log_prefix, self.timeout, bean
                );
                return;
            }
        }

        if waited {
            info!("{}finished waiting for {}", log_prefix, bean);
        }
    }

    pub fn wait_for_all<'a>(&self, beans: impl IntoIterator<Item = &'a BeanRef>, log_prefix: &str) {
        for bean in beans {
            self.wait_for(bean, log_prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bean;
    use std::sync::Arc;

    #[test]
    fn test_owner_thread_does_not_wait() {
        let inflation = PartialInflation::new(Duration::from_secs(60));
        let bean = Bean::new("Trade");
        inflation.add(&bean);
        let started = Instant::now();
        inflation.wait_for(&bean, "");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(inflation.owner(bean.id()), Some(thread::current().id()));
    }

    #[test]
    fn test_other_thread_waits_for_removal() {
        let inflation = Arc::new(PartialInflation::new(Duration::from_secs(60)));
        let bean = Bean::new("Trade");
        inflation.add(&bean);

        let waiter = {
            let inflation = inflation.clone();
            let bean = bean.clone();
            thread::spawn(move || {
                let started = Instant::now();
                inflation.wait_for(&bean, "");
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(200));
        inflation.remove_all([&bean]);
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(150));
        assert!(inflation.is_empty());
    }

    #[test]
    fn test_wait_times_out() {
        let inflation = Arc::new(PartialInflation::new(Duration::from_millis(100)));
        let bean = Bean::new("Trade");
        inflation.add(&bean);

        let waiter = {
            let inflation = inflation.clone();
            let bean = bean.clone();
            thread::spawn(move || inflation.wait_for(&bean, ""))
        };
        waiter.join().unwrap();
        // The mark is still there, the reader just stopped waiting
        assert!(inflation.is_partially_inflated(bean.id()));
    }
}
