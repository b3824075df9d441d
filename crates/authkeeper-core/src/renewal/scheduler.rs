use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::RenewalError;

/// Renew this many minutes before the credential expires
pub const RENEWAL_BUFFER_MINUTES: i64 = 2;

/// Something the scheduler can renew: exposes the current expiry and a way
/// to perform one renewal.
pub trait RenewalTarget: Send + Sync + 'static {
    /// Expiry of the current credential. `None` when there is no credential
    /// or its expiry could not be decoded.
    fn credential_expiry(&self) -> Option<DateTime<Utc>>;

    fn scheduler(&self) -> &RenewalScheduler;

    fn renew(self: Arc<Self>) -> BoxFuture<'static, Result<(), RenewalError>>;
}

struct ArmedTimer {
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    // Bumped on every arm and cancel; a timer whose generation is stale never renews
    generation: u64,
    armed: Option<ArmedTimer>,
}

/// Proactive renewal timer. At most one timer is armed at a time.
#[derive(Default)]
pub struct RenewalScheduler {
    slot: Mutex<TimerSlot>,
}

impl RenewalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().armed.is_some()
    }

    /// When the armed timer fires, if one is armed.
    pub fn armed_deadline(&self) -> Option<Instant> {
        self.slot.lock().armed.as_ref().map(|t| t.deadline)
    }

    /// Schedule the next renewal from the target's current credential.
    ///
    /// Replaces any armed timer. With no known expiry the scheduler stays
    /// unarmed; inside the renewal buffer it renews right away instead of
    /// arming.
    pub fn arm<T: RenewalTarget>(&self, target: &Arc<T>) {
        let Some(expires_at) = target.credential_expiry() else {
            self.cancel();
            debug!("No credential expiry known, renewal timer not armed");
            return;
        };

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.cancel();
                warn!("No async runtime available, renewal timer not armed");
                return;
            }
        };

        let delay = expires_at - Utc::now() - Duration::minutes(RENEWAL_BUFFER_MINUTES);
        if delay <= Duration::zero() {
            self.cancel();
            info!(%expires_at, "Credential inside renewal window, renewing now");
            let target = Arc::clone(target);
            runtime.spawn(async move {
                if let Err(e) = target.renew().await {
                    warn!(error = %e, "Immediate renewal failed");
                }
            });
            return;
        }

        let delay = delay.to_std().unwrap_or_default();
        let deadline = Instant::now() + delay;
        let weak = Arc::downgrade(target);

        let mut slot = self.slot.lock();
        if let Some(previous) = slot.armed.take() {
            previous.handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let Some(target) = weak.upgrade() else {
                return;
            };
            if !target.scheduler().claim(generation) {
                return;
            }

            debug!("Renewal timer fired");
            if let Err(e) = Arc::clone(&target).renew().await {
                warn!(error = %e, "Scheduled renewal failed");
            }
            // Cancelled or re-armed while renewing
            if target.scheduler().is_current(generation) {
                target.scheduler().arm(&target);
            }
        });

        slot.armed = Some(ArmedTimer { deadline, handle });
        debug!(delay_secs = delay.as_secs(), %expires_at, "Renewal timer armed");
    }

    /// Disarm the timer. Safe to call when nothing is armed.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if let Some(timer) = slot.armed.take() {
            timer.handle.abort();
            debug!("Renewal timer cancelled");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.slot.lock().generation == generation
    }

    /// Called by a firing timer: transitions Armed to Unarmed if the timer is
    /// still the current one.
    fn claim(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        slot.armed.take().is_some()
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.slot.get_mut().armed.take() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTarget {
        expiry: Mutex<Option<DateTime<Utc>>>,
        next_expiry: Mutex<Option<DateTime<Utc>>>,
        renewals: AtomicUsize,
        fail: AtomicBool,
        renew_delay: Mutex<Option<std::time::Duration>>,
        scheduler: RenewalScheduler,
    }

    impl FakeTarget {
        fn expiring_in(duration: Duration) -> Arc<Self> {
            let target = Self::default();
            *target.expiry.lock() = Some(Utc::now() + duration);
            Arc::new(target)
        }

        fn renewals(&self) -> usize {
            self.renewals.load(Ordering::SeqCst)
        }
    }

    impl RenewalTarget for FakeTarget {
        fn credential_expiry(&self) -> Option<DateTime<Utc>> {
            *self.expiry.lock()
        }

        fn scheduler(&self) -> &RenewalScheduler {
            &self.scheduler
        }

        fn renew(self: Arc<Self>) -> BoxFuture<'static, Result<(), RenewalError>> {
            async move {
                self.renewals.fetch_add(1, Ordering::SeqCst);
                let delay = *self.renew_delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail.load(Ordering::SeqCst) {
                    return Err(RenewalError::Transport("offline".to_string()));
                }
                let next = *self.next_expiry.lock();
                *self.expiry.lock() = next;
                Ok(())
            }
            .boxed()
        }
    }

    fn minutes(n: u64) -> std::time::Duration {
        std::time::Duration::from_secs(n * 60)
    }

    fn remaining(scheduler: &RenewalScheduler) -> std::time::Duration {
        scheduler.armed_deadline().unwrap() - Instant::now()
    }

    #[tokio::test(start_paused = true)]
    async fn test_arms_buffer_before_expiry() {
        let target = FakeTarget::expiring_in(Duration::minutes(30));
        target.scheduler.arm(&target);

        let delay = remaining(&target.scheduler);
        assert!(delay <= minutes(28));
        assert!(delay >= minutes(28) - std::time::Duration::from_secs(5));

        tokio::time::sleep(minutes(27)).await;
        assert_eq!(target.renewals(), 0);
        assert!(target.scheduler.is_armed());

        tokio::time::sleep(minutes(2)).await;
        assert_eq!(target.renewals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_immediately_inside_buffer() {
        let target = FakeTarget::expiring_in(Duration::seconds(60));
        target.scheduler.arm(&target);

        assert!(!target.scheduler.is_armed());
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(target.renewals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_from_new_expiry_after_firing() {
        let target = FakeTarget::expiring_in(Duration::minutes(30));
        *target.next_expiry.lock() = Some(Utc::now() + Duration::minutes(60));
        let start = Instant::now();
        target.scheduler.arm(&target);

        tokio::time::sleep(minutes(29)).await;
        assert_eq!(target.renewals(), 1);

        // Fired at ~28m, next cycle ~58m later from the 60-minute credential
        let next = target.scheduler.armed_deadline().unwrap() - start;
        assert!(next > minutes(85));
        assert!(next <= minutes(86));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_renewal() {
        let target = FakeTarget::expiring_in(Duration::minutes(30));
        target.scheduler.arm(&target);
        target.scheduler.cancel();
        assert!(!target.scheduler.is_armed());

        tokio::time::sleep(minutes(120)).await;
        assert_eq!(target.renewals(), 0);

        // Idempotent
        target.scheduler.cancel();
        target.scheduler.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let target = FakeTarget::expiring_in(Duration::minutes(30));
        target.scheduler.arm(&target);
        target.scheduler.arm(&target);
        target.scheduler.arm(&target);

        tokio::time::sleep(minutes(29)).await;
        assert_eq!(target.renewals(), 1);
        // next_expiry was None, so nothing is left armed
        assert!(!target.scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_expiry_stays_unarmed() {
        let target = Arc::new(FakeTarget::default());
        target.scheduler.arm(&target);
        assert!(!target.scheduler.is_armed());

        tokio::time::sleep(minutes(60)).await;
        assert_eq!(target.renewals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_failure_is_swallowed() {
        let target = FakeTarget::expiring_in(Duration::minutes(30));
        target.fail.store(true, Ordering::SeqCst);
        target.scheduler.arm(&target);

        tokio::time::sleep(minutes(29)).await;
        assert_eq!(target.renewals(), 1);
        // The old credential is still stored, so the next cycle is scheduled from it
        assert!(target.scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_renewal_is_not_undone() {
        let target = FakeTarget::expiring_in(Duration::minutes(30));
        *target.next_expiry.lock() = Some(Utc::now() + Duration::minutes(60));
        *target.renew_delay.lock() = Some(minutes(5));
        target.scheduler.arm(&target);

        // Fires at ~28m and is still renewing at 29m
        tokio::time::sleep(minutes(29)).await;
        assert_eq!(target.renewals(), 1);
        target.scheduler.cancel();

        tokio::time::sleep(minutes(10)).await;
        assert!(!target.scheduler.is_armed());
        assert_eq!(target.renewals(), 1);
    }

    #[test]
    fn test_arm_without_runtime_drops_previous_timer() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let target = FakeTarget::expiring_in(Duration::minutes(30));

        runtime.block_on(async { target.scheduler.arm(&target) });
        assert!(target.scheduler.is_armed());

        target.scheduler.arm(&target);
        assert!(!target.scheduler.is_armed());
    }
}
