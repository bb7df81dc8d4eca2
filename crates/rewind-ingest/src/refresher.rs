//! Background Refresher - TTL Cache with Single-Flight Refresh
//!
//! Wraps a value produced by an async loader. The first `get()` waits for the
//! loader; afterwards `get()` always returns the last successful value
//! immediately and, once the value is older than the refresh interval, kicks
//! off at most one background reload. A failed reload never evicts the value:
//! it is logged and the stale value keeps serving until the next interval
//! elapses.
//!
//! The component is parametric over the loader, so one implementation covers
//! both the token table and the broker high-water offsets.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::Result;

pub type LoaderFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type Loader<T> = Arc<dyn Fn() -> LoaderFuture<T> + Send + Sync>;

struct Cached<T> {
    value: T,
    /// Completion time of the last load *attempt*, successful or not. Using
    /// attempt time rather than success time bounds failed reloads (and
    /// their warnings) to one per interval.
    refreshed_at: Instant,
}

pub struct BackgroundRefresher<T> {
    label: String,
    interval: Duration,
    loader: Loader<T>,
    state: Arc<RwLock<Option<Cached<T>>>>,
    refreshing: Arc<AtomicBool>,
    init_lock: Arc<Mutex<()>>,
}

impl<T> Clone for BackgroundRefresher<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            interval: self.interval,
            loader: self.loader.clone(),
            state: self.state.clone(),
            refreshing: self.refreshing.clone(),
            init_lock: self.init_lock.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BackgroundRefresher<T> {
    pub fn new<F>(label: impl Into<String>, interval: Duration, loader: F) -> Self
    where
        F: Fn() -> LoaderFuture<T> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            interval,
            loader: Arc::new(loader),
            state: Arc::new(RwLock::new(None)),
            refreshing: Arc::new(AtomicBool::new(false)),
            init_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current value. Waits for the loader only on the very first call;
    /// afterwards returns immediately, refreshing in the background when the
    /// value has aged past the interval.
    pub async fn get(&self) -> Result<T> {
        {
            let state = self.state.read().await;
            if let Some(cached) = state.as_ref() {
                let value = cached.value.clone();
                let stale = cached.refreshed_at.elapsed() >= self.interval;
                drop(state);

                if stale && !self.refreshing.swap(true, Ordering::SeqCst) {
                    self.spawn_refresh();
                }
                return Ok(value);
            }
        }

        // Initial load: serialize concurrent first callers behind one loader run.
        let _guard = self.init_lock.lock().await;
        {
            let state = self.state.read().await;
            if let Some(cached) = state.as_ref() {
                return Ok(cached.value.clone());
            }
        }

        let value = (self.loader)().await?;
        let mut state = self.state.write().await;
        *state = Some(Cached {
            value: value.clone(),
            refreshed_at: Instant::now(),
        });
        debug!(refresher = %self.label, "Initial load complete");
        Ok(value)
    }

    fn spawn_refresh(&self) {
        let loader = self.loader.clone();
        let state = self.state.clone();
        let refreshing = self.refreshing.clone();
        let label = self.label.clone();

        tokio::spawn(async move {
            let result = (loader)().await;
            let mut guard = state.write().await;
            match result {
                Ok(value) => {
                    *guard = Some(Cached {
                        value,
                        refreshed_at: Instant::now(),
                    });
                    debug!(refresher = %label, "Refreshed");
                }
                Err(e) => {
                    if let Some(cached) = guard.as_mut() {
                        cached.refreshed_at = Instant::now();
                    }
                    warn!(
                        refresher = %label,
                        error = %e,
                        "Refresh failed; serving stale value"
                    );
                }
            }
            refreshing.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;

    fn counting_loader(
        calls: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    ) -> impl Fn() -> LoaderFuture<usize> + Send + Sync + 'static {
        move || -> LoaderFuture<usize> {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(limit) = fail_after {
                    if n > limit {
                        return Err(Error::Refresh("loader down".to_string()));
                    }
                }
                Ok(n)
            })
        }
    }

    #[tokio::test]
    async fn test_first_get_waits_for_loader() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = BackgroundRefresher::new(
            "test",
            Duration::from_secs(60),
            counting_loader(calls.clone(), None),
        );

        assert_eq!(refresher.get().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_value_does_not_reload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = BackgroundRefresher::new(
            "test",
            Duration::from_secs(60),
            counting_loader(calls.clone(), None),
        );

        refresher.get().await.unwrap();
        refresher.get().await.unwrap();
        refresher.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_value_returns_immediately_and_refreshes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = BackgroundRefresher::new(
            "test",
            Duration::from_millis(10),
            counting_loader(calls.clone(), None),
        );

        assert_eq!(refresher.get().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Stale: served from cache, refresh kicked off behind it.
        assert_eq!(refresher.get().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(refresher.get().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = BackgroundRefresher::new(
            "test",
            Duration::from_millis(10),
            counting_loader(calls.clone(), Some(1)),
        );

        assert_eq!(refresher.get().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        refresher.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The second load failed, so the first value survives.
        assert_eq!(refresher.get().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_retries_only_after_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = BackgroundRefresher::new(
            "test",
            Duration::from_millis(50),
            counting_loader(calls.clone(), Some(1)),
        );

        refresher.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        refresher.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Repeated gets right after the failed attempt do not hammer the loader.
        for _ in 0..10 {
            refresher.get().await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_initial_load_surfaces_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = BackgroundRefresher::new(
            "test",
            Duration::from_secs(60),
            counting_loader(calls.clone(), Some(0)),
        );

        assert!(refresher.get().await.is_err());
        // Nothing was cached, so the next call tries the loader again.
        assert!(refresher.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_refresh_in_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow_loader = {
            let calls = calls.clone();
            move || -> LoaderFuture<usize> {
                let calls = calls.clone();
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(n)
                })
            }
        };
        let refresher =
            BackgroundRefresher::new("test", Duration::from_millis(10), slow_loader);

        refresher.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Many concurrent stale reads trigger exactly one reload.
        for _ in 0..10 {
            refresher.get().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
