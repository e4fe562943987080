//! Narrow interfaces over the host environment: time, connectivity,
//! user activity, and the read cache sitting in front of the remote store.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Source of wall-clock time and delays.
pub trait Clock: Send + Sync + 'static {
	/// Current time as Unix epoch milliseconds.
	fn now_ms(&self) -> i64;

	/// Resolve after `delay`.
	fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Wall clock anchored at construction and advanced by tokio's timer, so
/// that a paused tokio runtime also pauses this clock.
#[derive(Debug, Clone)]
pub struct TokioClock {
	origin_ms: i64,
	origin: tokio::time::Instant,
}

impl TokioClock {
	pub fn new() -> Self {
		Self {
			origin_ms: chrono::Utc::now().timestamp_millis(),
			origin: tokio::time::Instant::now(),
		}
	}
}

impl Default for TokioClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for TokioClock {
	fn now_ms(&self) -> i64 {
		self.origin_ms + self.origin.elapsed().as_millis() as i64
	}

	fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
		Box::pin(tokio::time::sleep(delay))
	}
}

/// Clock whose `now_ms` only moves when told to. Delays still go through
/// tokio's timer.
#[derive(Debug, Default)]
pub struct ManualClock {
	now_ms: AtomicI64,
}

impl ManualClock {
	pub fn new(now_ms: i64) -> Arc<Self> {
		Arc::new(Self {
			now_ms: AtomicI64::new(now_ms),
		})
	}

	pub fn set(&self, now_ms: i64) {
		self.now_ms.store(now_ms, Ordering::SeqCst);
	}

	pub fn advance(&self, delta: Duration) {
		self.now_ms
			.fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> i64 {
		self.now_ms.load(Ordering::SeqCst)
	}

	fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
		Box::pin(tokio::time::sleep(delay))
	}
}

/// Publishes connectivity changes.
#[derive(Debug)]
pub struct NetworkMonitor {
	tx: watch::Sender<bool>,
}

impl NetworkMonitor {
	pub fn new(online: bool) -> Self {
		let (tx, _rx) = watch::channel(online);
		Self { tx }
	}

	pub fn set_online(&self, online: bool) {
		self.tx.send_if_modified(|current| {
			let changed = *current != online;
			*current = online;
			changed
		});
	}

	pub fn status(&self) -> NetworkStatus {
		NetworkStatus {
			rx: self.tx.subscribe(),
		}
	}
}

/// Read side of a [`NetworkMonitor`].
#[derive(Debug, Clone)]
pub struct NetworkStatus {
	rx: watch::Receiver<bool>,
}

impl NetworkStatus {
	/// A status that never changes. Watchers see the channel as closed.
	pub fn fixed(online: bool) -> Self {
		let (_tx, rx) = watch::channel(online);
		Self { rx }
	}

	pub fn is_online(&self) -> bool {
		*self.rx.borrow()
	}

	pub fn watch(&self) -> watch::Receiver<bool> {
		self.rx.clone()
	}
}

/// Fan-out of user interaction events.
#[derive(Debug, Clone)]
pub struct ActivitySignal {
	tx: broadcast::Sender<()>,
}

impl ActivitySignal {
	pub fn new() -> Self {
		let (tx, _rx) = broadcast::channel(64);
		Self { tx }
	}

	/// Record one user interaction.
	pub fn notify(&self) {
		// No subscribers is fine.
		let _ = self.tx.send(());
	}

	pub fn subscribe(&self) -> broadcast::Receiver<()> {
		self.tx.subscribe()
	}
}

impl Default for ActivitySignal {
	fn default() -> Self {
		Self::new()
	}
}

/// Cached reads of remote resources, keyed like `all-trips` or `trip-T1`.
pub trait ReadCache: Send + Sync + 'static {
	fn invalidate(&self, key: &str);
	fn clear(&self);
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_manual_clock() {
		let clock = ManualClock::new(1_000);
		assert_eq!(clock.now_ms(), 1_000);
		clock.advance(Duration::from_secs(2));
		assert_eq!(clock.now_ms(), 3_000);
		clock.set(10);
		assert_eq!(clock.now_ms(), 10);
	}

	#[tokio::test(start_paused = true)]
	async fn test_tokio_clock_follows_paused_time() {
		let clock = TokioClock::new();
		let start = clock.now_ms();
		clock.sleep(Duration::from_secs(30)).await;
		assert_eq!(clock.now_ms() - start, 30_000);
	}

	#[tokio::test]
	async fn test_network_monitor_notifies_changes() {
		let monitor = NetworkMonitor::new(true);
		let status = monitor.status();
		let mut rx = status.watch();
		assert!(status.is_online());

		monitor.set_online(false);
		rx.changed().await.unwrap();
		assert!(!*rx.borrow());
		assert!(!status.is_online());
	}

	#[tokio::test]
	async fn test_activity_signal_fans_out() {
		let signal = ActivitySignal::new();
		let mut a = signal.subscribe();
		let mut b = signal.subscribe();
		signal.notify();
		a.recv().await.unwrap();
		b.recv().await.unwrap();
	}
}
