use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::error::SyncError;

/// Bounds how many dispatch jobs are outstanding at once.
///
/// Jobs run as tokio tasks and are joined all-settled: a job that panics
/// is reported as [`SyncError::Task`] in its own slot and does not affect
/// the others.
#[derive(Debug, Clone)]
pub struct TaskPool {
	semaphore: Arc<Semaphore>,
	max_concurrent: usize,
}

impl TaskPool {
	pub fn new(max_concurrent: usize) -> Self {
		let max_concurrent = max_concurrent.max(1);
		Self {
			semaphore: Arc::new(Semaphore::new(max_concurrent)),
			max_concurrent,
		}
	}

	pub fn max_concurrent(&self) -> usize {
		self.max_concurrent
	}

	/// Run every job, returning results in submission order.
	pub async fn run_all<F, T>(&self, jobs: Vec<F>) -> Vec<Result<T, SyncError>>
	where
		F: Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		let handles = jobs.into_iter().map(|job| {
			let semaphore = self.semaphore.clone();
			tokio::spawn(async move {
				// The semaphore is never closed.
				let _permit = semaphore.acquire_owned().await.ok();
				job.await
			})
		});

		join_all(handles)
			.await
			.into_iter()
			.map(|joined| joined.map_err(|e| SyncError::Task(e.to_string())))
			.collect()
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn test_results_keep_submission_order() {
		let pool = TaskPool::new(2);
		let jobs: Vec<_> = (0..5u64)
			.map(|i| async move {
				tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
				i
			})
			.collect();
		let results: Vec<u64> = pool.run_all(jobs).await.into_iter().map(|r| r.unwrap()).collect();
		assert_eq!(results, vec![0, 1, 2, 3, 4]);
	}

	#[tokio::test]
	async fn test_concurrency_is_bounded() {
		let pool = TaskPool::new(2);
		let running = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));
		let jobs: Vec<_> = (0..6)
			.map(|_| {
				let running = running.clone();
				let peak = peak.clone();
				async move {
					let now = running.fetch_add(1, Ordering::SeqCst) + 1;
					peak.fetch_max(now, Ordering::SeqCst);
					tokio::time::sleep(Duration::from_millis(20)).await;
					running.fetch_sub(1, Ordering::SeqCst);
				}
			})
			.collect();
		pool.run_all(jobs).await;
		assert!(peak.load(Ordering::SeqCst) <= 2);
	}

	async fn explode() -> u8 {
		panic!("sub-batch exploded")
	}

	#[tokio::test]
	async fn test_panicking_job_is_isolated() {
		let pool = TaskPool::new(3);
		let jobs: Vec<std::pin::Pin<Box<dyn Future<Output = u8> + Send>>> = vec![
			Box::pin(async { 1u8 }),
			Box::pin(explode()),
			Box::pin(async { 3u8 }),
		];
		let results = pool.run_all(jobs).await;
		assert_eq!(results[0].as_ref().ok(), Some(&1));
		assert!(matches!(results[1], Err(SyncError::Task(_))));
		assert_eq!(results[2].as_ref().ok(), Some(&3));
	}
}
