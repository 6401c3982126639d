//! Route optimizer worker pool - keeps annealing off the async runtime
//!
//! Requests run on a dedicated rayon pool and hand their result back over a
//! oneshot. If the awaiting future is dropped (HTTP client went away), a
//! drop guard cancels the token and the worker stops at its next check.

use crate::domain::error::OptimizeError;
use crate::infra::config::OptimizerConfig;
use crate::infra::metrics::Metrics;
use crate::services::route_optimizer::{optimize, OptimizationRequest, OptimizationResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct OptimizerPool {
    pool: rayon::ThreadPool,
    config: OptimizerConfig,
    metrics: Arc<Metrics>,
}

impl OptimizerPool {
    pub fn new(
        workers: usize,
        config: OptimizerConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("optimizer-worker-{}", i))
            .build()?;
        info!(workers = %workers, "optimizer_pool_started");
        Ok(Self { pool, config, metrics })
    }

    /// Run one optimization on the pool
    ///
    /// The wall-clock budget starts now, so time spent queued counts.
    pub async fn submit(
        &self,
        request: OptimizationRequest,
    ) -> Result<OptimizationResult, OptimizeError> {
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.timeout_ms);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();

        let (tx, rx) = oneshot::channel();
        let config = self.config.clone();
        let started = Instant::now();
        self.pool.spawn(move || {
            let result = optimize(&request, &config, Some(deadline), Some(&cancel));
            // Receiver gone means the caller gave up
            let _ = tx.send(result);
        });

        let outcome = rx.await.map_err(|_| OptimizeError::WorkerUnavailable);
        let _ = guard.disarm();

        match outcome? {
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_optimization(
                    elapsed_ms,
                    result.timed_out,
                    result.distance_saved_meters,
                );
                if result.timed_out {
                    warn!(
                        waypoints = %result.order.len(),
                        timeout_ms = %timeout_ms,
                        iterations = %result.iterations,
                        "optimization_timed_out"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_optimization_rejected();
                Err(OptimizeError::Validation(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ValidationError;
    use crate::domain::types::Waypoint;

    fn pool() -> (OptimizerPool, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (OptimizerPool::new(2, OptimizerConfig::default(), metrics.clone()).unwrap(), metrics)
    }

    #[tokio::test]
    async fn test_submit_returns_result_and_records_metrics() {
        let (pool, metrics) = pool();
        let request = OptimizationRequest::new(vec![
            Waypoint::new("A", 0.0, 0.0),
            Waypoint::new("C", 1.0, 1.0),
            Waypoint::new("B", 0.0, 1.0),
            Waypoint::new("D", 1.0, 0.0),
        ])
        .with_seed(3);

        let result = pool.submit(request).await.unwrap();
        assert!(result.distance_saved_meters > 0.0);
        assert_eq!(metrics.report().optimizations_total, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_input() {
        let (pool, metrics) = pool();
        let err = pool.submit(OptimizationRequest::new(vec![])).await.unwrap_err();
        assert!(matches!(err, OptimizeError::Validation(ValidationError::EmptyWaypoints)));
        assert_eq!(metrics.report().optimizations_rejected, 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions() {
        let (pool, _) = pool();
        let pool = Arc::new(pool);
        let mut handles = Vec::new();
        for seed in 0..4u64 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let request = OptimizationRequest::new(
                    (0..8)
                        .map(|i| Waypoint::new(&i.to_string(), (i * 3 % 8) as f64 * 0.01, (i % 3) as f64 * 0.01))
                        .collect(),
                )
                .with_seed(seed);
                pool.submit(request).await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.order.len(), 8);
            assert_eq!(result.order[0], 0);
        }
    }
}
