//! Day-plan ordering by simulated annealing over 2-opt moves
//!
//! The tour always starts at waypoint 0. Each move reverses a segment
//! `[i..=j]` with `1 <= i < j < n`; on a symmetric distance matrix only the
//! two edges at the segment ends change, so the delta is O(1). The best tour
//! ever seen is kept and polished with a deterministic 2-opt descent.
//!
//! Pure and synchronous: callers run it on the optimizer pool, never on a
//! connection task.

use crate::domain::error::ValidationError;
use crate::domain::geo::distance_meters;
use crate::domain::types::Waypoint;
use crate::infra::config::{OptimizerConfig, SeedStrategy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Improvements smaller than this (meters) are treated as noise
const IMPROVEMENT_EPSILON_M: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRequest {
    pub waypoints: Vec<Waypoint>,
    /// Return to the first waypoint at the end
    #[serde(default)]
    pub round_trip: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl OptimizationRequest {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints, round_trip: false, timeout_ms: None, seed: None }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_round_trip(mut self) -> Self {
        self.round_trip = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    /// Permutation of input indices, starting with 0
    pub order: Vec<usize>,
    pub waypoints: Vec<Waypoint>,
    pub total_distance_meters: f64,
    pub naive_distance_meters: f64,
    pub distance_saved_meters: f64,
    pub iterations: u32,
    pub timed_out: bool,
}

/// Reject inputs the search cannot meaningfully order
pub fn validate_waypoints(waypoints: &[Waypoint], max: usize) -> Result<(), ValidationError> {
    if waypoints.is_empty() {
        return Err(ValidationError::EmptyWaypoints);
    }
    if waypoints.len() > max {
        return Err(ValidationError::TooManyWaypoints { count: waypoints.len(), max });
    }
    for (index, wp) in waypoints.iter().enumerate() {
        wp.coords()
            .validate()
            .map_err(|e| ValidationError::InvalidWaypoint { index, source: Box::new(e) })?;
    }
    for (first, a) in waypoints.iter().enumerate() {
        for (offset, b) in waypoints[first + 1..].iter().enumerate() {
            if a.lat == b.lat && a.lng == b.lng {
                return Err(ValidationError::DuplicateWaypoint { first, second: first + 1 + offset });
            }
        }
    }
    Ok(())
}

/// Symmetric pairwise distance matrix, row-major
struct DistanceMatrix {
    n: usize,
    cells: Vec<f64>,
}

impl DistanceMatrix {
    fn new(waypoints: &[Waypoint]) -> Self {
        let n = waypoints.len();
        let mut cells = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = distance_meters(waypoints[i].coords(), waypoints[j].coords());
                cells[i * n + j] = d;
                cells[j * n + i] = d;
            }
        }
        Self { n, cells }
    }

    #[inline]
    fn get(&self, a: usize, b: usize) -> f64 {
        self.cells[a * self.n + b]
    }

    fn tour_length(&self, tour: &[usize], round_trip: bool) -> f64 {
        let open: f64 = tour.windows(2).map(|w| self.get(w[0], w[1])).sum();
        match (round_trip, tour.first(), tour.last()) {
            (true, Some(&first), Some(&last)) if tour.len() > 1 => open + self.get(last, first),
            _ => open,
        }
    }

    /// Length change from reversing `tour[i..=j]`
    #[inline]
    fn reversal_delta(&self, tour: &[usize], i: usize, j: usize, round_trip: bool) -> f64 {
        let prev = tour[i - 1];
        let first = tour[i];
        let last = tour[j];
        let head = self.get(prev, last) - self.get(prev, first);
        let next = if j + 1 < tour.len() {
            Some(tour[j + 1])
        } else if round_trip {
            Some(tour[0])
        } else {
            None
        };
        match next {
            Some(next) => head + self.get(first, next) - self.get(last, next),
            None => head,
        }
    }
}

/// Greedy nearest-neighbour tour from waypoint 0
fn nearest_neighbor_tour(matrix: &DistanceMatrix) -> Vec<usize> {
    let n = matrix.n;
    let mut visited = vec![false; n];
    let mut tour = Vec::with_capacity(n);
    let mut current = 0;
    visited[0] = true;
    tour.push(0);
    while tour.len() < n {
        let mut best: Option<(usize, f64)> = None;
        for candidate in 0..n {
            if visited[candidate] {
                continue;
            }
            let d = matrix.get(current, candidate);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((candidate, d));
            }
        }
        let Some((next, _)) = best else { break };
        visited[next] = true;
        tour.push(next);
        current = next;
    }
    tour
}

/// Deterministic first-improvement 2-opt until no reversal helps
fn two_opt_descent(
    matrix: &DistanceMatrix,
    tour: &mut [usize],
    round_trip: bool,
    deadline: Option<Instant>,
) -> bool {
    let n = tour.len();
    let mut improved_any = false;
    loop {
        let mut improved = false;
        for i in 1..n - 1 {
            for j in (i + 1)..n {
                if matrix.reversal_delta(tour, i, j, round_trip) < -IMPROVEMENT_EPSILON_M {
                    tour[i..=j].reverse();
                    improved = true;
                    improved_any = true;
                }
            }
        }
        if !improved || deadline.is_some_and(|d| Instant::now() >= d) {
            return improved_any;
        }
    }
}

/// Order waypoints to minimize travel distance
///
/// `deadline` and `cancel` are checked between temperature steps; on expiry
/// the best tour found so far is returned with `timed_out = true`.
pub fn optimize(
    request: &OptimizationRequest,
    config: &OptimizerConfig,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
) -> Result<OptimizationResult, ValidationError> {
    let waypoints = &request.waypoints;
    validate_waypoints(waypoints, config.max_waypoints)?;

    let n = waypoints.len();
    let round_trip = request.round_trip;
    let matrix = DistanceMatrix::new(waypoints);
    let naive: Vec<usize> = (0..n).collect();
    let naive_distance = matrix.tour_length(&naive, round_trip);

    if n <= 2 {
        return Ok(build_result(waypoints, naive, naive_distance, naive_distance, 0, false));
    }

    let mut current = naive.clone();
    let mut current_len = naive_distance;
    if config.seed_strategy == SeedStrategy::NearestNeighbor {
        let greedy = nearest_neighbor_tour(&matrix);
        let greedy_len = matrix.tour_length(&greedy, round_trip);
        if greedy.len() == n && greedy_len < current_len {
            current = greedy;
            current_len = greedy_len;
        }
    }

    let mut rng = match request.seed.or(config.rng_seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut best = current.clone();
    let mut best_len = current_len;
    let mut temperature = config.initial_temperature_ratio * current_len;
    let mut iterations = 0u32;
    let mut timed_out = false;

    while iterations < config.max_iterations && temperature >= config.min_temperature {
        if deadline.is_some_and(|d| Instant::now() >= d)
            || cancel.is_some_and(|c| c.is_cancelled())
        {
            timed_out = true;
            break;
        }

        for _ in 0..config.moves_per_temperature {
            let i = rng.gen_range(1..n - 1);
            let j = rng.gen_range(i + 1..n);
            let delta = matrix.reversal_delta(&current, i, j, round_trip);
            if delta < 0.0 || rng.gen::<f64>() < (-delta / temperature).exp() {
                current[i..=j].reverse();
                current_len += delta;
                if current_len < best_len - IMPROVEMENT_EPSILON_M {
                    best.copy_from_slice(&current);
                    best_len = current_len;
                }
            }
        }

        temperature *= config.cooling_rate;
        iterations += 1;
    }

    if !timed_out {
        two_opt_descent(&matrix, &mut best, round_trip, deadline);
    }
    // Recompute to shed accumulated floating point drift
    best_len = matrix.tour_length(&best, round_trip);

    if best_len > naive_distance {
        best = naive;
        best_len = naive_distance;
    }

    debug!(
        waypoints = %n,
        iterations = %iterations,
        naive_m = format!("{:.1}", naive_distance),
        best_m = format!("{:.1}", best_len),
        timed_out = %timed_out,
        "route_optimized"
    );

    Ok(build_result(waypoints, best, best_len, naive_distance, iterations, timed_out))
}

fn build_result(
    waypoints: &[Waypoint],
    order: Vec<usize>,
    total: f64,
    naive: f64,
    iterations: u32,
    timed_out: bool,
) -> OptimizationResult {
    OptimizationResult {
        waypoints: order.iter().map(|&i| waypoints[i].clone()).collect(),
        order,
        total_distance_meters: total,
        naive_distance_meters: naive,
        distance_saved_meters: (naive - total).max(0.0),
        iterations,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wp(label: &str, lat: f64, lng: f64) -> Waypoint {
        Waypoint::new(label, lat, lng)
    }

    fn config() -> OptimizerConfig {
        OptimizerConfig::default()
    }

    #[test]
    fn test_square_scenario() {
        let request = OptimizationRequest::new(vec![
            wp("A", 0.0, 0.0),
            wp("C", 1.0, 1.0),
            wp("B", 0.0, 1.0),
            wp("D", 1.0, 0.0),
        ])
        .with_seed(7);

        let result = optimize(&request, &config(), None, None).unwrap();
        assert!(
            result.order == vec![0, 2, 1, 3] || result.order == vec![0, 3, 1, 2],
            "unexpected order {:?}",
            result.order
        );
        assert!(result.total_distance_meters < result.naive_distance_meters);
        assert!(result.distance_saved_meters > 0.0);
        assert_eq!(result.waypoints[0].label, "A");
        assert!(!result.timed_out);
    }

    #[test]
    fn test_two_points_unchanged() {
        let request = OptimizationRequest::new(vec![wp("a", 0.0, 0.0), wp("b", 0.0, 1.0)]);
        let result = optimize(&request, &config(), None, None).unwrap();
        assert_eq!(result.order, vec![0, 1]);
        assert_eq!(result.distance_saved_meters, 0.0);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_single_point() {
        let request = OptimizationRequest::new(vec![wp("a", 10.0, 10.0)]);
        let result = optimize(&request, &config(), None, None).unwrap();
        assert_eq!(result.order, vec![0]);
        assert_eq!(result.total_distance_meters, 0.0);
    }

    #[test]
    fn test_validation_errors() {
        let cfg = config();
        assert_eq!(
            optimize(&OptimizationRequest::new(vec![]), &cfg, None, None),
            Err(ValidationError::EmptyWaypoints)
        );
        assert!(matches!(
            optimize(&OptimizationRequest::new(vec![wp("a", 0.0, 0.0), wp("b", 91.0, 0.0)]), &cfg, None, None),
            Err(ValidationError::InvalidWaypoint { index: 1, .. })
        ));
        assert!(matches!(
            optimize(&OptimizationRequest::new(vec![wp("a", f64::NAN, 0.0)]), &cfg, None, None),
            Err(ValidationError::InvalidWaypoint { index: 0, .. })
        ));
        assert_eq!(
            optimize(
                &OptimizationRequest::new(vec![wp("a", 1.0, 1.0), wp("b", 2.0, 2.0), wp("c", 1.0, 1.0)]),
                &cfg,
                None,
                None
            ),
            Err(ValidationError::DuplicateWaypoint { first: 0, second: 2 })
        );
    }

    #[test]
    fn test_too_many_waypoints() {
        let mut cfg = config();
        cfg.max_waypoints = 3;
        let request = OptimizationRequest::new(
            (0..4).map(|i| wp(&i.to_string(), i as f64, 0.0)).collect(),
        );
        assert_eq!(
            optimize(&request, &cfg, None, None),
            Err(ValidationError::TooManyWaypoints { count: 4, max: 3 })
        );
    }

    #[test]
    fn test_reversal_delta_matches_recomputed_length() {
        let waypoints: Vec<Waypoint> = [(0.0, 0.0), (0.3, 0.9), (0.8, 0.1), (0.5, 0.5), (0.9, 0.7)]
            .iter()
            .enumerate()
            .map(|(i, (lat, lng))| wp(&i.to_string(), *lat, *lng))
            .collect();
        let matrix = DistanceMatrix::new(&waypoints);
        for round_trip in [false, true] {
            for i in 1..4 {
                for j in (i + 1)..5 {
                    let mut tour: Vec<usize> = (0..5).collect();
                    let before = matrix.tour_length(&tour, round_trip);
                    let delta = matrix.reversal_delta(&tour, i, j, round_trip);
                    tour[i..=j].reverse();
                    let after = matrix.tour_length(&tour, round_trip);
                    assert!((after - before - delta).abs() < 1e-6, "i={i} j={j} rt={round_trip}");
                }
            }
        }
    }

    #[test]
    fn test_expired_deadline_returns_best_so_far() {
        let request = OptimizationRequest::new(
            (0..12).map(|i| wp(&i.to_string(), (i * 7 % 12) as f64 * 0.01, (i * 5 % 12) as f64 * 0.01)).collect(),
        )
        .with_seed(1);
        let deadline = Instant::now() - Duration::from_millis(1);
        let result = optimize(&request, &config(), Some(deadline), None).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.order.len(), 12);
        assert!(result.distance_saved_meters >= 0.0);
    }

    #[test]
    fn test_cancelled_token_stops_search() {
        let token = CancellationToken::new();
        token.cancel();
        let request = OptimizationRequest::new(
            (0..6).map(|i| wp(&i.to_string(), i as f64 * 0.1, (i % 2) as f64 * 0.1)).collect(),
        );
        let result = optimize(&request, &config(), None, Some(&token)).unwrap();
        assert!(result.timed_out);
    }

    #[test]
    fn test_same_seed_is_reproducible() {
        let mut cfg = config();
        cfg.seed_strategy = SeedStrategy::InputOrder;
        let request = OptimizationRequest::new(
            (0..10).map(|i| wp(&i.to_string(), (i * 3 % 10) as f64 * 0.01, (i * 7 % 10) as f64 * 0.01)).collect(),
        )
        .with_seed(42);
        let a = optimize(&request, &cfg, None, None).unwrap();
        let b = optimize(&request, &cfg, None, None).unwrap();
        assert_eq!(a.order, b.order);
        assert_eq!(a.iterations, b.iterations);
    }
}
