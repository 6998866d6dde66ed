use rand::seq::SliceRandom;
use waypoint_registry::ServiceInstance;

use crate::health::HealthTracker;
use crate::options::Strategy;

/// Candidates tagged with their position in the registry's listing.
pub type Ranked = Vec<(usize, ServiceInstance)>;

/// Put `candidates` into the order `strategy` wants them tried.
pub fn order(
    strategy: Strategy,
    service: &str,
    health: &HealthTracker,
    mut candidates: Ranked,
) -> Ranked {
    match strategy {
        Strategy::RoundRobin => {
            if !candidates.is_empty() {
                let start = health.next_cursor(service) % candidates.len();
                candidates.rotate_left(start);
            }
        }
        Strategy::Random => {
            candidates.shuffle(&mut rand::thread_rng());
        }
        Strategy::LeastFailures => {
            // Stable, so equal scores keep registry order.
            candidates.sort_by(|(_, a), (_, b)| {
                health
                    .score(service, b.address())
                    .total_cmp(&health.score(service, a.address()))
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Ranked {
        ["a", "b", "c"]
            .into_iter()
            .enumerate()
            .map(|(i, id)| (i, ServiceInstance::new("svc", id).with_id(id)))
            .collect()
    }

    fn ids(ranked: &Ranked) -> Vec<&str> {
        ranked.iter().map(|(_, node)| node.id()).collect()
    }

    #[test]
    fn test_round_robin_rotates_start() {
        let health = HealthTracker::default();

        let first = order(Strategy::RoundRobin, "svc", &health, candidates());
        let second = order(Strategy::RoundRobin, "svc", &health, candidates());
        let third = order(Strategy::RoundRobin, "svc", &health, candidates());

        assert_eq!(ids(&first), vec!["a", "b", "c"]);
        assert_eq!(ids(&second), vec!["b", "c", "a"]);
        assert_eq!(ids(&third), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_least_failures_prefers_healthy_and_is_stable() {
        let health = HealthTracker::default();
        health.record_failure("svc", "a");

        let ranked = order(Strategy::LeastFailures, "svc", &health, candidates());
        assert_eq!(ids(&ranked), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_random_keeps_every_candidate() {
        let health = HealthTracker::default();

        let mut ranked = ids(&order(Strategy::Random, "svc", &health, candidates()))
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        ranked.sort();
        assert_eq!(ranked, vec!["a", "b", "c"]);
    }
}
