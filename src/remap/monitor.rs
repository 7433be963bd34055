//! Overload detection from router latency reports

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddrV4;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{CoordinatorRemapHandler, RemapState};
use crate::config::RemapConfig;
use crate::Result;

/// Servers to move out of, or back into, the normal path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadDecision {
    pub overloaded: Vec<SocketAddrV4>,
    pub underloaded: Vec<SocketAddrV4>,
}

impl LoadDecision {
    pub fn is_empty(&self) -> bool {
        self.overloaded.is_empty() && self.underloaded.is_empty()
    }
}

/// Latest latency each router observed for each server
#[derive(Default)]
pub struct LoadMonitor {
    reports: Mutex<HashMap<String, HashMap<SocketAddrV4, f64>>>,
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a router's latency sample for a server, in seconds
    pub fn report(&self, router: &str, server: SocketAddrV4, latency: f64) {
        self.reports
            .lock()
            .entry(router.to_string())
            .or_default()
            .insert(server, latency);
    }

    pub fn report_many<I>(&self, router: &str, samples: I)
    where
        I: IntoIterator<Item = (SocketAddrV4, f64)>,
    {
        let mut reports = self.reports.lock();
        reports.entry(router.to_string()).or_default().extend(samples);
    }

    /// Drop the reports of a router that left
    pub fn remove_router(&self, router: &str) {
        self.reports.lock().remove(router);
    }

    /// Mean reported latency per server
    pub fn server_latencies(&self) -> BTreeMap<SocketAddrV4, f64> {
        let mut sums: BTreeMap<SocketAddrV4, (f64, usize)> = BTreeMap::new();
        for samples in self.reports.lock().values() {
            for (&server, &latency) in samples {
                let entry = sums.entry(server).or_default();
                entry.0 += latency;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(server, (total, count))| (server, total / count as f64))
            .collect()
    }

    /// Cluster-wide average of the per-server means
    pub fn average(&self) -> Option<f64> {
        let latencies = self.server_latencies();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.values().sum::<f64>() / latencies.len() as f64)
    }

    /// Classify servers against the thresholds in `config`
    ///
    /// At most `config.maximum` servers are remapped at once, the slowest
    /// first. Nothing is started in manual mode.
    pub fn evaluate(&self, coordinator: &CoordinatorRemapHandler, config: &RemapConfig) -> LoadDecision {
        let latencies = self.server_latencies();
        let Some(average) = self.average() else {
            return LoadDecision::default();
        };

        let mut decision = LoadDecision::default();
        let mut candidates = Vec::new();
        for (&server, &latency) in &latencies {
            match coordinator.server_state(server) {
                Some(RemapState::Normal) => {
                    if latency > config.start_threshold * average && latency > config.overload_threshold {
                        candidates.push((server, latency));
                    }
                }
                Some(RemapState::Degraded) => {
                    if latency < config.stop_threshold * average && !coordinator.is_crashed(server) {
                        decision.underloaded.push(server);
                    }
                }
                _ => {}
            }
        }

        if !config.manual {
            let budget = config.maximum.saturating_sub(coordinator.remapped_count());
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
            decision.overloaded = candidates.into_iter().take(budget).map(|(server, _)| server).collect();
        }
        debug!(average, ?decision, "load evaluated");
        decision
    }

    /// Evaluate and start the resulting transitions; returns what was started
    pub fn check(&self, coordinator: &CoordinatorRemapHandler) -> Result<LoadDecision> {
        let decision = self.evaluate(coordinator, coordinator.config());
        if decision.is_empty() {
            return Ok(decision);
        }
        let overloaded = coordinator.transit_to_degraded(&decision.overloaded, false)?;
        let underloaded = coordinator.transit_to_normal(&decision.underloaded, false)?;
        if !overloaded.is_empty() || !underloaded.is_empty() {
            info!(?overloaded, ?underloaded, "load-driven transitions started");
        }
        Ok(LoadDecision { overloaded, underloaded })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use super::*;
    use crate::remap::LocalBus;

    fn server(i: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 9000)
    }

    fn coordinator(config: RemapConfig, servers: u8) -> Arc<CoordinatorRemapHandler> {
        let bus = Arc::new(LocalBus::new());
        let coordinator = CoordinatorRemapHandler::new("coordinator", bus, config).unwrap();
        for i in 0..servers {
            coordinator.add_alive_server(server(i));
        }
        coordinator
    }

    fn uniform(monitor: &LoadMonitor, router: &str, servers: u8, latency: f64) {
        monitor.report_many(router, (0..servers).map(|i| (server(i), latency)));
    }

    #[test]
    fn test_mean_across_routers() {
        let monitor = LoadMonitor::new();
        monitor.report("router1", server(0), 0.002);
        monitor.report("router2", server(0), 0.004);
        monitor.report("router1", server(1), 0.003);
        let latencies = monitor.server_latencies();
        assert!((latencies[&server(0)] - 0.003).abs() < 1e-12);
        assert!((monitor.average().unwrap() - 0.003).abs() < 1e-12);

        monitor.remove_router("router2");
        assert!((monitor.server_latencies()[&server(0)] - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_hot_server_detected() {
        let config = RemapConfig::default();
        let coordinator = coordinator(config, 8);
        let monitor = LoadMonitor::new();
        uniform(&monitor, "router1", 8, 0.001);
        monitor.report("router1", server(3), 0.02);

        let decision = monitor.evaluate(&coordinator, &config);
        assert_eq!(decision.overloaded, vec![server(3)]);
        assert!(decision.underloaded.is_empty());
    }

    #[test]
    fn test_absolute_floor_applies() {
        let config = RemapConfig {
            overload_threshold: 1.0,
            ..RemapConfig::default()
        };
        let coordinator = coordinator(config, 4);
        let monitor = LoadMonitor::new();
        uniform(&monitor, "router1", 4, 0.001);
        monitor.report("router1", server(0), 0.5);
        assert!(monitor.evaluate(&coordinator, &config).is_empty());
    }

    #[test]
    fn test_manual_and_maximum_limit_starts() {
        let config = RemapConfig {
            maximum: 1,
            ..RemapConfig::default()
        };
        let coordinator = coordinator(config, 8);
        let monitor = LoadMonitor::new();
        uniform(&monitor, "router1", 8, 0.001);
        monitor.report("router1", server(1), 0.01);
        monitor.report("router1", server(2), 0.03);

        // Only the slowest fits the budget
        assert_eq!(monitor.evaluate(&coordinator, &config).overloaded, vec![server(2)]);

        let manual = RemapConfig {
            manual: true,
            ..config
        };
        assert!(monitor.evaluate(&coordinator, &manual).overloaded.is_empty());

        coordinator.transit_to_degraded(&[server(5)], false).unwrap();
        assert!(monitor.evaluate(&coordinator, &config).overloaded.is_empty());
    }

    #[test]
    fn test_check_starts_and_restores() {
        let config = RemapConfig::default();
        let coordinator = coordinator(config, 4);
        let monitor = LoadMonitor::new();
        uniform(&monitor, "router1", 4, 0.001);
        monitor.report("router1", server(2), 0.05);

        let started = monitor.check(&coordinator).unwrap();
        assert_eq!(started.overloaded, vec![server(2)]);
        assert_eq!(coordinator.server_state(server(2)), Some(RemapState::Intermediate));

        // Pretend the transition finished, then the load drops
        let event = coordinator.transit_events().try_recv().unwrap();
        coordinator.finish_transit(event).unwrap();
        monitor.report("router1", server(2), 0.0001);
        let restored = monitor.check(&coordinator).unwrap();
        assert_eq!(restored.underloaded, vec![server(2)]);
        assert_eq!(coordinator.server_state(server(2)), Some(RemapState::Coordinated));
    }
}
