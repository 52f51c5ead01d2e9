//! Path selection for outgoing packets.
//!
//! Two strategies: lowest-RTT (default) and round-robin by dispatch
//! quota. Both skip potentially-failed paths and, once more than one
//! path exists, the initial path; retransmissions override the
//! sending-allowed check so lost data can always move.

use crate::protocol::{PathId, INITIAL_PATH_ID};
use crate::session::config::SchedulerStrategy;
use crate::session::path::Path;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Quota-tracking path selector.
pub struct Scheduler {
    strategy: SchedulerStrategy,
    quotas: HashMap<PathId, u32>,
}

impl Scheduler {
    /// Create a scheduler with the given strategy.
    #[must_use]
    pub fn new(strategy: SchedulerStrategy) -> Self {
        Self {
            strategy,
            quotas: HashMap::new(),
        }
    }

    /// Dispatch count for a path.
    #[must_use]
    pub fn quota(&self, path_id: PathId) -> u32 {
        *self.quotas.get(&path_id).unwrap_or(&0)
    }

    /// Count one packet dispatched on a path.
    pub fn add_quota(&mut self, path_id: PathId) {
        *self.quotas.entry(path_id).or_insert(0) += 1;
    }

    /// Forget a closed path.
    pub fn remove_path(&mut self, path_id: PathId) {
        self.quotas.remove(&path_id);
    }

    /// Pick the path the next packet should use, or `None` when no path
    /// is currently usable.
    #[must_use]
    pub fn select_path(
        &mut self,
        paths: &HashMap<PathId, Arc<Path>>,
        has_retransmission: bool,
        has_stream_retransmission: bool,
        from_path: Option<&Arc<Path>>,
    ) -> Option<Arc<Path>> {
        // Single-path degenerate case.
        if paths.len() <= 1 {
            let initial = paths.get(&INITIAL_PATH_ID)?;
            if !has_retransmission && !initial.sending_allowed() {
                return None;
            }
            return Some(Arc::clone(initial));
        }

        match self.strategy {
            SchedulerStrategy::LowLatency => self.select_path_low_latency(
                paths,
                has_retransmission,
                has_stream_retransmission,
                from_path,
            ),
            SchedulerStrategy::RoundRobin => {
                self.select_path_round_robin(paths, has_retransmission)
            }
        }
    }

    /// Paths in id order, so selection is deterministic under ties.
    fn ordered<'a>(paths: &'a HashMap<PathId, Arc<Path>>) -> Vec<&'a Arc<Path>> {
        let mut v: Vec<_> = paths.iter().collect();
        v.sort_by_key(|(id, _)| **id);
        v.into_iter().map(|(_, p)| p).collect()
    }

    fn eligible(path: &Path, has_retransmission: bool) -> bool {
        if !has_retransmission && !path.sending_allowed() {
            return false;
        }
        if path.is_potentially_failed() {
            return false;
        }
        // Keep the initial path as a control channel once real paths
        // exist.
        path.path_id() != INITIAL_PATH_ID
    }

    fn select_path_low_latency(
        &mut self,
        paths: &HashMap<PathId, Arc<Path>>,
        has_retransmission: bool,
        has_stream_retransmission: bool,
        from_path: Option<&Arc<Path>>,
    ) -> Option<Arc<Path>> {
        // A stream retransmission pulled off an unprobed path: prefer
        // moving it to a path that has seen fewer packets.
        if has_retransmission && has_stream_retransmission {
            if let Some(from) = from_path {
                if from.smoothed_rtt().is_zero() {
                    let current_quota = self.quota(from.path_id());
                    for path in Self::ordered(paths) {
                        let id = path.path_id();
                        if id == INITIAL_PATH_ID || id == from.path_id() {
                            continue;
                        }
                        if self.quota(id) < current_quota {
                            return Some(Arc::clone(path));
                        }
                    }
                }
            }
        }

        let mut selected: Option<&Arc<Path>> = None;
        let mut lower_rtt = Duration::ZERO;

        for path in Self::ordered(paths) {
            if !Self::eligible(path, has_retransmission) {
                continue;
            }
            let current_rtt = path.smoothed_rtt();

            // Prefer a probed path over an unprobed one.
            if !lower_rtt.is_zero() && current_rtt.is_zero() {
                continue;
            }
            // Among unprobed paths, take the least-used one.
            if current_rtt.is_zero() {
                if let Some(sel) = selected {
                    if self.quota(path.path_id()) > self.quota(sel.path_id()) {
                        continue;
                    }
                }
            }
            if !current_rtt.is_zero()
                && !lower_rtt.is_zero()
                && selected.is_some()
                && current_rtt >= lower_rtt
            {
                continue;
            }
            lower_rtt = current_rtt;
            selected = Some(path);
        }
        selected.cloned()
    }

    fn select_path_round_robin(
        &mut self,
        paths: &HashMap<PathId, Arc<Path>>,
        has_retransmission: bool,
    ) -> Option<Arc<Path>> {
        let mut selected: Option<&Arc<Path>> = None;
        let mut lowest_quota = u32::MAX;
        for path in Self::ordered(paths) {
            if !Self::eligible(path, has_retransmission) {
                continue;
            }
            let quota = self.quota(path.path_id());
            if quota < lowest_quota {
                selected = Some(path);
                lowest_quota = quota;
            }
        }
        selected.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Perspective;
    use crate::session::config::SessionConfig;
    use skein_transport::MemoryConnection;
    use std::time::Duration;

    fn make_paths(ids: &[PathId]) -> HashMap<PathId, Arc<Path>> {
        let config = SessionConfig::new(Perspective::Client);
        let mut paths = HashMap::new();
        for &id in ids {
            let (a, _b) = MemoryConnection::pair(
                format!("10.0.0.1:{}", 1000 + u16::from(id)).parse().unwrap(),
                format!("10.0.0.2:{}", 1000 + u16::from(id)).parse().unwrap(),
            );
            paths.insert(id, Arc::new(Path::new(id, a, &config, None)));
        }
        paths
    }

    #[test]
    fn test_single_path_uses_initial() {
        let mut sched = Scheduler::new(SchedulerStrategy::LowLatency);
        let paths = make_paths(&[0]);
        let selected = sched.select_path(&paths, false, false, None).unwrap();
        assert_eq!(selected.path_id(), 0);
    }

    #[test]
    fn test_multipath_avoids_initial() {
        let mut sched = Scheduler::new(SchedulerStrategy::LowLatency);
        let paths = make_paths(&[0, 1, 2]);
        for _ in 0..10 {
            let selected = sched.select_path(&paths, false, false, None).unwrap();
            assert_ne!(selected.path_id(), 0);
            sched.add_quota(selected.path_id());
        }
    }

    #[test]
    fn test_round_robin_fairness() {
        let mut sched = Scheduler::new(SchedulerStrategy::RoundRobin);
        let paths = make_paths(&[0, 1, 2, 3]);
        let mut counts: HashMap<PathId, u32> = HashMap::new();
        for _ in 0..30 {
            let selected = sched.select_path(&paths, false, false, None).unwrap();
            sched.add_quota(selected.path_id());
            *counts.entry(selected.path_id()).or_insert(0) += 1;
        }
        // Paths 1..3 usable (initial excluded): 30 sends over 3 paths.
        assert_eq!(counts.get(&0), None);
        for id in [1, 2, 3] {
            assert_eq!(counts[&id], 10, "path {id} shorted");
        }
    }

    #[test]
    fn test_potentially_failed_skipped() {
        let mut sched = Scheduler::new(SchedulerStrategy::RoundRobin);
        let paths = make_paths(&[0, 1, 2]);
        paths[&1].mark_potentially_failed();
        for _ in 0..20 {
            let selected = sched.select_path(&paths, false, false, None).unwrap();
            assert_eq!(selected.path_id(), 2);
            sched.add_quota(selected.path_id());
        }
    }

    #[test]
    fn test_low_latency_prefers_smaller_rtt() {
        let mut sched = Scheduler::new(SchedulerStrategy::LowLatency);
        let paths = make_paths(&[0, 1, 2]);
        paths[&1].prime_rtt(Duration::from_millis(20));
        paths[&2].prime_rtt(Duration::from_millis(80));
        for _ in 0..20 {
            let selected = sched.select_path(&paths, false, false, None).unwrap();
            assert_eq!(selected.path_id(), 1);
            sched.add_quota(selected.path_id());
        }
    }

    #[test]
    fn test_probed_path_beats_unprobed() {
        let mut sched = Scheduler::new(SchedulerStrategy::LowLatency);
        let paths = make_paths(&[0, 1, 2]);
        paths[&2].prime_rtt(Duration::from_millis(100));
        let selected = sched.select_path(&paths, false, false, None).unwrap();
        assert_eq!(selected.path_id(), 2);
    }

    #[test]
    fn test_all_paths_failed_returns_none() {
        let mut sched = Scheduler::new(SchedulerStrategy::RoundRobin);
        let paths = make_paths(&[0, 1, 2]);
        paths[&1].mark_potentially_failed();
        paths[&2].mark_potentially_failed();
        assert!(sched.select_path(&paths, false, false, None).is_none());
    }

    #[test]
    fn test_unprobed_tiebreak_by_quota() {
        let mut sched = Scheduler::new(SchedulerStrategy::LowLatency);
        let paths = make_paths(&[0, 1, 2]);
        sched.add_quota(1);
        sched.add_quota(1);
        sched.add_quota(2);
        // Both unprobed: the lower-quota path wins.
        let selected = sched.select_path(&paths, false, false, None).unwrap();
        assert_eq!(selected.path_id(), 2);
    }

    #[test]
    fn test_retransmission_overrides_sending_allowed() {
        let mut sched = Scheduler::new(SchedulerStrategy::LowLatency);
        let paths = make_paths(&[0]);
        // Even a congested initial path must carry retransmissions; with
        // a fresh path sending is allowed either way, so just verify the
        // retransmission flag keeps selection working.
        assert!(sched.select_path(&paths, true, false, None).is_some());
    }
}
