//! Worker-side and master-side run state

use crate::orchestrator::Report;
use crate::scenario::{Cluster, Configuration, Group, PropertyContext};

/// What a worker knows about the current run
#[derive(Debug, Clone)]
pub struct WorkerState {
    worker_index: usize,
    fleet_size: usize,
    configuration: Option<Configuration>,
    cluster: Option<Cluster>,
    service: Option<String>,
}

impl WorkerState {
    /// State right after the handshake
    pub fn new(worker_index: usize, fleet_size: usize) -> Self {
        Self {
            worker_index,
            fleet_size,
            configuration: None,
            cluster: None,
            service: None,
        }
    }

    /// Index assigned by the master
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Number of connected workers, equal to the largest topology
    pub fn fleet_size(&self) -> usize {
        self.fleet_size
    }

    /// Install the configuration for the following topologies
    pub fn set_configuration(&mut self, configuration: Configuration) {
        self.configuration = Some(configuration);
    }

    /// Current configuration
    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    /// Enter a topology; `service` is the service this worker runs in it
    pub fn begin_run(&mut self, cluster: Cluster, service: Option<String>) {
        self.cluster = Some(cluster);
        self.service = service;
    }

    /// Leave the current topology
    pub fn end_run(&mut self) {
        self.cluster = None;
        self.service = None;
    }

    /// Current topology
    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    /// Size of the current topology, zero between topologies
    pub fn cluster_size(&self) -> usize {
        self.cluster.as_ref().map_or(0, Cluster::size)
    }

    /// Whether this worker is part of the current topology
    pub fn is_participating(&self) -> bool {
        self.worker_index < self.cluster_size()
    }

    /// Group of this worker in the current topology
    pub fn group(&self) -> Option<&Group> {
        self.cluster.as_ref()?.group_of(self.worker_index)
    }

    /// Service this worker runs in the current topology
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Placeholder values visible to stage properties on this worker
    pub fn property_context(&self) -> PropertyContext {
        let configuration = self
            .configuration
            .as_ref()
            .map_or("", |c| c.name.as_str());
        let base = match &self.cluster {
            Some(cluster) => PropertyContext::for_cluster(configuration, cluster, self.fleet_size),
            None => PropertyContext::new(),
        };
        base.for_worker(self.worker_index, self.group(), self.service())
    }
}

/// What the master knows about the current run
#[derive(Debug)]
pub struct MasterState {
    configuration: String,
    cluster: Cluster,
    max_cluster_size: usize,
    report: Report,
    previous: Vec<Report>,
}

impl MasterState {
    /// State for one configuration and topology
    pub fn new(configuration: impl Into<String>, cluster: Cluster, max_cluster_size: usize) -> Self {
        let configuration = configuration.into();
        let report = Report::new(configuration.clone(), cluster.clone());
        Self {
            configuration,
            cluster,
            max_cluster_size,
            report,
            previous: Vec::new(),
        }
    }

    /// Move on to the next configuration and topology, archiving the report
    pub fn next_run(&mut self, configuration: impl Into<String>, cluster: Cluster) -> &mut Self {
        self.configuration = configuration.into();
        self.cluster = cluster;
        let report = Report::new(self.configuration.clone(), self.cluster.clone());
        self.previous.push(std::mem::replace(&mut self.report, report));
        self
    }

    /// Current configuration name
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// Current topology
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Size of the current topology
    pub fn cluster_size(&self) -> usize {
        self.cluster.size()
    }

    /// Largest topology of the benchmark
    pub fn max_cluster_size(&self) -> usize {
        self.max_cluster_size
    }

    /// Report of the current run
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Mutable report of the current run
    pub fn report_mut(&mut self) -> &mut Report {
        &mut self.report
    }

    /// Reports of earlier runs, oldest first
    pub fn previous_reports(&self) -> &[Report] {
        &self.previous
    }

    /// Placeholder values visible to stage properties on the master
    ///
    /// Worker-specific keys are absent, so only placeholders with a
    /// default may reference them.
    pub fn property_context(&self) -> PropertyContext {
        PropertyContext::for_cluster(&self.configuration, &self.cluster, self.max_cluster_size)
    }

    /// Consume the state, returning every report in run order
    pub fn into_reports(mut self) -> Vec<Report> {
        self.previous.push(self.report);
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::keys;

    #[test]
    fn test_worker_property_context() {
        let mut state = WorkerState::new(2, 4);
        state.set_configuration(Configuration::single("local", "inmemory"));
        state.begin_run(Cluster::single(3), Some("inmemory".into()));

        assert!(state.is_participating());
        let context = state.property_context();
        assert_eq!(context.get(keys::CONFIG_NAME), Some("local"));
        assert_eq!(context.get(keys::CLUSTER_SIZE), Some("3"));
        assert_eq!(context.get(keys::CLUSTER_MAX_SIZE), Some("4"));
        assert_eq!(context.get(keys::WORKER_INDEX), Some("2"));
        assert_eq!(context.get(keys::GROUP_NAME), Some("default"));
        assert_eq!(context.get(keys::PLUGIN), Some("inmemory"));
    }

    #[test]
    fn test_worker_outside_topology() {
        let mut state = WorkerState::new(3, 4);
        state.begin_run(Cluster::single(2), None);
        assert!(!state.is_participating());
        assert!(state.group().is_none());

        state.end_run();
        assert_eq!(state.cluster_size(), 0);
    }

    #[test]
    fn test_master_state_archives_reports() {
        let mut state = MasterState::new("a", Cluster::single(1), 2);
        assert!(state.property_context().get(keys::WORKER_INDEX).is_none());
        state.next_run("a", Cluster::single(2));
        assert_eq!(state.cluster_size(), 2);

        let reports = state.into_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].cluster.size(), 1);
        assert_eq!(reports[1].cluster.size(), 2);
    }
}
