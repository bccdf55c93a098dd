//! Benchmark descriptor types: scenario, configurations and cluster topologies
//!
//! Everything in here is immutable once the master has distributed it. The
//! worker side only reads these values and evaluates stage properties
//! against its own [`PropertyContext`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::stage::StageError;

/// Name of the group used by [`Cluster::single`]
pub const DEFAULT_GROUP: &str = "default";

/// Context keys available to `${...}` placeholders
pub mod keys {
    /// Name of the running configuration
    pub const CONFIG_NAME: &str = "config.name";
    /// Size of the current topology
    pub const CLUSTER_SIZE: &str = "cluster.size";
    /// Largest topology of the benchmark
    pub const CLUSTER_MAX_SIZE: &str = "cluster.max_size";
    /// Index of the evaluating worker
    pub const WORKER_INDEX: &str = "worker.index";
    /// Group of the evaluating worker
    pub const GROUP_NAME: &str = "group.name";
    /// Size of the evaluating worker's group
    pub const GROUP_SIZE: &str = "group.size";
    /// Service the evaluating worker runs
    pub const PLUGIN: &str = "plugin";
}

/// String properties of a stage or service, possibly holding placeholders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add or replace a property
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value of a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the property is set
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate over all properties in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether no property is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value parsed with [`FromStr`]
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, StageError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| StageError::invalid_property(key, raw, e))
            })
            .transpose()
    }

    /// Value parsed with [`FromStr`], or `default` when unset
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, StageError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Mandatory value parsed with [`FromStr`]
    pub fn require<T>(&self, key: &str) -> Result<T, StageError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parse(key)?
            .ok_or_else(|| StageError::MissingProperty(key.to_string()))
    }

    /// Duration in humantime notation, e.g. `1m 30s` or `250ms`
    pub fn duration(&self, key: &str) -> Result<Option<Duration>, StageError> {
        self.get(key)
            .map(|raw| {
                humantime::parse_duration(raw.trim())
                    .map_err(|e| StageError::invalid_property(key, raw, e))
            })
            .transpose()
    }

    /// Comma separated list; empty entries are dropped
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// Resolve `${name}` and `${name:default}` placeholders in every value
    ///
    /// A placeholder whose name is missing from `context` and which carries
    /// no default fails the whole evaluation.
    pub fn evaluate(&self, context: &PropertyContext) -> Result<Properties, StageError> {
        self.0
            .iter()
            .map(|(k, v)| Ok((k.clone(), evaluate_value(v, context)?)))
            .collect::<Result<BTreeMap<_, _>, StageError>>()
            .map(Properties)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

fn evaluate_value(value: &str, context: &PropertyContext) -> Result<String, StageError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            StageError::invalid_property("placeholder", value, "unterminated '${'")
        })?;
        let expr = &after[..end];
        let (name, default) = match expr.split_once(':') {
            Some((name, default)) => (name.trim(), Some(default)),
            None => (expr.trim(), None),
        };
        match context.get(name).or(default) {
            Some(resolved) => out.push_str(resolved),
            None => return Err(StageError::UnresolvedProperty(name.to_string())),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Values visible to placeholder evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyContext(BTreeMap<String, String>);

impl PropertyContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Context shared by master and every worker of one topology
    pub fn for_cluster(configuration: &str, cluster: &Cluster, max_cluster_size: usize) -> Self {
        Self::new()
            .with(keys::CONFIG_NAME, configuration)
            .with(keys::CLUSTER_SIZE, cluster.size())
            .with(keys::CLUSTER_MAX_SIZE, max_cluster_size)
    }

    /// Extend a cluster context with worker-local values
    pub fn for_worker(
        mut self,
        worker_index: usize,
        group: Option<&Group>,
        plugin: Option<&str>,
    ) -> Self {
        self = self.with(keys::WORKER_INDEX, worker_index);
        if let Some(group) = group {
            self = self
                .with(keys::GROUP_NAME, &group.name)
                .with(keys::GROUP_SIZE, group.size);
        }
        if let Some(plugin) = plugin {
            self = self.with(keys::PLUGIN, plugin);
        }
        self
    }
}

/// One stage entry of the scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescription {
    /// Registered stage type, e.g. `basic-operations-test`
    #[serde(rename = "type")]
    pub stage_type: String,

    /// Unevaluated stage properties
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

impl StageDescription {
    /// Describe a stage of the given type
    pub fn new(stage_type: impl Into<String>, properties: Properties) -> Self {
        Self {
            stage_type: stage_type.into(),
            properties,
        }
    }
}

/// Ordered list of stage descriptions; the position is the stage id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scenario {
    stages: Vec<StageDescription>,
}

impl Scenario {
    /// Build a scenario from stage descriptions
    pub fn new(stages: Vec<StageDescription>) -> Self {
        Self { stages }
    }

    /// Append a stage, builder style
    pub fn with_stage(mut self, stage_type: impl Into<String>, properties: Properties) -> Self {
        self.stages.push(StageDescription::new(stage_type, properties));
        self
    }

    /// Stage with the given id
    pub fn stage(&self, id: usize) -> Option<&StageDescription> {
        self.stages.get(id)
    }

    /// All stages in execution order
    pub fn stages(&self) -> &[StageDescription] {
        &self.stages
    }

    /// Number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

/// Service setup for one group of workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setup {
    /// Group this setup applies to
    #[serde(default = "default_group")]
    pub group: String,

    /// Registered service name
    pub service: String,

    /// Service properties
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Named configuration: which service each group runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Configuration name used in reports
    pub name: String,

    /// Per-group service setups
    pub setups: Vec<Setup>,
}

impl Configuration {
    /// Configuration running `service` on the default group
    pub fn single(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setups: vec![Setup {
                group: default_group(),
                service: service.into(),
                properties: Properties::new(),
            }],
        }
    }

    /// Set properties on the setup of `group`, builder style
    pub fn with_properties(mut self, group: &str, properties: Properties) -> Self {
        if let Some(setup) = self.setups.iter_mut().find(|s| s.group == group) {
            setup.properties = properties;
        }
        self
    }

    /// Setup of the given group
    pub fn setup(&self, group: &str) -> Option<&Setup> {
        self.setups.iter().find(|s| s.group == group)
    }
}

/// Named, sized partition of a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Number of workers in the group
    pub size: usize,
}

/// Topology: ordered groups whose sizes sum to the cluster size
///
/// Workers `0..size` participate; indexes are assigned to groups in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    groups: Vec<Group>,
}

impl Cluster {
    /// Topology with one default group of `size` workers
    pub fn single(size: usize) -> Self {
        Self {
            groups: vec![Group {
                name: default_group(),
                size,
            }],
        }
    }

    /// Topology from explicit groups
    pub fn with_groups(groups: Vec<Group>) -> Self {
        Self { groups }
    }

    /// Total number of participating workers
    pub fn size(&self) -> usize {
        self.groups.iter().map(|g| g.size).sum()
    }

    /// Groups in index order
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Group owning the given worker index
    pub fn group_of(&self, worker_index: usize) -> Option<&Group> {
        let mut upper = 0;
        for group in &self.groups {
            upper += group.size;
            if worker_index < upper {
                return Some(group);
            }
        }
        None
    }

    /// Position of the worker inside its group
    pub fn index_in_group(&self, worker_index: usize) -> Option<usize> {
        let mut lower = 0;
        for group in &self.groups {
            if worker_index < lower + group.size {
                return Some(worker_index - lower);
            }
            lower += group.size;
        }
        None
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .groups
            .iter()
            .map(|g| format!("{}={}", g.name, g.size))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Complete benchmark loaded by the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benchmark {
    /// Stages executed for every configuration and topology
    pub scenario: Scenario,

    /// Configurations run in order
    pub configurations: Vec<Configuration>,

    /// Topologies run in order for each configuration
    pub clusters: Vec<Cluster>,
}

impl Benchmark {
    /// Parse a JSON benchmark descriptor
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidBenchmark(e.to_string()))
    }

    /// Largest topology; this is the fleet size the master waits for
    pub fn max_cluster_size(&self) -> usize {
        self.clusters.iter().map(Cluster::size).max().unwrap_or(0)
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.configurations.is_empty() {
            return Err(ConfigError::InvalidBenchmark(
                "at least one configuration is required".into(),
            ));
        }
        if self.clusters.is_empty() {
            return Err(ConfigError::InvalidBenchmark(
                "at least one cluster is required".into(),
            ));
        }
        if let Some(cluster) = self.clusters.iter().find(|c| c.size() == 0) {
            return Err(ConfigError::InvalidBenchmark(format!(
                "cluster {cluster} has no workers"
            )));
        }
        for configuration in &self.configurations {
            for cluster in &self.clusters {
                if let Some(group) = cluster
                    .groups()
                    .iter()
                    .find(|g| configuration.setup(&g.name).is_none())
                {
                    return Err(ConfigError::InvalidBenchmark(format!(
                        "configuration '{}' has no setup for group '{}'",
                        configuration.name, group.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_group_cluster() -> Cluster {
        Cluster::with_groups(vec![
            Group {
                name: "servers".into(),
                size: 2,
            },
            Group {
                name: "clients".into(),
                size: 3,
            },
        ])
    }

    #[test]
    fn test_cluster_groups() {
        let cluster = two_group_cluster();
        assert_eq!(cluster.size(), 5);
        assert_eq!(cluster.group_of(0).unwrap().name, "servers");
        assert_eq!(cluster.group_of(1).unwrap().name, "servers");
        assert_eq!(cluster.group_of(2).unwrap().name, "clients");
        assert_eq!(cluster.group_of(4).unwrap().name, "clients");
        assert!(cluster.group_of(5).is_none());
        assert_eq!(cluster.index_in_group(3), Some(1));
        assert_eq!(cluster.to_string(), "[servers=2, clients=3]");
    }

    #[test]
    fn test_placeholder_evaluation() {
        let context = PropertyContext::for_cluster("local", &Cluster::single(3), 4)
            .for_worker(2, Cluster::single(3).group_of(2), Some("inmemory"));
        let props = Properties::new()
            .with("threads", "${cluster.size}")
            .with("name", "test-${config.name}-${worker.index}")
            .with("fallback", "${missing:7}")
            .with("plain", "no placeholders");

        let evaluated = props.evaluate(&context).unwrap();
        assert_eq!(evaluated.get("threads"), Some("3"));
        assert_eq!(evaluated.get("name"), Some("test-local-2"));
        assert_eq!(evaluated.get("fallback"), Some("7"));
        assert_eq!(evaluated.get("plain"), Some("no placeholders"));
    }

    #[test]
    fn test_unresolved_placeholder_fails() {
        let props = Properties::new().with("x", "${worker.index}");
        let result = props.evaluate(&PropertyContext::new());
        assert!(matches!(result, Err(StageError::UnresolvedProperty(name)) if name == "worker.index"));
    }

    #[test]
    fn test_unterminated_placeholder_fails() {
        let props = Properties::new().with("x", "${cluster.size");
        assert!(props.evaluate(&PropertyContext::new()).is_err());
    }

    #[test]
    fn test_typed_getters() {
        let props = Properties::new()
            .with("duration", "1m 30s")
            .with("threads", " 4 ")
            .with("workers", "0, 2,,3")
            .with("bad", "four");

        assert_eq!(
            props.duration("duration").unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(props.require::<usize>("threads").unwrap(), 4);
        assert_eq!(props.parse_or::<usize>("absent", 9).unwrap(), 9);
        assert_eq!(props.list("workers").unwrap(), vec!["0", "2", "3"]);
        assert!(props.parse::<usize>("bad").is_err());
        assert!(matches!(
            props.require::<usize>("absent"),
            Err(StageError::MissingProperty(_))
        ));
    }

    #[test]
    fn test_benchmark_from_json() {
        let json = r#"{
            "scenario": [
                {"type": "sleep", "properties": {"duration": "10ms"}},
                {"type": "basic-operations-test", "properties": {"total-threads": "4"}}
            ],
            "configurations": [{"name": "local", "setups": [{"service": "inmemory"}]}],
            "clusters": [{"groups": [{"name": "default", "size": 2}]}]
        }"#;

        let benchmark = Benchmark::from_json(json).unwrap();
        assert_eq!(benchmark.scenario.stage_count(), 2);
        assert_eq!(benchmark.scenario.stage(0).unwrap().stage_type, "sleep");
        assert_eq!(benchmark.max_cluster_size(), 2);
        assert!(benchmark.validate().is_ok());
    }

    #[test]
    fn test_benchmark_requires_setup_per_group() {
        let benchmark = Benchmark {
            scenario: Scenario::default(),
            configurations: vec![Configuration::single("local", "inmemory")],
            clusters: vec![two_group_cluster()],
        };
        assert!(matches!(
            benchmark.validate(),
            Err(ConfigError::InvalidBenchmark(_))
        ));
    }
}
