//! Partition trees describing how a run is split across booked hosts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ServiceId;

/// Runtime state a host reports for the partition it processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorState {
    /// Host owning the processor.
    pub host: ServiceId,

    /// Opaque processor state.
    pub state: Value,
}

/// A (possibly nested) slice of a run's work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Position of this partition among its siblings.
    pub index: u32,

    /// Host assigned to this partition.
    pub host: Option<ServiceId>,

    /// Nested partitions.
    pub sub_partitions: Vec<Partition>,

    /// Processor state attached while the run is live.
    pub processor_state: Option<ProcessorState>,
}

impl Partition {
    /// Create an unassigned leaf partition.
    pub fn new(index: u32) -> Self {
        Self {
            index,
            host: None,
            sub_partitions: Vec::new(),
            processor_state: None,
        }
    }

    /// Builder method to assign a host.
    pub fn with_host(mut self, host: ServiceId) -> Self {
        self.host = Some(host);
        self
    }

    /// Builder method to add a sub-partition.
    pub fn with_sub_partition(mut self, partition: Partition) -> Self {
        self.sub_partitions.push(partition);
        self
    }

    /// Number of partitions in the tree, including this one.
    pub fn len(&self) -> usize {
        1 + self.sub_partitions.iter().map(Partition::len).sum::<usize>()
    }

    /// A partition tree is never empty; kept for clippy symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Hosts assigned anywhere in the tree, parent before children.
    pub fn hosts(&self) -> Vec<ServiceId> {
        let mut hosts = Vec::new();
        self.collect_hosts(&mut hosts);
        hosts
    }

    fn collect_hosts(&self, out: &mut Vec<ServiceId>) {
        if let Some(host) = &self.host {
            out.push(host.clone());
        }
        for sub in &self.sub_partitions {
            sub.collect_hosts(out);
        }
    }

    /// Drop every processor-state reference in the tree.
    pub fn clear_processor_state(&mut self) {
        self.processor_state = None;
        for sub in &mut self.sub_partitions {
            sub.clear_processor_state();
        }
    }

    /// Whether any node still carries processor state.
    pub fn has_processor_state(&self) -> bool {
        self.processor_state.is_some()
            || self.sub_partitions.iter().any(Partition::has_processor_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Partition {
        let state = |host: &str| ProcessorState {
            host: ServiceId::new(host),
            state: Value::from(1),
        };
        let mut child = Partition::new(0).with_host(ServiceId::new("h2"));
        child.processor_state = Some(state("h2"));
        let mut root = Partition::new(0)
            .with_host(ServiceId::new("h1"))
            .with_sub_partition(child)
            .with_sub_partition(Partition::new(1).with_host(ServiceId::new("h3")));
        root.processor_state = Some(state("h1"));
        root
    }

    #[test]
    fn test_hosts_in_tree_order() {
        let hosts = tree().hosts();
        let names: Vec<&str> = hosts.iter().map(ServiceId::as_str).collect();
        assert_eq!(names, vec!["h1", "h2", "h3"]);
        assert_eq!(tree().len(), 3);
    }

    #[test]
    fn test_clear_processor_state_is_recursive() {
        let mut root = tree();
        assert!(root.has_processor_state());
        root.clear_processor_state();
        assert!(!root.has_processor_state());
        assert_eq!(root.hosts().len(), 3);
    }
}
