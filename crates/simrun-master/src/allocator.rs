//! Resource allocation: how many hosts a configuration needs and how its
//! work is partitioned over the hosts that were booked.

use simrun_core::{Partition, ServiceDescriptor, TaskConfiguration};

/// Computes the resource set of a configuration.
pub trait ResourceAllocator: Send + Sync {
    /// Number of hosts that must be booked before the run can start.
    fn required_hosts(&self, config: &TaskConfiguration) -> usize;

    /// Partition tree for the booked hosts. `booked[0]` is the primary.
    fn partition(&self, config: &TaskConfiguration, booked: &[ServiceDescriptor]) -> Partition;
}

/// One host per requested partition: the primary owns the root partition,
/// every auxiliary host owns one sub-partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionAllocator;

impl ResourceAllocator for PartitionAllocator {
    fn required_hosts(&self, config: &TaskConfiguration) -> usize {
        config.partitions.max(1) as usize
    }

    fn partition(&self, _config: &TaskConfiguration, booked: &[ServiceDescriptor]) -> Partition {
        let mut root = Partition::new(0);
        let Some((primary, auxiliary)) = booked.split_first() else {
            return root;
        };
        root.host = Some(primary.id.clone());
        for (index, host) in auxiliary.iter().enumerate() {
            root.sub_partitions
                .push(Partition::new(index as u32 + 1).with_host(host.id.clone()));
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrun_core::{ModelReference, ServiceId};

    fn host(id: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceId::new(id), "simulation", "http://x")
    }

    #[test]
    fn test_single_partition() {
        let config = TaskConfiguration::new(ModelReference::new("inline:"));
        let partition = PartitionAllocator.partition(&config, &[host("h1")]);
        assert_eq!(PartitionAllocator.required_hosts(&config), 1);
        assert_eq!(partition.host, Some(ServiceId::new("h1")));
        assert!(partition.sub_partitions.is_empty());
    }

    #[test]
    fn test_auxiliary_hosts_become_sub_partitions() {
        let config = TaskConfiguration::new(ModelReference::new("inline:")).with_partitions(3);
        let partition =
            PartitionAllocator.partition(&config, &[host("h1"), host("h2"), host("h3")]);
        assert_eq!(PartitionAllocator.required_hosts(&config), 3);
        assert_eq!(
            partition.hosts(),
            vec![ServiceId::new("h1"), ServiceId::new("h2"), ServiceId::new("h3")]
        );
        assert_eq!(partition.sub_partitions[1].index, 2);
    }
}
