//! Cluster metadata snapshots and the read-only queries over them.

use crate::client::ClientError;

/// Immutable view of one metadata response.
///
/// Snapshots are replaced wholesale by the refresh schedule, never mutated.
/// Lookups scan linearly; topic and partition counts are small.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub topics: Vec<MetadataTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTopic {
    pub name: String,

    /// Broker-reported error marker for the whole topic, if any.
    pub error: Option<ClientError>,

    pub partitions: Vec<MetadataPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPartition {
    pub id: i32,

    /// Broker id of the leader, `-1` when unknown.
    pub leader: i32,

    /// In-sync replica set.
    pub isr: Vec<i32>,

    pub error: Option<ClientError>,
}

impl Metadata {
    /// All topic names.
    ///
    /// A topic that is mid leader election is still listed; any other
    /// per-topic marker fails the whole call.
    pub fn topics(&self) -> Result<Vec<String>, ClientError> {
        let mut names = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            match &topic.error {
                None | Some(ClientError::LeaderNotAvailable) => names.push(topic.name.clone()),
                Some(err) => return Err(err.clone()),
            }
        }
        Ok(names)
    }

    /// Whether `name` is a known topic. Any per-topic marker is an error.
    pub fn contains_topic(&self, name: &str) -> Result<bool, ClientError> {
        for topic in &self.topics {
            if let Some(err) = &topic.error {
                return Err(err.clone());
            }
            if topic.name == name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn partitions(&self, topic: &str) -> Result<Vec<i32>, ClientError> {
        self.partitions_matching(topic, false)
    }

    /// Partitions that currently have a leader and accept writes.
    pub fn writable_partitions(&self, topic: &str) -> Result<Vec<i32>, ClientError> {
        self.partitions_matching(topic, true)
    }

    fn partitions_matching(&self, topic: &str, writable_only: bool) -> Result<Vec<i32>, ClientError> {
        let mut ids = Vec::new();
        for t in &self.topics {
            if let Some(err) = &t.error {
                return Err(err.clone());
            }
            if t.name != topic {
                continue;
            }
            for p in &t.partitions {
                if writable_only && matches!(p.error, Some(ClientError::LeaderNotAvailable)) {
                    continue;
                }
                ids.push(p.id);
            }
        }
        Ok(ids)
    }

    /// Leader broker id for the partition, `-1` when not found.
    pub fn leader(&self, topic: &str, partition: i32) -> Result<i32, ClientError> {
        for t in &self.topics {
            if let Some(err) = &t.error {
                return Err(err.clone());
            }
            if t.name != topic {
                continue;
            }
            for p in &t.partitions {
                if p.id == partition {
                    return Ok(p.leader);
                }
            }
        }
        Ok(-1)
    }

    /// In-sync replicas for the partition; empty when not found.
    pub fn replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>, ClientError> {
        for t in &self.topics {
            if let Some(err) = &t.error {
                return Err(err.clone());
            }
            if t.name != topic {
                continue;
            }
            for p in &t.partitions {
                if p.id == partition {
                    return Ok(p.isr.clone());
                }
            }
        }
        Ok(Vec::new())
    }
}
