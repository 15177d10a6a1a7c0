//! Consistent hashing with bounded loads
//!
//! Members are placed on the ring several times (virtual nodes). Keys are
//! first hashed into a fixed partition table; each partition is owned by the
//! first member clockwise from the partition's hash that still has room under
//! the average-load ceiling. Adding or removing a member only recomputes the
//! partition table, so most keys keep their owner.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{Result, SyncError};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over raw bytes
pub fn fnv1a64(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Ring tuning knobs
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Number of partitions keys are hashed into
    pub partition_count: u64,
    /// Virtual nodes per member
    pub replication_factor: usize,
    /// Allowed load relative to the average (must exceed 1.0)
    pub load: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            partition_count: 5000,
            replication_factor: 5,
            load: 1.25,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(SyncError::Config {
                message: "partition_count must be positive".into(),
            });
        }
        if self.replication_factor == 0 {
            return Err(SyncError::Config {
                message: "replication_factor must be positive".into(),
            });
        }
        if !(self.load > 1.0) {
            return Err(SyncError::Config {
                message: format!("load must be greater than 1.0, got {}", self.load),
            });
        }
        Ok(())
    }
}

/// Bounded-load consistent hash ring
#[derive(Debug, Clone)]
pub struct HashRing {
    config: RingConfig,
    /// Virtual node hash -> member
    ring: BTreeMap<u64, String>,
    members: BTreeSet<String>,
    /// Partition id -> owning member
    partitions: Vec<String>,
}

impl HashRing {
    pub fn new(config: RingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ring: BTreeMap::new(),
            members: BTreeSet::new(),
            partitions: Vec::new(),
        })
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a member. Adding an existing member is a no-op.
    pub fn add(&mut self, member: &str) -> Result<()> {
        if self.members.contains(member) {
            return Ok(());
        }

        let mut ring = self.ring.clone();
        for i in 0..self.config.replication_factor {
            ring.insert(fnv1a64(format!("{member}{i}").as_bytes()), member.to_string());
        }
        let mut members = self.members.clone();
        members.insert(member.to_string());

        self.partitions = distribute(&self.config, &ring, members.len())?;
        self.ring = ring;
        self.members = members;

        debug!("Added ring member {} ({} members)", member, self.members.len());
        Ok(())
    }

    /// Remove a member. Returns false when it was not on the ring.
    pub fn remove(&mut self, member: &str) -> Result<bool> {
        if !self.members.contains(member) {
            return Ok(false);
        }

        let mut ring = self.ring.clone();
        ring.retain(|_, owner| owner != member);
        let mut members = self.members.clone();
        members.remove(member);

        self.partitions = if members.is_empty() {
            Vec::new()
        } else {
            distribute(&self.config, &ring, members.len())?
        };
        self.ring = ring;
        self.members = members;

        debug!("Removed ring member {} ({} members)", member, self.members.len());
        Ok(true)
    }

    /// Partition a key hashes into
    pub fn partition_of(&self, key: &[u8]) -> u64 {
        fnv1a64(key) % self.config.partition_count
    }

    /// Owner of a key, `None` while the ring is empty
    pub fn locate(&self, key: &[u8]) -> Option<&str> {
        let partition = self.partition_of(key) as usize;
        self.partitions.get(partition).map(String::as_str)
    }

    /// Upper bound on partitions per member
    pub fn average_load(&self) -> f64 {
        average_load(&self.config, self.members.len())
    }

    /// Partitions owned by each member
    pub fn load_distribution(&self) -> BTreeMap<String, u64> {
        let mut loads: BTreeMap<String, u64> =
            self.members.iter().map(|m| (m.clone(), 0)).collect();
        for owner in &self.partitions {
            *loads.entry(owner.clone()).or_default() += 1;
        }
        loads
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self {
            config: RingConfig::default(),
            ring: BTreeMap::new(),
            members: BTreeSet::new(),
            partitions: Vec::new(),
        }
    }
}

fn average_load(config: &RingConfig, members: usize) -> f64 {
    if members == 0 {
        return 0.0;
    }
    ((config.partition_count / members as u64) as f64 * config.load).ceil()
}

/// Build the partition table for the given ring
fn distribute(
    config: &RingConfig,
    ring: &BTreeMap<u64, String>,
    members: usize,
) -> Result<Vec<String>> {
    let avg_load = average_load(config, members);
    let mut loads: BTreeMap<&str, f64> = BTreeMap::new();
    let mut partitions = Vec::with_capacity(config.partition_count as usize);

    for partition in 0..config.partition_count {
        let key = fnv1a64(&partition.to_le_bytes());
        let owner = ring
            .range(key..)
            .chain(ring.range(..key))
            .map(|(_, member)| member.as_str())
            .find(|member| loads.get(member).copied().unwrap_or(0.0) + 1.0 <= avg_load)
            .ok_or_else(|| SyncError::Invariant {
                message: format!(
                    "no member has room for partition {partition} (members={members}, avg_load={avg_load})"
                ),
            })?;

        *loads.entry(owner).or_insert(0.0) += 1.0;
        partitions.push(owner.to_string());
    }

    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_empty_ring_locates_nothing() {
        let ring = HashRing::new(RingConfig::default()).unwrap();
        assert!(ring.locate(b"t1").is_none());
        assert_eq!(ring.average_load(), 0.0);
    }

    #[test]
    fn test_single_member_owns_everything() {
        let mut ring = HashRing::new(RingConfig::default()).unwrap();
        ring.add("agent-1").unwrap();

        for i in 0..100 {
            assert_eq!(ring.locate(format!("task-{i}").as_bytes()), Some("agent-1"));
        }
        assert_eq!(ring.load_distribution()["agent-1"], 5000);
    }

    #[test]
    fn test_loads_are_bounded() {
        let mut ring = HashRing::new(RingConfig::default()).unwrap();
        for i in 0..7 {
            ring.add(&format!("agent-{i}")).unwrap();
        }

        let avg = ring.average_load() as u64;
        let loads = ring.load_distribution();
        assert_eq!(loads.values().sum::<u64>(), 5000);
        for (member, load) in loads {
            assert!(load <= avg, "{member} holds {load} partitions, bound is {avg}");
        }
    }

    #[test]
    fn test_add_is_idempotent_and_remove_reports_presence() {
        let mut ring = HashRing::new(RingConfig::default()).unwrap();
        ring.add("a").unwrap();
        ring.add("b").unwrap();
        let before = ring.load_distribution();

        ring.add("b").unwrap();
        assert_eq!(ring.load_distribution(), before);

        assert!(ring.remove("a").unwrap());
        assert!(!ring.remove("a").unwrap());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_remove_last_member_empties_table() {
        let mut ring = HashRing::new(RingConfig::default()).unwrap();
        ring.add("only").unwrap();
        ring.remove("only").unwrap();
        assert!(ring.is_empty());
        assert!(ring.locate(b"anything").is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RingConfig {
            load: 1.0,
            ..Default::default()
        };
        assert!(matches!(HashRing::new(config), Err(SyncError::Config { .. })));
    }

    #[test]
    fn test_too_many_members_is_invariant_error() {
        let mut ring = HashRing::new(RingConfig {
            partition_count: 2,
            replication_factor: 1,
            load: 1.25,
        })
        .unwrap();
        ring.add("a").unwrap();
        ring.add("b").unwrap();

        let err = ring.add("c").unwrap_err();
        assert!(matches!(err, SyncError::Invariant { .. }));
        // Failed add leaves the ring untouched
        assert!(!ring.contains("c"));
        assert_eq!(ring.len(), 2);
    }
}
