use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

use crate::cluster::Shard;
use crate::operations::types::{MigrationError, MigrationResult};

pub type ShardId = String;

/// Separator between source and destination shard in an explicit mapping entry.
const MAPPING_SEPARATOR: char = '|';

/// Source shard id to destination shard id, fixed for the whole run.
///
/// The map may be partial: a lookup of a source shard which is not mapped is a hard error,
/// because skipping it would silently drop that shard's data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardMap {
    mapping: BTreeMap<ShardId, ShardId>,
}

impl ShardMap {
    /// Pair the i-th source shard with the i-th destination shard, in listing order.
    ///
    /// Source shards beyond the destination shard count are left unmapped.
    pub fn one_to_one(source: &[Shard], destination: &[Shard]) -> Self {
        let mapping = source
            .iter()
            .zip(destination)
            .map(|(source, destination)| {
                log::debug!("{} ==> {}", source.id, destination.id);
                (source.id.clone(), destination.id.clone())
            })
            .collect::<BTreeMap<_, _>>();

        if source.len() > destination.len() {
            log::warn!(
                "Source has {} shards but destination only {}, shards {:?} are unmapped",
                source.len(),
                destination.len(),
                source[destination.len()..]
                    .iter()
                    .map(|shard| &shard.id)
                    .collect::<Vec<_>>(),
            );
        }

        Self { mapping }
    }

    /// Parse explicit `source|destination` entries. The result may be n:m.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> MigrationResult<Self> {
        let mut mapping = BTreeMap::new();

        for entry in entries {
            let entry = entry.as_ref();
            let (source, destination) = entry
                .split_once(MAPPING_SEPARATOR)
                .map(|(source, destination)| (source.trim(), destination.trim()))
                .filter(|(source, destination)| {
                    !source.is_empty()
                        && !destination.is_empty()
                        && !destination.contains(MAPPING_SEPARATOR)
                })
                .ok_or_else(|| {
                    MigrationError::bad_input(format!(
                        "invalid shard mapping `{entry}`, expected `sourceShard|destShard`"
                    ))
                })?;

            match mapping.entry(source.to_string()) {
                Entry::Occupied(_) => {
                    return Err(MigrationError::DuplicateShardMapping {
                        shard: source.to_string(),
                    });
                }
                Entry::Vacant(vacant) => {
                    log::debug!("{source} ==> {destination}");
                    vacant.insert(destination.to_string());
                }
            }
        }

        Ok(Self { mapping })
    }

    /// Build the map for a run: explicit entries if any were configured, 1:1 otherwise.
    pub fn build<S: AsRef<str>>(
        entries: &[S],
        source: &[Shard],
        destination: &[Shard],
    ) -> MigrationResult<Self> {
        if entries.is_empty() {
            log::debug!("Default 1:1 shard mapping");
            return Ok(Self::one_to_one(source, destination));
        }

        log::debug!("Custom n:m shard mapping");
        let map = Self::from_entries(entries)?;

        for (source_id, destination_id) in &map.mapping {
            if !source.iter().any(|shard| &shard.id == source_id) {
                log::warn!("Mapped source shard {source_id} is not part of the source cluster");
            }
            if !destination.iter().any(|shard| &shard.id == destination_id) {
                log::warn!(
                    "Mapped destination shard {destination_id} is not part of the destination cluster"
                );
            }
        }

        Ok(map)
    }

    /// Destination shard for `source`, failing if it is unmapped.
    pub fn resolve(&self, source: &str) -> MigrationResult<&ShardId> {
        self.mapping
            .get(source)
            .ok_or_else(|| MigrationError::UnmappedShard {
                shard: source.to_string(),
            })
    }

    pub fn get(&self, source: &str) -> Option<&ShardId> {
        self.mapping.get(source)
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShardId, &ShardId)> {
        self.mapping.iter()
    }
}

impl fmt::Display for ShardMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (source, destination) in &self.mapping {
            writeln!(f, "{source} ==> {destination}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn shards(prefix: &str, n: usize) -> Vec<Shard> {
        (0..n)
            .map(|i| Shard::new(format!("{prefix}{i}"), format!("{prefix}{i}/host{i}:27017")))
            .collect()
    }

    #[test]
    fn one_to_one_pairs_in_order() {
        let map = ShardMap::one_to_one(&shards("src", 2), &shards("dst", 2));
        assert_eq!(map.resolve("src0").unwrap(), "dst0");
        assert_eq!(map.resolve("src1").unwrap(), "dst1");
    }

    #[test]
    fn excess_source_shards_are_unmapped() {
        let map = ShardMap::one_to_one(&shards("src", 3), &shards("dst", 2));
        assert_eq!(map.len(), 2);
        assert!(matches!(
            map.resolve("src2"),
            Err(MigrationError::UnmappedShard { shard }) if shard == "src2"
        ));
    }

    #[test]
    fn explicit_mapping_may_be_n_to_m() {
        let map = ShardMap::from_entries(&["a|x", "b|x", "c|y"]).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.resolve("a").unwrap(), "x");
        assert_eq!(map.resolve("b").unwrap(), "x");
        assert_eq!(map.resolve("c").unwrap(), "y");
    }

    #[test]
    fn duplicate_source_is_rejected() {
        let err = ShardMap::from_entries(&["a|x", "a|y"]).unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateShardMapping { shard } if shard == "a"));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        for entry in ["a", "a|", "|x", "a|x|y"] {
            assert!(
                matches!(
                    ShardMap::from_entries(&[entry]),
                    Err(MigrationError::BadInput { .. })
                ),
                "{entry} should be rejected",
            );
        }
    }

    #[test]
    fn build_prefers_explicit_entries() {
        let map = ShardMap::build(&["src1|dst0"], &shards("src", 2), &shards("dst", 2)).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.resolve("src1").unwrap(), "dst0");
        assert!(map.resolve("src0").is_err());

        let map = ShardMap::build::<&str>(&[], &shards("src", 2), &shards("dst", 2)).unwrap();
        assert_eq!(map.len(), 2);
    }

    proptest! {
        #[test]
        fn default_mapping_size(n_source in 0usize..8, n_dest in 0usize..8) {
            let source = shards("src", n_source);
            let destination = shards("dst", n_dest);
            let map = ShardMap::one_to_one(&source, &destination);

            prop_assert_eq!(map.len(), n_source.min(n_dest));
            for (i, shard) in source.iter().enumerate() {
                match map.get(&shard.id) {
                    Some(mapped) => prop_assert_eq!(mapped, &destination[i].id),
                    None => prop_assert!(i >= n_dest),
                }
            }
        }
    }
}
