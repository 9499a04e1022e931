use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Gid, NSHARDS};

/// One snapshot of the shard -> group placement, produced by the controller.
///
/// `num` is strictly increasing; `num == 0` is the empty initial placement in
/// which every shard belongs to gid 0 ("no owner") and `groups` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub num: u64,
    pub shards: [Gid; NSHARDS],
    pub groups: HashMap<Gid, Vec<String>>,
}

impl Config {
    /// Derives the successor config: same placement, `num + 1`, deep-copied
    /// group table. The caller then transforms and rebalances it.
    pub fn successor(&self) -> Config {
        Config {
            num: self.num + 1,
            shards: self.shards,
            groups: self
                .groups
                .iter()
                .map(|(gid, servers)| (*gid, servers.clone()))
                .collect(),
        }
    }

    /// The replica endpoints of the group owning `shard`, if any.
    pub fn owner_of(&self, shard: usize) -> Option<&[String]> {
        let gid = self.shards[shard];
        if gid == 0 {
            return None;
        }
        self.groups.get(&gid).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_bumps_num_and_deep_copies_groups() {
        let mut base = Config::default();
        base.groups.insert(7, vec!["g7-0".into(), "g7-1".into()]);
        base.shards = [7; NSHARDS];

        let mut next = base.successor();
        assert_eq!(next.num, 1);
        assert_eq!(next.shards, base.shards);

        next.groups.get_mut(&7).unwrap().push("g7-2".into());
        assert_eq!(base.groups[&7].len(), 2);
    }

    #[test]
    fn zero_config_has_no_owners() {
        let zero = Config::default();
        for shard in 0..NSHARDS {
            assert!(zero.owner_of(shard).is_none());
        }
    }
}
