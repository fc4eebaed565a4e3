//! Random path selection over the peer directory.
//!
//! Hops are drawn uniformly without regard to topology, latency or shared
//! operators.

use crate::directory::PeerDirectory;
use crate::types::{NodeId, PeerRecord};
use crate::{Result, RoutingError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use veilnet_crypto::PublicKey;

/// One hop a path can route through: a peer with a known public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub record: PeerRecord,
    pub public_key: PublicKey,
}

impl Hop {
    /// `None` when the record carries no key.
    pub fn from_record(record: PeerRecord) -> Option<Self> {
        let public_key = record.public_key?;
        Some(Self { record, public_key })
    }

    pub fn node_id(&self) -> NodeId {
        self.record.node_id
    }
}

/// An ordered, non-empty sequence of distinct hops. The first hop receives
/// the wrapped message; the last delivers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    hops: Vec<Hop>,
}

impl Path {
    pub fn new(hops: Vec<Hop>) -> Result<Self> {
        if hops.is_empty() {
            return Err(RoutingError::InvalidPath("path has no hops".into()));
        }
        let mut seen = HashSet::with_capacity(hops.len());
        for hop in &hops {
            if !seen.insert(hop.node_id()) {
                return Err(RoutingError::InvalidPath(format!("node {} repeats", hop.node_id())));
            }
        }
        Ok(Self { hops })
    }

    /// Builds a path from records, failing if any lacks a public key.
    pub fn from_records(records: Vec<PeerRecord>) -> Result<Self> {
        let hops = records
            .into_iter()
            .map(|record| {
                let node_id = record.node_id;
                Hop::from_record(record)
                    .ok_or_else(|| RoutingError::InvalidPath(format!("node {node_id} has no public key")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(hops)
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn first(&self) -> &Hop {
        // Non-empty by construction.
        &self.hops[0]
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.hops.iter().map(Hop::node_id).collect()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.hops.iter().any(|hop| hop.node_id() == node_id)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PathSelector;

impl PathSelector {
    pub fn new() -> Self {
        Self
    }

    /// Draws `hop_count` distinct peers, excluding the local node and peers
    /// without a public key.
    pub fn select_path(&self, directory: &PeerDirectory, hop_count: usize) -> Result<Path> {
        self.select_path_with_rng(directory, hop_count, &mut rand::thread_rng())
    }

    pub fn select_path_with_rng<R: Rng + ?Sized>(
        &self,
        directory: &PeerDirectory,
        hop_count: usize,
        rng: &mut R,
    ) -> Result<Path> {
        if hop_count == 0 {
            return Err(RoutingError::InvalidConfig("hop_count must be at least 1".into()));
        }

        let eligible: Vec<Hop> = directory
            .remote_peers()
            .into_iter()
            .filter_map(Hop::from_record)
            .collect();
        if eligible.len() < hop_count {
            return Err(RoutingError::InsufficientPeers {
                required: hop_count,
                available: eligible.len(),
            });
        }

        let hops = eligible.choose_multiple(rng, hop_count).cloned().collect();
        Path::new(hops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerAddress;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use veilnet_crypto::IdentityKeyPair;

    fn keyed(id: u64) -> PeerRecord {
        PeerRecord::new(
            NodeId(id),
            PeerAddress::new("localhost", 9000 + id as u16),
            Some(IdentityKeyPair::generate().public_key()),
        )
    }

    fn directory_with(peers: usize, keyless: usize) -> PeerDirectory {
        let directory = PeerDirectory::new(keyed(0));
        for id in 1..=peers as u64 {
            directory.upsert(keyed(id));
        }
        for id in 0..keyless as u64 {
            directory.upsert(PeerRecord::new(NodeId(1000 + id), PeerAddress::new("localhost", 1), None));
        }
        directory
    }

    #[test]
    fn test_zero_hops_is_invalid_config() {
        let directory = directory_with(3, 0);
        assert!(matches!(
            PathSelector::new().select_path(&directory, 0),
            Err(RoutingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_keyless_peers_are_not_eligible() {
        let directory = directory_with(1, 5);
        match PathSelector::new().select_path(&directory, 2) {
            Err(RoutingError::InsufficientPeers { required, available }) => {
                assert_eq!(required, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_path_rejects_duplicates() {
        let record = keyed(4);
        let hop = Hop::from_record(record).unwrap();
        assert!(matches!(
            Path::new(vec![hop.clone(), hop]),
            Err(RoutingError::InvalidPath(_))
        ));
        assert!(Path::new(Vec::new()).is_err());
        assert!(Path::from_records(vec![PeerRecord::new(
            NodeId(9),
            PeerAddress::new("localhost", 1),
            None
        )])
        .is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_path_is_distinct_and_excludes_self(
            peers in 1usize..12,
            keyless in 0usize..4,
            hop_count in 1usize..6,
            seed in any::<u64>(),
        ) {
            let directory = directory_with(peers, keyless);
            let mut rng = StdRng::seed_from_u64(seed);
            match PathSelector::new().select_path_with_rng(&directory, hop_count, &mut rng) {
                Ok(path) => {
                    prop_assert!(hop_count <= peers);
                    prop_assert_eq!(path.len(), hop_count);
                    prop_assert!(!path.contains(NodeId(0)));
                    let ids: HashSet<_> = path.node_ids().into_iter().collect();
                    prop_assert_eq!(ids.len(), hop_count);
                    prop_assert!(path.hops().iter().all(|hop| hop.record.public_key.is_some()));
                }
                Err(RoutingError::InsufficientPeers { required, available }) => {
                    prop_assert!(hop_count > peers);
                    prop_assert_eq!(required, hop_count);
                    prop_assert_eq!(available, peers);
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }
    }
}
