//! Property tests for the onion codec.

use proptest::prelude::*;
use std::sync::Arc;
use veilnet_crypto::IdentityKeyPair;
use veilnet_routing::{NodeId, OnionCodec, Path, PeerAddress, PeerRecord, RoutingError, Unwrapped};

fn network(hops: usize) -> (Vec<Arc<IdentityKeyPair>>, Path) {
    let keys: Vec<_> = (0..hops).map(|_| Arc::new(IdentityKeyPair::generate())).collect();
    let records = keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            PeerRecord::new(
                NodeId(i as u64 + 1),
                PeerAddress::new("127.0.0.1", 9100 + i as u16),
                Some(key.public_key()),
            )
        })
        .collect();
    (keys, Path::from_records(records).unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_every_hop_peels_one_layer(
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        hops in 1usize..5,
    ) {
        let (keys, path) = network(hops);
        let codec = OnionCodec::new();
        let mut layer = codec.wrap(&path, &payload).unwrap();

        for (index, key) in keys.iter().enumerate() {
            let bytes = layer.to_bytes().unwrap();
            match codec.unwrap_bytes(&bytes, key).unwrap() {
                Unwrapped::Forward { next_hop, layer: inner } => {
                    prop_assert!(index + 1 < hops);
                    prop_assert_eq!(next_hop.node_id, NodeId(index as u64 + 2));
                    layer = inner;
                }
                Unwrapped::Deliver { payload: delivered } => {
                    prop_assert_eq!(index + 1, hops);
                    prop_assert_eq!(&delivered, &payload);
                }
            }
        }
    }

    #[test]
    fn prop_any_flipped_ciphertext_byte_fails(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        hops in 1usize..4,
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let (keys, path) = network(hops);
        let codec = OnionCodec::new();
        let mut layer = codec.wrap(&path, &payload).unwrap();
        let index = position.index(layer.ciphertext.len());
        layer.ciphertext[index] ^= mask;

        prop_assert!(matches!(
            codec.unwrap(&layer, &keys[0]),
            Err(RoutingError::LayerDecryptionFailed)
        ));
    }

    #[test]
    fn prop_wire_bytes_tampering_fails(
        hops in 1usize..3,
        position in any::<prop::sample::Index>(),
    ) {
        let (keys, path) = network(hops);
        let codec = OnionCodec::new();
        let mut bytes = codec.wrap(&path, b"hello").unwrap().to_bytes().unwrap();
        let index = position.index(bytes.len());
        bytes[index] ^= 0x01;

        prop_assert!(codec.unwrap_bytes(&bytes, &keys[0]).is_err());
    }
}
