#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::net::SocketAddr;
    use trace_core::avl::AvlTree;
    use trace_core::config::{TrackerConfig, TrackerMode};
    use trace_core::decode::{decode_ip, DecodeError, IpHeaderError, Timestamp};
    use trace_core::memory::FlowHandle;
    use trace_core::stream::{seq_lt, FlowKey, SequenceSpace, QUAD_SIZE};
    use trace_core::util::log::{init_logger, is_initialized};
    use trace_core::TrackerError;

    fn key(i: u16) -> FlowKey {
        let a: SocketAddr = format!("10.{}.0.1:{}", i % 7, 1000 + i).parse().unwrap();
        let b: SocketAddr = "10.255.0.1:80".parse().unwrap();
        FlowKey::new(a, b)
    }

    // 区间列表始终有序且互不相邻
    fn assert_merged(space: &SequenceSpace) {
        for ix in 0..4 {
            if let Some(quad) = space.quadrant(ix) {
                for pair in quad.intervals().windows(2) {
                    assert!(pair[0].end as u64 + 1 < pair[1].begin as u64, "{:?}", pair);
                }
            }
        }
    }

    #[test]
    fn test_merge_invariant_random_segments() {
        let mut rng = StdRng::seed_from_u64(2024);
        let mut space = SequenceSpace::new();
        for _ in 0..2000 {
            let seq = rng.random_range(0..200_000u32);
            let len = rng.random_range(1..1500u32);
            let class = space.classify(seq, len);
            assert!(class.rexmit_bytes <= len);
            assert_merged(&space);
        }
    }

    #[test]
    fn test_first_insertion_is_clean() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let seq: u32 = rng.random();
            let len = rng.random_range(1..65_536u32);
            let mut space = SequenceSpace::new();
            let class = space.classify(seq, len);
            assert_eq!(class.rexmit_bytes, 0);
            assert!(!class.out_of_order);
            let again = space.classify(seq, len);
            assert_eq!(again.rexmit_bytes, len);
        }
    }

    #[test]
    fn test_long_stream_through_wrap() {
        let mut space = SequenceSpace::new();
        let mut seq = 0xfff0_0000u32;
        let len = 1 << 20;
        let mut total = 0u64;
        while total < 2 * QUAD_SIZE {
            assert_eq!(space.classify(seq, len).rexmit_bytes, 0);
            seq = seq.wrapping_add(len);
            total += len as u64;
        }
        assert!(seq_lt(0xfff0_0000u32.wrapping_add(len), seq));
        assert!(space.summary().quadrants_populated <= 3);
    }

    #[test]
    fn test_avl_with_flow_keys() {
        let mut tree = AvlTree::new();
        let mut rng = StdRng::seed_from_u64(9);
        let mut present = std::collections::BTreeSet::new();
        for step in 0..3000u32 {
            let i = rng.random_range(0..300u16);
            let k = key(i);
            if rng.random_bool(0.6) {
                let inserted = tree.insert(k, step).is_ok();
                assert_eq!(inserted, present.insert(i));
            } else {
                assert_eq!(tree.remove(&k).is_some(), present.remove(&i));
            }
        }
        tree.check_invariants().unwrap();
        assert_eq!(tree.len(), present.len());
        for i in present {
            assert!(tree.contains_key(&key(i)));
        }
    }

    #[test]
    fn test_avl_reverse_orientation_lookup() {
        let mut tree: AvlTree<FlowKey, &str> = AvlTree::new();
        let a: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:80".parse().unwrap();
        tree.insert(FlowKey::new(a, b), "flow").unwrap();
        assert_eq!(tree.get(&FlowKey::new(b, a)), Some(&"flow"));
        assert!(tree.insert(FlowKey::new(b, a), "dup").is_err());
    }

    #[test]
    fn test_config_from_file() {
        let path = std::env::temp_dir().join(format!("trace_core_config_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"mode": "continuous", "live_idle_secs": 30}"#).unwrap();
        let config = TrackerConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.mode, TrackerMode::Continuous);
        assert_eq!(config.live_idle_secs, 30);
        assert!(config.uses_snapshot_index());

        let missing = TrackerConfig::from_json_file("/nonexistent/trace_core.json");
        assert!(matches!(missing, Err(TrackerError::Io(_))));
    }

    #[test]
    fn test_decode_error_converts() {
        let err: TrackerError = decode_ip(Timestamp::default(), &[0x45, 0, 0])
            .unwrap_err()
            .into();
        assert!(matches!(
            err,
            TrackerError::Decode(DecodeError::IpHeaderError(IpHeaderError::TooShort))
        ));
        assert!(!err.is_internal());
        assert!(TrackerError::InternalInconsistency("x".into()).is_internal());
    }

    #[test]
    fn test_handle_ordering_is_stable() {
        let mut pool = trace_core::memory::FlowPool::default();
        let handles: Vec<FlowHandle> = (0..4).map(|i| pool.acquire(i)).collect();
        let mut sorted = handles.clone();
        sorted.sort();
        assert_eq!(handles, sorted);
    }

    #[test]
    fn test_logger_init_is_idempotent() {
        init_logger(log::LevelFilter::Warn, None);
        init_logger(log::LevelFilter::Trace, None);
        assert!(is_initialized());
    }
}
