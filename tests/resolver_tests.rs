//! Target resolution properties

use eagleeye::utils::resolve_targets;
use eagleeye::utils::target_parser::TargetParser;
use eagleeye::EngineError;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};

fn v4(octets: [u8; 4]) -> String {
    Ipv4Addr::from(octets).to_string()
}

proptest! {
    #[test]
    fn resolution_is_sorted_unique_and_deterministic(
        base in any::<[u8; 3]>(),
        start in 0u8..200,
        len in 0u8..50,
        prefix in 24u8..=32,
    ) {
        let low = v4([base[0], base[1], base[2], start]);
        let high = v4([base[0], base[1], base[2], start + len]);
        let targets = vec![
            format!("{}-{}", low, high),
            format!("{}/{}", low, prefix),
            low.clone(),
        ];
        let parser = TargetParser::default();
        let none: Vec<String> = Vec::new();

        let first = resolve_targets(&targets, &none, &parser).unwrap();
        let second = resolve_targets(&targets, &none, &parser).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.windows(2).all(|w| w[0] < w[1]));

        let low_addr: IpAddr = low.parse().unwrap();
        prop_assert!(first.contains(&low_addr));
    }

    #[test]
    fn excluded_hosts_never_survive(
        base in any::<[u8; 3]>(),
        excluded in proptest::collection::vec(0u8..=255, 0..20),
    ) {
        let targets = vec![format!("{}/24", v4([base[0], base[1], base[2], 0]))];
        let excludes: Vec<String> = excluded.iter().map(|&last| v4([base[0], base[1], base[2], last])).collect();

        match resolve_targets(&targets, &excludes, &TargetParser::default()) {
            Ok(hosts) => {
                for exclude in &excludes {
                    let addr: IpAddr = exclude.parse().unwrap();
                    prop_assert!(!hosts.contains(&addr));
                }
            }
            Err(e) => prop_assert!(matches!(e, EngineError::EmptyTargetSet)),
        }
    }
}

#[test]
fn test_ipv4_sorts_before_ipv6() {
    let hosts = resolve_targets(&["::1", "10.0.0.1"], &[], &TargetParser::default()).unwrap();
    assert!(hosts[0].is_ipv4());
    assert!(hosts[1].is_ipv6());
}

#[test]
fn test_expansion_cap() {
    let err = resolve_targets(&["10.0.0.0/8"], &[], &TargetParser::new(1024)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTargetSpec(_)));
}
