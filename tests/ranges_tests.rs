use edge_scan_rs::ranges::{default_ranges, generate_candidate, parse_ranges_str};

#[test]
fn generated_candidates_stay_inside_narrow_blocks() {
    for range in ["188.114.96.0/20", "104.24.0.0/14"] {
        for _ in 0..100 {
            let ip = generate_candidate(range).unwrap();
            let base: Vec<u8> = range
                .split('/')
                .next()
                .unwrap()
                .split('.')
                .map(|o| o.parse().unwrap())
                .collect();
            let o = ip.octets();
            assert_eq!(&o[..3], &base[..3], "range {range} produced {ip}");
            assert!((1..=254).contains(&o[3]));
        }
    }
}

#[test]
fn wide_blocks_randomize_third_octet_too() {
    let mut thirds = std::collections::HashSet::new();
    for _ in 0..300 {
        let ip = generate_candidate("162.158.0.0/15").unwrap();
        let o = ip.octets();
        assert_eq!((o[0], o[1]), (162, 158));
        assert!((1..=254).contains(&o[3]));
        thirds.insert(o[2]);
    }
    // With 300 draws over [0,255] we should see plenty of distinct values.
    assert!(thirds.len() > 50);
}

#[test]
fn empty_selection_falls_back_to_builtin_set() {
    let parsed = parse_ranges_str("").unwrap();
    assert!(parsed.is_empty());
    assert!(!default_ranges().is_empty());
}
