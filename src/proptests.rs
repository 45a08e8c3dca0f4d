use super::*;

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Ids a packed trie should assign: siblings by subtree total (descending)
/// then byte, recursively.
fn model_rank_order(entries: &[(Vec<u8>, u32)], depth: usize) -> Vec<Vec<u8>> {
    if entries.is_empty() {
        return Vec::new();
    }
    if depth == entries[0].0.len() {
        return entries.iter().map(|(k, _)| k.clone()).collect();
    }

    let mut groups: BTreeMap<u8, Vec<(Vec<u8>, u32)>> = BTreeMap::new();
    for e in entries {
        groups.entry(e.0[depth]).or_default().push(e.clone());
    }
    let mut groups: Vec<(u8, u64, Vec<(Vec<u8>, u32)>)> = groups
        .into_iter()
        .map(|(b, g)| (b, g.iter().map(|(_, c)| *c as u64).sum(), g))
        .collect();
    groups.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    groups
        .into_iter()
        .flat_map(|(_, _, g)| model_rank_order(&g, depth + 1))
        .collect()
}

fn prefix_set(plen: usize, entries: &BTreeMap<Vec<u8>, u32>) -> PrefixSet {
    let mut set = PrefixSet::new(plen);
    for (k, &c) in entries {
        set.push(k, c).unwrap();
    }
    set
}

fn keys_strategy(len: usize) -> impl Strategy<Value = BTreeMap<Vec<u8>, u32>> {
    // Narrow alphabet so keys share prefixes.
    prop::collection::btree_map(
        prop::collection::vec(prop::sample::select(vec![0u8, 1, 2, 0x7f, 0xff]), len),
        1u32..100,
        1..60,
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 10_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_packed_trie_is_dense_rank_ordered_bijection(
        (plen, entries) in (1usize..5).prop_flat_map(|plen| (Just(plen), keys_strategy(plen))),
        threshold in prop::sample::select(vec![1usize, 2, 3, 300]),
        probes in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..5), 0..20),
    ) {
        let mut set = prefix_set(plen, &entries);
        let trie = PackedTrie::build_with_map_threshold(&mut set, threshold).unwrap();

        let as_vec: Vec<(Vec<u8>, u32)> = entries.iter().map(|(k, &c)| (k.clone(), c)).collect();
        let expected = model_rank_order(&as_vec, 0);

        prop_assert_eq!(trie.len(), entries.len());
        for (id, key) in expected.iter().enumerate() {
            prop_assert_eq!(trie.search(key), Some(id));
            prop_assert_eq!(set.get(id).map(|(k, c)| (k.to_vec(), c)), Some((key.clone(), entries[key])));
        }

        let leaves: Vec<(usize, Vec<u8>)> = trie.leaves().map(|(id, k)| (id, k.to_vec())).collect();
        let expected_leaves: Vec<(usize, Vec<u8>)> = expected.iter().cloned().enumerate().collect();
        prop_assert_eq!(leaves, expected_leaves);

        for probe in probes {
            if probe.len() == plen && !entries.contains_key(&probe) {
                prop_assert_eq!(trie.search(&probe), None);
            }
        }
    }

    #[test]
    fn prop_byte_trie_round_trips_and_packs(
        (len, entries) in (1usize..5).prop_flat_map(|len| (Just(len), keys_strategy(len))),
        offset in 0u32..1000,
        threshold in prop::sample::select(vec![0usize, 2, 4, 256]),
    ) {
        let flat: Vec<u8> = entries.keys().flatten().copied().collect();
        let mut trie = ByteTrieBuilder::new()
            .value_offset(offset)
            .map_threshold(threshold)
            .build(&flat, len)
            .unwrap();

        prop_assert_eq!(trie.trie_size(), entries.len());
        prop_assert_eq!(trie.len_of_keys(), len);
        let keys: Vec<Vec<u8>> = trie.keys().map(|k| k.to_vec()).collect();
        prop_assert_eq!(&keys, &entries.keys().cloned().collect::<Vec<_>>());
        for (i, key) in entries.keys().enumerate() {
            prop_assert_eq!(trie.get(key), Some(offset + i as u32));
        }

        // Store the counts, then check a packed copy sees them and stays independent.
        for (key, &count) in &entries {
            trie.set(key, count).unwrap();
        }
        let packed = trie.pack();
        let mut copy = packed.clone();
        for (key, &count) in &entries {
            prop_assert_eq!(packed.search(key), Some(count));
            copy.set(key, 0).unwrap();
        }
        prop_assert_eq!(packed.len(), entries.len());
        for (key, &count) in &entries {
            prop_assert_eq!(packed.search(key), Some(count));
            prop_assert_eq!(copy.search(key), Some(0));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        max_shrink_iters: 1_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_top_k_matches_sorting_model(
        values in prop::collection::vec(0u32..8, 512),
        k in 1usize..40,
    ) {
        // Two one-byte prefixes give 512 counters: ids 0 and 1 for 'a' and 'b'.
        let mut prefixes = PrefixSet::from_parts(1, b"ab".to_vec(), vec![1, 1]).unwrap();
        let trie = PackedTrie::build(&mut prefixes).unwrap();
        let counts = CountsArray::new(NgramSpace::Prefixed(&trie)).unwrap();

        let mut values = values;
        values[0] = values[0].max(1);
        values[256] = values[256].max(1);
        for (i, &v) in values.iter().enumerate() {
            for _ in 0..v {
                counts.increment(i / 64, &[1 << (i % 64)]);
            }
        }

        let top = find_top_k(&counts, k).unwrap();

        let mut model: Vec<u32> = values.iter().copied().filter(|&v| v > 1).collect();
        model.sort_unstable_by(|a, b| b.cmp(a));
        model.truncate(k);
        let mut got: Vec<u32> = top.counts().to_vec();
        got.sort_unstable_by(|a, b| b.cmp(a));
        prop_assert_eq!(got, model);

        let mut seen = HashSet::new();
        for (ngram, count) in top.iter() {
            prop_assert!(seen.insert(ngram.to_vec()));
            let row = (ngram[0] - b'a') as usize;
            prop_assert_eq!(values[row * 256 + ngram[1] as usize], count);
        }
    }

    #[test]
    fn prop_counts_are_per_file_presence(
        files in prop::collection::vec(
            prop::collection::vec(prop::sample::select(b"abcd".to_vec()), 0..40),
            1..12,
        ),
        chunk_size in 1usize..9,
        group_size in 1usize..5,
        threads in 1usize..4,
    ) {
        // Every 2-byte prefix over the alphabet, so all 3-grams are counted.
        let mut prefixes = PrefixSet::new(2);
        for a in b"abcd" {
            for b in b"abcd" {
                prefixes.push(&[*a, *b], 1).unwrap();
            }
        }
        let trie = PackedTrie::build(&mut prefixes).unwrap();

        let mut model: HashMap<Vec<u8>, BTreeSet<usize>> = HashMap::new();
        for (f, data) in files.iter().enumerate() {
            for w in data.windows(3) {
                model.entry(w.to_vec()).or_default().insert(f);
            }
        }

        let config = PipelineConfig {
            n: 3,
            k: 1,
            threads,
            group_size,
            chunk_size,
            queue_depth: 2,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(config, MemorySource::new(files.clone())).unwrap();
        let (counts, stats) = pipeline.count_pass(NgramSpace::Prefixed(&trie)).unwrap();

        prop_assert_eq!(stats.files, files.len());
        for a in b"abcd" {
            for b in b"abcd" {
                for c in b"abcd" {
                    let gram = [*a, *b, *c];
                    let id = trie.search(&gram[..2]).unwrap();
                    let expected = model.get(&gram[..]).map_or(0, |s| s.len()) as u32;
                    prop_assert_eq!(counts.get(id * 256 + *c as usize), expected);
                }
            }
        }
    }
}
