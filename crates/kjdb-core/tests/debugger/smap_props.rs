//! Property tests for the SMAP engine.

use kjdb_core::smap::{self, RangeMapping};
use proptest::prelude::*;

/// A file entry plus its mappings, rendered into canonical SMAP text.
fn render(files: &[(u32, String, Vec<RangeMapping>)]) -> String {
    let mut out = String::from("SMAP\nOutKt.class\nKotlin\n*S Kotlin\n*F\n");
    for (id, name, _) in files {
        out.push_str(&format!("+ {id} {name}\n{name}\n"));
    }
    out.push_str("*L\n");
    for (id, _, ranges) in files {
        for range in ranges {
            out.push_str(&format!(
                "{}#{id},{}:{}\n",
                range.source_start, range.range, range.dest_start
            ));
        }
    }
    out.push_str("*E\n");
    out
}

fn range_strategy(file_id: u32) -> impl Strategy<Value = RangeMapping> {
    (1u32..1000, 1u32..1000, 1u32..20).prop_map(move |(source_start, dest_start, range)| {
        RangeMapping {
            source_start,
            dest_start,
            range,
            parent_file: file_id,
        }
    })
}

fn smap_strategy() -> impl Strategy<Value = Vec<(u32, String, Vec<RangeMapping>)>> {
    (1u32..4).prop_flat_map(|count| {
        let strategies: Vec<_> = (1..=count)
            .map(|id| {
                prop::collection::vec(range_strategy(id), 1..6)
                    .prop_map(move |ranges| (id, format!("File{id}.kt"), ranges))
            })
            .collect();
        strategies
    })
}

proptest! {
    /// parse(serialize(m)) reproduces the file tree.
    #[test]
    fn prop_serialize_round_trips(files in smap_strategy()) {
        let text = render(&files);
        let parsed = smap::parse(&text).unwrap();
        let reparsed = smap::parse(&parsed.serialize()).unwrap();
        prop_assert_eq!(&parsed, &reparsed);
    }

    /// For every mapped generated line, source→dest inverts dest→source.
    #[test]
    fn prop_dest_source_round_trip(files in smap_strategy()) {
        let text = render(&files);
        let parsed = smap::parse(&text).unwrap();
        for (_, _, ranges) in &files {
            for range in ranges {
                for dest in range.dest_start..range.dest_start + range.range {
                    let source = range.map_dest_to_source(dest);
                    prop_assert_eq!(range.map_source_to_dest(source), dest);
                }
            }
        }
        // Spot-check through the parsed map as well.
        let (_, name, ranges) = &files[0];
        let range = &ranges[0];
        let dests = parsed.find_dest_lines(name, range.source_start);
        prop_assert!(dests.contains(&range.dest_start));
    }

    /// Every dest line inside a declared range resolves to some position.
    #[test]
    fn prop_contained_dest_lines_resolve(files in smap_strategy()) {
        let text = render(&files);
        let parsed = smap::parse(&text).unwrap();
        for (_, _, ranges) in &files {
            for range in ranges {
                prop_assert!(parsed.contains_dest(range.dest_start));
                prop_assert!(parsed.contains_dest(range.dest_start + range.range - 1));
                prop_assert!(parsed.find_source_position(range.dest_start).is_some());
            }
        }
    }
}
