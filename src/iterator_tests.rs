//! End-to-end iterator tests over writer-produced stores.
//!
//! Every test builds a store with [`crate::writer::StoreWriter`], reopens it
//! through the public API, and checks point lookups against the source rows
//! for each packing the writer can choose.

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use tempfile::TempDir;

    use crate::accessor::ColumnIterator;
    use crate::columnar::{Columnar, IteratorHints};
    use crate::format::Settings;
    use crate::writer::StoreWriter;

    fn open(writer: StoreWriter, total_docs: u32) -> Columnar {
        Columnar::open_bytes(writer.finish().unwrap(), total_docs).unwrap()
    }

    fn parse_u32s(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn parse_i64s(bytes: &[u8]) -> Vec<i64> {
        bytes
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()) as i64)
            .collect()
    }

    fn take_vint(bytes: &[u8]) -> (u64, usize) {
        let mut value = 0u64;
        let mut shift = 0;
        for (i, &b) in bytes.iter().enumerate() {
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return (value, i + 1);
            }
            shift += 7;
        }
        panic!("unterminated varint");
    }

    #[test]
    fn test_bool_fidelity_across_packings() {
        // Block 0 is constant, blocks 1 and 2 are mixed bitmaps.
        let values: Vec<bool> = (0..600u32)
            .map(|r| if r < 256 { true } else { r * 7 % 3 == 0 })
            .collect();
        let mut writer = StoreWriter::new(Settings {
            rows_per_block: 256,
            ..Settings::default()
        });
        writer.add_bool_attribute("flag", values.clone());
        let store = open(writer, 600);

        let mut iter = store.create_iterator("flag", &IteratorHints::default()).unwrap();
        for r in 0..600u32 {
            assert_eq!(iter.advance_to(r), r);
            assert_eq!(iter.get().unwrap(), values[r as usize] as i64, "row {r}");
        }

        // Arbitrary order must read the same values.
        let mut order: Vec<u32> = (0..600).collect();
        order.shuffle(&mut StdRng::seed_from_u64(7));
        for r in order {
            iter.advance_to(r);
            assert_eq!(iter.get().unwrap(), values[r as usize] as i64, "row {r}");
        }
    }

    #[test]
    fn test_mva_const_block() {
        let rows = vec![vec![2u32, 4, 8]; 300];
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("tags", rows);
        let store = open(writer, 300);

        let mut iter = store.create_iterator("tags", &IteratorHints::default()).unwrap();
        for r in [0u32, 128, 299, 5] {
            iter.advance_to(r);
            assert_eq!(parse_u32s(iter.get_bytes(false).unwrap()), vec![2, 4, 8]);
        }
    }

    #[test]
    fn test_mva_table_block() {
        let rows: Vec<Vec<u32>> = (0..300u32)
            .map(|r| {
                let k = r % 10;
                vec![k, k + 20, k + 100]
            })
            .collect();
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("tags", rows.clone());
        let store = open(writer, 300);

        let mut iter = store.create_iterator("tags", &IteratorHints::default()).unwrap();
        for r in 0..300u32 {
            iter.advance_to(r);
            assert_eq!(
                parse_u32s(iter.get_bytes(false).unwrap()),
                rows[r as usize],
                "row {r}"
            );
        }
    }

    #[test]
    fn test_fixed_length_random_access() {
        // 300 distinct fixed-length rows select the fixed-length packing;
        // reads in a random permutation must reproduce every vector.
        let rows: Vec<Vec<u32>> = (0..300u32).map(|r| vec![r, r + 1, r + 2]).collect();
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("seq", rows.clone());
        let store = open(writer, 300);

        let mut order: Vec<u32> = (0..300).collect();
        order.shuffle(&mut StdRng::seed_from_u64(1234));

        let mut iter = store.create_iterator("seq", &IteratorHints::default()).unwrap();
        for r in order {
            iter.advance_to(r);
            assert_eq!(
                parse_u32s(iter.get_bytes(false).unwrap()),
                vec![r, r + 1, r + 2],
                "row {r}"
            );
        }
    }

    #[test]
    fn test_delta_pfor_block() {
        // Varied lengths (including empty rows) and >256 distinct vectors.
        let rows: Vec<Vec<u32>> = (0..400u32)
            .map(|r| (0..(r % 5)).map(|k| r * 10 + k * 3).collect())
            .collect();
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("tags", rows.clone());
        let store = open(writer, 400);

        let mut iter = store.create_iterator("tags", &IteratorHints::default()).unwrap();
        for r in 0..400u32 {
            iter.advance_to(r);
            assert_eq!(
                parse_u32s(iter.get_bytes(false).unwrap()),
                rows[r as usize],
                "row {r}"
            );
        }
    }

    #[test]
    fn test_int64set_signed_values() {
        let rows = vec![
            vec![-100i64, -1, 50],
            vec![i64::MIN, i64::MAX],
            vec![],
            vec![7],
        ];
        let mut writer = StoreWriter::with_defaults();
        writer.add_int64set_attribute("vals", rows.clone());
        let store = open(writer, 4);

        let mut iter = store.create_iterator("vals", &IteratorHints::default()).unwrap();
        for (r, expected) in rows.iter().enumerate() {
            iter.advance_to(r as u32);
            assert_eq!(&parse_i64s(iter.get_bytes(false).unwrap()), expected);
        }
    }

    #[test]
    fn test_packed_prefix() {
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("tags", vec![vec![1u32, 2, 3]; 10]);
        let store = open(writer, 10);

        let mut iter = store.create_iterator("tags", &IteratorHints::default()).unwrap();
        iter.advance_to(4);
        let unpacked = iter.get_bytes(false).unwrap().to_vec();
        iter.advance_to(4);
        let packed = iter.get_bytes(true).unwrap();
        let (len, consumed) = take_vint(packed);
        assert_eq!(len as usize, unpacked.len());
        assert_eq!(&packed[consumed..], &unpacked[..]);
    }

    #[test]
    fn test_type_mismatch_surfaces_as_error() {
        let mut writer = StoreWriter::with_defaults();
        writer.add_bool_attribute("flag", vec![true, false]);
        writer.add_uint32set_attribute("tags", vec![vec![1], vec![2]]);
        let store = open(writer, 2);

        let mut flags = store.create_iterator("flag", &IteratorHints::default()).unwrap();
        flags.advance_to(0);
        assert!(flags.get_bytes(false).is_err());
        assert!(flags.get_length().is_err());

        let mut tags = store.create_iterator("tags", &IteratorHints::default()).unwrap();
        tags.advance_to(0);
        assert!(tags.get().is_err());

        assert!(store.create_iterator("missing", &IteratorHints::default()).is_err());
    }

    #[test]
    fn test_get_requires_position() {
        let mut writer = StoreWriter::with_defaults();
        writer.add_bool_attribute("flag", vec![true]);
        let store = open(writer, 1);
        let mut iter = store.create_iterator("flag", &IteratorHints::default()).unwrap();
        assert!(iter.get().is_err());
        iter.advance_to(5);
        assert!(iter.get().is_err()); // out of range
    }

    #[test]
    fn test_open_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attrs.col");

        let rows: Vec<Vec<u32>> = (0..200u32).map(|r| vec![r, r + 7]).collect();
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("pairs", rows.clone());
        writer.write_to_path(&path).unwrap();

        let store = Columnar::open(&path, 200).unwrap();
        let hints = IteratorHints {
            sequential: true,
            ..IteratorHints::default()
        };
        let mut iter = store.create_iterator("pairs", &hints).unwrap();
        for r in 0..200u32 {
            iter.advance_to(r);
            assert_eq!(parse_u32s(iter.get_bytes(false).unwrap()), rows[r as usize]);
        }

        // Host row count must agree with the stored directory.
        assert!(Columnar::open(&path, 199).is_err());
    }

    #[test]
    fn test_repeated_reads_are_stable() {
        let rows: Vec<Vec<u32>> = (0..300u32).map(|r| vec![r, r + 1, r + 2]).collect();
        let mut writer = StoreWriter::with_defaults();
        writer.add_uint32set_attribute("seq", rows);
        let store = open(writer, 300);

        let mut iter = store.create_iterator("seq", &IteratorHints::default()).unwrap();
        iter.advance_to(42);
        let first = iter.get_bytes(false).unwrap().to_vec();
        iter.advance_to(42);
        assert_eq!(iter.get_bytes(false).unwrap(), &first[..]);
    }
}
