#![allow(missing_docs)]

use proptest::prelude::*;
use stratum::storage::freespace::{
    bitmap_pages_for, decode_bitmap_pages, encode_bitmap_page, BitmapBuffer,
};
use stratum::PageNumber;

fn buffer_from(bits: &[bool]) -> BitmapBuffer {
    let mut buffer = BitmapBuffer::new(bits.len() as u64);
    for (page, free) in bits.iter().enumerate() {
        if *free {
            buffer.set_free(PageNumber(page as u64)).expect("page is tracked");
        }
    }
    buffer
}

fn run_fits(bits: &[bool], start: usize, count: usize) -> bool {
    start + count <= bits.len() && bits[start..start + count].iter().all(|free| *free)
}

/// First run at or after `position`, else the first one starting before it.
fn expected(bits: &[bool], count: usize, position: usize) -> Option<u64> {
    let position = position.min(bits.len());
    (position..bits.len())
        .chain(0..position)
        .find(|&start| run_fits(bits, start, count))
        .map(|start| start as u64)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn find_returns_a_full_non_wrapping_run(
        bits in prop::collection::vec(prop::bool::weighted(0.6), 1..400),
        count in 1u64..12,
        position in 0u64..450,
    ) {
        let buffer = buffer_from(&bits);
        let found = buffer.find(count, position);
        if let Some(start) = found {
            prop_assert!(start.0 + count <= bits.len() as u64);
            for page in start.0..start.0 + count {
                prop_assert!(buffer.is_free(PageNumber(page)));
            }
        }
        prop_assert_eq!(
            found.map(|page| page.0),
            expected(&bits, count as usize, position as usize)
        );
    }

    #[test]
    fn free_count_matches_bits(bits in prop::collection::vec(any::<bool>(), 0..300)) {
        let buffer = buffer_from(&bits);
        prop_assert_eq!(buffer.free_count(), bits.iter().filter(|b| **b).count() as u64);
        let listed: Vec<u64> = buffer.free_pages().into_iter().map(|p| p.0).collect();
        let wanted: Vec<u64> = bits
            .iter()
            .enumerate()
            .filter(|(_, free)| **free)
            .map(|(page, _)| page as u64)
            .collect();
        prop_assert_eq!(listed, wanted);
    }

    #[test]
    fn bitmap_pages_preserve_words(
        bits in prop::collection::vec(any::<bool>(), 1..20_000),
        page_size in prop::sample::select(vec![1024usize, 2048, 4096]),
    ) {
        let buffer = buffer_from(&bits);
        let pages = bitmap_pages_for(bits.len() as u64, page_size);
        let mut images = Vec::new();
        for index in 0..pages {
            let page = PageNumber(2 + index as u64);
            images.push(
                encode_bitmap_page(buffer.words(), index, page, page_size)
                    .expect("encodes"),
            );
        }
        let words = decode_bitmap_pages(&images, bits.len() as u64, page_size).expect("decodes");
        prop_assert_eq!(words.as_slice(), buffer.words());
    }
}
