use std::net::Ipv4Addr;

use mc_server_indexer::error::RangeError;
use mc_server_indexer::partition::{parse_range, split_range, AddressChunk};

fn range(start: u32, end: u32) -> AddressChunk {
    AddressChunk {
        start: Ipv4Addr::from(start),
        end: Ipv4Addr::from(end),
    }
}

fn assert_tiles(whole: AddressChunk, chunks: &[AddressChunk], n: usize) {
    assert!(!chunks.is_empty());
    assert!(chunks.len() <= n);
    assert_eq!(chunks[0].start, whole.start, "first chunk starts the range");
    assert_eq!(chunks.last().unwrap().end, whole.end, "last chunk ends the range");
    for c in chunks {
        assert!(c.start <= c.end, "inverted chunk {c}");
    }
    for pair in chunks.windows(2) {
        assert_eq!(
            u32::from(pair[0].end) + 1,
            u32::from(pair[1].start),
            "gap or overlap between {} and {}",
            pair[0],
            pair[1]
        );
    }
    let covered: u64 = chunks.iter().map(AddressChunk::address_count).sum();
    assert_eq!(covered, whole.address_count());
}

#[test]
fn chunks_tile_assorted_ranges() {
    let ranges = [
        range(0, 0),
        range(0, 9),
        range(10, 10 + 999),
        range(0x0a00_0000, 0x0aff_ffff),
        range(0xffff_fff0, u32::MAX),
        range(0, u32::MAX),
        range(0xc0a8_0001, 0xc0a8_01ff),
    ];
    for whole in ranges {
        for n in [1, 2, 3, 7, 12, 16, 64, 1000] {
            let chunks = split_range(whole, n).unwrap();
            assert_tiles(whole, &chunks, n);
        }
    }
}

#[test]
fn full_space_into_twelve() {
    let whole = parse_range("0.0.0.0-255.255.255.255").unwrap();
    let chunks = split_range(whole, 12).unwrap();
    assert_eq!(chunks.len(), 12);
    assert_eq!(chunks[0].to_string(), "0.0.0.0-21.85.85.85");
    assert_eq!(chunks[11].end, Ipv4Addr::new(255, 255, 255, 255));
    assert_tiles(whole, &chunks, 12);
}

#[test]
fn single_chunk_is_the_whole_range() {
    let whole = parse_range("198.51.100.0/24").unwrap();
    assert_eq!(split_range(whole, 1).unwrap(), vec![whole]);
}

#[test]
fn tiny_range_yields_fewer_chunks() {
    let whole = parse_range("203.0.113.7").unwrap();
    let chunks = split_range(whole, 12).unwrap();
    assert_eq!(chunks, vec![whole]);
}

#[test]
fn zero_chunks_rejected() {
    let whole = parse_range("10.0.0.0/8").unwrap();
    assert_eq!(split_range(whole, 0), Err(RangeError::ZeroChunks));
}

#[test]
fn oversized_chunk_count_is_clamped() {
    let single = parse_range("10.0.0.1").unwrap();
    assert_eq!(split_range(single, usize::MAX).unwrap(), vec![single]);

    let whole = parse_range("172.16.0.0/16").unwrap();
    let chunks = split_range(whole, usize::MAX / 8).unwrap();
    assert_eq!(chunks.len(), 65_536);
    assert_eq!(chunks[1], range(0xac10_0001, 0xac10_0001));
    assert_tiles(whole, &chunks, usize::MAX / 8);
}
