#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use baler_chunk::{Chain, Chunk, ChunkDecoder, ChunkType, FieldPath, FieldProjection};

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the chunk decoder as both chunk layouts.
    // The decoder must reject all malformed inputs gracefully:
    // - truncated sections and bad varints
    // - lying counts, sizes, and bucket directories
    // - out-of-range node/buffer/transition indices
    // - corrupted compressed blocks
    // - non-terminating state machines
    if data.len() < 3 {
        return;
    }
    let num_records = u64::from(data[0] & 0x0F);
    let decoded_data_size = u64::from(data[1]);
    let payload = Chain::from(Bytes::copy_from_slice(&data[2..]));

    for chunk_type in [ChunkType::Simple, ChunkType::Transposed] {
        let chunk = Chunk::new(chunk_type, num_records, decoded_data_size, payload.clone());

        for projection in [
            FieldProjection::all(),
            FieldProjection::new([FieldPath::from([1])]),
        ] {
            let mut decoder = ChunkDecoder::new(projection);
            if decoder.reset(&chunk) {
                // Accepted chunks must serve their records and uphold
                // the framing invariants.
                assert_eq!(decoder.num_records(), num_records);
                let mut out = Bytes::new();
                while decoder.read_record(&mut out) {}
                assert!(decoder.healthy());
                decoder.set_index(0);
                let _ = decoder.read_record(&mut out);
            } else {
                assert!(!decoder.message().is_empty());
                assert!(!decoder.recover());
            }
        }
    }
});
