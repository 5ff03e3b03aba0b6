use bytes::Bytes;

use baler_chunk::{
    ChunkDecoder, CompressionKind, EncoderOptions, FieldPath, FieldProjection, TransposeEncoder,
};

/// Build a transposed chunk, then decode it twice: once in full, once
/// with a projection keeping only field 1.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let count: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(5);

    let mut encoder = TransposeEncoder::new(EncoderOptions {
        compression: CompressionKind::Zstd,
        ..Default::default()
    });
    for i in 0..count {
        // {1: i, 2: "event-i"}
        let mut record = vec![0x08, i as u8];
        let text = format!("event-{}", i);
        record.push(0x12);
        record.push(text.len() as u8);
        record.extend_from_slice(text.as_bytes());
        encoder.add_record(Bytes::from(record))?;
    }
    let chunk = encoder.encode()?;

    println!(
        "chunk: type={:?} records={} decoded={}B payload={}B",
        chunk.header.chunk_type,
        chunk.header.num_records,
        chunk.header.decoded_data_size,
        chunk.header.data_size,
    );

    for (label, projection) in [
        ("full", FieldProjection::all()),
        ("field 1 only", FieldProjection::new([FieldPath::from([1])])),
    ] {
        let mut decoder = ChunkDecoder::new(projection);
        if !decoder.reset(&chunk) {
            eprintln!("decode failed: {}", decoder.message());
            std::process::exit(1);
        }

        println!("\n── decode ({}) ──", label);
        let mut record = Bytes::new();
        let mut index = 0u64;
        while decoder.read_record(&mut record) {
            println!("  record #{}: {} bytes {:02x?}", index, record.len(), record.as_ref());
            index += 1;
        }
        if !decoder.healthy() {
            eprintln!("read failed: {}", decoder.message());
            std::process::exit(1);
        }
    }

    Ok(())
}
