#![no_main]
use geode_pack::{decode_container, Decompress};
use libfuzzer_sys::fuzz_target;

/// Chunks stored raw, so the fuzzer reaches the chunk bodies instead of
/// fighting the zstd frame format.
struct Stored;

impl Decompress for Stored {
    fn decompress(&self, src: &[u8], _expected_size: usize) -> geode_pack::Result<Vec<u8>> {
        Ok(src.to_vec())
    }
}

fuzz_target!(|data: &[u8]| {
    let _ = decode_container(data, &Stored);
});
