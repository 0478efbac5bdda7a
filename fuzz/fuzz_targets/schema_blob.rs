#![no_main]
use geode_pack::schema::remote::SchemaBlob;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = SchemaBlob::parse(data);
});
