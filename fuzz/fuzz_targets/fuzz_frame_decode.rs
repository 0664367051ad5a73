#![no_main]

use docstore::formats::{decode_frame, ScanMode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut cur = std::io::Cursor::new(data);
    let _ = decode_frame(&mut cur, ScanMode::BestEffortTail);
    let mut cur = std::io::Cursor::new(data);
    let _ = decode_frame(&mut cur, ScanMode::Strict);
});
