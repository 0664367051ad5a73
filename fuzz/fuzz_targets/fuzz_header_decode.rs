#![no_main]

use docstore::header::DbHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = DbHeader::decode(data) {
        // Anything that decodes must re-encode and decode to itself.
        let bytes = header.encode().unwrap();
        let again = DbHeader::decode(&bytes).unwrap();
        assert_eq!(again, header);
    }
});
