#![no_main]
use libfuzzer_sys::fuzz_target;
use rescar::archive::ArchiveIndex;

fuzz_target!(|data: &[u8]| {
    // Opening and resolving arbitrary bytes must never panic, only fail.
    let Ok(index) = ArchiveIndex::open(data) else {
        return;
    };
    for i in 0..index.len() {
        if let Ok(Some(payload)) = index.payload_at(i) {
            let start = data.as_ptr() as usize;
            let p = payload.as_ptr() as usize;
            assert!(p >= start && p + payload.len() <= start + data.len());
        }
    }
    let names: Vec<String> = index.entries().map(|e| e.name.to_string()).collect();
    for name in &names {
        let _ = index.lookup(name);
    }
    let _ = index.list();
});
