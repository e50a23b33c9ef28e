#![no_main]
use libfuzzer_sys::fuzz_target;
use rescar::archive::ArchiveIndex;
use rescar::builder::ArchiveBuilder;

fuzz_target!(|data: &[u8]| {
    // Split the input into entries: first byte of each chunk picks a length.
    let mut builder = ArchiveBuilder::new();
    let mut rest = data;
    let mut i = 0usize;
    while let Some((&len, tail)) = rest.split_first() {
        let n = (len as usize).min(tail.len());
        builder.add(format!("e{i}.lu"), tail[..n].to_vec());
        rest = &tail[n..];
        i += 1;
    }

    let bytes = builder.to_vec().unwrap();
    let index = ArchiveIndex::open(&bytes[..]).unwrap();
    assert_eq!(index.len(), i);
    for entry in index.entries() {
        assert_eq!(entry.offset % 4, 0);
        assert!(index.lookup(entry.name).unwrap().is_some());
    }
});
