#![no_main]

use libfuzzer_sys::fuzz_target;
use paktools::{detect_format, ArchiveReader, LegacyPak};
use std::io;

fuzz_target!(|data: &[u8]| {
    // Detection must never panic, whatever the input
    let _ = detect_format(data);

    if let Ok(reader) = ArchiveReader::open(data.to_vec()) {
        let paths: Vec<String> = reader.entries().map(|e| e.path.clone()).collect();
        for path in &paths {
            let _ = reader.read_entry(path);
            if let Ok(stream) = reader.stream_entry(path) {
                let _ = stream.copy_to(io::sink());
            }
        }
        let _ = reader.verify_all();
        let _ = reader.contains("../../../etc/passwd");
        let _ = reader.contains("");
    }

    if let Ok(pak) = LegacyPak::open(data.to_vec()) {
        let names: Vec<String> = pak.entries().map(|e| e.name.clone()).collect();
        for name in &names {
            let _ = pak.read_entry(name);
        }
    }
});
