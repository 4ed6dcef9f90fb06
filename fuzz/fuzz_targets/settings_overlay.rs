#![no_main]

use std::fs;
use std::io::Write;

use libfuzzer_sys::fuzz_target;
use tempfile::NamedTempFile;

use berth_config::Settings;

fuzz_target!(|data: &[u8]| {
    let mut file = match NamedTempFile::new() {
        Ok(v) => v,
        Err(_) => return,
    };
    if file.write_all(data).is_err() {
        return;
    }
    let path = file.path().to_path_buf();

    // Arbitrary overlay files either parse or error; neither may panic.
    let _ = Settings::load(Some(&path));
    let _ = fs::remove_file(path);
});
