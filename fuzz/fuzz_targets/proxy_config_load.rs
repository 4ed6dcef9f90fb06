#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

use berth_proxy::ProxyManager;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("workspaces.yml");
    if fs::write(&path, data).is_err() {
        return;
    }

    // A torn or hostile config file must load as an empty document, never
    // panic or error out of provisioning.
    let manager = ProxyManager::new(path, "berth.dev", "https://berth.dev/api/auth/verify");
    let config = manager.load().expect("load is total");
    let _ = config.http.routers.len();
});
