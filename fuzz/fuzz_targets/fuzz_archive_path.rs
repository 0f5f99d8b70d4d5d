#![no_main]

use libfuzzer_sys::fuzz_target;
use plugin_engine::archive::{resolve_entry_path, sanitize_entry_path};
use std::path::{Component, Path};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let root = Path::new("/srv/plugins/.temp-extract-0");

    if let Ok(relative) = sanitize_entry_path(raw) {
        assert!(relative
            .components()
            .all(|c| matches!(c, Component::Normal(_))));
    }
    if let Ok(resolved) = resolve_entry_path(root, raw) {
        assert!(resolved.starts_with(root));
    }
});
