#![no_main]

use libfuzzer_sys::fuzz_target;
use plugin_engine::manifest::PluginManifest;

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(manifest) = PluginManifest::from_json(content) {
        // An accepted name is always a single directory segment
        assert!(!manifest.name.is_empty());
        assert!(!manifest.name.contains(['/', '\\']));
        assert_ne!(manifest.name, "..");
    }
});
