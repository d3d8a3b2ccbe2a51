//! Loading a beamline profile from disk and building its detectors.

use std::io::Write;

use daq_filestore::config::{ConfigError, RegistryBackend, Settings};
use daq_filestore::control::SimControlSystem;
use daq_filestore::detector::factory::{build_detectors, open_registry};

const PROFILE: &str = r#"
[application]
name = "CHX"
log_level = "info"
json_logs = true

[registry]
backend = "jsonl"
root = "REGISTRY_ROOT"

[[detectors]]
name = "eiger4m"
prefix = "XF:11IDB-ES{Det:Eig4M}"
kind = "eiger"
trigger = "fast"
trigger_prefix = "XF:11IDB-ES{Trigger:Eig4M}"
write_path_template = "/XF11ID/data/%Y/%m/%d/"

[[detectors]]
name = "eiger1m_single"
prefix = "XF:11IDB-ES{Det:Eig1M}"
kind = "eiger"
collision_policy = "reject"

[[detectors]]
name = "xray_eye1_writing"
prefix = "XF:11IDA-BI{Bpm:1-Cam:1}"
kind = "prosilica"
tiff = true
"#;

#[tokio::test]
async fn test_profile_builds_all_detectors() {
    let dir = tempfile::tempdir().unwrap();
    let registry_root = dir.path().join("registry");
    let path = dir.path().join("daqfs.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(
        PROFILE
            .replace("REGISTRY_ROOT", &registry_root.display().to_string())
            .as_bytes(),
    )
    .unwrap();

    let settings = Settings::load(&path).unwrap();
    assert!(settings.application.json_logs);
    assert_eq!(settings.registry.backend, RegistryBackend::Jsonl);

    let registry = open_registry(&settings.registry).await.unwrap();
    assert!(registry_root.is_dir());

    let cs = SimControlSystem::new();
    let detectors = build_detectors(&settings, &cs, &registry).unwrap();
    let names: Vec<&str> = detectors.iter().map(|d| d.name()).collect();
    assert_eq!(names, ["eiger4m", "eiger1m_single", "xray_eye1_writing"]);
    assert_eq!(detectors[0].image_key(), "eiger4m_image");
}

#[test]
fn test_missing_prefix_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let toml = "[[detectors]]\nname = \"eiger\"\nkind = \"eiger\"";
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, toml).unwrap();

    // `prefix` is required.
    assert!(matches!(
        Settings::load(&path),
        Err(ConfigError::LoadError(_))
    ));
}
