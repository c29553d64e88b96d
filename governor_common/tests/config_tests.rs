//! File-based configuration loading tests.
//!
//! Covers `GovernorConfig::load()` and `load_sync()` against real files:
//! missing file handling, parse errors, and a full machine document with
//! parallel stages.

use governor_common::config::{load_sync, ConfigError, GovernorConfig, StageSpec};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write a complete two-motor machine file into the given directory.
fn write_machine_yaml(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("human.yml");
    fs::write(
        &path,
        r#"
name: Human
devices:
  dc:
    type: Device
    name: Detector cover
    pv: "XF:17ID:AMX{Det:1-Cvr}"
    timeout: 5
    positions:
      In: 0.0
      Out: 1.0
  li:
    type: Motor
    name: Light
    pv: "XF:17ID:AMX{Light:1-Ax:X}Mtr"
    tolerance: 0.1
    timeout: 30
    positions:
      Up: 0.0
      Down: -96.0
  bs:
    type: Motor
    name: Beamstop
    pv: "XF:17ID:AMX{BS:1-Ax:X}Mtr"
    tolerance: 0.05
    timeout: 15
    positions:
      In: 1.5
      Out: 40.0
states:
  M:
    name: Maintenance
  SE:
    name: Sample Exchange
    targets:
      dc: {target: In, limits: [-1, 1]}
      li: {target: Up, limits: [-98, 14], updateAfter: true}
      bs: {target: Out, limits: [-5, 5]}
  SA:
    name: Sample Aligned
    targets:
      dc: {target: In, limits: [-1, 1]}
      li: {target: Down, limits: [-14, 98]}
      bs: {target: In, limits: [-0.5, 0.5]}
init_state: M
transitions:
  M:
    SE: [dc, li, bs]
  SE:
    SA: [[dc, bs], li]
  SA:
    SE: [li, [dc, bs]]
"#,
    )
    .unwrap();
    path
}

#[test]
fn load_full_machine_file() {
    let dir = TempDir::new().unwrap();
    let path = write_machine_yaml(dir.path());

    let cfg = GovernorConfig::load(&path).expect("load human.yml");
    cfg.validate().expect("valid config");

    assert_eq!(cfg.name, "Human");
    assert_eq!(cfg.init_state, "M");
    assert_eq!(cfg.states["SE"].targets["li"].target, "Up");
    assert!(cfg.states["SE"].targets["li"].update_after);

    // M -> SE is three singleton stages, SE -> SA starts with a parallel one.
    let m_se = &cfg.transitions["M"]["SE"];
    assert_eq!(m_se.len(), 3);
    assert!(matches!(m_se[0], StageSpec::Single(_)));
    let se_sa = &cfg.transitions["SE"]["SA"];
    assert_eq!(se_sa[0].devices(), ["dc".to_string(), "bs".to_string()]);
}

#[test]
fn missing_file_is_file_not_found() {
    let dir = TempDir::new().unwrap();
    let err = GovernorConfig::load(&dir.path().join("absent.yml")).unwrap_err();
    assert!(matches!(err, ConfigError::FileNotFound(_)));
}

#[test]
fn malformed_yaml_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yml");
    fs::write(&path, "name: [unterminated").unwrap();
    let err = GovernorConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn unknown_top_level_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("extra.yml");
    fs::write(
        &path,
        r#"
name: X
devices: {}
states:
  M: {name: Maintenance}
init_state: M
surprise: true
"#,
    )
    .unwrap();
    let err = GovernorConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "got {err:?}");
}

#[test]
fn sync_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sync.yml");
    fs::write(
        &path,
        r#"
li: [Up, Down]
bs: [In]
"#,
    )
    .unwrap();
    let sync = load_sync(&path).expect("load sync.yml");
    assert_eq!(sync["li"], vec!["Up".to_string(), "Down".to_string()]);
    assert_eq!(sync["bs"], vec!["In".to_string()]);
}
