//! Command-line tests for the `reframe` binary

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use reframe_cli::adapters::memory::synthetic_asset;
use reframe_cli::domain::model::Size;
use reframe_cli::domain::orientation::Rotation;

fn reframe() -> Command {
    let mut cmd = Command::cargo_bin("reframe").unwrap();
    cmd.env_remove("REFRAME_CONFIG")
        .env_remove("REFRAME_PRESET")
        .env_remove("RUST_LOG");
    cmd
}

fn write_asset(dir: &Path, rotation: Rotation, with_audio: bool) -> String {
    let asset = synthetic_asset(2.0, Size::new(1920, 1080), rotation, 10.0, with_audio);
    let path = dir.join("asset.json");
    std::fs::write(&path, serde_json::to_string_pretty(&asset).unwrap()).unwrap();
    path.display().to_string()
}

#[test]
fn test_presets_table() {
    reframe()
        .arg("presets")
        .assert()
        .success()
        .stdout(predicate::str::contains("720p"))
        .stdout(predicate::str::contains("3.5 Mbit/s"));
}

#[test]
fn test_presets_json() {
    let output = reframe().args(["presets", "--json"]).output().unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 8);
    assert_eq!(rows[0]["name"], "240p");
    assert_eq!(rows[7]["height"], 3840);
}

#[test]
fn test_export_without_output_fails() {
    let dir = TempDir::new().unwrap();
    let asset = write_asset(dir.path(), Rotation::Deg0, true);
    reframe()
        .args(["export", "--input", &asset, "--simulate", "--progress", "none"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("output destination is not set"));
}

#[test]
fn test_export_missing_input_fails() {
    reframe()
        .args(["export", "--input", "/nonexistent/clip.mov", "--output", "out.mp4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Input file does not exist"));
}

#[test]
fn test_simulated_export() {
    let dir = TempDir::new().unwrap();
    let asset = write_asset(dir.path(), Rotation::Deg90, true);
    let output = dir.path().join("upright.mov");

    reframe()
        .args([
            "export",
            "--input",
            &asset,
            "--output",
            output.to_str().unwrap(),
            "--preset",
            "480p",
            "--meta",
            "title=Holiday",
            "--network-optimized",
            "--progress",
            "none",
            "--simulate",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Output:"));

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(record["network_optimized"], true);
    assert_eq!(record["metadata"][0]["key"], "title");
    // container follows the output extension
    assert_eq!(record["container"], "mov");
    assert_eq!(record["status"], "completed");
}

#[test]
fn test_simulated_export_with_json_progress() {
    let dir = TempDir::new().unwrap();
    let asset = write_asset(dir.path(), Rotation::Deg0, false);
    let output = dir.path().join("out.mp4");

    reframe()
        .args([
            "export",
            "--input",
            &asset,
            "--output",
            output.to_str().unwrap(),
            "--progress",
            "json",
            "--simulate",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"event\":\"progress\""))
        .stdout(predicate::str::contains("\"event\":\"complete\""));
}

#[test]
fn test_probe_reports_rotation() {
    let dir = TempDir::new().unwrap();
    let asset = write_asset(dir.path(), Rotation::Deg90, false);

    let output = reframe()
        .args(["probe", "--input", &asset, "--json", "--simulate"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["rotation_degrees"], 90);
    assert_eq!(report["render_size"]["width"], 1080);
    assert_eq!(report["render_size"]["height"], 1920);
}

#[test]
fn test_estimate() {
    let dir = TempDir::new().unwrap();
    let asset = write_asset(dir.path(), Rotation::Deg0, true);

    reframe()
        .args(["estimate", "--input", &asset, "--preset", "720p", "--simulate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("907000 bytes"));
}

#[test]
fn test_unknown_preset_is_rejected() {
    let dir = TempDir::new().unwrap();
    let asset = write_asset(dir.path(), Rotation::Deg0, true);

    reframe()
        .args(["estimate", "--input", &asset, "--preset", "8k", "--simulate"])
        .assert()
        .failure();
}
