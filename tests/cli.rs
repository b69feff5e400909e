//! Binary-level tests for the storestack CLI.

use assert_cmd::Command;
use rusqlite::Connection;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const V1: &str = "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL);";
const V2: &str = "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT);";
const V3: &str = "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT, words INTEGER NOT NULL);";
const MAP_2_3: &str =
    "INSERT INTO main.notes (id, title, body, words) SELECT id, title, body, 0 FROM src.notes;";

struct Fixture {
    home: TempDir,
    models: TempDir,
    stores: TempDir,
}

impl Fixture {
    fn new(with_mapping: bool) -> Self {
        let models = TempDir::new().unwrap();
        fs::write(models.path().join("1.sql"), V1).unwrap();
        fs::write(models.path().join("2.sql"), V2).unwrap();
        fs::write(models.path().join("3.sql"), V3).unwrap();
        if with_mapping {
            fs::write(models.path().join("2-3.mapping.sql"), MAP_2_3).unwrap();
        }
        Self {
            home: TempDir::new().unwrap(),
            models,
            stores: TempDir::new().unwrap(),
        }
    }

    fn store(&self) -> std::path::PathBuf {
        self.stores.path().join("Notes.sqlite")
    }

    fn write_v1_store(&self) {
        let conn = Connection::open(self.store()).unwrap();
        conn.execute_batch(V1).unwrap();
        conn.execute("INSERT INTO notes VALUES (1, 'first'), (2, 'second')", [])
            .unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("storestack").unwrap();
        cmd.env("HOME", self.home.path())
            .env_remove("STORESTACK_CONFIG")
            .env_remove("RUST_LOG")
            .args(args)
            .args(["--json", "-q", "--name", "Notes"])
            .arg("--models")
            .arg(self.models.path())
            .arg("--store-dir")
            .arg(self.stores.path());
        cmd
    }
}

fn stdout_json(output: &std::process::Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn user_version(path: &Path) -> i32 {
    Connection::open(path)
        .unwrap()
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_version_json() {
    let output = Command::cargo_bin("storestack")
        .unwrap()
        .args(["version", "--json"])
        .output()
        .unwrap();
    let json = stdout_json(&output);
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_migrate_walks_every_version() {
    let fixture = Fixture::new(true);
    fixture.write_v1_store();

    let report = stdout_json(&fixture.cmd(&["migrate"]).output().unwrap());
    assert_eq!(report["from"], 1);
    assert_eq!(report["to"], 3);
    let steps = report["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["mapping"], "inferred");
    assert_eq!(steps[1]["mapping"], "custom");
    assert_eq!(user_version(&fixture.store()), 3);

    let entries: Vec<_> = fs::read_dir(fixture.stores.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(entries, vec!["Notes.sqlite".to_string()]);

    let info = stdout_json(&fixture.cmd(&["info"]).output().unwrap());
    assert_eq!(info["version"], 3);
    assert_eq!(info["compatible"], true);
    assert!(info["plan"].as_array().unwrap().is_empty());
}

#[test]
fn test_dry_run_leaves_store_untouched() {
    let fixture = Fixture::new(true);
    fixture.write_v1_store();
    let before = fs::read(fixture.store()).unwrap();

    let plan = stdout_json(&fixture.cmd(&["migrate", "--dry-run"]).output().unwrap());
    assert_eq!(plan["steps"], serde_json::json!([[1, 2], [2, 3]]));
    assert_eq!(fs::read(fixture.store()).unwrap(), before);
}

#[test]
fn test_missing_mapping_is_fatal() {
    let fixture = Fixture::new(false);
    fixture.write_v1_store();
    let before = fs::read(fixture.store()).unwrap();

    let output = fixture.cmd(&["migrate"]).output().unwrap();
    assert_eq!(output.status.code(), Some(3));
    let err: Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(err["error"]["code"], "MAPPING_NOT_FOUND");
    assert_eq!(err["error"]["fatal"], true);
    assert_eq!(fs::read(fixture.store()).unwrap(), before);
}

#[test]
fn test_clean_removes_strays() {
    let fixture = Fixture::new(true);
    fixture.write_v1_store();
    fs::write(fixture.stores.path().join("stale.sqlite"), b"old").unwrap();

    let preview = stdout_json(&fixture.cmd(&["clean", "--dry-run"]).output().unwrap());
    assert_eq!(preview["removed"].as_array().unwrap().len(), 1);
    assert!(fixture.stores.path().join("stale.sqlite").exists());

    stdout_json(&fixture.cmd(&["clean"]).output().unwrap());
    assert!(!fixture.stores.path().join("stale.sqlite").exists());
    assert!(fixture.store().exists());
}

#[test]
fn test_open_migrates_and_counts_rows() {
    let fixture = Fixture::new(true);
    fixture.write_v1_store();

    let opened = stdout_json(&fixture.cmd(&["open"]).output().unwrap());
    assert_eq!(opened["model_version"], 3);
    assert_eq!(opened["tables"]["notes"], 2);
    assert_eq!(opened["migration"]["steps"].as_array().unwrap().len(), 2);
}

#[test]
fn test_open_creates_fresh_store() {
    let fixture = Fixture::new(true);

    let opened = stdout_json(&fixture.cmd(&["open"]).output().unwrap());
    assert_eq!(opened["tables"]["notes"], 0);
    assert_eq!(user_version(&fixture.store()), 3);
}

#[test]
fn test_missing_name_is_invalid_argument() {
    let home = TempDir::new().unwrap();
    let output = Command::cargo_bin("storestack")
        .unwrap()
        .env("HOME", home.path())
        .env_remove("STORESTACK_CONFIG")
        .args(["info", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
}

#[test]
fn test_init_writes_config_used_by_later_commands() {
    let fixture = Fixture::new(true);
    fixture.write_v1_store();
    let config = fixture.home.path().join("storestack.json");
    let config_arg = config.to_str().unwrap();

    let written = stdout_json(&fixture.cmd(&["init", "--config", config_arg]).output().unwrap());
    assert_eq!(written["config"]["name"], "Notes");
    assert!(config.exists());

    let again = fixture.cmd(&["init", "--config", config_arg]).output().unwrap();
    assert_eq!(again.status.code(), Some(7));

    let output = Command::cargo_bin("storestack")
        .unwrap()
        .env("HOME", fixture.home.path())
        .env_remove("STORESTACK_CONFIG")
        .args(["info", "--json", "-q", "--config", config_arg])
        .output()
        .unwrap();
    let info = stdout_json(&output);
    assert_eq!(info["version"], 1);
    assert_eq!(info["plan"], serde_json::json!([[1, 2], [2, 3]]));
}
