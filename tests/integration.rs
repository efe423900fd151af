use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_harvest"))
}

fn set_mtime(path: &Path, secs: u64) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn setup_test_env(with_cache: bool) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("notes")).unwrap();
    fs::write(files_dir.join("alpha.md"), "# Alpha\n\nFirst document.\n").unwrap();
    fs::write(files_dir.join("beta.txt"), "Beta plain text file.\n").unwrap();
    fs::write(files_dir.join("notes/gamma.md"), "# Gamma\n\nNested note.\n").unwrap();
    fs::write(files_dir.join("image.bin"), [0u8, 159, 146, 150]).unwrap();
    for (n, name) in ["alpha.md", "beta.txt", "notes/gamma.md"].iter().enumerate() {
        set_mtime(&files_dir.join(name), 1_700_000_000 + n as u64 * 60);
    }

    let cache_section = if with_cache {
        format!("[cache]\npath = \"{}/cache\"\n", root.display())
    } else {
        String::new()
    };

    let config_content = format!(
        r#"[archive]
path = "{root}/archives"

{cache_section}
[connectors.filesystem.docs]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]

[connectors.http_json.tracker]
url = "http://127.0.0.1:9/api/issues"
category = "issue"
ascending = true
"#,
        root = root.display(),
        cache_section = cache_section,
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn parse_lines(content: &str) -> Vec<serde_json::Value> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_connectors_lists_types_and_instances() {
    let (_tmp, config) = setup_test_env(false);
    let (stdout, stderr, success) = run_harvest(&config, &["connectors"]);
    assert!(success, "connectors failed: {}", stderr);
    assert!(stdout.contains("filesystem"));
    assert!(stdout.contains("http_json"));
    assert!(stdout.contains("filesystem:docs"));
    assert!(stdout.contains("http_json:tracker"));
}

#[test]
fn test_fetch_filesystem_to_file() {
    let (tmp, config) = setup_test_env(false);
    let out = tmp.path().join("out/items.jsonl");
    let (_stdout, stderr, success) = run_harvest(
        &config,
        &[
            "fetch",
            "filesystem:docs",
            "--json-line",
            "--progress",
            "off",
            "--output",
            out.to_str().unwrap(),
        ],
    );
    assert!(success, "fetch failed: {}", stderr);
    assert!(stderr.contains("Total items:"));

    let items = parse_lines(&fs::read_to_string(&out).unwrap());
    let paths: Vec<&str> = items
        .iter()
        .map(|i| i["data"]["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["alpha.md", "beta.txt", "notes/gamma.md"]);

    for item in &items {
        assert_eq!(item["backend_name"], "filesystem");
        assert_eq!(item["category"], "file");
        assert_eq!(item["uuid"].as_str().unwrap().len(), 40);
        assert_eq!(item["search_fields"]["item_id"], item["data"]["path"]);
        assert!(item["classified_fields_filtered"].is_null());
        assert!(item.get("offset").is_none());
    }
}

#[test]
fn test_fetch_to_stdout_is_stable() {
    let (_tmp, config) = setup_test_env(false);
    let args = ["fetch", "filesystem:docs", "--json-line", "--progress", "off"];

    let (first, stderr, success) = run_harvest(&config, &args);
    assert!(success, "fetch failed: {}", stderr);
    let (second, _, _) = run_harvest(&config, &args);

    let uuids = |out: &str| -> Vec<String> {
        parse_lines(out)
            .iter()
            .map(|i| i["uuid"].as_str().unwrap().to_string())
            .collect()
    };
    assert_eq!(uuids(&first).len(), 3);
    assert_eq!(uuids(&first), uuids(&second));
}

#[test]
fn test_fetch_with_future_from_date_is_empty() {
    let (_tmp, config) = setup_test_env(false);
    let (stdout, stderr, success) = run_harvest(
        &config,
        &[
            "fetch",
            "filesystem:docs",
            "--json-line",
            "--from-date",
            "2999-01-01",
        ],
    );
    assert!(success, "fetch failed: {}", stderr);
    assert!(stdout.trim().is_empty());
    assert!(stderr.contains("Total items:        0"));
}

#[test]
fn test_fetch_archive_conflicts_with_no_archive() {
    let (_tmp, config) = setup_test_env(false);
    let (_, stderr, success) = run_harvest(
        &config,
        &["fetch", "filesystem:docs", "--fetch-archive", "--no-archive"],
    );
    assert!(!success);
    assert!(stderr.contains("not compatible"));
}

#[test]
fn test_fetch_archive_requires_archiving_connector() {
    let (_tmp, config) = setup_test_env(false);
    let (_, stderr, success) =
        run_harvest(&config, &["fetch", "filesystem:docs", "--fetch-archive"]);
    assert!(!success);
    assert!(stderr.contains("does not support archiving"));
}

#[test]
fn test_fetch_unknown_instance_fails() {
    let (_tmp, config) = setup_test_env(false);
    let (_, stderr, success) = run_harvest(&config, &["fetch", "filesystem:nope"]);
    assert!(!success);
    assert!(stderr.contains("[connectors.filesystem.nope]"));

    let (_, stderr, success) = run_harvest(&config, &["fetch", "docs"]);
    assert!(!success);
    assert!(stderr.contains("Expected <type>:<name>"));
}

#[test]
fn test_fetch_invalid_category_fails() {
    let (tmp, config) = setup_test_env(false);
    let (_, stderr, success) = run_harvest(
        &config,
        &["fetch", "http_json:tracker", "--category", "commit"],
    );
    assert!(!success);
    assert!(stderr.contains("commit category not valid"));
    // The archive created for the fetch is gone again.
    let leftovers = walkdir::WalkDir::new(tmp.path().join("archives"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_blacklist_requires_unique_field() {
    let (_tmp, config) = setup_test_env(false);
    let (_, stderr, success) = run_harvest(
        &config,
        &["fetch", "filesystem:docs", "--blacklist-ids", "alpha.md"],
    );
    assert!(!success);
    assert!(stderr.contains("unique"));
}

#[test]
fn test_archives_list_empty() {
    let (_tmp, config) = setup_test_env(false);
    let (_, stderr, success) = run_harvest(&config, &["archives", "list"]);
    assert!(success, "archives list failed: {}", stderr);
    assert!(stderr.contains("0 archive(s)"));
}

#[test]
fn test_cache_commands() {
    let (_tmp, config) = setup_test_env(false);
    let (_, stderr, success) = run_harvest(&config, &["cache", "backup", "filesystem:docs"]);
    assert!(!success);
    assert!(stderr.contains("No [cache] path configured"));

    let (tmp, config) = setup_test_env(true);
    for args in [
        vec!["cache", "backup", "filesystem:docs"],
        vec!["cache", "clean", "filesystem:docs"],
        vec!["cache", "recover", "filesystem:docs"],
        vec!["cache", "clean", "--erase", "filesystem:docs"],
    ] {
        let (_, stderr, success) = run_harvest(&config, &args);
        assert!(success, "{:?} failed: {}", args, stderr);
    }
    assert!(tmp.path().join("cache/filesystem/docs/items").is_dir());
    assert!(tmp.path().join("cache/filesystem/docs/recovery").is_dir());
}

#[test]
fn test_completions() {
    let output = Command::new(harvest_binary())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("harvest"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_harvest(&tmp.path().join("absent.toml"), &["connectors"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_json_progress_reports_resolved_category() {
    let (_tmp, config) = setup_test_env(false);
    let (_, stderr, success) = run_harvest(
        &config,
        &["fetch", "filesystem:docs", "--json-line", "--progress", "json"],
    );
    assert!(success, "fetch failed: {}", stderr);

    let started: Vec<serde_json::Value> = stderr
        .lines()
        .filter(|l| l.starts_with('{'))
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
        .filter(|v| v["phase"] == "started")
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0]["category"], "file");
    assert_eq!(started[0]["connector"], "filesystem:docs");
}
