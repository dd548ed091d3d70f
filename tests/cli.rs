use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn notebook_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("notebook");
    path
}

fn setup_test_env(provision_scoring: bool) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("advisory.txt"),
        "Sandworm operators deployed a new wiper against grid operators. \
         The wiper beaconed to 45.77.12.9 before execution. \
         Operators should hunt for the staging host in proxy logs.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/notebook.sqlite"

[ranking]
provision_scoring_tables = {}

[scheduler]
enabled = false
"#,
        root.display(),
        provision_scoring
    );

    let config_path = config_dir.join("notebook.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_notebook(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    run_notebook_with_log(config_path, args, None)
}

fn run_notebook_with_log(config_path: &Path, args: &[&str], rust_log: Option<&str>) -> (String, String, bool) {
    let binary = notebook_binary();
    let mut command = Command::new(&binary);
    match rust_log {
        Some(filter) => command.env("RUST_LOG", filter),
        None => command.env_remove("RUST_LOG"),
    };
    let output = command
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run notebook binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn add_actor(config_path: &Path, name: &str) -> String {
    let (stdout, stderr, success) = run_notebook(config_path, &["actor", "add", name]);
    assert!(success, "actor add failed: stdout={}, stderr={}", stdout, stderr);
    stdout
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("actor "))
        .expect("actor id line")
        .trim()
        .to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(true);

    let (stdout, stderr, success) = run_notebook(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_notebook(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_actor_add_and_list() {
    let (_tmp, config_path) = setup_test_env(false);
    run_notebook(&config_path, &["init"]);

    let id = add_actor(&config_path, "Sandworm");
    let (stdout, _, success) = run_notebook(&config_path, &["actor", "add", "Gamaredon", "--untracked"]);
    assert!(success);
    assert!(stdout.contains("tracked: false"));

    let (stdout, _, success) = run_notebook(&config_path, &["actor", "list"]);
    assert!(success);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("Sandworm"));
    assert!(stdout.contains("untracked"));
}

#[test]
fn test_ingest_dedups_by_url() {
    let (tmp, config_path) = setup_test_env(false);
    run_notebook(&config_path, &["init"]);
    let actor = add_actor(&config_path, "Sandworm");
    let file = tmp.path().join("files/advisory.txt");
    let file = file.to_str().unwrap();

    let args = [
        "ingest",
        actor.as_str(),
        "https://www.cisa.gov/news/aa24-1",
        "--file",
        file,
        "--title",
        "Sandworm wiper advisory",
        "--published-at",
        "2024-04-30",
    ];
    let (first, stderr, success) = run_notebook(&config_path, &args);
    assert!(success, "ingest failed: {}", stderr);
    let (second, _, success) = run_notebook(&config_path, &args);
    assert!(success);
    assert!(first.starts_with("source "));
    assert_eq!(first, second);
}

#[test]
fn test_rust_log_level_is_respected() {
    let (tmp, config_path) = setup_test_env(false);
    run_notebook(&config_path, &["init"]);
    let actor = add_actor(&config_path, "Sandworm");
    let file = tmp.path().join("files/advisory.txt");
    let args = [
        "ingest",
        actor.as_str(),
        "https://www.cisa.gov/news/aa24-2",
        "--file",
        file.to_str().unwrap(),
    ];

    let (_, stderr, success) = run_notebook_with_log(&config_path, &args, Some("intel_notebook=debug"));
    assert!(success, "ingest failed: {}", stderr);
    assert!(stderr.contains("source inserted"), "stderr: {}", stderr);

    let (stdout, stderr, success) = run_notebook(&config_path, &args);
    assert!(success);
    assert!(stdout.starts_with("source "));
    assert!(!stderr.contains("source matched by url"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_missing_file_fails() {
    let (tmp, config_path) = setup_test_env(false);
    run_notebook(&config_path, &["init"]);
    let actor = add_actor(&config_path, "Sandworm");
    let missing = tmp.path().join("files/missing.txt");

    let (_, stderr, success) = run_notebook(
        &config_path,
        &["ingest", &actor, "https://a.example/x", "--file", missing.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("failed to read"));
}

#[test]
fn test_evidence_json_in_degraded_mode() {
    let (tmp, config_path) = setup_test_env(false);
    run_notebook(&config_path, &["init"]);
    let actor = add_actor(&config_path, "Sandworm");
    let file = tmp.path().join("files/advisory.txt");

    let (_, stderr, success) = run_notebook(
        &config_path,
        &[
            "ingest",
            &actor,
            "https://www.cisa.gov/news/aa24-1",
            "--file",
            file.to_str().unwrap(),
        ],
    );
    assert!(success, "ingest failed: {}", stderr);

    let (stdout, stderr, success) = run_notebook(&config_path, &["evidence", &actor, "--json"]);
    assert!(success, "evidence failed: {}", stderr);
    let items: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["domain"], "cisa.gov");
    assert_eq!(items[0]["source_tier"], "high");
    assert_eq!(items[0]["scores"]["final"], 0.0);
}

#[test]
fn test_empty_histories() {
    let (_tmp, config_path) = setup_test_env(false);
    run_notebook(&config_path, &["init"]);
    let actor = add_actor(&config_path, "Sandworm");

    let (stdout, _, success) = run_notebook(&config_path, &["runs", &actor]);
    assert!(success);
    assert!(stdout.contains("No sync runs."));

    let (stdout, _, success) = run_notebook(&config_path, &["jobs", &actor]);
    assert!(success);
    assert!(stdout.contains("No active job."));

    let (stdout, _, success) = run_notebook(&config_path, &["recover"]);
    assert!(success);
    assert!(stdout.contains("No stale generations."));

    let (stdout, _, success) = run_notebook(&config_path, &["evidence", &actor]);
    assert!(success);
    assert!(stdout.contains("No evidence."));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_notebook(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
