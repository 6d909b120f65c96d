use adoptrack_core::{Database, Dimension};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    base: PathBuf,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            base,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("adoptrack/data.db")
    }

    fn write_config(&self, toml: &str) {
        let dir = self.xdg_config.join("adoptrack");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), toml).expect("failed to write config");
    }
}

fn command(env: &CliTestEnv, args: &[&str]) -> Command {
    let mut command = Command::new(PathBuf::from(assert_cmd::cargo::cargo_bin!("adoptrack")));
    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("ADOPTRACK_DB_PATH")
        .env_remove("ADOPTRACK_LOG");
    command
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    command(env, args)
        .stdin(Stdio::null())
        .output()
        .unwrap_or_else(|e| panic!("failed to execute adoptrack: {e}"))
}

fn run_with_stdin(env: &CliTestEnv, args: &[&str], stdin: &str) -> Output {
    let mut child = command(env, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to spawn adoptrack: {e}"));
    child
        .stdin
        .take()
        .expect("stdin should be piped")
        .write_all(stdin.as_bytes())
        .expect("failed to write stdin");
    child.wait_with_output().expect("failed to wait for adoptrack")
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "adoptrack {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}):\n{}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[test]
fn before_and_after_record_an_edit() {
    let env = CliTestEnv::new();

    let args = ["before", "s1", "/work/app/main.rs"];
    let output = run_with_stdin(&env, &args, "");
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Recorded before snapshot"));

    let args = [
        "--format",
        "json",
        "after",
        "s1",
        "/work/app/main.rs",
        "--session-info",
        "model=test",
    ];
    let output = run_with_stdin(&env, &args, "fn main() {\n    run();\n}\n");
    assert_success(&args, &output);

    let summary = json(&output);
    assert_eq!(summary["metric"]["generated_lines"], 3);
    assert_eq!(summary["metric"]["estimated"], false);
    assert_eq!(summary["event"]["session_info"], "model=test");
    assert_eq!(summary["event"]["project_id"], "/work/app");

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "database file should exist at {}",
        db_path.display()
    );
    let db = Database::open(&db_path).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    let bucket = db
        .get_bucket(Dimension::File, "/work/app/main.rs")
        .expect("bucket query failed")
        .expect("file bucket should exist");
    assert_eq!(bucket.generated_total, 3);
}

#[test]
fn after_without_before_fails() {
    let env = CliTestEnv::new();

    let output = run_with_stdin(&env, &["after", "s1", "/work/f2"], "x");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no pending before snapshot"),
        "unexpected stderr:\n{stderr}"
    );
}

#[test]
fn empty_session_is_rejected() {
    let env = CliTestEnv::new();

    let output = run_with_stdin(&env, &["before", "", "/work/f"], "x");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid argument"));
}

#[test]
fn content_file_and_queries() {
    let env = CliTestEnv::new();
    env.write_config("[projects]\nroots = [\"/repo\"]\n");

    let before = env.base.join("before.txt");
    let after = env.base.join("after.txt");
    fs::write(&before, "a\nb\nc\n").unwrap();
    fs::write(&after, "a\nc\nd\n").unwrap();

    let args = [
        "before",
        "s1",
        "/repo/src/lib.rs",
        "--content-file",
        before.to_str().unwrap(),
    ];
    assert_success(&args, &run_bin(&env, &args));
    let args = [
        "after",
        "s1",
        "/repo/src/lib.rs",
        "--content-file",
        after.to_str().unwrap(),
    ];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("generated: 1  removed: 1"));

    let args = ["--format", "json", "project", "/repo"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let project = json(&output);
    assert_eq!(project["generated_total"], 1);
    assert_eq!(project["event_count"], 1);

    let args = ["--format", "json", "dashboard"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let dashboard = json(&output);
    assert_eq!(dashboard["generated_total"], 1);
    assert_eq!(dashboard["file_count"], 1);
    assert_eq!(dashboard["session_count"], 1);

    let args = ["show", "1"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("-b"), "diff should show the removed line:\n{stdout}");
    assert!(stdout.contains("+d"), "diff should show the added line:\n{stdout}");

    let args = ["list", "session"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("s1"));
}

#[test]
fn pairings_lists_abandoned_snapshots() {
    let env = CliTestEnv::new();

    for content in ["first", "second"] {
        let args = ["before", "s1", "/work/f"];
        assert_success(&args, &run_with_stdin(&env, &args, content));
    }

    let args = ["--format", "json", "pairings", "--status", "abandoned"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let abandoned = json(&output);
    assert_eq!(abandoned.as_array().map(Vec::len), Some(1));
    assert_eq!(abandoned[0]["content"], "first");

    let output = run_bin(&env, &["pairings", "--status", "completed"]);
    assert!(!output.status.success());
}

#[test]
fn verify_rebuild_export_import() {
    let env = CliTestEnv::new();

    let args = ["before", "s1", "/work/app/a.rs"];
    assert_success(&args, &run_with_stdin(&env, &args, ""));
    let args = ["after", "s1", "/work/app/a.rs"];
    assert_success(&args, &run_with_stdin(&env, &args, "1\n2\n"));

    let args = ["verify"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("All buckets match"));

    let args = ["rebuild"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Rebuilt 3 buckets"));

    let backup = env.base.join("backup.json");
    let args = ["export", backup.to_str().unwrap()];
    assert_success(&args, &run_bin(&env, &args));
    assert!(backup.exists());

    // Importing into the populated database is refused
    let output = run_bin(&env, &["import", backup.to_str().unwrap()]);
    assert!(!output.status.success());

    // A fresh database accepts it and reports the same totals
    let restored = CliTestEnv::new();
    let args = ["import", backup.to_str().unwrap()];
    assert_success(&args, &run_bin(&restored, &args));

    let args = ["--format", "json", "file", "/work/app/a.rs"];
    let output = run_bin(&restored, &args);
    assert_success(&args, &output);
    assert_eq!(json(&output)["generated_total"], 2);
}

#[test]
fn database_path_env_override() {
    let env = CliTestEnv::new();
    let custom = env.base.join("custom/adoptrack.db");

    let output = command(&env, &["before", "s1", "/work/f"])
        .env("ADOPTRACK_DB_PATH", &custom)
        .stdin(Stdio::null())
        .output()
        .expect("failed to execute adoptrack");
    assert!(output.status.success());

    assert!(custom.exists(), "database should be created at the override path");
    assert!(!env.db_path().exists());
}
