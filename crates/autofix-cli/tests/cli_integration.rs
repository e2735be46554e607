use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir =
            tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let workspace = Self { dir };
        workspace.write_config("autofix-test-missing-ollama");
        workspace
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write_config(&self, ollama_binary: &str) {
        let config = format!(
            "claude:\n  api_key_env: AUTOFIX_TEST_UNSET_API_KEY\nollama:\n  binary: {ollama_binary}\ntimeouts:\n  analyze_secs: 20\n  apply_secs: 20\n  verify_secs: 20\n"
        );
        write(&self.path("autofix.yaml"), &config);
    }

    fn run<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_autofix"))
            .arg("--memory-dir")
            .arg(self.path("memory"))
            .arg("--config")
            .arg(self.path("autofix.yaml"))
            .args(args)
            .env_remove("AUTOFIX_MEMORY_DIR")
            .env_remove("AUTOFIX_LOG")
            .output()
            .unwrap_or_else(|err| panic!("failed to execute autofix binary: {err}"))
    }

    fn run_json<I, S>(&self, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        if !output.status.success() {
            panic!(
                "autofix command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        parse_stdout(&output)
    }
}

fn write(path: &Path, body: &str) {
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn write_issue(workspace: &Workspace, expected_pattern: &str) -> PathBuf {
    let path = workspace.path("issue.json");
    let issue = serde_json::json!({
        "model": "llama3:8b",
        "issue_type": "wrong_answer",
        "description": "model answered five",
        "test_prompt": "What is 2+2?",
        "expected_pattern": expected_pattern,
        "actual_response": "five",
        "test_environment": {"ollama": "0.3.12"}
    });
    write(&path, &issue.to_string());
    path
}

#[test]
fn stats_on_empty_memory_reports_zero_attempts() {
    let workspace = Workspace::new();
    let stats = workspace.run_json(["stats"]);

    assert_eq!(as_str(&stats, "contract_version"), "autofix.cli.v1");
    assert_eq!(as_u64(&stats, "totalFixesAttempted"), 0);
    assert_eq!(as_u64(&stats, "schemaVersion"), 2);
    assert!(workspace.path("memory").join("knowledge_base.json").exists());
}

#[test]
fn export_on_empty_memory_writes_snapshot() {
    let workspace = Workspace::new();
    let out = workspace.path("snapshot.json");
    let summary = workspace.run_json([OsStr::new("export"), OsStr::new("--out"), out.as_os_str()]);

    assert_eq!(as_u64(&summary, "models"), 0);
    let body = fs::read_to_string(&out).unwrap_or_else(|err| panic!("snapshot missing: {err}"));
    let snapshot: Value =
        serde_json::from_str(&body).unwrap_or_else(|err| panic!("snapshot is not JSON: {err}"));
    assert_eq!(as_u64(&snapshot["statistics"], "totalFixesAttempted"), 0);
    assert_eq!(snapshot["modelInsights"], serde_json::json!({}));
}

#[test]
fn list_reports_all_backends_unavailable_without_prerequisites() {
    let workspace = Workspace::new();
    let listing = workspace.run_json(["list"]);

    assert_eq!(as_u64(&listing, "available"), 0);
    let names: Vec<&str> = listing["backends"]
        .as_array()
        .unwrap_or_else(|| panic!("backends is not an array: {listing}"))
        .iter()
        .map(|backend| as_str(backend, "name"))
        .collect();
    assert_eq!(names, vec!["claude", "deepseek", "qwen"]);
}

#[test]
fn info_describes_known_backend_and_rejects_unknown() {
    let workspace = Workspace::new();
    let info = workspace.run_json(["info", "claude"]);
    assert_eq!(as_str(&info, "kind"), "cloud");
    assert_eq!(as_str(&info, "provider"), "Anthropic");

    let output = workspace.run(["info", "gpt"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown backend `gpt`"));
}

#[test]
fn fix_with_unknown_backend_fails_before_recording() {
    let workspace = Workspace::new();
    let issue = write_issue(&workspace, ".*4.*");

    let output = workspace.run([
        OsStr::new("fix"),
        OsStr::new("--issue"),
        issue.as_os_str(),
        OsStr::new("--backend"),
        OsStr::new("gpt"),
    ]);
    assert!(!output.status.success());

    let stats = workspace.run_json(["stats"]);
    assert_eq!(as_u64(&stats, "totalFixesAttempted"), 0);
}

#[test]
fn fix_with_claude_and_no_key_is_a_configuration_error() {
    let workspace = Workspace::new();
    let issue = write_issue(&workspace, ".*4.*");

    let output = workspace.run([
        OsStr::new("fix"),
        OsStr::new("--issue"),
        issue.as_os_str(),
        OsStr::new("--backend"),
        OsStr::new("claude"),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("AUTOFIX_TEST_UNSET_API_KEY"));
}

#[test]
fn model_insights_for_unknown_model_are_zeroed() {
    let workspace = Workspace::new();
    let insights = workspace.run_json(["model", "mistral:7b"]);

    assert_eq!(as_str(&insights, "model"), "mistral:7b");
    assert_eq!(as_u64(&insights, "totalTests"), 0);
    assert_eq!(insights["recentHistory"], serde_json::json!([]));
}

#[cfg(unix)]
fn install_fake_ollama(workspace: &Workspace, verification_reply: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = workspace.path("ollama");
    let body = format!(
        r#"#!/bin/sh
case "$1" in
  --version) echo "ollama version 0.3.12" ;;
  list) echo "NAME ID SIZE"; echo "qwen2.5-coder:7b abc123 4.7GB" ;;
  run)
    cat > /dev/null
    if [ "$2" = "qwen2.5-coder:7b" ]; then
      echo '{{"analysis": "stale model weights", "fix_type": "model_reinstall", "fix_commands": ["true"], "confidence": 0.6}}'
    else
      echo '{verification_reply}'
    fi
    ;;
  *) exit 2 ;;
esac
"#
    );
    write(&script, &body);
    let mut permissions = fs::metadata(&script)
        .unwrap_or_else(|err| panic!("failed to stat fake ollama: {err}"))
        .permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&script, permissions)
        .unwrap_or_else(|err| panic!("failed to make fake ollama executable: {err}"));
    script
}

#[cfg(unix)]
#[test]
fn fix_runs_full_attempt_and_exits_zero_when_verified() {
    let workspace = Workspace::new();
    let ollama = install_fake_ollama(&workspace, "The answer is 4.");
    workspace.write_config(&ollama.display().to_string());
    let issue = write_issue(&workspace, ".*4.*");

    let report = workspace.run_json([
        OsStr::new("fix"),
        OsStr::new("--issue"),
        issue.as_os_str(),
        OsStr::new("--backend"),
        OsStr::new("qwen"),
    ]);

    assert_eq!(as_str(&report, "state"), "verified");
    assert_eq!(as_str(&report, "backend"), "qwen");
    assert_eq!(report["outcome"]["verified"], Value::Bool(true));

    let stats = workspace.run_json(["stats"]);
    assert_eq!(as_u64(&stats, "totalFixesAttempted"), 1);
    assert_eq!(as_u64(&stats, "successfulFixes"), 1);

    let insights = workspace.run_json(["model", "llama3:8b"]);
    assert_eq!(as_u64(&insights, "totalTests"), 1);
}

#[cfg(unix)]
#[test]
fn fix_with_mismatched_reply_exits_non_zero_and_still_records() {
    let workspace = Workspace::new();
    let ollama = install_fake_ollama(&workspace, "five");
    workspace.write_config(&ollama.display().to_string());
    let issue = write_issue(&workspace, ".*4.*");

    let output = workspace.run([
        OsStr::new("fix"),
        OsStr::new("--issue"),
        issue.as_os_str(),
        OsStr::new("--backend"),
        OsStr::new("qwen"),
    ]);
    assert!(!output.status.success());

    let report = parse_stdout(&output);
    assert_eq!(as_str(&report, "state"), "verify_failed");
    assert_eq!(as_str(&report["failure"], "kind"), "verification_mismatch");
    assert_eq!(report["outcome"]["fixApplied"], Value::Bool(true));

    let stats = workspace.run_json(["stats"]);
    assert_eq!(as_u64(&stats, "totalFixesAttempted"), 1);
}

#[cfg(unix)]
#[test]
fn fix_without_backend_flag_uses_qwen() {
    let workspace = Workspace::new();
    let ollama = install_fake_ollama(&workspace, "The answer is 4.");
    workspace.write_config(&ollama.display().to_string());
    let issue = write_issue(&workspace, ".*4.*");

    let report = workspace.run_json([OsStr::new("fix"), OsStr::new("--issue"), issue.as_os_str()]);

    assert_eq!(as_str(&report, "backend"), "qwen");
    assert_eq!(as_str(&report, "state"), "verified");
}
