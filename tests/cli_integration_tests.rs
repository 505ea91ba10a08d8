use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn template(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_help_and_version() {
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("fmt"))
        .stdout(predicate::str::contains("tokens"));

    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_check_clean_file() {
    let dir = TempDir::new().unwrap();
    let path = template(&dir, "clean.j2", "{% if x %}{{ x | upper }}{% endif %}\n");
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("check")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_check_reports_spacing() {
    let dir = TempDir::new().unwrap();
    let path = template(&dir, "tight.j2", "{{x}}\n");
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("check")
        .arg(&path)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("jinja[spacing]"))
        .stdout(predicate::str::contains("{{ x }}"));
}

#[test]
fn test_check_json_output() {
    let dir = TempDir::new().unwrap();
    let tight = template(&dir, "tight.j2", "{{foo(1)}}");
    let broken = template(&dir, "broken.j2", "{{ & }}");
    let assert = Command::cargo_bin("rustle-jinja")
        .unwrap()
        .args(["check", "--output", "json"])
        .arg(&tight)
        .arg(&broken)
        .assert()
        .code(2);

    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: Value = serde_json::from_str(&output).unwrap();
    let findings = json.as_array().unwrap();
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0]["tag"], "spacing");
    assert_eq!(findings[0]["reformatted"], "{{ foo(1) }}");
    assert_eq!(findings[1]["tag"], "invalid");
    assert!(findings[1].get("reformatted").is_none());
}

#[test]
fn test_check_reads_stdin() {
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .args(["check", "-"])
        .write_stdin("{{ a+b }}")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("-: jinja[spacing]"));
}

#[test]
fn test_fmt_prints_template() {
    let dir = TempDir::new().unwrap();
    let source = "{%- for x in items -%}\n  {{ x }}{# note #}\n{%- endfor %}\n";
    let path = template(&dir, "loop.j2", source);
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("fmt")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::diff(source));
}

#[test]
fn test_fmt_check_and_write() {
    let dir = TempDir::new().unwrap();
    let path = template(&dir, "crlf.j2", "{% if x %}\r\n{{ x }}\r\n{% endif %}\r\n");

    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .args(["fmt", "--check"])
        .arg(&path)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("would reformat"));

    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .args(["fmt", "--write"])
        .arg(&path)
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "{% if x %}\n{{ x }}\n{% endif %}\n"
    );

    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .args(["fmt", "--check"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn test_fmt_verify_with_vars() {
    let dir = TempDir::new().unwrap();
    let path = template(&dir, "greet.j2", "Hello {{ name | upper }}!");
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .args(["fmt", "--verify", "-e", "name=\"world\""])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::diff("Hello {{ name | upper }}!"));
}

#[test]
fn test_fmt_syntax_error_fails() {
    let dir = TempDir::new().unwrap();
    let path = template(&dir, "bad.j2", "{% if x %}never closed");
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("fmt")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("endif"));
}

#[test]
fn test_tokens_json() {
    let dir = TempDir::new().unwrap();
    let path = template(&dir, "one.j2", "{{ x }}");
    let assert = Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("tokens")
        .arg(&path)
        .assert()
        .success();

    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: Value = serde_json::from_str(&output).unwrap();
    let tokens = json.as_array().unwrap();
    assert_eq!(tokens[0]["kind"], "initial");
    assert_eq!(tokens[1]["kind"], "variable_begin");
    assert_eq!(tokens[1]["pair"], 5);
    assert_eq!(tokens.last().unwrap()["kind"], "eof");
}

#[test]
fn test_custom_delimiters_from_config() {
    let dir = TempDir::new().unwrap();
    let config = template(
        &dir,
        "env.yml",
        "variable_start_string: '<<'\nvariable_end_string: '>>'\n",
    );
    let path = template(&dir, "custom.j2", "<< x >> {{ y }}");
    Command::cargo_bin("rustle-jinja")
        .unwrap()
        .arg("fmt")
        .arg(&path)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::diff("<< x >> {{ y }}"));
}
