//! Integration tests for basic CLI behavior.
//!
//! Covers the standard flags, `presets` and the offline `transcode`
//! command. `serve` is exercised through the library in
//! `gateway_routing.rs` since it never returns.

#![allow(deprecated)] // cargo_bin deprecation, replacement not yet stable

use assert_cmd::Command;
use predicates::prelude::*;

/// Helper: get a Command for the `retrogate` binary with an empty config dir.
fn retrogate(config_home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("retrogate").expect("binary 'retrogate' should be built");
    cmd.env("XDG_CONFIG_HOME", config_home).env_remove("RUST_LOG");
    cmd
}

// ─── Top-level flags ─────────────────────────────────────────────────────────

#[test]
fn help_flag_lists_subcommands() {
    let home = tempfile::tempdir().unwrap();
    retrogate(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: retrogate"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("transcode"))
        .stdout(predicate::str::contains("presets"));
}

#[test]
fn version_flag_shows_semver() {
    let home = tempfile::tempdir().unwrap();
    retrogate(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^retrogate \d+\.\d+\.\d+\n$").unwrap());
}

#[test]
fn serve_help_documents_overrides() {
    let home = tempfile::tempdir().unwrap();
    retrogate(home.path())
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--preset"))
        .stdout(predicate::str::contains("--output"));
}

// ─── presets ─────────────────────────────────────────────────────────────────

#[test]
fn presets_lists_builtins() {
    let home = tempfile::tempdir().unwrap();
    retrogate(home.path())
        .arg("presets")
        .assert()
        .success()
        .stdout(predicate::str::contains("macweb2"))
        .stdout(predicate::str::contains("wii_internet_channel"));
}

// ─── transcode ───────────────────────────────────────────────────────────────

#[test]
fn transcode_reads_stdin() {
    let home = tempfile::tempdir().unwrap();
    retrogate(home.path())
        .args(["transcode", "-"])
        .write_stdin(r#"<p class="x">Caf&eacute; <a href="https://example.com/">link</a><script>x()</script></p>"#)
        .assert()
        .success()
        .stdout(predicate::str::contains("Cafe"))
        .stdout(predicate::str::contains(r#"href="http://example.com/""#))
        .stdout(predicate::str::contains("script").not())
        .stdout(predicate::str::contains("class").not());
}

#[test]
fn transcode_reads_a_file() {
    let home = tempfile::tempdir().unwrap();
    let input = home.path().join("page.html");
    std::fs::write(&input, "<html><body><br/><p>\u{201c}hi\u{201d}</p></body></html>").unwrap();
    retrogate(home.path())
        .arg("transcode")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("<br>"))
        .stdout(predicate::str::contains("<br/>").not())
        .stdout(predicate::str::contains("''hi''"));
}

#[test]
fn transcode_missing_file_fails() {
    let home = tempfile::tempdir().unwrap();
    retrogate(home.path())
        .args(["transcode", "/nonexistent/page.html"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading /nonexistent/page.html"));
}

#[test]
fn unknown_preset_is_fatal() {
    let home = tempfile::tempdir().unwrap();
    retrogate(home.path())
        .args(["transcode", "--preset", "netscape9000", "-"])
        .write_stdin("<p>x</p>")
        .assert()
        .failure()
        .stderr(predicate::str::contains("netscape9000"));
}
