use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn config_hash_is_printed_with_canonical_json() {
    let mut base = tempfile::NamedTempFile::new().unwrap();
    writeln!(base, "bridge:\n  poll_interval_ms: 1000\n  device_port: 502").unwrap();
    let mut site = tempfile::NamedTempFile::new().unwrap();
    writeln!(site, "bridge:\n  device_port: 1502").unwrap();

    Command::cargo_bin("otb")
        .unwrap()
        .arg("config-hash")
        .arg(base.path())
        .arg(site.path())
        .assert()
        .success()
        .stdout(predicate::str::is_match("config_hash=[0-9a-f]{64}").unwrap())
        .stdout(predicate::str::contains(
            r#"{"bridge":{"device_port":1502,"poll_interval_ms":1000}}"#,
        ));
}

#[test]
fn config_hash_refuses_secret_literals() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "auth:\n  key_env: \"sk-live-0123456789\"").unwrap();

    Command::cargo_bin("otb")
        .unwrap()
        .arg("config-hash")
        .arg(f.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"));
}
