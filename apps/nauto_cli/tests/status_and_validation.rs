use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use tempfile::tempdir;

const INVENTORY_YAML: &str = r#"
devices:
  - name: r1
    transport:
      address: 10.0.0.1
      username: admin
      connection_type: netconf_ssh
      port: 830
    credential:
      name: r1
"#;

fn write_inventory(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("inventory.yaml");
    fs::write(&path, INVENTORY_YAML).expect("write inventory");
    path
}

#[test]
fn status_lists_registered_devices_as_closed() {
    let temp = tempdir().expect("temp dir");
    let inventory = write_inventory(&temp);

    Command::cargo_bin("nauto_cli")
        .expect("binary")
        .env("NAUTO_KEYRING_FILE", temp.path().join("creds.json"))
        .env("NAUTO_ENCRYPTION_KEY", "test-passphrase-not-a-real-secret")
        .arg("--inventory")
        .arg(&inventory)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("r1"))
        .stdout(contains("CLOSED"));
}

#[test]
fn missing_inventory_file_fails_with_context() {
    let temp = tempdir().expect("temp dir");
    let missing = temp.path().join("does-not-exist.yaml");

    Command::cargo_bin("nauto_cli")
        .expect("binary")
        .env("NAUTO_KEYRING_FILE", temp.path().join("creds.json"))
        .arg("--inventory")
        .arg(&missing)
        .arg("status")
        .assert()
        .failure()
        .stderr(contains("loading inventory"));
}

#[test]
fn commit_against_unmatched_device_pattern_fails() {
    let temp = tempdir().expect("temp dir");
    let inventory = write_inventory(&temp);

    Command::cargo_bin("nauto_cli")
        .expect("binary")
        .env("NAUTO_KEYRING_FILE", temp.path().join("creds.json"))
        .env("NAUTO_ENCRYPTION_KEY", "test-passphrase-not-a-real-secret")
        .arg("--inventory")
        .arg(&inventory)
        .args(["commit", "--device", "no-such-device*"])
        .assert()
        .failure()
        .stderr(contains("no device matched pattern"));
}

#[test]
fn commit_rejects_unknown_push_level() {
    let temp = tempdir().expect("temp dir");
    let inventory = write_inventory(&temp);

    Command::cargo_bin("nauto_cli")
        .expect("binary")
        .env("NAUTO_KEYRING_FILE", temp.path().join("creds.json"))
        .env("NAUTO_ENCRYPTION_KEY", "test-passphrase-not-a-real-secret")
        .arg("--inventory")
        .arg(&inventory)
        .args(["commit", "--device", "r1", "--push", "bogus"])
        .assert()
        .failure()
        .stderr(contains("unknown push level"));
}

#[test]
fn commit_against_unconnected_device_fails_not_open() {
    let temp = tempdir().expect("temp dir");
    let inventory = write_inventory(&temp);

    Command::cargo_bin("nauto_cli")
        .expect("binary")
        .env("NAUTO_KEYRING_FILE", temp.path().join("creds.json"))
        .env("NAUTO_ENCRYPTION_KEY", "test-passphrase-not-a-real-secret")
        .arg("--inventory")
        .arg(&inventory)
        .args(["commit", "--device", "r1"])
        .assert()
        .failure()
        .stderr(contains("is not open"));
}

#[test]
fn apply_template_rejects_malformed_var() {
    let temp = tempdir().expect("temp dir");
    let inventory = write_inventory(&temp);

    Command::cargo_bin("nauto_cli")
        .expect("binary")
        .env("NAUTO_KEYRING_FILE", temp.path().join("creds.json"))
        .env("NAUTO_ENCRYPTION_KEY", "test-passphrase-not-a-real-secret")
        .arg("--inventory")
        .arg(&inventory)
        .args(["apply-template", "--device", "r1", "--template", "t1", "--var", "no-equals-sign"])
        .assert()
        .failure()
        .stderr(contains("--var must be key=value"));
}
