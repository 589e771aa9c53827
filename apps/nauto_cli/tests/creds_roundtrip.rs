use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn isolated_cmd(temp: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("nauto_cli").expect("binary");
    cmd.env("NAUTO_KEYRING_FILE", temp.path().join("creds.json"))
        .env("NAUTO_ENCRYPTION_KEY", "test-passphrase-not-a-real-secret");
    cmd
}

#[test]
fn creds_store_then_resolve_round_trips_through_fallback_file() {
    let temp = tempdir().expect("temp dir");

    isolated_cmd(&temp)
        .args(["creds", "store", "--name", "r1", "--username", "admin", "--password", "swordfish"])
        .assert()
        .success()
        .stdout(contains("Stored credential r1"));

    isolated_cmd(&temp)
        .args(["creds", "resolve", "--name", "r1"])
        .assert()
        .success()
        .stdout(contains("admin"));
}

#[test]
fn creds_resolve_of_unknown_name_fails() {
    let temp = tempdir().expect("temp dir");

    isolated_cmd(&temp)
        .args(["creds", "resolve", "--name", "does-not-exist"])
        .assert()
        .failure();
}

#[test]
fn creds_store_without_password_source_fails_on_non_tty_stdin() {
    let temp = tempdir().expect("temp dir");

    isolated_cmd(&temp)
        .args(["creds", "store", "--name", "r1", "--username", "admin"])
        .assert()
        .failure()
        .stderr(contains("stdin is not a TTY"));
}
