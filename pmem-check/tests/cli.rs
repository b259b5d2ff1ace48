use assert_cmd::Command;

fn pmem_check() -> Command {
    Command::cargo_bin("pmem-check").expect("binary is built")
}

#[test]
fn reference_workload_passes() {
    let dir = tempfile::tempdir().unwrap();
    pmem_check().arg(dir.path().join("pool")).assert().success();
}

#[test]
fn small_workload_passes() {
    let dir = tempfile::tempdir().unwrap();
    pmem_check()
        .arg(dir.path().join("pool"))
        .args(["--threads", "4", "--ops", "25", "--layout", "small"])
        .assert()
        .success();
}

#[test]
fn existing_pool_is_not_reused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool");

    pmem_check().arg(&path).assert().success();
    pmem_check().arg(&path).assert().failure().code(1);
}

#[test]
fn missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    pmem_check()
        .arg(dir.path().join("missing").join("pool"))
        .assert()
        .failure()
        .code(1);
}

#[test]
fn undersized_pool_fails() {
    let dir = tempfile::tempdir().unwrap();
    pmem_check()
        .arg(dir.path().join("pool"))
        .args(["--pool-size", "4096"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn failed_create_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool");

    pmem_check()
        .arg(&path)
        .args(["--pool-size", &u64::MAX.to_string()])
        .assert()
        .failure()
        .code(1);
    assert!(!path.exists());

    pmem_check().arg(&path).assert().success();
}

#[test]
fn usage_errors() {
    pmem_check().assert().failure().code(2);

    let dir = tempfile::tempdir().unwrap();
    pmem_check()
        .arg(dir.path().join("pool"))
        .args(["--threads", "0"])
        .assert()
        .failure()
        .code(2);
}
