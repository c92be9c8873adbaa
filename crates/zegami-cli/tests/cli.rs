// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use assert_cmd::Command;
use predicates::prelude::*;

fn zegami() -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("zegami")?;
    for var in ["ZEGAMI_HOME", "ZEGAMI_USERNAME", "ZEGAMI_PASSWORD", "ZEGAMI_TOKEN"] {
        cmd.env_remove(var);
    }
    Ok(cmd)
}

#[test]
fn test_version() -> Result<(), Box<dyn std::error::Error>> {
    zegami()?
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    Ok(())
}

#[test]
fn test_help_lists_commands() -> Result<(), Box<dyn std::error::Error>> {
    let output = zegami()?.arg("--help").output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    for command in ["login", "collections", "upload-images", "replace-data", "annotations"] {
        assert!(stdout.contains(command), "missing {} in {}", command, stdout);
    }
    Ok(())
}

#[test]
fn test_urls_requires_rows() -> Result<(), Box<dyn std::error::Error>> {
    zegami()?
        .args(["urls", "Research", "Dogs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("<ROWS>"));
    Ok(())
}

#[test]
fn test_rows_rejects_non_numeric_index() -> Result<(), Box<dyn std::error::Error>> {
    zegami()?
        .args(["download", "Research", "Dogs", "first"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
    Ok(())
}

#[test]
fn test_invalid_home_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let home = tempfile::tempdir()?;
    zegami()?
        .env("HOME", home.path())
        .args(["--home", "not a url", "token"])
        .assert()
        .failure();
    Ok(())
}
