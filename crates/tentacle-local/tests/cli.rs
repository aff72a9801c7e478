use anyhow::{Context, Result};
use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

fn tentacle_local(dir: &TempDir) -> Result<Command> {
    let mut cmd = Command::cargo_bin("tentacle-local").context("binary not built")?;
    cmd.env("XDG_CONFIG_HOME", dir.path()).env("RUST_LOG", "off");
    Ok(cmd)
}

#[test]
fn run_prints_output_and_exits_with_the_script_code() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = dir.path().join("state.json");

    let output = tentacle_local(&dir)?
        .args(["run", "echo hello; exit 5", "--state"])
        .arg(&state)
        .output()?;

    assert_eq!(output.status.code(), Some(5));
    assert_eq!(String::from_utf8(output.stdout)?, "hello\n");

    let context: serde_json::Value = serde_json::from_str(&fs::read_to_string(&state)?)?;
    assert_eq!(context["next_log_sequence"], 1);
    assert_eq!(context["script_service_version"], "v2");
    Ok(())
}

#[test]
fn trailing_arguments_reach_the_script() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = tentacle_local(&dir)?
        .args(["run", "echo \"$1 $2\"", "--", "left", "right"])
        .output()?;

    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout)?, "left right\n");
    Ok(())
}

#[test]
fn output_is_persisted_when_a_log_is_given() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("out.jsonl");
    tentacle_local(&dir)?
        .args(["run", "echo one; echo two >&2", "--log"])
        .arg(&log)
        .assert()
        .success();

    let lines: Vec<serde_json::Value> = fs::read_to_string(&log)?
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().all(|l| l["occurred_at_ms"].is_u64()));
    Ok(())
}

#[test]
fn capabilities_reports_the_negotiated_service() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for (agent, expected) in [
        ("legacy", "IScriptService"),
        ("v2", "IScriptServiceV2"),
        ("kubernetes", "IKubernetesScriptServiceV1"),
    ] {
        let output = tentacle_local(&dir)?
            .args(["--agent", agent, "capabilities"])
            .output()?;
        assert!(output.status.success());
        let stdout = String::from_utf8(output.stdout)?;
        assert_eq!(stdout.lines().next(), Some(expected), "agent {agent}");
    }
    Ok(())
}

#[test]
fn agent_capabilities_come_from_the_config_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("client.toml");
    fs::write(&config, "[agent]\ncapabilities = [\"IScriptService\"]\n")?;

    let output = tentacle_local(&dir)?
        .args(["--config"])
        .arg(&config)
        .arg("capabilities")
        .output()?;
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8(output.stdout)?.lines().next(),
        Some("IScriptService")
    );

    let output = tentacle_local(&dir)?
        .args(["--config"])
        .arg(&config)
        .args(["--agent", "kubernetes", "capabilities"])
        .output()?;
    assert_eq!(
        String::from_utf8(output.stdout)?.lines().next(),
        Some("IKubernetesScriptServiceV1")
    );
    Ok(())
}

#[test]
fn unreadable_config_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("client.toml");
    fs::write(&config, "client = 3")?;

    tentacle_local(&dir)?
        .args(["--config"])
        .arg(&config)
        .args(["run", "true"])
        .assert()
        .failure();
    Ok(())
}
