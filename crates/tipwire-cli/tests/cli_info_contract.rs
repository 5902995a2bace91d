use std::process::Command;

fn tipwire() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tipwire"));
    cmd.env_remove("TIPWIRE_CONFIG").env_remove("TIPWIRE_ENV_FILE");
    cmd
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.output().expect("run tipwire");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("parse json")
}

#[test]
fn tipwire_version_contract() {
    let v = json_stdout(tipwire().args(["version"]));
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["name"].as_str(), Some("tipwire"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());

    let out = tipwire().args(["version", "--output", "text"]).output().unwrap();
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("tipwire "));
}

#[test]
fn tipwire_today_prints_utc_date() {
    let v = json_stdout(tipwire().args(["today"]));
    let today = v["today"].as_str().unwrap();
    assert_eq!(today.len(), 10);
    assert_eq!(today.as_bytes()[4], b'-');
    assert!(v["utc_datetime"].as_str().unwrap().starts_with(today));
}

#[test]
fn tipwire_doctor_with_render_disabled_skips_node_checks() {
    let v = json_stdout(
        tipwire()
            .args(["doctor", "--timeout-ms", "1"])
            .env("TIPWIRE_RENDER_DISABLE", "1"),
    );
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("doctor"));
    assert_eq!(v["configured"]["render_disabled"].as_bool(), Some(true));
    assert!(v.get("elapsed_ms").is_some());
    let checks = v["checks"].as_array().expect("checks array");
    for name in ["node", "playwright_package", "config"] {
        let c = checks
            .iter()
            .find(|c| c["name"].as_str() == Some(name))
            .unwrap_or_else(|| panic!("{name} check"));
        assert_eq!(c["skipped"].as_bool(), Some(true), "{name}");
        assert_eq!(c["ok"].as_bool(), Some(true), "{name}");
    }
    assert_eq!(v["ok"].as_bool(), Some(true));
}

#[test]
fn tipwire_doctor_reports_a_broken_config() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("tipwire.json");
    std::fs::write(&path, r#"{"sources": []}"#).unwrap();

    let v = json_stdout(
        tipwire()
            .arg("doctor")
            .arg("--config")
            .arg(&path)
            .env("TIPWIRE_RENDER_DISABLE", "1"),
    );
    assert_eq!(v["ok"].as_bool(), Some(false));
    let config = v["checks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"].as_str() == Some("config"))
        .unwrap();
    assert_eq!(config["ok"].as_bool(), Some(false));
    assert!(config["error"].as_str().unwrap().contains("no sources"));
}

#[test]
fn env_file_supplies_unset_variables() {
    let tmp = tempfile::tempdir().unwrap();
    let env_file = tmp.path().join("tipwire.env");
    std::fs::write(&env_file, "# local overrides\nTIPWIRE_RENDER_DISABLE=1\n").unwrap();

    let v = json_stdout(
        tipwire()
            .args(["doctor", "--timeout-ms", "1"])
            .env_remove("TIPWIRE_RENDER_DISABLE")
            .env("TIPWIRE_ENV_FILE", &env_file),
    );
    assert_eq!(v["configured"]["render_disabled"].as_bool(), Some(true));
}
