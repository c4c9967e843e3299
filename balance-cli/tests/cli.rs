use std::process::Command;

fn temp_path(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "balance-cli-{label}-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ))
}

#[test]
fn cli_list_modes_writes_output() {
    let exe = env!("CARGO_BIN_EXE_balance-cli");
    let output_path = temp_path("list");
    let status = Command::new(exe)
        .args(["--list-modes", "--output"])
        .arg(&output_path)
        .status()
        .expect("run cli");
    assert!(status.success());
    let content = std::fs::read_to_string(output_path).expect("read output");
    assert!(content.contains("Available modes"));
    assert!(content.contains("enhancement_cost"));
}

#[test]
fn cli_runs_every_sample_without_input() {
    let exe = env!("CARGO_BIN_EXE_balance-cli");
    for mode in ["ttk_ehp", "economy_flow", "enhancement_cost", "clear_probability"] {
        let output = Command::new(exe)
            .args(["--mode", mode, "--report", "markdown"])
            .output()
            .expect("run cli");
        assert!(output.status.success(), "{mode} sample failed");
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains(&format!("# Balance Report: {mode}")));
    }
}

#[test]
fn cli_json_report_for_input_document() {
    let exe = env!("CARGO_BIN_EXE_balance-cli");
    let input_path = temp_path("ttk-input");
    std::fs::write(
        &input_path,
        r#"{"mode":"ttk_ehp","parameters":{"profiles":[{"dps":500,"target_ttk_seconds":60}]}}"#,
    )
    .expect("write input");
    let output = Command::new(exe)
        .args(["--report", "json", "--input"])
        .arg(&input_path)
        .output()
        .expect("run cli");
    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("json report on stdout");
    assert_eq!(value["mode"], "ttk_ehp");
    assert_eq!(value["report"]["profiles"][0]["hp"], 30_000.0);
}

#[test]
fn cli_rejects_invalid_configuration() {
    let exe = env!("CARGO_BIN_EXE_balance-cli");
    let input_path = temp_path("bad-economy");
    std::fs::write(
        &input_path,
        r#"{"mode":"economy_flow","parameters":{"horizon":0}}"#,
    )
    .expect("write input");
    let output = Command::new(exe)
        .arg("--input")
        .arg(&input_path)
        .output()
        .expect("run cli");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("horizon"));
}

#[test]
fn cli_reports_truncation_with_warning_exit() {
    let exe = env!("CARGO_BIN_EXE_balance-cli");
    let input_path = temp_path("truncated");
    std::fs::write(
        &input_path,
        r#"{"mode":"enhancement_cost","parameters":{
            "strategy":"monte_carlo","trials":100,"max_attempts_per_trial":5,
            "levels":[{"success_probability":0.001,"cost_per_attempt":1}]}}"#,
    )
    .expect("write input");
    let output = Command::new(exe)
        .args(["--report", "json", "--input"])
        .arg(&input_path)
        .output()
        .expect("run cli");
    assert_eq!(output.status.code(), Some(3));
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("partial report on stdout");
    assert_eq!(value["report"]["truncated"], true);
}

#[test]
fn cli_requires_mode_without_input() {
    let exe = env!("CARGO_BIN_EXE_balance-cli");
    let output = Command::new(exe).output().expect("run cli");
    assert_eq!(output.status.code(), Some(2));
}
