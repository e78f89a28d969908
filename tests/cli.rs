use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::{Value, json};
use tempfile::tempdir;

fn calpipe() -> Command {
    let mut cmd = Command::cargo_bin("calpipe").expect("binary present");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_product(path: &Path, data: Value) {
    let product = json!({"name": "exp", "meta": {"instrument": {"detector": "NRCA1"}}, "data": data});
    fs::write(path, serde_json::to_string_pretty(&product).unwrap()).unwrap();
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn list_steps_names_bundled_steps() {
    let output = calpipe().arg("list-steps").assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();

    assert!(stdout.contains("flat_field"));
    assert!(stdout.contains("detector1 (pipeline"));
}

#[test]
fn show_params_prints_schema_and_references() {
    let output = calpipe()
        .args(["show-params", "flat"])
        .assert()
        .success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();

    assert!(stdout.contains("scale = 1.0"));
    assert!(stdout.contains("override_flat"));
    assert!(stdout.contains("reference flat (required)"));
}

#[test]
fn run_writes_output_and_record() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("exp.json");
    write_product(&input, json!([2.0, 4.0]));
    let output = temp.path().join("out").join("result.json");
    let record = temp.path().join("record.json");

    calpipe()
        .current_dir(temp.path())
        .arg("run")
        .arg("flat_field")
        .arg(&input)
        .args(["--set", "scale=2", "--set", "override_flat=flat_9.fits"])
        .arg("--output")
        .arg(&output)
        .arg("--record")
        .arg(&record)
        .assert()
        .success();

    let result = read_json(&output);
    assert_eq!(result["data"], json!([1.0, 2.0]));
    assert_eq!(result["meta"]["ref_file"]["flat"], json!("flat_9.fits"));
    assert_eq!(result["meta"]["cal_step"]["flat"], json!("COMPLETE"));
    let written = read_json(&record);
    assert_eq!(written["status"], json!("completed"));
    assert_eq!(written["root"]["parameters"]["scale"]["source"]["kind"], json!("override"));
}

#[test]
fn run_uses_a_reference_table() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("exp.json");
    write_product(&input, json!([3.0]));
    let table = temp.path().join("refs.yaml");
    fs::write(
        &table,
        "rules:\n  - reftype: dark\n    match:\n      instrument.detector: NRCA1\n    identifier: dark_a1.fits\n  - reftype: flat\n    identifier: flat_any.fits\n",
    )
    .unwrap();
    let output = temp.path().join("result.json");

    calpipe()
        .arg("run")
        .arg("detector1")
        .arg(&input)
        .arg("--references")
        .arg(&table)
        .args(["--set", "dark_current.dark_level=1"])
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    let result = read_json(&output);
    assert_eq!(result["data"], json!([2.0]));
    assert_eq!(result["meta"]["ref_file"]["dark"], json!("dark_a1.fits"));
    assert_eq!(result["meta"]["ref_file"]["flat"], json!("flat_any.fits"));
}

#[test]
fn unknown_parameter_fails_the_command() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("exp.json");
    write_product(&input, json!([1.0]));

    let assert = calpipe()
        .arg("run")
        .arg("flat_field")
        .arg(&input)
        .args(["--set", "gain=3"])
        .assert()
        .failure();

    assert!(stderr(&assert).contains("unknown parameter 'gain'"));
}

#[test]
fn failed_step_gives_nonzero_exit() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("exp.json");
    write_product(&input, json!([1.0]));
    let record = temp.path().join("record.yaml");

    calpipe()
        .arg("run")
        .arg("flat_field")
        .arg(&input)
        .args(["--set", "scale=0", "--set", "override_flat=f.fits"])
        .arg("--record")
        .arg(&record)
        .assert()
        .failure();

    let written: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(&record).unwrap()).unwrap();
    assert_eq!(written["status"], serde_yaml::Value::from("failed"));
}

#[test]
fn configure_writes_resolved_parameters() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("params.yaml");

    calpipe()
        .args(["configure", "detector1", "--set", "flat_field.scale=4", "--output"])
        .arg(&output)
        .assert()
        .success();

    let written: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(written["class"], serde_yaml::Value::from("detector1"));
    assert_eq!(
        written["steps"]["flat_field"]["scale"],
        serde_yaml::Value::from(4.0)
    );
}

#[test]
fn validate_reports_broken_definitions() {
    let temp = tempdir().unwrap();
    let good = temp.path().join("good.yaml");
    let bad = temp.path().join("bad.yaml");
    fs::write(&good, "class: pipeline\nsteps:\n  - class: dark_current\n").unwrap();
    fs::write(&bad, "class: pipeline\nsteps:\n  - class: nosuchstep\n").unwrap();

    calpipe().arg("validate").arg(&good).assert().success();
    let assert = calpipe().arg("validate").arg(&bad).assert().failure();
    assert!(stderr(&assert).contains("nosuchstep"));
}

#[test]
fn metrics_are_exported_on_request() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("exp.json");
    write_product(&input, json!([1.0]));
    let metrics = temp.path().join("metrics.json");
    let prometheus = temp.path().join("metrics.prom");

    calpipe()
        .arg("run")
        .arg("annotate")
        .arg(&input)
        .arg("--metrics-json")
        .arg(&metrics)
        .arg("--metrics-prometheus")
        .arg(&prometheus)
        .assert()
        .success();

    let snapshot = read_json(&metrics);
    assert_eq!(snapshot["steps"]["annotate"]["calls"], json!(1));
    assert!(
        fs::read_to_string(&prometheus)
            .unwrap()
            .contains("calpipe_")
    );
}

fn stderr(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).to_string()
}
