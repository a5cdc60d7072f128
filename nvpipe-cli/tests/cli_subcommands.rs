use std::process::{Command, Output};

fn nvpipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_nvpipe"))
        .args(args)
        .env("RUST_LOG", "error")
        .output()
        .expect("run nvpipe")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).expect("stdout is one JSON document")
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = nvpipe(&["help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["devices", "inspect", "selftest"] {
        assert!(stdout.contains(sub), "missing {sub} in help output");
    }
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let output = nvpipe(&["selftest", "--no-such-flag"]);
    assert_eq!(output.status.code(), Some(2));
    let output = nvpipe(&["selftest", "--frames", "0"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn loopback_devices_json() {
    let output = nvpipe(&["devices", "--loopback", "--loopback-devices", "2", "--json"]);
    assert!(
        output.status.success(),
        "devices failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "devices");
    assert_eq!(value["ok"], true);
    assert_eq!(value["backend"], "loopback");
    assert_eq!(value["devices"].as_array().map(Vec::len), Some(2));
    assert_eq!(value["devices"][1]["device"], 1);
}

#[test]
fn loopback_inspect_lists_ranked_elements() {
    let output = nvpipe(&["inspect", "--loopback", "--loopback-devices", "2", "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    let elements = value["elements"].as_array().expect("elements array");
    let find = |name: &str| elements.iter().find(|e| e["name"] == name).cloned();

    let dec = find("nvh264dec").expect("nvh264dec registered");
    assert_eq!(dec["rank"], 256);
    assert_eq!(dec["kind"], "decoder");
    let second = find("nvh264device1dec").expect("second device decoder");
    assert_eq!(second["rank"], 255);
    assert!(find("nvh265enc").is_some());
}

#[test]
fn inspect_human_output_names_elements() {
    let output = nvpipe(&["inspect", "--loopback"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("nvh264enc rank=256 device=0 default"));
    assert!(stdout.contains("backend=loopback"));
}

#[test]
fn selftest_round_trips_frames() {
    let output = nvpipe(&["selftest", "--frames", "12", "--gop-size", "5", "--json"]);
    assert!(
        output.status.success(),
        "selftest failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], true);
    let summary = &value["summary"];
    assert_eq!(summary["units"], 12);
    assert_eq!(summary["decoded"], 12);
    assert_eq!(summary["sync_points"], serde_json::json!([0, 5, 10]));
    assert_eq!(summary["mismatches"], serde_json::json!([]));
    assert_eq!(summary["encoder"]["frames_submitted"], 12);
}
