use assert_cmd::Command;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn temp_workspace() -> TempDir {
    let workspace = tempfile::tempdir().expect("create tempdir");
    write_fixtures(workspace.path());
    workspace
}

fn write_fixtures(dir: &Path) {
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<unk>": 0, "<s>": 1, "</s>": 2, "<pad>": 3,
                "hello": 4, "world": 5, "how": 6, "are": 7, "you": 8,
                "fine": 9, "thanks": 10, "bye": 11
            },
            "unk_token": "<unk>"
        }
    });
    fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).expect("write tokenizer");

    let template = json!({
        "user_format": "{content}",
        "assistant_format": "{content}",
    });
    fs::write(dir.join("template.json"), template.to_string()).expect("write template");

    let records = [
        json!({
            "prompt": [{"role": "user", "content": "hello world"}],
            "response": [{"role": "assistant", "content": "fine thanks"}],
        }),
        json!({
            "prompt": [
                {"role": "user", "content": "bye"},
                {"role": "assistant", "content": "bye"},
            ],
            "response": [{"role": "assistant", "content": "bye"}],
        }),
        json!({
            "prompt": [{"role": "user", "content": "how are you"}],
            "response": [{"role": "assistant", "content": "fine"}],
        }),
    ];
    let lines = records
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(dir.join("records.jsonl"), lines).expect("write records");
}

fn sftpack(workspace: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sftpack").expect("binary exists");
    cmd.current_dir(workspace.path());
    cmd
}

fn read_rows(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .expect("read output")
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid JSON line"))
        .collect()
}

fn as_numbers(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .expect("array")
        .iter()
        .map(|v| v.as_i64().expect("integer"))
        .collect()
}

#[test]
fn encode_masks_prompts_and_drops_malformed_records() {
    let workspace = temp_workspace();
    sftpack(&workspace)
        .args([
            "--quiet",
            "encode",
            "records.jsonl",
            "-m",
            "tokenizer.json",
            "--template",
            "template.json",
            "--cutoff-len",
            "16",
            "--no-progress",
            "-o",
            "encoded.jsonl",
        ])
        .assert()
        .success();

    let rows = read_rows(&workspace.path().join("encoded.jsonl"));
    assert_eq!(rows.len(), 2, "malformed record is dropped");
    assert_eq!(as_numbers(&rows[0]["input_ids"]), vec![1, 4, 5, 9, 10, 2]);
    assert_eq!(
        as_numbers(&rows[0]["labels"]),
        vec![-100, -100, -100, 9, 10, 2]
    );
    assert_eq!(as_numbers(&rows[0]["attention_mask"]), vec![1; 6]);
    assert_eq!(as_numbers(&rows[1]["input_ids"]), vec![1, 6, 7, 8, 9, 2]);
}

#[test]
fn pack_emits_fixed_length_blocks_and_summary() {
    let workspace = temp_workspace();
    let stdout = sftpack(&workspace)
        .args([
            "--quiet",
            "pack",
            "records.jsonl",
            "-m",
            "tokenizer.json",
            "--pad-token",
            "<pad>",
            "--template",
            "template.json",
            "--cutoff-len",
            "8",
            "--neat",
            "--no-progress",
            "--json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let summary: Value = serde_json::from_slice(&stdout).expect("summary is valid JSON");
    assert_eq!(summary["blocks"], 2);
    assert_eq!(summary["cutoff_len"], 8);
    assert_eq!(summary["stats"]["malformed"], 1);

    let blocks = read_rows(&workspace.path().join("packed.jsonl"));
    assert_eq!(blocks.len(), 2);
    assert_eq!(
        as_numbers(&blocks[0]["input_ids"]),
        vec![1, 4, 5, 9, 10, 2, 3, 3]
    );
    assert_eq!(
        as_numbers(&blocks[0]["group_ids"]),
        vec![1, 1, 1, 1, 1, 1, 2, 2]
    );
    for block in &blocks {
        assert_eq!(as_numbers(&block["labels"]).len(), 8);
    }
}

#[test]
fn inspect_decodes_packed_groups() {
    let workspace = temp_workspace();
    sftpack(&workspace)
        .args([
            "--quiet",
            "pack",
            "records.jsonl",
            "-m",
            "tokenizer.json",
            "--template",
            "template.json",
            "--cutoff-len",
            "8",
            "--neat",
            "--no-progress",
            "-o",
            "packed.jsonl",
        ])
        .assert()
        .success();

    let stdout = sftpack(&workspace)
        .args(["inspect", "packed.jsonl", "-m", "tokenizer.json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(stdout).expect("utf8 output");
    assert!(text.contains("packed block (8 tokens)"));
    assert!(text.contains("[group 1]"));
    assert!(text.contains("hello world fine thanks"));
}

#[test]
fn empty_result_fails_with_stage_message() {
    let workspace = temp_workspace();
    let malformed = json!({
        "prompt": [],
        "response": [{"role": "assistant", "content": "bye"}],
    });
    fs::write(workspace.path().join("bad.jsonl"), malformed.to_string()).expect("write");

    let output = sftpack(&workspace)
        .args([
            "--quiet",
            "encode",
            "bad.jsonl",
            "-m",
            "tokenizer.json",
            "--no-progress",
        ])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8 stderr");
    assert!(stderr.contains("cannot find valid samples"));
}

#[test]
fn fractional_epochs_are_rejected() {
    let workspace = temp_workspace();
    sftpack(&workspace)
        .args([
            "--quiet",
            "encode",
            "records.jsonl",
            "-m",
            "tokenizer.json",
            "--num-epochs",
            "1.5",
            "--no-progress",
        ])
        .assert()
        .failure();
}
