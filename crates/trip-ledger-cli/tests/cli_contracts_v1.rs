#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::{params, Connection};
use serde_json::{json, Value};
use ulid::Ulid;

fn tl_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_tl") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/tl");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "trip-ledger-cli", "--bin", "tl"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build tl binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("trip-ledger-{label}-{}.sqlite3", Ulid::new()))
}

fn tl_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(tl_binary_path());
    command.arg("--db").arg(db_path);
    command.env_remove("TRIP_LEDGER_CONFIG");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run tl command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn ok_json(db_path: &Path, args: &[&str]) -> Value {
    let output = tl_output(db_path, args);
    assert!(
        output.status.success(),
        "command {:?} failed\nstdout={}\nstderr={}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn err_json(db_path: &Path, args: &[&str]) -> Value {
    let output = tl_output(db_path, args);
    assert!(
        !output.status.success(),
        "command {:?} unexpectedly succeeded\nstdout={}",
        args,
        String::from_utf8_lossy(&output.stdout)
    );
    stdout_json(&output)
}

fn create_trip(db_path: &Path, title: &str) -> String {
    let created = ok_json(db_path, &["trip", "create", "--title", title, "--currency", "EUR"]);
    match created["id"].as_str() {
        Some(id) => id.to_string(),
        None => panic!("created trip has no id: {created}"),
    }
}

fn seed_items(db_path: &Path, trip_id: &str) {
    let update = json!({
        "locations": {"added": [
            {"id": "lisbon", "name": "Lisbon"},
            {"id": "porto", "name": "Porto"}
        ]},
        "expenses": {"added": [
            {"id": "train", "amount": 60.0, "currency": "EUR", "category": "Transport"},
            {"id": "dinner", "amount": 30.0, "currency": "EUR", "category": "Food"}
        ]}
    })
    .to_string();
    let patched = ok_json(db_path, &["trip", "patch", "--trip", trip_id, "--update-json", &update]);
    assert_eq!(patched["written"], json!(true));
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(tl_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["trip", "link", "cleanup-log"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }

    let output = match Command::new(tl_binary_path()).args(["link", "--help"]).output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run link help: {err}"),
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["set", "split", "remove", "show"] {
        assert!(stdout.contains(required), "missing link subcommand {required}; output={stdout}");
    }
}

#[test]
fn created_trip_starts_at_current_schema_and_version_one() {
    let db_path = temp_db("create");
    let trip_id = create_trip(&db_path, "Iberia");

    let shown = ok_json(&db_path, &["trip", "show", "--trip", &trip_id]);
    assert_eq!(shown["schemaVersion"], json!(4));
    assert_eq!(shown["documentVersion"], json!(1));
    assert_eq!(shown["title"], json!("Iberia"));

    let listed = ok_json(&db_path, &["trip", "list"]);
    let Some(trips) = listed.as_array() else {
        panic!("trip list is not an array: {listed}");
    };
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0]["id"], json!(trip_id));
}

#[test]
fn single_link_moves_between_items_and_derives_the_reference() {
    let db_path = temp_db("single-link");
    let trip_id = create_trip(&db_path, "Iberia");
    seed_items(&db_path, &trip_id);

    let first = ok_json(
        &db_path,
        &["link", "set", "--trip", &trip_id, "--expense", "train", "--kind", "location", "--item", "lisbon"],
    );
    assert_eq!(first["replaced"], json!(0));
    assert_eq!(first["links"][0]["itemId"], json!("lisbon"));

    let second = ok_json(
        &db_path,
        &["link", "set", "--trip", &trip_id, "--expense", "train", "--kind", "location", "--item", "porto"],
    );
    assert_eq!(second["replaced"], json!(1));
    assert_eq!(second["links"].as_array().map(Vec::len), Some(1));
    assert_eq!(second["travelReference"]["type"], json!("location"));
    assert_eq!(second["travelReference"]["locationId"], json!("porto"));

    let shown = ok_json(&db_path, &["link", "show", "--trip", &trip_id, "--expense", "train"]);
    assert_eq!(shown["links"][0]["itemId"], json!("porto"));

    let validated = ok_json(&db_path, &["trip", "validate", "--trip", &trip_id]);
    assert_eq!(validated["isValid"], json!(true));
}

#[test]
fn cross_trip_link_is_rejected_with_stable_error_shape() {
    let db_path = temp_db("cross-trip");
    let trip_a = create_trip(&db_path, "A");
    let trip_b = create_trip(&db_path, "B");
    seed_items(&db_path, &trip_a);

    let missing_expense = err_json(
        &db_path,
        &["link", "set", "--trip", &trip_b, "--expense", "train", "--kind", "location", "--item", "lisbon"],
    );
    assert_eq!(missing_expense["error"]["kind"], json!("EXPENSE_NOT_FOUND"));
    assert_eq!(missing_expense["error"]["status"], json!(404));
    assert_eq!(missing_expense["error"]["details"][0]["expenseId"], json!("train"));

    let foreign_item = err_json(
        &db_path,
        &["link", "set", "--trip", &trip_a, "--expense", "train", "--kind", "location", "--item", "madrid"],
    );
    assert_eq!(foreign_item["error"]["kind"], json!("CROSS_TRIP_REFERENCE"));
    assert_eq!(foreign_item["error"]["details"][0]["type"], json!("TRAVEL_ITEM_NOT_FOUND"));

    let untouched = ok_json(&db_path, &["trip", "show", "--trip", &trip_a]);
    assert_eq!(untouched["documentVersion"], json!(2));
}

#[test]
fn split_links_enforce_the_amount_and_duplicates() {
    let db_path = temp_db("split");
    let trip_id = create_trip(&db_path, "Iberia");
    seed_items(&db_path, &trip_id);

    let short = json!([
        {"kind": "location", "itemId": "lisbon", "splitMode": "fixed", "splitValue": 20.0},
        {"kind": "location", "itemId": "porto", "splitMode": "fixed", "splitValue": 20.0}
    ])
    .to_string();
    let rejected = err_json(
        &db_path,
        &["link", "split", "--trip", &trip_id, "--expense", "train", "--targets-json", &short],
    );
    assert_eq!(rejected["error"]["kind"], json!("SPLIT_VALIDATION_FAILED"));
    assert_eq!(rejected["error"]["status"], json!(400));

    let duplicate = json!([
        {"kind": "location", "itemId": "lisbon"},
        {"kind": "location", "itemId": "lisbon"}
    ])
    .to_string();
    let rejected = err_json(
        &db_path,
        &["link", "split", "--trip", &trip_id, "--expense", "train", "--targets-json", &duplicate],
    );
    assert_eq!(rejected["error"]["kind"], json!("DUPLICATE_LINK"));
    assert_eq!(rejected["error"]["status"], json!(409));

    let balanced = json!([
        {"kind": "location", "itemId": "lisbon", "splitMode": "percentage", "splitValue": 25.0},
        {"kind": "location", "itemId": "porto", "splitMode": "percentage", "splitValue": 75.0}
    ])
    .to_string();
    let linked = ok_json(
        &db_path,
        &["link", "split", "--trip", &trip_id, "--expense", "train", "--targets-json", &balanced],
    );
    assert_eq!(linked["links"].as_array().map(Vec::len), Some(2));

    let removed = ok_json(&db_path, &["link", "remove", "--trip", &trip_id, "--expense", "train"]);
    assert_eq!(removed["replaced"], json!(2));
    assert_eq!(removed["links"], json!([]));
}

#[test]
fn imported_legacy_document_is_migrated_and_ghost_links_are_logged() {
    let db_path = temp_db("legacy");
    let file = std::env::temp_dir().join(format!("trip-ledger-legacy-{}.json", Ulid::new()));
    let body = json!({
        "id": "legacyTrip",
        "title": "Before accommodations existed",
        "travelData": {"locations": [{
            "id": "loc1",
            "name": "Lisbon",
            "accommodationData": "Casa do Largo",
            "costTrackingLinks": [{"expenseId": "stay"}, {"expenseId": "ghost"}]
        }]},
        "costData": {"expenses": [{"id": "stay", "amount": 200.0, "category": "Accommodation"}]}
    });
    if let Err(err) = std::fs::write(&file, body.to_string()) {
        panic!("failed to write legacy fixture: {err}");
    }
    let Some(file_arg) = file.to_str() else {
        panic!("temp path is not utf-8");
    };

    let imported = ok_json(&db_path, &["trip", "import", "--file", file_arg]);
    assert_eq!(imported["documentVersion"], json!(1));

    let reports = ok_json(&db_path, &["trip", "migrate", "--trip", "legacyTrip"]);
    assert_eq!(reports[0]["fromVersion"], json!(1));
    assert_eq!(reports[0]["toVersion"], json!(4));
    assert_eq!(reports[0]["persisted"], json!(true));

    let shown = ok_json(&db_path, &["trip", "show", "--trip", "legacyTrip"]);
    assert_eq!(shown["schemaVersion"], json!(4));
    assert_eq!(shown["accommodations"][0]["id"], json!("acc-loc1"));

    let log = ok_json(&db_path, &["cleanup-log", "list", "--trip", "legacyTrip"]);
    assert_eq!(log["entries"].as_array().map(Vec::len), Some(1));
    assert_eq!(log["entries"][0]["expenseId"], json!("ghost"));
}

#[test]
fn corrupt_row_surfaces_as_invalid_trip_data() {
    let db_path = temp_db("corrupt");
    let trip_id = create_trip(&db_path, "Soon broken");

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    if let Err(err) = conn.execute(
        "UPDATE trip_documents SET body_json = ?1 WHERE trip_id = ?2",
        params!["{not json", trip_id],
    ) {
        panic!("failed to corrupt row: {err}");
    }

    let failed = err_json(&db_path, &["trip", "show", "--trip", &trip_id]);
    assert_eq!(failed["error"]["kind"], json!("INVALID_TRIP_DATA"));
    assert_eq!(failed["error"]["status"], json!(400));

    let listed = ok_json(&db_path, &["trip", "list"]);
    assert_eq!(listed, json!([]));
}

#[test]
fn unknown_trip_and_bad_ids_use_the_error_taxonomy() {
    let db_path = temp_db("taxonomy");

    let missing = err_json(&db_path, &["trip", "show", "--trip", "nope"]);
    assert_eq!(missing["error"]["kind"], json!("INVALID_TRIP_DATA"));

    let bad_id = err_json(&db_path, &["trip", "show", "--trip", "   "]);
    assert_eq!(bad_id["error"]["kind"], json!("VALIDATION_ERROR"));
    let message = bad_id["error"]["message"].as_str().unwrap_or_default();
    assert!(!message.is_empty());
}
