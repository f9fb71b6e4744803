use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

const STORE_ENV_VARS: &[&str] = &[
    "METRICS_LEDGER_WORKBOOK",
    "METRICS_LEDGER_SPREADSHEET_ID",
    "GOOGLE_ACCESS_TOKEN",
    "METRICS_LEDGER_DAILY_TAB",
    "METRICS_LEDGER_PLAN_TAB",
    "METRICS_LEDGER_UNITS_TAB",
];

fn unique_workbook_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.json", Ulid::new()))
}

fn run_ml<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(env!("CARGO_BIN_EXE_ml"));
    for name in STORE_ENV_VARS {
        command.env_remove(name);
    }
    command
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ml binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ml(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ml command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn init_workbook(path: &Path) -> Value {
    run_json(["--workbook", path_str(path), "workbook", "init"])
}

/// Append rows to a tab by editing the workbook file directly, as an operator would
/// edit the spreadsheet by hand.
fn append_rows(path: &Path, tab: &str, rows: &[&[&str]]) {
    let mut workbook = read_json_file(path);
    let tab_rows = workbook
        .get_mut("tabs")
        .and_then(|tabs| tabs.get_mut(tab))
        .and_then(|tab| tab.get_mut("rows"))
        .and_then(Value::as_array_mut)
        .unwrap_or_else(|| panic!("workbook has no tab {tab}"));
    for row in rows {
        tab_rows.push(Value::from(row.iter().map(|cell| Value::from(*cell)).collect::<Vec<_>>()));
    }
    let body = serde_json::to_string_pretty(&workbook)
        .unwrap_or_else(|err| panic!("failed to serialize workbook: {err}"));
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write workbook: {err}"));
}

// Test IDs: TCLI-001
#[test]
fn cli_outputs_validate_against_versioned_schemas() {
    let workbook = unique_workbook_path("metrics-ledger-contract");
    let wb = path_str(&workbook);

    let initialised = init_workbook(&workbook);
    validate_schema("workbook-init.response.schema.json", &initialised);

    let created = run_json([
        "--workbook",
        wb,
        "records",
        "create",
        "--table",
        "daily",
        "--payload",
        r#"{"date":"2024-03-05","unidade":"U1","leadsRecebidos":"12","vendas":3}"#,
    ]);
    validate_schema("records-write.response.schema.json", &created);
    assert_eq!(as_u64(&created, "row"), 2);

    let listed = run_json(["--workbook", wb, "records", "list", "--table", "daily"]);
    validate_schema("records-list.response.schema.json", &listed);
    assert_eq!(as_u64(&listed, "count"), 1);

    let totals = run_json(["--workbook", wb, "records", "totals", "--table", "daily"]);
    validate_schema("records-totals.response.schema.json", &totals);
    assert_eq!(totals.pointer("/totals/leadsReceived").and_then(Value::as_u64), Some(12));

    let updated = run_json([
        "--workbook",
        wb,
        "records",
        "update",
        "--table",
        "daily",
        "--payload",
        r#"{"rowIndex":2,"date":"05/03/2024","unitId":"U1","sales":4}"#,
    ]);
    validate_schema("records-write.response.schema.json", &updated);

    append_rows(&workbook, "Unidades", &[&["U1", "Centro"], &["U2"]]);
    let units = run_json(["--workbook", wb, "units", "list"]);
    validate_schema("units-list.response.schema.json", &units);
    assert_eq!(as_u64(&units, "count"), 1);

    let deleted = run_json([
        "--workbook",
        wb,
        "records",
        "delete",
        "--table",
        "daily",
        "--row-index",
        "2",
        "--date",
        "2024-03-05",
        "--unit-id",
        "U1",
    ]);
    validate_schema("records-write.response.schema.json", &deleted);

    let after = run_json(["--workbook", wb, "records", "list", "--table", "daily"]);
    assert_eq!(as_u64(&after, "count"), 0);

    let _ = fs::remove_file(&workbook);
}

// Test IDs: TCLI-002
#[test]
fn duplicate_create_fails_and_leaves_one_row() {
    let workbook = unique_workbook_path("metrics-ledger-duplicate");
    let wb = path_str(&workbook);
    init_workbook(&workbook);

    let payload = r#"{"date":"2024-03-05","unitId":"U1","planCount":10}"#;
    let first = run_json(["--workbook", wb, "records", "create", "--table", "plan", "--payload", payload]);
    assert_eq!(as_u64(&first, "row"), 2);

    let output = run_ml(["--workbook", wb, "records", "create", "--table", "plan", "--payload", payload]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Já existe um registro para esta data e unidade"),
        "unexpected stderr: {stderr}"
    );

    let listed = run_json(["--workbook", wb, "records", "list", "--table", "plan"]);
    assert_eq!(as_u64(&listed, "count"), 1);

    let _ = fs::remove_file(&workbook);
}

// Test IDs: TCLI-003
#[test]
fn list_filters_and_orders_by_calendar_date() {
    let workbook = unique_workbook_path("metrics-ledger-list");
    let wb = path_str(&workbook);
    init_workbook(&workbook);
    append_rows(
        &workbook,
        "Comercial",
        &[
            &["02/01/2025", "U1", "1"],
            &["15/12/2024", "U1", "2"],
            &["20/12/2024", "U2", "4"],
        ],
    );

    let listed = run_json([
        "--workbook", wb, "records", "list", "--table", "daily", "--unit-id", "U1", "--order", "asc",
    ]);
    let rows = listed
        .get("records")
        .and_then(Value::as_array)
        .map(|records| {
            records.iter().filter_map(|record| record.get("rowIndex").and_then(Value::as_u64)).collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(rows, vec![3, 2]);

    let december = run_json([
        "--workbook",
        wb,
        "records",
        "totals",
        "--table",
        "daily",
        "--from",
        "2024-12-01",
        "--to",
        "2024-12-31",
    ]);
    assert_eq!(december.pointer("/totals/leadsReceived").and_then(Value::as_u64), Some(6));

    let _ = fs::remove_file(&workbook);
}

// Test IDs: TCLI-004
#[test]
fn init_refuses_to_overwrite_without_force() {
    let workbook = unique_workbook_path("metrics-ledger-init");
    let wb = path_str(&workbook);
    init_workbook(&workbook);

    let again = run_ml(["--workbook", wb, "workbook", "init"]);
    assert!(!again.status.success());

    let forced = run_json(["--workbook", wb, "workbook", "init", "--force"]);
    validate_schema("workbook-init.response.schema.json", &forced);

    let _ = fs::remove_file(&workbook);
}

// Test IDs: TCLI-005
#[test]
fn commands_fail_without_a_configured_store() {
    let output = run_ml(["records", "list", "--table", "daily"]);
    assert!(!output.status.success());

    let missing_token = run_ml(["--spreadsheet-id", "sheet-1", "units", "list"]);
    assert!(!missing_token.status.success());
}

// Test IDs: TCLI-006
#[test]
fn update_and_delete_report_missing_rows() {
    let workbook = unique_workbook_path("metrics-ledger-missing");
    let wb = path_str(&workbook);
    init_workbook(&workbook);

    let update = run_ml([
        "--workbook",
        wb,
        "records",
        "update",
        "--table",
        "daily",
        "--payload",
        r#"{"date":"2024-03-05","unitId":"U1"}"#,
    ]);
    assert!(!update.status.success());
    assert!(String::from_utf8_lossy(&update.stderr).contains("Índice da linha é obrigatório"));

    let delete = run_ml(["--workbook", wb, "records", "delete", "--table", "daily", "--row-index", "5"]);
    assert!(!delete.status.success());
    assert!(String::from_utf8_lossy(&delete.stderr).contains("Registro não encontrado"));

    let _ = fs::remove_file(&workbook);
}
