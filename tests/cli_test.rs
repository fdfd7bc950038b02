// ABOUTME: End-to-end tests of the view-materializer binary against a SQLite file
// ABOUTME: Exercises sync, status and reset with a flag-defined job and a JSON state file

use rusqlite::Connection;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn create_database(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL, amount INTEGER NOT NULL);
         CREATE TABLE orders_log (customer_id INTEGER NOT NULL, _version INTEGER NOT NULL);
         CREATE TRIGGER orders_ins AFTER INSERT ON orders BEGIN
             INSERT INTO orders_log
             VALUES (NEW.customer_id, (SELECT COALESCE(MAX(_version), 0) + 1 FROM orders_log));
         END;
         CREATE VIEW customer_totals AS
             SELECT customer_id, SUM(amount) AS total FROM orders GROUP BY customer_id;
         CREATE TABLE customer_totals_mat (customer_id INTEGER PRIMARY KEY, total INTEGER NOT NULL);
         INSERT INTO orders (customer_id, amount) VALUES (1, 100), (1, 50), (2, 75);",
    )
    .unwrap();
}

fn run(dir: &Path, args: &[&str]) -> Output {
    let bin_path = env!("CARGO_BIN_EXE_view-materializer");
    let db = dir.join("shop.db");
    let state = dir.join("state").join("watermarks.json");
    Command::new(bin_path)
        .args(args)
        .arg("--database-url")
        .arg(&db)
        .arg("--state-file")
        .arg(&state)
        .args([
            "--source-view",
            "customer_totals",
            "--target-table",
            "customer_totals_mat",
            "--changes-function",
            "orders_log",
        ])
        .current_dir(dir)
        .env_remove("MATERIALIZER_DATABASE_URL")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_sync_status_reset_cycle() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path();
    create_database(&dir.join("shop.db"));

    // Nothing committed yet
    let output = run(dir, &["status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("customer_totals_mat: never synced"));

    let output = run(dir, &["sync"]);
    assert!(
        output.status.success(),
        "sync failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let conn = Connection::open(dir.join("shop.db")).unwrap();
    let totals: Vec<(i64, i64)> = conn
        .prepare("SELECT customer_id, total FROM customer_totals_mat ORDER BY customer_id")
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(totals, vec![(1, 150), (2, 75)]);

    let output = run(dir, &["status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(
        "customer_totals_mat: 3 (key last_sync_version:customer_totals_mat)"
    ));

    let output = run(dir, &["reset"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Watermark for job 'customer_totals_mat' reset to 0"));

    let output = run(dir, &["status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("customer_totals_mat: 0"));
}

#[test]
fn test_unknown_job_exits_nonzero() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path();
    create_database(&dir.join("shop.db"));

    let output = run(dir, &["sync", "--job", "nope"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Job 'nope' not found"));
}

#[test]
fn test_failed_job_exits_nonzero_without_committing() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path();
    create_database(&dir.join("shop.db"));
    Connection::open(dir.join("shop.db"))
        .unwrap()
        .execute_batch("DROP TABLE customer_totals_mat; CREATE TABLE customer_totals_mat (customer_id INTEGER, total INTEGER);")
        .unwrap();

    let output = run(dir, &["sync"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("1 of 1 job(s) failed"));
    assert!(stderr.contains("has no primary key"));
    assert!(!dir.join("state").join("watermarks.json").exists());
}
