use anyhow::{anyhow, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::classify::ComplianceStatus;
use crate::detect::DetectedObject;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One classified outcome of analyzing a single image (`metadata` row).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub id: i64,
    pub image_name: String,
    pub overall_status: ComplianceStatus,
}

/// One bounding-box object found within an event's image (`violations` row).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredDetection {
    pub id: i64,
    pub metadata_id: i64,
    pub ppe_type: String,
    pub confidence: f64,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// A detection joined with its parent event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViolationRow {
    pub detection: StoredDetection,
    pub image_name: String,
    pub overall_status: ComplianceStatus,
}

/// Untyped result of an arbitrary read query, every cell rendered as text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Persistence contract for detection events.
///
/// The store exclusively owns the `metadata` and `violations` tables. Each
/// event and its detections are written as one atomic unit; nothing else ever
/// mutates either table.
pub trait ViolationStore: Send + Sync {
    /// Insert an event and all of its detections in a single transaction and
    /// return the new event id. On any failure nothing is committed.
    fn write_detection_event(
        &self,
        image_name: &str,
        overall_status: ComplianceStatus,
        detections: &[DetectedObject],
    ) -> Result<i64>;

    /// Detections joined with their events, ascending by detection id.
    /// When `ppe_prefix` is set only labels starting with it are returned.
    fn list_violations(&self, ppe_prefix: Option<&str>) -> Result<Vec<ViolationRow>>;

    /// Run caller-supplied SQL on a connection that refuses writes.
    fn query_raw(&self, sql: &str) -> Result<QueryRows>;

    fn get_event(&self, id: i64) -> Result<Option<DetectionEvent>>;

    fn detections_for_event(&self, id: i64) -> Result<Vec<StoredDetection>>;

    /// Number of events per overall status. Every status is present.
    fn status_counts(&self) -> Result<BTreeMap<ComplianceStatus, u64>>;
}

/// SQLite-backed store. Holds only the database path; every operation opens,
/// uses and drops its own connection.
#[derive(Clone, Debug)]
pub struct SqliteViolationStore {
    db_path: String,
}

impl SqliteViolationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        let conn = store.connect()?;
        ensure_schema(&conn)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = crate::open_db_connection(&self.db_path)
            .with_context(|| format!("open database {}", self.db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(conn)
    }

    fn connect_read_only(&self) -> Result<Connection> {
        let conn = self.connect()?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS metadata (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          image_name TEXT NOT NULL,
          overall_status TEXT NOT NULL
            CHECK (overall_status IN ('violation', 'non_violation', 'normal'))
        );

        CREATE TABLE IF NOT EXISTS violations (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          metadata_id INTEGER NOT NULL REFERENCES metadata(id),
          ppe_type TEXT NOT NULL CHECK (length(ppe_type) > 0),
          confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
          x1 REAL NOT NULL,
          y1 REAL NOT NULL,
          x2 REAL NOT NULL,
          y2 REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_violations_metadata ON violations(metadata_id);
        "#,
    )?;
    Ok(())
}

impl ViolationStore for SqliteViolationStore {
    fn write_detection_event(
        &self,
        image_name: &str,
        overall_status: ComplianceStatus,
        detections: &[DetectedObject],
    ) -> Result<i64> {
        let mut conn = self.connect()?;
        // Dropping `tx` without commit rolls the whole unit back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO metadata (image_name, overall_status) VALUES (?1, ?2)",
            params![image_name, overall_status.as_str()],
        )
        .context("insert detection event")?;
        let metadata_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO violations (metadata_id, ppe_type, confidence, x1, y1, x2, y2)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for det in detections {
                stmt.execute(params![
                    metadata_id,
                    det.label,
                    det.confidence,
                    det.bbox.x1,
                    det.bbox.y1,
                    det.bbox.x2,
                    det.bbox.y2
                ])
                .with_context(|| format!("insert detection '{}'", det.label))?;
            }
        }

        tx.commit().context("commit detection event")?;
        Ok(metadata_id)
    }

    fn list_violations(&self, ppe_prefix: Option<&str>) -> Result<Vec<ViolationRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT v.id, v.metadata_id, v.ppe_type, v.confidence,
                   v.x1, v.y1, v.x2, v.y2, m.image_name, m.overall_status
            FROM violations v
            JOIN metadata m ON v.metadata_id = m.id
            WHERE ?1 IS NULL OR substr(v.ppe_type, 1, length(?1)) = ?1
            ORDER BY v.id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![ppe_prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(9)?;
            out.push(ViolationRow {
                detection: StoredDetection {
                    id: row.get(0)?,
                    metadata_id: row.get(1)?,
                    ppe_type: row.get(2)?,
                    confidence: row.get(3)?,
                    x1: row.get(4)?,
                    y1: row.get(5)?,
                    x2: row.get(6)?,
                    y2: row.get(7)?,
                },
                image_name: row.get(8)?,
                overall_status: status.parse()?,
            });
        }
        Ok(out)
    }

    fn query_raw(&self, sql: &str) -> Result<QueryRows> {
        let sql = sqlite_dialect(sql)?;
        let conn = self.connect_read_only()?;
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(render_value(row.get_ref(idx)?));
            }
            out.push(cells);
        }
        Ok(QueryRows { columns, rows: out })
    }

    fn get_event(&self, id: i64) -> Result<Option<DetectionEvent>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, image_name, overall_status FROM metadata WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, image_name, status)) => Ok(Some(DetectionEvent {
                id,
                image_name,
                overall_status: status.parse()?,
            })),
            None => Ok(None),
        }
    }

    fn detections_for_event(&self, id: i64) -> Result<Vec<StoredDetection>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, metadata_id, ppe_type, confidence, x1, y1, x2, y2
            FROM violations WHERE metadata_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(StoredDetection {
                id: row.get(0)?,
                metadata_id: row.get(1)?,
                ppe_type: row.get(2)?,
                confidence: row.get(3)?,
                x1: row.get(4)?,
                y1: row.get(5)?,
                x2: row.get(6)?,
                y2: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn status_counts(&self) -> Result<BTreeMap<ComplianceStatus, u64>> {
        let conn = self.connect()?;
        let mut counts: BTreeMap<ComplianceStatus, u64> =
            ComplianceStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut stmt =
            conn.prepare("SELECT overall_status, COUNT(*) FROM metadata GROUP BY overall_status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = u64::try_from(count).map_err(|_| anyhow!("negative event count"))?;
            counts.insert(status.parse()?, count);
        }
        Ok(counts)
    }
}

fn sql_tokens() -> &'static Regex {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    TOKENS.get_or_init(|| {
        Regex::new(r#"(?s)'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|/\*.*?\*/|;|(?i:\bilike\b)"#)
            .expect("static sql token regex")
    })
}

/// Adapt a single caller-supplied statement to SQLite.
///
/// `ILIKE` outside literals becomes `LIKE`, which SQLite already matches
/// case-insensitively for ASCII. Text after a terminating `;` other than
/// comments is refused, since `prepare` would silently ignore it.
pub fn sqlite_dialect(sql: &str) -> Result<String> {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    let mut terminated = false;
    for token in sql_tokens().find_iter(sql) {
        let gap = &sql[last..token.start()];
        let text = token.as_str();
        let is_comment = text.starts_with("--") || text.starts_with("/*");
        if terminated && (!gap.trim().is_empty() || !(is_comment || text == ";")) {
            return Err(anyhow!("multiple statements are not supported"));
        }
        out.push_str(gap);
        if text.eq_ignore_ascii_case("ilike") {
            out.push_str("LIKE");
        } else {
            out.push_str(text);
        }
        if text == ";" {
            terminated = true;
        }
        last = token.end();
    }
    let rest = &sql[last..];
    if terminated && !rest.trim().is_empty() {
        return Err(anyhow!("multiple statements are not supported"));
    }
    out.push_str(rest);
    Ok(out)
}

/// Render a real the way every text surface of the crate shows it.
pub fn format_real(value: f64) -> String {
    value.to_string()
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => format_real(f),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => hex::encode(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SqliteViolationStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ppe.db");
        let store = SqliteViolationStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn det(label: &str, confidence: f64) -> DetectedObject {
        DetectedObject::new(label, confidence, [1.0, 2.0, 30.0, 40.0])
    }

    #[test]
    fn write_assigns_shared_metadata_id() {
        let (_dir, store) = temp_store();
        let dets = vec![det("no_glove", 0.9), det("goggles", 0.75), det("glove", 0.5)];
        let id = store
            .write_detection_event("shift1.jpg", ComplianceStatus::Violation, &dets)
            .unwrap();

        let event = store.get_event(id).unwrap().unwrap();
        assert_eq!(event.image_name, "shift1.jpg");
        assert_eq!(event.overall_status, ComplianceStatus::Violation);

        let stored = store.detections_for_event(id).unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|d| d.metadata_id == id));
        assert_eq!(stored[0].ppe_type, "no_glove");
        assert_eq!(stored[1].confidence, 0.75);
    }

    #[test]
    fn empty_event_is_stored() {
        let (_dir, store) = temp_store();
        let id = store
            .write_detection_event("empty.jpg", ComplianceStatus::Normal, &[])
            .unwrap();
        assert!(store.detections_for_event(id).unwrap().is_empty());
        assert_eq!(
            store.status_counts().unwrap()[&ComplianceStatus::Normal],
            1
        );
    }

    #[test]
    fn failed_detection_insert_rolls_back_event() {
        let (_dir, store) = temp_store();
        let dets = vec![det("no_glove", 0.9), det("glove", 1.5)];
        let err = store
            .write_detection_event("broken.jpg", ComplianceStatus::Violation, &dets)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("glove"));

        let rows = store
            .query_raw("SELECT COUNT(*) FROM metadata")
            .unwrap();
        assert_eq!(rows.rows, vec![vec!["0".to_string()]]);
        let rows = store
            .query_raw("SELECT COUNT(*) FROM violations")
            .unwrap();
        assert_eq!(rows.rows, vec![vec!["0".to_string()]]);
        assert!(store.get_event(1).unwrap().is_none());
    }

    #[test]
    fn list_violations_filters_prefix_in_id_order() {
        let (_dir, store) = temp_store();
        store
            .write_detection_event(
                "a.jpg",
                ComplianceStatus::Violation,
                &[det("glove", 0.8), det("no_goggles", 0.7)],
            )
            .unwrap();
        store
            .write_detection_event("b.jpg", ComplianceStatus::Violation, &[det("no_glove", 0.6)])
            .unwrap();

        let all = store.list_violations(None).unwrap();
        assert_eq!(all.len(), 3);

        let only_no = store.list_violations(Some("no")).unwrap();
        let labels: Vec<&str> = only_no.iter().map(|r| r.detection.ppe_type.as_str()).collect();
        assert_eq!(labels, vec!["no_goggles", "no_glove"]);
        assert!(only_no[0].detection.id < only_no[1].detection.id);
        assert_eq!(only_no[1].image_name, "b.jpg");
    }

    #[test]
    fn query_raw_renders_cells_and_refuses_writes() {
        let (_dir, store) = temp_store();
        store
            .write_detection_event("a.jpg", ComplianceStatus::NonViolation, &[det("glove", 0.25)])
            .unwrap();

        let rows = store
            .query_raw("SELECT id, ppe_type, confidence, NULL FROM violations")
            .unwrap();
        assert_eq!(rows.columns, vec!["id", "ppe_type", "confidence", "NULL"]);
        assert_eq!(rows.rows, vec![vec!["1", "glove", "0.25", "NULL"]]);

        assert!(store
            .query_raw("INSERT INTO metadata (image_name, overall_status) VALUES ('x', 'normal')")
            .is_err());
        assert_eq!(store.status_counts().unwrap()[&ComplianceStatus::Normal], 0);
        assert!(store.query_raw("SELECT * FROM nowhere").is_err());
    }

    #[test]
    fn query_raw_accepts_ilike() {
        let (_dir, store) = temp_store();
        store
            .write_detection_event(
                "a.jpg",
                ComplianceStatus::Violation,
                &[det("no_glove", 0.9), det("glove", 0.8)],
            )
            .unwrap();

        let rows = store
            .query_raw("SELECT COUNT(*) FROM violations WHERE ppe_type ILIKE 'no%';")
            .unwrap();
        assert_eq!(rows.rows, vec![vec!["1".to_string()]]);
    }

    #[test]
    fn dialect_rewrites_ilike_only_outside_literals() {
        assert_eq!(
            sqlite_dialect("select * from violations where ppe_type iLike 'ILIKE%'").unwrap(),
            "select * from violations where ppe_type LIKE 'ILIKE%'"
        );
        assert_eq!(
            sqlite_dialect("SELECT \"ilike\", milike FROM t -- ilike").unwrap(),
            "SELECT \"ilike\", milike FROM t -- ilike"
        );
        assert_eq!(
            sqlite_dialect("SELECT ';' AS sep;  -- done\n").unwrap(),
            "SELECT ';' AS sep;  -- done\n"
        );
    }

    #[test]
    fn multiple_statements_are_refused() {
        let (_dir, store) = temp_store();
        let err = store.query_raw("SELECT 1; SELECT 2;").unwrap_err();
        assert!(err.to_string().contains("multiple statements"));
        assert!(sqlite_dialect("SELECT 1;;").is_ok());
    }
}
