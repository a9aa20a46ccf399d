//! Violation history export.
//!
//! The report is a pure function of store state: the same rows always render
//! to the same CSV bytes.

use anyhow::Result;

use crate::storage::{format_real, ViolationRow, ViolationStore};

/// Label prefix marking a violation class (`no_glove`, `no_goggles`, ...).
pub const VIOLATION_PREFIX: &str = "no";

pub const REPORT_COLUMNS: [&str; 10] = [
    "id",
    "metadata_id",
    "ppe_type",
    "confidence",
    "x1",
    "y1",
    "x2",
    "y2",
    "image_name",
    "overall_status",
];

const HTML_TITLES: [&str; 10] = [
    "ID",
    "Metadata ID",
    "PPE Type",
    "Confidence",
    "X1",
    "Y1",
    "X2",
    "Y2",
    "Image Name",
    "Overall Status",
];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViolationReport {
    pub rows: Vec<ViolationRow>,
}

impl ViolationReport {
    /// Read every violation-class detection, ascending by detection id.
    pub fn build(store: &dyn ViolationStore) -> Result<Self> {
        let rows = store.list_violations(Some(VIOLATION_PREFIX))?;
        Ok(Self { rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cells of every row in [`REPORT_COLUMNS`] order.
    pub fn table(&self) -> Vec<[String; 10]> {
        self.rows.iter().map(cells).collect()
    }

    /// Header line plus one comma-joined line per row, each ending in `\n`.
    pub fn to_csv(&self) -> String {
        let mut out = REPORT_COLUMNS.join(",");
        out.push('\n');
        for row in self.table() {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    /// Mail-ready HTML letter wrapping the report table.
    pub fn to_html(&self) -> String {
        let mut table = String::from(
            "<table border=\"1\" cellpadding=\"8\" style=\"border-collapse: collapse;\">\n",
        );
        table.push_str("  <tr style=\"background-color: #f2f2f2;\">\n");
        for title in HTML_TITLES {
            table.push_str(&format!("    <th>{}</th>\n", title));
        }
        table.push_str("  </tr>\n");
        for row in self.table() {
            table.push_str("  <tr>\n");
            for cell in row.iter() {
                table.push_str(&format!("    <td>{}</td>\n", escape_html(cell)));
            }
            table.push_str("  </tr>\n");
        }
        table.push_str("</table>\n");

        format!(
            r#"<html>
<body style="font-family: Arial, sans-serif;">
<p>Hello, Safety Manager</p>
<p>Please find below the latest <strong>PPE Violations Report</strong> extracted from the system.
This report includes all recent safety violations detected by the monitoring system.</p>
<p>Review and take necessary action.</p>
<h3>PPE Violations Table</h3>
{table}</body>
</html>
"#
        )
    }
}

fn cells(row: &ViolationRow) -> [String; 10] {
    let det = &row.detection;
    [
        det.id.to_string(),
        det.metadata_id.to_string(),
        det.ppe_type.clone(),
        format_real(det.confidence),
        format_real(det.x1),
        format_real(det.y1),
        format_real(det.x2),
        format_real(det.y2),
        row.image_name.clone(),
        row.overall_status.to_string(),
    ]
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
