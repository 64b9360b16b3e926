use std::fmt::Write;

use super::Aggregator;

impl Aggregator {
    /// Renders the statistics table as aligned text: origin, class, count,
    /// average latency in milliseconds, one column per latency class and one
    /// per observed status code.
    pub fn dump_table(&self) -> String {
        let codes = self.observed_codes();
        let thresholds = self.latency_classes().thresholds();

        let mut header = vec![
            "Domain".to_string(),
            "Class".to_string(),
            "Count".to_string(),
            "Average ms".to_string(),
        ];
        header.extend(thresholds.iter().map(|t| format!(">={}ms", t / 1_000)));
        header.extend(codes.iter().map(|c| format!("HTTP {c}")));

        let mut rows = Vec::new();
        for (origin, class, bucket) in self.snapshot_for_export() {
            let mut row = vec![
                origin.to_string(),
                class.to_string(),
                bucket.count().to_string(),
                format!("{:.3}", bucket.average() / 1_000.0),
            ];
            row.extend(
                thresholds
                    .iter()
                    .map(|t| bucket.classes().get(t).copied().unwrap_or(0).to_string()),
            );
            row.extend(
                codes
                    .iter()
                    .map(|c| bucket.codes().get(c).copied().unwrap_or(0).to_string()),
            );
            rows.push(row);
        }

        let mut widths: Vec<usize> = header.iter().map(String::len).collect();
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let mut out = String::new();
        write_row(&mut out, &header, &widths);
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        write_row(&mut out, &rule, &widths);
        for row in &rows {
            write_row(&mut out, row, &widths);
        }
        out
    }
}

/// Text columns (domain, class) are left aligned, numbers right aligned.
fn write_row(out: &mut String, cells: &[String], widths: &[usize]) {
    out.push('|');
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        let _ = if i < 2 {
            write!(out, " {cell:<width$} |")
        } else {
            write!(out, " {cell:>width$} |")
        };
    }
    out.push('\n');
}
