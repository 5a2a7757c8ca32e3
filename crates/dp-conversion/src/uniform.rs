//! The uniform row format written by conversion scripts.
//!
//! Semicolon separated, ASCII, one header line naming the columns. Required columns are
//! `timestamp`, `parameter`, `value` plus either `site` or all of `x`, `y`, `z`.

use std::path::Path;

use anyhow::Context;
use chrono::NaiveDateTime;
use dp_core::{Location, PipelineError, Signal, TIMESTAMP_FORMAT};

pub const SEPARATOR: char = ';';
pub const MAX_ROW_ERRORS: usize = 10;

const REQUIRED: [&str; 3] = ["timestamp", "parameter", "value"];
const COORDINATES: [&str; 3] = ["x", "y", "z"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn split_line(line: &str) -> Vec<String> {
    line.split(SEPARATOR).map(|f| f.trim().to_string()).collect()
}

impl UniformTable {
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());
        let Some((_, header)) = lines.next() else {
            return Err(PipelineError::format("conversion output is empty, header line missing"));
        };
        let columns = split_line(header);
        if columns.iter().any(String::is_empty) {
            return Err(PipelineError::format(format!(
                "conversion output header `{header}` contains an empty column name"
            )));
        }

        let mut rows = Vec::new();
        for (index, line) in lines {
            let fields = split_line(line);
            if fields.len() != columns.len() {
                return Err(PipelineError::format(format!(
                    "line {}: expected {} fields, found {}",
                    index + 1,
                    columns.len(),
                    fields.len()
                )));
            }
            rows.push(fields);
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn to_text(&self) -> String {
        let mut out = self.columns.join(";");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join(";"));
            out.push('\n');
        }
        out
    }

    pub async fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::write(path, self.to_text())
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Header-level checks; `source_required` holds for source-type generic scripts.
    pub fn check_columns(&self, source_required: bool) -> Vec<PipelineError> {
        let mut errors = Vec::new();
        for name in REQUIRED {
            if self.column(name).is_none() {
                errors.push(PipelineError::format(format!("column `{name}` is missing")));
            }
        }
        if source_required && self.column("source").is_none() {
            errors.push(PipelineError::format(
                "column `source` is required for a source type conversion script",
            ));
        }

        let has_site = self.column("site").is_some();
        let coordinates = COORDINATES
            .iter()
            .filter(|c| self.column(c).is_some())
            .count();
        match (has_site, coordinates) {
            (true, 0) | (false, 3) => {}
            (true, _) => errors.push(PipelineError::format(
                "columns `site` and `x`, `y`, `z` are mutually exclusive",
            )),
            (false, 0) => errors.push(PipelineError::format(
                "either column `site` or columns `x`, `y`, `z` are required",
            )),
            (false, _) => errors.push(PipelineError::format(
                "columns `x`, `y`, `z` must be given together",
            )),
        }
        errors
    }

    /// Row-level conversion into signals. Stops after [`MAX_ROW_ERRORS`] errors.
    pub fn to_signals(&self, source: Option<&str>) -> Result<Vec<Signal>, Vec<PipelineError>> {
        let errors = self.check_columns(source.is_none());
        if !errors.is_empty() {
            return Err(errors);
        }

        let index = |name: &str| self.column(name);
        let timestamp_at = index("timestamp");
        let parameter_at = index("parameter");
        let value_at = index("value");
        let source_at = index("source");
        let site_at = index("site");
        let xyz_at = (index("x"), index("y"), index("z"));

        let mut signals = Vec::with_capacity(self.rows.len());
        let mut errors = Vec::new();
        for (row_no, row) in self.rows.iter().enumerate() {
            let field = |at: Option<usize>| at.map(|i| row[i].as_str()).unwrap_or_default();
            let line = row_no + 2;
            let mut row_errors = Vec::new();

            let timestamp = NaiveDateTime::parse_from_str(field(timestamp_at), TIMESTAMP_FORMAT)
                .map_err(|_| {
                    row_errors.push(format!(
                        "line {line}: timestamp `{}` does not match {TIMESTAMP_FORMAT}",
                        field(timestamp_at)
                    ))
                })
                .ok();
            let value = match field(value_at).parse::<f64>() {
                Ok(v) if v.is_finite() => Some(v),
                _ => {
                    row_errors.push(format!(
                        "line {line}: value `{}` is not a finite number",
                        field(value_at)
                    ));
                    None
                }
            };
            let parameter = field(parameter_at);
            if parameter.is_empty() {
                row_errors.push(format!("line {line}: parameter is empty"));
            }
            let row_source = match source_at.map(|i| row[i].as_str()) {
                Some(s) if !s.is_empty() => s,
                _ => source.unwrap_or_default(),
            };
            if row_source.is_empty() {
                row_errors.push(format!("line {line}: source is empty"));
            }
            let location = match site_at {
                Some(i) if row[i].is_empty() => {
                    row_errors.push(format!("line {line}: site is empty"));
                    None
                }
                Some(i) => Some(Location::Site(row[i].clone())),
                None => parse_coordinates(
                    [field(xyz_at.0), field(xyz_at.1), field(xyz_at.2)],
                    line,
                    &mut row_errors,
                ),
            };

            match (timestamp, value, location) {
                (Some(timestamp), Some(value), Some(location)) if row_errors.is_empty() => {
                    signals.push(Signal {
                        timestamp,
                        parameter: parameter.to_string(),
                        source: row_source.to_string(),
                        value,
                        location,
                    })
                }
                _ => {
                    errors.extend(row_errors.into_iter().map(PipelineError::format));
                    if errors.len() >= MAX_ROW_ERRORS {
                        errors.truncate(MAX_ROW_ERRORS);
                        errors.push(PipelineError::format(format!(
                            "stopped after {MAX_ROW_ERRORS} errors"
                        )));
                        return Err(errors);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(signals)
        } else {
            Err(errors)
        }
    }
}

fn parse_coordinates(fields: [&str; 3], line: usize, errors: &mut Vec<String>) -> Option<Location> {
    let mut parsed = [0.0; 3];
    for (slot, (name, text)) in parsed.iter_mut().zip(COORDINATES.iter().zip(fields)) {
        match text.parse::<f64>() {
            Ok(v) if v.is_finite() => *slot = v,
            _ => {
                errors.push(format!("line {line}: coordinate {name} `{text}` is not a number"));
                return None;
            }
        }
    }
    let [x, y, z] = parsed;
    Some(Location::Coordinates { x, y, z })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_core::ErrorKind;

    const SITE_TABLE: &str = "timestamp;parameter;value;site\n\
        2020-01-01 00:00:00;temp;23.5;lake\n\
        2020-01-01 00:01:00;temp;23.6;lake\n";

    #[test]
    fn written_table_reparses_to_same_rows() {
        let table = UniformTable::parse(SITE_TABLE).expect("parse");
        assert_eq!(table.len(), 2);
        let again = UniformTable::parse(&table.to_text()).expect("reparse");
        assert_eq!(again, table);
    }

    #[test]
    fn source_specific_rows_take_folder_source() {
        let table = UniformTable::parse(SITE_TABLE).expect("parse");
        let signals = table.to_signals(Some("sensor-1")).expect("signals");
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].source, "sensor-1");
        assert_eq!(signals[1].value, 23.6);
        assert_eq!(signals[0].location, Location::Site("lake".to_string()));
    }

    #[test]
    fn generic_script_output_needs_source_column() {
        let table = UniformTable::parse(SITE_TABLE).expect("parse");
        let errors = table.to_signals(None).expect_err("missing source");
        assert!(errors[0].message.contains("source"));
    }

    #[test]
    fn coordinates_replace_site() {
        let text = "timestamp;parameter;value;source;x;y;z\n2020-01-01 00:00:00;temp;1;s1;1;2;3\n";
        let signals = UniformTable::parse(text)
            .expect("parse")
            .to_signals(None)
            .expect("signals");
        assert_eq!(
            signals[0].location,
            Location::Coordinates { x: 1.0, y: 2.0, z: 3.0 }
        );
    }

    #[test]
    fn site_and_coordinates_together_are_rejected() {
        let text = "timestamp;parameter;value;site;x;y;z\n";
        let table = UniformTable::parse(text).expect("parse");
        let errors = table.check_columns(false);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("mutually exclusive"));
    }

    #[test]
    fn row_errors_are_capped() {
        let mut text = String::from("timestamp;parameter;value;site\n");
        for _ in 0..25 {
            text.push_str("yesterday;temp;warm;lake\n");
        }
        let errors = UniformTable::parse(&text)
            .expect("parse")
            .to_signals(Some("s1"))
            .expect_err("bad rows");
        assert_eq!(errors.len(), MAX_ROW_ERRORS + 1);
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Format));
    }

    #[test]
    fn ragged_rows_are_format_errors() {
        let err = UniformTable::parse("timestamp;parameter;value;site\n2020-01-01 00:00:00;temp\n")
            .expect_err("ragged");
        assert!(err.message.contains("line 2"));
    }

    #[test]
    fn header_only_output_is_an_empty_table() {
        let table = UniformTable::parse("timestamp;parameter;value;site\n").expect("parse");
        assert!(table.is_empty());
        assert_eq!(table.to_signals(Some("s1")).expect("signals"), Vec::new());
    }
}
