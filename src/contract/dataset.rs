//! CSV handling and deterministic column selection.
//!
//! Column selection runs host-side before the contract files are
//! written, so the layout the container sees is identical between train
//! and predict. Feature columns are 1-based indices; the target is a
//! name or 1-based index. Predict-time data commonly lacks the target
//! column, in which case a placeholder column of the same name is
//! appended and filled with the missing-value marker instead of failing.

use super::{ContractError, MISSING_VALUE};

/// Name given to a placeholder target when the request referenced the
/// target by an index the predict data does not have.
const FALLBACK_TARGET_NAME: &str = "target";

/// Target column reference: a header name or a 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetColumn {
    Index(usize),
    Name(String),
}

impl TargetColumn {
    /// Parses a target spec; digit strings are 1-based indices.
    pub fn parse(raw: &str) -> Result<Self, ContractError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ContractError::InvalidColumnSelection(
                "target column is empty".to_string(),
            ));
        }
        match trimmed.parse::<usize>() {
            Ok(0) => Err(ContractError::InvalidColumnSelection(
                "target column index is 1-based; got 0".to_string(),
            )),
            Ok(idx) => Ok(TargetColumn::Index(idx)),
            Err(_) => Ok(TargetColumn::Name(trimmed.to_string())),
        }
    }

    /// String form carried in `params.json`.
    pub fn as_spec(&self) -> String {
        match self {
            TargetColumn::Index(i) => i.to_string(),
            TargetColumn::Name(n) => n.clone(),
        }
    }
}

/// Which columns a job selects out of its dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnSelection {
    /// 1-based feature column indices; empty means "all columns".
    pub feature_indices: Vec<usize>,
    /// Target column; `None` means "last column" for train and a
    /// synthesized placeholder for predict.
    pub target: Option<TargetColumn>,
}

impl ColumnSelection {
    /// Parses the wire form: comma-separated 1-based indices plus an
    /// optional target spec.
    pub fn parse(features: Option<&str>, target: Option<&str>) -> Result<Self, ContractError> {
        let mut feature_indices = Vec::new();
        if let Some(raw) = features {
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let idx: usize = part.parse().map_err(|_| {
                    ContractError::InvalidColumnSelection(format!(
                        "'{part}' is not a column index"
                    ))
                })?;
                if idx == 0 {
                    return Err(ContractError::InvalidColumnSelection(
                        "column indices are 1-based; got 0".to_string(),
                    ));
                }
                feature_indices.push(idx);
            }
        }

        let target = match target {
            Some(raw) if !raw.trim().is_empty() => Some(TargetColumn::parse(raw)?),
            _ => None,
        };

        Ok(Self {
            feature_indices,
            target,
        })
    }

    /// The `basicAttributesColumns` value for `params.json`, or `None`
    /// when all columns are selected.
    pub fn feature_spec(&self) -> Option<String> {
        if self.feature_indices.is_empty() {
            None
        } else {
            Some(
                self.feature_indices
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            )
        }
    }
}

/// A parsed CSV table with a header row.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Result of applying a `ColumnSelection` to a table.
#[derive(Debug, Clone)]
pub struct SelectedDataset {
    pub table: CsvTable,
    /// Resolved target column name, if the job has a target at all.
    pub target_column: Option<String>,
    /// Whether a placeholder target column was synthesized.
    pub placeholder_added: bool,
}

impl CsvTable {
    /// Parses CSV text. Every row must match the header width.
    pub fn parse(text: &str) -> Result<Self, ContractError> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        let (_, header_line) = lines.next().ok_or(ContractError::EmptyDataset)?;
        let headers = split_csv_line(header_line);
        if headers.is_empty() {
            return Err(ContractError::EmptyDataset);
        }

        let mut rows = Vec::new();
        for (idx, line) in lines {
            let row = split_csv_line(line);
            if row.len() != headers.len() {
                return Err(ContractError::MalformedCsv {
                    line: idx + 1,
                    reason: format!("expected {} fields, found {}", headers.len(), row.len()),
                });
            }
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    /// Serializes back to CSV text, quoting fields that need it.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        write_csv_line(&mut out, &self.headers);
        for row in &self.rows {
            write_csv_line(&mut out, row);
        }
        out
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn header_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Applies column selection for a training dataset.
    ///
    /// Invalid feature indices are skipped; the target column is always
    /// kept; an unspecified or unresolvable target defaults to the last
    /// selected column.
    pub fn select_for_training(
        &self,
        selection: &ColumnSelection,
    ) -> Result<SelectedDataset, ContractError> {
        let target_name = self.resolve_target_name(selection.target.as_ref(), false);
        let mut kept = self.kept_feature_names(selection);

        if let Some(ref name) = target_name {
            if self.header_index(name).is_some() && !kept.contains(name) {
                kept.push(name.clone());
            }
        }

        let table = self.filter_columns(&kept)?;
        let target_column = match target_name {
            Some(ref name) if table.header_index(name).is_some() => Some(name.clone()),
            // No usable target: default to the last column.
            _ => table.headers.last().cloned(),
        };

        Ok(SelectedDataset {
            table,
            target_column,
            placeholder_added: false,
        })
    }

    /// Applies column selection for predict-time data, synthesizing a
    /// placeholder target column when the data lacks one. This keeps
    /// the column layout identical to the training layout.
    pub fn select_for_prediction(
        &self,
        selection: &ColumnSelection,
    ) -> Result<SelectedDataset, ContractError> {
        let target_name = self.resolve_target_name(selection.target.as_ref(), true);
        let mut kept = self.kept_feature_names(selection);

        if let Some(ref name) = target_name {
            if !kept.contains(name) {
                kept.push(name.clone());
            }
        }

        let mut table = self.filter_columns(&kept)?;

        let mut placeholder_added = false;
        let target_column = match target_name {
            Some(name) => {
                if table.header_index(&name).is_none() {
                    table.append_missing_column(&name);
                    placeholder_added = true;
                }
                Some(name)
            }
            // No target specified for predict: synthesize one at the end.
            None => {
                let name = FALLBACK_TARGET_NAME.to_string();
                if table.header_index(&name).is_none() {
                    table.append_missing_column(&name);
                    placeholder_added = true;
                }
                Some(name)
            }
        };

        Ok(SelectedDataset {
            table,
            target_column,
            placeholder_added,
        })
    }

    /// Applies feature selection only, for clustering data that has no
    /// concept of a target column.
    pub fn select_features_only(
        &self,
        selection: &ColumnSelection,
    ) -> Result<SelectedDataset, ContractError> {
        let kept = self.kept_feature_names(selection);
        let table = self.filter_columns(&kept)?;
        Ok(SelectedDataset {
            table,
            target_column: None,
            placeholder_added: false,
        })
    }

    /// Resolves the target reference to a column name. Out-of-range
    /// indices resolve to a fallback name on predict (so a placeholder
    /// can be added) and to `None` on train (fall back to last column).
    fn resolve_target_name(&self, target: Option<&TargetColumn>, predict: bool) -> Option<String> {
        match target {
            Some(TargetColumn::Index(idx)) => {
                if *idx >= 1 && *idx <= self.headers.len() {
                    Some(self.headers[idx - 1].clone())
                } else if predict {
                    Some(FALLBACK_TARGET_NAME.to_string())
                } else {
                    None
                }
            }
            Some(TargetColumn::Name(name)) => Some(name.clone()),
            None => None,
        }
    }

    /// Header names selected by the feature index list, in index-list
    /// order, skipping out-of-range entries. Empty list keeps all.
    fn kept_feature_names(&self, selection: &ColumnSelection) -> Vec<String> {
        if selection.feature_indices.is_empty() {
            return self.headers.clone();
        }

        let mut names = Vec::new();
        for &idx in &selection.feature_indices {
            if idx >= 1 && idx <= self.headers.len() {
                let name = self.headers[idx - 1].clone();
                if !names.contains(&name) {
                    names.push(name);
                }
            } else {
                tracing::warn!(index = idx, "Ignoring out-of-range feature column index");
            }
        }
        names
    }

    /// Keeps only the named columns, preserving original column order.
    fn filter_columns(&self, kept: &[String]) -> Result<CsvTable, ContractError> {
        let indices: Vec<usize> = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| kept.contains(h))
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            return Err(ContractError::InvalidColumnSelection(
                "selection matches no columns".to_string(),
            ));
        }

        if indices.len() == self.headers.len() {
            return Ok(self.clone());
        }

        let headers = indices.iter().map(|&i| self.headers[i].clone()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();

        Ok(CsvTable { headers, rows })
    }

    /// Appends a column whose every cell is the missing-value marker.
    fn append_missing_column(&mut self, name: &str) {
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(MISSING_VALUE.to_string());
        }
    }
}

/// Splits one CSV line, honoring double-quoted fields with `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field).trim().to_string());
            }
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

fn write_csv_line(out: &mut String, fields: &[String]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains(',') || field.contains('"') || field.contains('\n') {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iris_like() -> CsvTable {
        CsvTable::parse(
            "sepal_length,sepal_width,petal_length,species\n\
             5.1,3.5,1.4,setosa\n\
             6.2,2.9,4.3,versicolor\n",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_rejects_ragged_rows() {
        let err = CsvTable::parse("a,b,c\n1,2\n").unwrap_err();
        assert!(matches!(err, ContractError::MalformedCsv { line: 2, .. }));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            CsvTable::parse("\n\n"),
            Err(ContractError::EmptyDataset)
        ));
    }

    #[test]
    fn test_quoted_fields() {
        let table = CsvTable::parse("name,desc\nx,\"a, b\"\ny,\"say \"\"hi\"\"\"\n").unwrap();
        assert_eq!(table.rows[0][1], "a, b");
        assert_eq!(table.rows[1][1], "say \"hi\"");

        // Round-trips through the writer.
        let again = CsvTable::parse(&table.to_csv()).unwrap();
        assert_eq!(again, table);
    }

    #[test]
    fn test_training_selection_keeps_exact_columns() {
        let table = iris_like();
        let selection = ColumnSelection::parse(Some("1,2,3"), Some("4")).unwrap();
        let selected = table.select_for_training(&selection).unwrap();

        assert_eq!(
            selected.table.headers,
            vec!["sepal_length", "sepal_width", "petal_length", "species"]
        );
        assert_eq!(selected.target_column.as_deref(), Some("species"));
        assert!(!selected.placeholder_added);
    }

    #[test]
    fn test_training_selection_defaults_to_last_column() {
        let table = iris_like();
        let selected = table
            .select_for_training(&ColumnSelection::default())
            .unwrap();

        assert_eq!(selected.table.column_count(), 4);
        assert_eq!(selected.target_column.as_deref(), Some("species"));
    }

    #[test]
    fn test_training_selection_by_target_name() {
        let table = iris_like();
        let selection = ColumnSelection::parse(Some("1,3"), Some("species")).unwrap();
        let selected = table.select_for_training(&selection).unwrap();

        assert_eq!(
            selected.table.headers,
            vec!["sepal_length", "petal_length", "species"]
        );
        assert_eq!(selected.target_column.as_deref(), Some("species"));
    }

    #[test]
    fn test_prediction_inserts_placeholder_for_missing_target() {
        // Predict data has only the 3 feature columns.
        let table = CsvTable::parse(
            "sepal_length,sepal_width,petal_length\n5.0,3.0,1.5\n6.0,3.1,4.4\n",
        )
        .unwrap();
        let selection = ColumnSelection::parse(Some("1,2,3"), Some("4")).unwrap();
        let selected = table.select_for_prediction(&selection).unwrap();

        assert!(selected.placeholder_added);
        assert_eq!(selected.table.column_count(), 4);
        assert_eq!(selected.table.headers[3], "target");
        for row in &selected.table.rows {
            assert_eq!(row[3], MISSING_VALUE);
        }
    }

    #[test]
    fn test_prediction_placeholder_matches_train_position() {
        // Train side: 3 features + named target, target lands last.
        let train = iris_like();
        let train_sel = ColumnSelection::parse(Some("1,2,3"), Some("species")).unwrap();
        let trained = train.select_for_training(&train_sel).unwrap();

        // Predict side: same selection, data lacks the target column.
        let predict = CsvTable::parse(
            "sepal_length,sepal_width,petal_length\n5.0,3.0,1.5\n",
        )
        .unwrap();
        let predicted = predict.select_for_prediction(&train_sel).unwrap();

        assert!(predicted.placeholder_added);
        assert_eq!(predicted.table.headers, trained.table.headers);
        assert_eq!(
            predicted.target_column.as_deref(),
            trained.target_column.as_deref()
        );
    }

    #[test]
    fn test_prediction_without_target_synthesizes_one() {
        let table = CsvTable::parse("a,b\n1,2\n").unwrap();
        let selected = table
            .select_for_prediction(&ColumnSelection::default())
            .unwrap();

        assert!(selected.placeholder_added);
        assert_eq!(selected.table.headers, vec!["a", "b", "target"]);
        assert_eq!(selected.target_column.as_deref(), Some("target"));
    }

    #[test]
    fn test_prediction_with_target_present_adds_nothing() {
        let table = iris_like();
        let selection = ColumnSelection::parse(None, Some("species")).unwrap();
        let selected = table.select_for_prediction(&selection).unwrap();

        assert!(!selected.placeholder_added);
        assert_eq!(selected.table.column_count(), 4);
    }

    #[test]
    fn test_features_only_selection() {
        let table = iris_like();
        let selection = ColumnSelection::parse(Some("1,2"), None).unwrap();
        let selected = table.select_features_only(&selection).unwrap();

        assert_eq!(selected.table.headers, vec!["sepal_length", "sepal_width"]);
        assert!(selected.target_column.is_none());
    }

    #[test]
    fn test_out_of_range_feature_indices_skipped() {
        let table = iris_like();
        let selection = ColumnSelection::parse(Some("1,9"), Some("4")).unwrap();
        let selected = table.select_for_training(&selection).unwrap();

        assert_eq!(selected.table.headers, vec!["sepal_length", "species"]);
    }

    #[test]
    fn test_selection_parse_rejects_garbage() {
        assert!(ColumnSelection::parse(Some("1,two,3"), None).is_err());
        assert!(ColumnSelection::parse(Some("0"), None).is_err());
        assert!(TargetColumn::parse("0").is_err());
    }

    #[test]
    fn test_selection_feature_spec() {
        let selection = ColumnSelection::parse(Some("1, 2, 3"), None).unwrap();
        assert_eq!(selection.feature_spec().as_deref(), Some("1,2,3"));
        assert!(ColumnSelection::default().feature_spec().is_none());
    }
}
