//! Flattening of JSON cells into plain columns.
//!
//! Export cells such as `metadata` and `subject_data` hold JSON objects whose
//! key spelling drifts between export batches (`Date` in one, `date` in the
//! next). Keys are folded to lower case into a new tree that remembers every
//! spelling, so a lookup can tell an absent field from one written once or
//! several times. Each requested dot path becomes a column named
//! `{prefix}.{path_lowercased}`, joined back to its row by classification id.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SchemaError;
use crate::table::{Row, Table};

/// Accepted alternate spellings, consulted in order when a field is absent.
pub const ALTERNATE_SPELLINGS: &[(&str, &[&str])] = &[("#priority", &["priority"])];

static NULL: Value = Value::Null;

/// How the JSON in a cell wraps the fields of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    /// The cell is the object holding the fields.
    Plain,
    /// The cell is an object with a single key (a subject id) whose value
    /// holds the fields.
    SubjectEnvelope,
}

/// A JSON tree with object keys folded to lower case.
///
/// Keys that fold to the same spelling keep all of their values.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldedJson<'a> {
    /// Any non-object value.
    Leaf(&'a Value),
    /// An object with its source and folded members.
    Object {
        /// The object as written.
        source: &'a Value,
        /// Folded key to the values found under every spelling of it.
        members: BTreeMap<String, Vec<FoldedJson<'a>>>,
    },
}

/// Outcome of looking a dot path up in a [`FoldedJson`] tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldLookup<'a> {
    /// No spelling of the path exists.
    Absent,
    /// Exactly one spelling exists.
    Single(&'a Value),
    /// Several spellings exist.
    DuplicateCased(Vec<&'a Value>),
}

/// Folds every object key in `value` to lower case, recursively.
#[must_use]
pub fn normalise_keys(value: &Value) -> FoldedJson<'_> {
    match value {
        Value::Object(map) => {
            let mut members: BTreeMap<String, Vec<FoldedJson<'_>>> = BTreeMap::new();
            for (key, member) in map {
                members
                    .entry(key.to_lowercase())
                    .or_default()
                    .push(normalise_keys(member));
            }
            FoldedJson::Object {
                source: value,
                members,
            }
        }
        other => FoldedJson::Leaf(other),
    }
}

impl<'a> FoldedJson<'a> {
    /// Returns the value as written.
    #[must_use]
    pub const fn source(&self) -> &'a Value {
        match self {
            Self::Leaf(value) | Self::Object { source: value, .. } => value,
        }
    }

    /// Looks a dot path up case-insensitively.
    ///
    /// A `null` met before the path ends resolves the path to `null`, so
    /// `retired.retired_at` under `"retired": null` is a single empty value.
    #[must_use]
    pub fn lookup(&self, path: &str) -> FieldLookup<'a> {
        let mut frontier = vec![self];
        let mut found: Vec<&'a Value> = Vec::new();
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let folded = segment.to_lowercase();
            let more = segments.peek().is_some();
            let mut next = Vec::new();
            for member in frontier
                .into_iter()
                .filter_map(|node| match node {
                    Self::Object { members, .. } => members.get(&folded),
                    Self::Leaf(_) => None,
                })
                .flatten()
            {
                match member {
                    Self::Leaf(value) if more && value.is_null() => found.push(*value),
                    _ => next.push(member),
                }
            }
            frontier = next;
        }
        found.extend(frontier.into_iter().map(Self::source));
        match found.len() {
            0 => FieldLookup::Absent,
            1 => FieldLookup::Single(found.remove(0)),
            _ => FieldLookup::DuplicateCased(found),
        }
    }
}

/// Renders a JSON value as cell text.
///
/// Strings are copied verbatim, `null` becomes empty, and anything else is
/// compact JSON.
#[must_use]
pub fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Expands `fields` of the JSON in `column` into `{prefix}.{field}` columns
/// and drops `column`.
///
/// The table is only modified when every row expands and cross-checks
/// cleanly.
///
/// # Errors
///
/// Returns [`SchemaError::ColumnCollision`] if an output column already
/// exists (so expanding twice always fails), [`SchemaError::MissingColumn`]
/// if `column` is absent, and the per-row errors of malformed JSON, absent
/// fields, conflicting spellings or a failed cross-check.
pub fn expand(
    table: &mut Table,
    column: &str,
    fields: &[String],
    prefix: &str,
    shape: JsonShape,
) -> Result<(), SchemaError> {
    let outputs = output_columns(table, fields, prefix)?;
    let index = table.require_column(column)?;

    let mut parsed = Vec::with_capacity(table.len());
    for row in table.rows() {
        parsed.push((row.classification_id(), parse_cell(row, index, column, shape)?));
    }

    let mut columns: Vec<HashMap<u64, String>> = vec![HashMap::new(); fields.len()];
    let mut alternates_used = 0_usize;
    for (classification_id, value) in &parsed {
        let folded = normalise_keys(value);
        for (field, values) in fields.iter().zip(&mut columns) {
            let (resolved, alternate) = resolve(&folded, field, *classification_id, column)?;
            alternates_used += usize::from(alternate);
            values.insert(*classification_id, render(resolved));
        }
    }
    if alternates_used > 0 {
        warn!(
            column,
            rows = alternates_used,
            "accepted alternate spellings for missing fields"
        );
    }

    let mut expanded = table.clone();
    for (name, values) in outputs.iter().zip(columns) {
        expanded.push_column(name, values)?;
    }
    cross_check(&expanded, &parsed, fields, &outputs, column)?;
    expanded.drop_columns(&[column])?;

    debug!(column, prefix, fields = fields.len(), rows = expanded.len(), "expanded JSON column");
    *table = expanded;
    Ok(())
}

fn output_columns(table: &Table, fields: &[String], prefix: &str) -> Result<Vec<String>, SchemaError> {
    let mut outputs: Vec<String> = Vec::with_capacity(fields.len());
    for field in fields {
        let name = format!("{prefix}.{}", field.to_lowercase());
        if table.has_column(&name) || outputs.contains(&name) {
            return Err(SchemaError::ColumnCollision { column: name });
        }
        outputs.push(name);
    }
    Ok(outputs)
}

fn parse_cell(row: &Row, index: usize, column: &str, shape: JsonShape) -> Result<Value, SchemaError> {
    let classification_id = row.classification_id();
    let parsed: Value =
        serde_json::from_str(row.cell(index)).map_err(|err| SchemaError::InvalidJson {
            classification_id,
            column: column.to_owned(),
            message: err.to_string(),
        })?;
    match (shape, parsed) {
        (JsonShape::Plain, value) => Ok(value),
        (JsonShape::SubjectEnvelope, Value::Object(envelope)) => {
            let subjects = envelope.len();
            let mut entries = envelope.into_iter();
            match (entries.next(), entries.next()) {
                (Some((_, inner)), None) => Ok(inner),
                _ => Err(SchemaError::SubjectEnvelope {
                    classification_id,
                    column: column.to_owned(),
                    subjects,
                }),
            }
        }
        (JsonShape::SubjectEnvelope, _) => Err(SchemaError::SubjectEnvelope {
            classification_id,
            column: column.to_owned(),
            subjects: 0,
        }),
    }
}

fn alternates(field: &str) -> &'static [&'static str] {
    ALTERNATE_SPELLINGS
        .iter()
        .find(|(canonical, _)| canonical.eq_ignore_ascii_case(field))
        .map(|(_, spellings)| *spellings)
        .unwrap_or_default()
}

/// Resolves one field, returning the value and whether an alternate spelling
/// supplied it.
fn resolve<'a>(
    folded: &FoldedJson<'a>,
    field: &str,
    classification_id: u64,
    column: &str,
) -> Result<(&'a Value, bool), SchemaError> {
    let spellings = std::iter::once(field).chain(alternates(field).iter().copied());
    for (position, spelling) in spellings.enumerate() {
        let value = match folded.lookup(spelling) {
            FieldLookup::Absent => continue,
            FieldLookup::Single(value) => value,
            FieldLookup::DuplicateCased(values) => {
                populated_once(&values).ok_or_else(|| SchemaError::ConflictingCase {
                    classification_id,
                    column: column.to_owned(),
                    path: field.to_owned(),
                })?
            }
        };
        return Ok((value, position > 0));
    }
    Err(SchemaError::MissingField {
        classification_id,
        column: column.to_owned(),
        path: field.to_owned(),
    })
}

/// Picks the only non-null value, or `null` when none is populated.
fn populated_once<'a>(values: &[&'a Value]) -> Option<&'a Value> {
    let mut populated = values.iter().copied().filter(|value| !value.is_null());
    match (populated.next(), populated.next()) {
        (Some(value), None) => Some(value),
        (None, _) => Some(&NULL),
        (Some(_), Some(_)) => None,
    }
}

fn walk_source<'a>(value: &'a Value, segments: &[String], found: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };
    if let Value::Object(map) = value {
        for (key, member) in map {
            if key.to_lowercase() != *head {
                continue;
            }
            if member.is_null() && !rest.is_empty() {
                found.push(member);
            } else {
                walk_source(member, rest, found);
            }
        }
    }
}

/// Value of `field` obtained by walking the unfolded source JSON.
fn source_value(value: &Value, field: &str) -> Option<String> {
    std::iter::once(field)
        .chain(alternates(field).iter().copied())
        .find_map(|spelling| {
            let segments: Vec<String> = spelling.split('.').map(str::to_lowercase).collect();
            let mut found = Vec::new();
            walk_source(value, &segments, &mut found);
            (!found.is_empty()).then(|| populated_once(&found).map(render))
        })
        .flatten()
}

fn cross_check(
    expanded: &Table,
    parsed: &[(u64, Value)],
    fields: &[String],
    outputs: &[String],
    column: &str,
) -> Result<(), SchemaError> {
    for (classification_id, value) in parsed {
        for (field, output) in fields.iter().zip(outputs) {
            let source = source_value(value, field).unwrap_or_default();
            let flattened = expanded
                .value(*classification_id, output)
                .unwrap_or_default();
            if source != flattened {
                return Err(SchemaError::CrossCheck {
                    classification_id: *classification_id,
                    column: column.to_owned(),
                    path: field.clone(),
                    source_value: source,
                    flattened: flattened.to_owned(),
                });
            }
        }
    }
    Ok(())
}

/// Union of the object keys seen in a JSON column, as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyTree {
    children: BTreeMap<String, KeyTree>,
}

impl KeyTree {
    fn absorb(&mut self, value: &Value) {
        if let Value::Object(map) = value {
            for (key, member) in map {
                self.children.entry(key.clone()).or_default().absorb(member);
            }
        }
    }

    /// Returns the dot paths of every leaf key.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for (key, child) in &self.children {
            if child.children.is_empty() {
                paths.push(key.clone());
            } else {
                paths.extend(child.paths().into_iter().map(|path| format!("{key}.{path}")));
            }
        }
        paths
    }

    /// Returns groups of sibling keys that differ only in case.
    #[must_use]
    pub fn case_variants(&self) -> Vec<Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in self.children.keys() {
            groups.entry(key.to_lowercase()).or_default().push(key.clone());
        }
        let mut variants: Vec<Vec<String>> =
            groups.into_values().filter(|group| group.len() > 1).collect();
        for child in self.children.values() {
            variants.extend(child.case_variants());
        }
        variants
    }
}

/// Surveys the keys used in a JSON column across all rows.
///
/// # Errors
///
/// Returns the same per-row errors as [`expand`] for malformed JSON or
/// subject envelopes, or [`SchemaError::MissingColumn`].
pub fn survey_keys(table: &Table, column: &str, shape: JsonShape) -> Result<KeyTree, SchemaError> {
    let index = table.require_column(column)?;
    let mut tree = KeyTree::default();
    for row in table.rows() {
        tree.absorb(&parse_cell(row, index, column, shape)?);
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn table(rows: &[(u64, &str)]) -> Table {
        let mut table = Table::new(vec!["classification_id".to_owned(), "metadata".to_owned()])
            .expect("valid header");
        for (id, json) in rows {
            table
                .push_row(vec![id.to_string(), (*json).to_owned()])
                .expect("valid row");
        }
        table
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn lookup_distinguishes_absent_single_and_duplicate() {
        let value = json!({"Date": "1 May", "date": null, "Page": 3, "retired": {"Retired_At": "x"}});
        let folded = normalise_keys(&value);

        assert_eq!(folded.lookup("catalogue"), FieldLookup::Absent);
        assert_eq!(folded.lookup("PAGE"), FieldLookup::Single(&json!(3)));
        assert_eq!(
            folded.lookup("retired.retired_at"),
            FieldLookup::Single(&json!("x"))
        );
        assert!(matches!(
            folded.lookup("date"),
            FieldLookup::DuplicateCased(values) if values.len() == 2
        ));
    }

    #[rstest]
    #[case::null_parent(json!({"retired": null}), FieldLookup::Single(&Value::Null))]
    #[case::scalar_parent(json!({"retired": 3}), FieldLookup::Absent)]
    #[case::missing_parent(json!({"page": 3}), FieldLookup::Absent)]
    fn lookup_stops_at_a_null_parent(#[case] value: Value, #[case] expected: FieldLookup<'static>) {
        let folded = normalise_keys(&value);
        assert_eq!(folded.lookup("retired.retired_at"), expected);
    }

    #[test]
    fn unretired_subjects_expand_to_empty_cells() {
        let mut table = table(&[
            (1, r##"{"9": {"#priority": 1, "retired": {"retired_at": "2022-03-01T00:00:00Z"}}}"##),
            (2, r##"{"10": {"#priority": 2, "retired": null}}"##),
        ]);
        expand(
            &mut table,
            "metadata",
            &fields(&["#priority", "retired.retired_at"]),
            "subj",
            JsonShape::SubjectEnvelope,
        )
        .expect("expand");

        assert_eq!(table.value(1, "subj.retired.retired_at"), Some("2022-03-01T00:00:00Z"));
        assert_eq!(table.value(2, "subj.retired.retired_at"), Some(""));
        assert_eq!(table.value(2, "subj.#priority"), Some("2"));
    }

    #[test]
    fn merges_case_variants_into_one_column() {
        let mut table = table(&[
            (1, r#"{"Started_At": "2021-01-01T00:00:00Z"}"#),
            (2, r#"{"started_at": "2021-01-02T00:00:00Z"}"#),
        ]);
        expand(&mut table, "metadata", &fields(&["started_at"]), "md", JsonShape::Plain)
            .expect("expand");

        assert_eq!(table.columns(), ["classification_id", "md.started_at"]);
        assert_eq!(table.value(1, "md.started_at"), Some("2021-01-01T00:00:00Z"));
        assert_eq!(table.value(2, "md.started_at"), Some("2021-01-02T00:00:00Z"));
    }

    #[test]
    fn accepts_one_populated_spelling_per_object() {
        let mut table = table(&[(1, r#"{"Date": null, "date": "1 May"}"#)]);
        expand(&mut table, "metadata", &fields(&["Date"]), "subj", JsonShape::Plain)
            .expect("expand");
        assert_eq!(table.value(1, "subj.date"), Some("1 May"));
    }

    #[test]
    fn rejects_two_populated_spellings() {
        let mut table = table(&[(9, r#"{"Date": "1 May", "date": "2 May"}"#)]);
        let err = expand(&mut table, "metadata", &fields(&["date"]), "subj", JsonShape::Plain)
            .expect_err("conflict");
        assert_eq!(
            err,
            SchemaError::ConflictingCase {
                classification_id: 9,
                column: "metadata".to_owned(),
                path: "date".to_owned(),
            }
        );
        assert!(table.has_column("metadata"));
    }

    #[test]
    fn rejects_re_expansion() {
        let mut table = table(&[(1, r#"{"started_at": "a"}"#)]);
        let keepers = fields(&["started_at"]);
        expand(&mut table, "metadata", &keepers, "md", JsonShape::Plain).expect("first");
        let err = expand(&mut table, "metadata", &keepers, "md", JsonShape::Plain)
            .expect_err("second expansion");
        assert_eq!(
            err,
            SchemaError::ColumnCollision {
                column: "md.started_at".to_owned()
            }
        );
    }

    #[test]
    fn names_the_row_missing_a_field() {
        let mut table = table(&[(1, r#"{"started_at": "a"}"#), (2, "{}")]);
        let err = expand(&mut table, "metadata", &fields(&["started_at"]), "md", JsonShape::Plain)
            .expect_err("missing");
        assert_eq!(
            err,
            SchemaError::MissingField {
                classification_id: 2,
                column: "metadata".to_owned(),
                path: "started_at".to_owned(),
            }
        );
    }

    #[test]
    fn accepts_priority_without_hash() {
        let mut table = table(&[(1, r##"{"#priority": 4}"##), (2, r#"{"priority": 5}"#)]);
        expand(&mut table, "metadata", &fields(&["#priority"]), "subj", JsonShape::Plain)
            .expect("expand");
        assert_eq!(table.value(1, "subj.#priority"), Some("4"));
        assert_eq!(table.value(2, "subj.#priority"), Some("5"));
    }

    #[rstest]
    #[case::one_subject(r#"{"77": {"Page": "2"}}"#, Ok("2"))]
    #[case::no_subject("{}", Err(0))]
    #[case::two_subjects(r#"{"77": {"Page": "2"}, "78": {"Page": "3"}}"#, Err(2))]
    fn unwraps_subject_envelopes(#[case] json: &str, #[case] expected: Result<&str, usize>) {
        let mut table = table(&[(5, json)]);
        let result = expand(
            &mut table,
            "metadata",
            &fields(&["page"]),
            "subj",
            JsonShape::SubjectEnvelope,
        );
        match expected {
            Ok(page) => {
                result.expect("expand");
                assert_eq!(table.value(5, "subj.page"), Some(page));
            }
            Err(subjects) => assert_eq!(
                result,
                Err(SchemaError::SubjectEnvelope {
                    classification_id: 5,
                    column: "metadata".to_owned(),
                    subjects,
                })
            ),
        }
    }

    #[rstest]
    #[case(json!("text"), "text")]
    #[case(json!(null), "")]
    #[case(json!(1.5), "1.5")]
    #[case(json!(true), "true")]
    #[case(json!({"a": [1, 2]}), r#"{"a":[1,2]}"#)]
    fn renders_values_as_cell_text(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(render(&value), expected);
    }

    #[test]
    fn invalid_json_is_a_schema_error() {
        let mut table = table(&[(3, "{not json")]);
        let err = expand(&mut table, "metadata", &fields(&["a"]), "md", JsonShape::Plain)
            .expect_err("invalid");
        assert!(matches!(
            err,
            SchemaError::InvalidJson {
                classification_id: 3,
                ..
            }
        ));
    }

    #[test]
    fn survey_reports_case_drift() {
        let table = table(&[
            (1, r#"{"Date": "a", "retired": {"id": 1}}"#),
            (2, r#"{"date": "b", "retired": {"id": 2, "Id": 3}}"#),
        ]);
        let tree = survey_keys(&table, "metadata", JsonShape::Plain).expect("survey");
        assert_eq!(tree.paths(), ["Date", "date", "retired.Id", "retired.id"]);
        assert_eq!(
            tree.case_variants(),
            vec![
                vec!["Date".to_owned(), "date".to_owned()],
                vec!["Id".to_owned(), "id".to_owned()],
            ]
        );
    }
}
