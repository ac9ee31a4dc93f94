//! Workflow and project catalogue.
//!
//! The catalogue is a JSON document describing every workflow the pipeline
//! knows about: export names, accepted versions, subject fields to keep,
//! start timestamps, display labels and types, the projects that group the
//! workflows, and an optional pseudo-workflow split. All per-workflow tables
//! are cross-checked on load so a run never starts with inconsistent
//! configuration.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ConfigError;

/// Current supported catalogue version.
const SUPPORTED_VERSION: u32 = 1;

/// Numeric identifier of a workflow.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(u64);

impl WorkflowId {
    /// Wraps a raw workflow id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw workflow id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Parses a comma-separated list of workflow ids.
///
/// Blank entries are ignored, so `"18504, 19279,"` is accepted.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidSelection`] if an entry is not an unsigned
/// integer or the list names no workflow at all.
pub fn parse_workflow_list(value: &str) -> Result<Vec<WorkflowId>, ConfigError> {
    let ids = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<WorkflowId>()
                .map_err(|err| ConfigError::InvalidSelection {
                    value: value.to_owned(),
                    message: format!("'{entry}': {err}"),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(ConfigError::InvalidSelection {
            value: value.to_owned(),
            message: "no workflow ids listed".to_owned(),
        });
    }
    Ok(ids)
}

/// Configuration of one exported workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    id: WorkflowId,
    name: String,
    kept_versions: BTreeSet<String>,
    subject_fields: Vec<String>,
    start_stamp: DateTime<Utc>,
    label: String,
    workflow_type: String,
}

impl WorkflowConfig {
    /// Returns the workflow id.
    #[must_use]
    pub const fn id(&self) -> WorkflowId {
        self.id
    }

    /// Returns the export name; the export file is `{name}-classifications.csv`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` when rows of `version` are kept.
    #[must_use]
    pub fn keeps_version(&self, version: &str) -> bool {
        self.kept_versions.contains(version)
    }

    /// Returns the accepted workflow versions.
    #[must_use]
    pub const fn kept_versions(&self) -> &BTreeSet<String> {
        &self.kept_versions
    }

    /// Returns the workflow-specific subject fields to keep.
    #[must_use]
    pub fn subject_fields(&self) -> &[String] {
        &self.subject_fields
    }

    /// Returns the instant the workflow went live; earlier rows are test data.
    #[must_use]
    pub const fn start_stamp(&self) -> DateTime<Utc> {
        self.start_stamp
    }

    /// Returns the display label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the workflow type.
    #[must_use]
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }
}

/// A synthetic workflow carved out of a parent workflow.
///
/// Within the parent, rows are grouped by `group_field` and the rows holding
/// the smallest `order_field` value of each group move to the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoWorkflowSplit {
    parent: WorkflowId,
    child_id: WorkflowId,
    child_name: String,
    child_label: String,
    child_type: String,
    group_field: String,
    order_field: String,
}

impl PseudoWorkflowSplit {
    /// Returns the workflow the child is carved from.
    #[must_use]
    pub const fn parent(&self) -> WorkflowId {
        self.parent
    }

    /// Returns the synthetic workflow id.
    #[must_use]
    pub const fn child_id(&self) -> WorkflowId {
        self.child_id
    }

    /// Returns the synthetic workflow name.
    #[must_use]
    pub fn child_name(&self) -> &str {
        &self.child_name
    }

    /// Returns the synthetic workflow label.
    #[must_use]
    pub fn child_label(&self) -> &str {
        &self.child_label
    }

    /// Returns the synthetic workflow type.
    #[must_use]
    pub fn child_type(&self) -> &str {
        &self.child_type
    }

    /// Returns the flattened column rows are grouped by.
    #[must_use]
    pub fn group_field(&self) -> &str {
        &self.group_field
    }

    /// Returns the flattened column ordering pages within a group.
    #[must_use]
    pub fn order_field(&self) -> &str {
        &self.order_field
    }
}

/// One piece of a [`LocationTemplate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Text copied verbatim.
    Literal(String),
    /// Value of the named column.
    Column(String),
}

/// A location URL assembled from literal text and column values.
///
/// Placeholders are written `{column}`; `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationTemplate {
    parts: Vec<TemplatePart>,
}

impl LocationTemplate {
    /// Parses a template string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for unbalanced braces or empty
    /// placeholders.
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::Parse {
            message: format!("location template '{template}': {message}"),
        };
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let column = placeholder(&mut chars).ok_or_else(|| invalid("unclosed placeholder"))?;
                    if column.is_empty() {
                        return Err(invalid("empty placeholder"));
                    }
                    if !literal.is_empty() {
                        parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(TemplatePart::Column(column));
                }
                '}' => return Err(invalid("unmatched '}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Returns the template pieces in order.
    #[must_use]
    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }

    /// Returns the columns the template reads.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            TemplatePart::Column(column) => Some(column.as_str()),
            TemplatePart::Literal(_) => None,
        })
    }
}

/// Reads a placeholder name up to its closing brace.
fn placeholder(chars: &mut impl Iterator<Item = char>) -> Option<String> {
    let mut column = String::new();
    for ch in chars {
        match ch {
            '}' => return Some(column),
            '{' => return None,
            other => column.push(other),
        }
    }
    None
}

/// A project grouping several workflows for redistribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    name: String,
    workflows: Vec<WorkflowId>,
    subjects_file: String,
    url: String,
    location_templates: Vec<(String, LocationTemplate)>,
    plain_location_prefix: Option<String>,
}

impl Project {
    /// Returns the project name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the project's workflows, including derived ones.
    #[must_use]
    pub fn workflows(&self) -> &[WorkflowId] {
        &self.workflows
    }

    /// Returns the subject index file name, relative to the exports directory.
    #[must_use]
    pub fn subjects_file(&self) -> &str {
        &self.subjects_file
    }

    /// Returns the project's public URL, ending in `/`.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns derived location columns and their templates.
    #[must_use]
    pub fn location_templates(&self) -> &[(String, LocationTemplate)] {
        &self.location_templates
    }

    /// Returns the prefix applied to plain image URLs, if any.
    #[must_use]
    pub fn plain_location_prefix(&self) -> Option<&str> {
        self.plain_location_prefix.as_deref()
    }

    /// Returns the file stem used for the project's sharing export.
    ///
    /// Whitespace runs become `_` and `&` becomes `and`.
    #[must_use]
    pub fn slug(&self) -> String {
        self.name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .replace('&', "and")
    }
}

/// The validated catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalogue {
    workflows: BTreeMap<WorkflowId, WorkflowConfig>,
    all_subject_keepers: Vec<String>,
    metadata_keepers: Vec<String>,
    stop_stamp: DateTime<Utc>,
    projects: Vec<Project>,
    split: Option<PseudoWorkflowSplit>,
}

impl Catalogue {
    /// Parses a catalogue from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the JSON is malformed, the version is
    /// unsupported, or the tables are inconsistent with one another.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawCatalogue = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;

        Self::from_raw(raw)
    }

    /// Loads a catalogue from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Self::from_json(&contents)
    }

    fn from_raw(raw: RawCatalogue) -> Result<Self, ConfigError> {
        if raw.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                expected: SUPPORTED_VERSION,
                actual: raw.version,
            });
        }

        let reference: BTreeSet<WorkflowId> = raw.names.keys().copied().collect();
        check_keys("keepers", &reference, raw.keepers.keys())?;
        check_keys("subjectKeepers", &reference, raw.subject_keepers.keys())?;
        check_keys("startStamps", &reference, raw.start_stamps.keys())?;

        let split = raw
            .pseudo_workflow_split
            .map(|split| validate_split(split, &reference, &raw.labels, &raw.workflow_types))
            .transpose()?;

        let mut labelled = reference.clone();
        labelled.extend(split.as_ref().map(PseudoWorkflowSplit::child_id));
        check_keys("labels", &labelled, raw.labels.keys())?;
        check_keys("workflowTypes", &labelled, raw.workflow_types.keys())?;

        let mut keepers = raw.keepers;
        let mut subject_keepers = raw.subject_keepers;
        let mut labels = raw.labels;
        let mut workflow_types = raw.workflow_types;
        let workflows = raw
            .names
            .into_iter()
            .map(|(id, name)| {
                let config = WorkflowConfig {
                    id,
                    name,
                    kept_versions: keepers.remove(&id).unwrap_or_default(),
                    subject_fields: subject_keepers.remove(&id).unwrap_or_default(),
                    start_stamp: raw.start_stamps.get(&id).copied().unwrap_or_default(),
                    label: labels.remove(&id).unwrap_or_default(),
                    workflow_type: workflow_types.remove(&id).unwrap_or_default(),
                };
                (id, config)
            })
            .collect();

        let projects = validate_projects(raw.projects, &labelled)?;

        Ok(Self {
            workflows,
            all_subject_keepers: raw.all_subject_keepers,
            metadata_keepers: raw.metadata_keepers,
            stop_stamp: raw.stop_stamp,
            projects,
            split,
        })
    }

    /// Returns every exported workflow in id order.
    pub fn workflows(&self) -> impl Iterator<Item = &WorkflowConfig> {
        self.workflows.values()
    }

    /// Looks up an exported workflow.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownWorkflow`] when `id` is not exported.
    /// Derived workflows are not exported and are unknown here.
    pub fn workflow(&self, id: WorkflowId) -> Result<&WorkflowConfig, ConfigError> {
        self.workflows
            .get(&id)
            .ok_or(ConfigError::UnknownWorkflow { workflow_id: id })
    }

    /// Resolves the workflows a run processes, in read order.
    ///
    /// `None` selects every exported workflow in id order; otherwise the
    /// requested order is kept and repeats are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownWorkflow`] for an id that is not exported.
    pub fn select(
        &self,
        requested: Option<&[WorkflowId]>,
    ) -> Result<Vec<&WorkflowConfig>, ConfigError> {
        let Some(requested) = requested else {
            return Ok(self.workflows.values().collect());
        };
        let mut seen = HashSet::new();
        requested
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|id| self.workflow(*id))
            .collect()
    }

    /// Returns the subject fields kept for every workflow.
    #[must_use]
    pub fn all_subject_keepers(&self) -> &[String] {
        &self.all_subject_keepers
    }

    /// Returns the classification metadata fields kept in the output.
    #[must_use]
    pub fn metadata_keepers(&self) -> &[String] {
        &self.metadata_keepers
    }

    /// Returns the global cutoff; rows finishing at or after it are dropped.
    #[must_use]
    pub const fn stop_stamp(&self) -> DateTime<Utc> {
        self.stop_stamp
    }

    /// Returns the projects in catalogue order.
    #[must_use]
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Returns the pseudo-workflow split, if configured.
    #[must_use]
    pub const fn split(&self) -> Option<&PseudoWorkflowSplit> {
        self.split.as_ref()
    }

    /// Returns the label of an exported or derived workflow.
    #[must_use]
    pub fn label(&self, id: WorkflowId) -> Option<&str> {
        self.workflows.get(&id).map(WorkflowConfig::label).or_else(|| {
            self.split
                .as_ref()
                .filter(|split| split.child_id == id)
                .map(PseudoWorkflowSplit::child_label)
        })
    }
}

fn check_keys<'a>(
    table: &'static str,
    reference: &BTreeSet<WorkflowId>,
    keys: impl Iterator<Item = &'a WorkflowId>,
) -> Result<(), ConfigError> {
    let present: BTreeSet<WorkflowId> = keys.copied().collect();
    if &present == reference {
        return Ok(());
    }
    Err(ConfigError::TableKeysDiffer {
        table,
        missing: reference.difference(&present).copied().collect(),
        unexpected: present.difference(reference).copied().collect(),
    })
}

fn validate_split(
    raw: RawSplit,
    exported: &BTreeSet<WorkflowId>,
    labels: &BTreeMap<WorkflowId, String>,
    workflow_types: &BTreeMap<WorkflowId, String>,
) -> Result<PseudoWorkflowSplit, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidSplit { message };
    if !exported.contains(&raw.parent) {
        return Err(invalid(format!(
            "parent workflow {} is not exported",
            raw.parent
        )));
    }
    if exported.contains(&raw.child_id) {
        return Err(invalid(format!(
            "child workflow {} clashes with an exported workflow",
            raw.child_id
        )));
    }
    for (field, value) in [
        ("childName", &raw.child_name),
        ("groupField", &raw.group_field),
        ("orderField", &raw.order_field),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!("{field} must not be empty")));
        }
    }
    Ok(PseudoWorkflowSplit {
        parent: raw.parent,
        child_id: raw.child_id,
        child_name: raw.child_name,
        child_label: labels.get(&raw.child_id).cloned().unwrap_or_default(),
        child_type: workflow_types.get(&raw.child_id).cloned().unwrap_or_default(),
        group_field: raw.group_field,
        order_field: raw.order_field,
    })
}

fn validate_projects(
    raw: Vec<RawProject>,
    known: &BTreeSet<WorkflowId>,
) -> Result<Vec<Project>, ConfigError> {
    let mut slugs = HashSet::new();
    raw.into_iter()
        .map(|project| {
            if let Some(unknown) = project.workflows.iter().find(|id| !known.contains(id)) {
                return Err(ConfigError::UnknownProjectWorkflow {
                    project: project.name,
                    workflow_id: *unknown,
                });
            }
            let location_templates = project
                .location_templates
                .into_iter()
                .map(|(column, template)| Ok((column, LocationTemplate::parse(&template)?)))
                .collect::<Result<Vec<_>, ConfigError>>()?;
            let built = Project {
                name: project.name,
                workflows: project.workflows,
                subjects_file: project.subjects_file,
                url: project.url,
                location_templates,
                plain_location_prefix: project.plain_location_prefix,
            };
            if !slugs.insert(built.slug()) {
                return Err(ConfigError::Parse {
                    message: format!("project '{}' shares its file name with another", built.name),
                });
            }
            Ok(built)
        })
        .collect()
}

/// Raw JSON representation for deserialization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawCatalogue {
    version: u32,
    names: BTreeMap<WorkflowId, String>,
    keepers: BTreeMap<WorkflowId, BTreeSet<String>>,
    subject_keepers: BTreeMap<WorkflowId, Vec<String>>,
    start_stamps: BTreeMap<WorkflowId, DateTime<Utc>>,
    labels: BTreeMap<WorkflowId, String>,
    workflow_types: BTreeMap<WorkflowId, String>,
    all_subject_keepers: Vec<String>,
    metadata_keepers: Vec<String>,
    stop_stamp: DateTime<Utc>,
    #[serde(default)]
    projects: Vec<RawProject>,
    #[serde(default)]
    pseudo_workflow_split: Option<RawSplit>,
}

/// Raw JSON representation of a project.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawProject {
    name: String,
    workflows: Vec<WorkflowId>,
    subjects_file: String,
    url: String,
    #[serde(default)]
    location_templates: BTreeMap<String, String>,
    #[serde(default)]
    plain_location_prefix: Option<String>,
}

/// Raw JSON representation of the pseudo-workflow split.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSplit {
    parent: WorkflowId,
    child_id: WorkflowId,
    child_name: String,
    group_field: String,
    order_field: String,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const VALID_JSON: &str = r##"{
        "version": 1,
        "names": {"18504": "meetings", "19279": "herbarium-sheets"},
        "keepers": {"18504": ["38.91"], "19279": ["12.5", "12.6"]},
        "subjectKeepers": {"18504": ["date", "page"], "19279": ["barcode"]},
        "startStamps": {
            "18504": "2021-11-17T00:00:00Z",
            "19279": "2022-01-10T00:00:00Z"
        },
        "labels": {"1": "Attendance", "18504": "Meetings", "19279": "Sheets"},
        "workflowTypes": {"1": "tabular", "18504": "tabular", "19279": "specimen"},
        "allSubjectKeepers": ["#priority", "retired.retired_at"],
        "metadataKeepers": ["started_at", "finished_at", "utc_offset"],
        "stopStamp": "2023-01-01T00:00:00Z",
        "projects": [
            {
                "name": "Minutes & Sheets",
                "workflows": [18504, 1, 19279],
                "subjectsFile": "minutes-subjects.csv",
                "url": "https://example.org/projects/minutes/",
                "locationTemplates": {"location.rbge": "https://data.rbge.org.uk/herb/{subj.barcode}"},
                "plainLocationPrefix": "https://images.example.org/"
            }
        ],
        "pseudoWorkflowSplit": {
            "parent": 18504,
            "childId": 1,
            "childName": "attendance",
            "groupField": "subj.date",
            "orderField": "subj.page"
        }
    }"##;

    fn valid() -> serde_json::Value {
        serde_json::from_str(VALID_JSON).expect("valid fixture JSON")
    }

    fn with(path: &[&str], value: serde_json::Value) -> String {
        let mut doc = valid();
        let mut cursor = &mut doc;
        let (last, parents) = path.split_last().expect("non-empty path");
        for key in parents {
            cursor = cursor.get_mut(*key).expect("fixture key");
        }
        if let Some(object) = cursor.as_object_mut() {
            if value.is_null() {
                object.remove(*last);
            } else {
                object.insert((*last).to_owned(), value);
            }
        }
        doc.to_string()
    }

    #[test]
    fn parses_valid_catalogue() {
        let catalogue = Catalogue::from_json(VALID_JSON).expect("valid catalogue");

        let ids: Vec<u64> = catalogue.workflows().map(|wf| wf.id().get()).collect();
        assert_eq!(ids, vec![18504, 19279]);

        let sheets = catalogue
            .workflow(WorkflowId::new(19279))
            .expect("known workflow");
        assert_eq!(sheets.name(), "herbarium-sheets");
        assert!(sheets.keeps_version("12.6"));
        assert!(!sheets.keeps_version("12.60"));
        assert_eq!(sheets.subject_fields(), ["barcode"]);
        assert_eq!(sheets.label(), "Sheets");

        let split = catalogue.split().expect("split configured");
        assert_eq!(split.child_id(), WorkflowId::new(1));
        assert_eq!(split.child_label(), "Attendance");
        assert_eq!(catalogue.label(WorkflowId::new(1)), Some("Attendance"));
    }

    #[test]
    fn project_slug_replaces_spaces_and_ampersands() {
        let catalogue = Catalogue::from_json(VALID_JSON).expect("valid catalogue");
        let project = catalogue.projects().first().expect("one project");
        assert_eq!(project.slug(), "Minutes_and_Sheets");
        let (column, template) = project.location_templates().first().expect("template");
        assert_eq!(column, "location.rbge");
        assert_eq!(template.columns().collect::<Vec<_>>(), ["subj.barcode"]);
    }

    #[rstest]
    #[case::missing_start_stamp(
        &["startStamps", "19279"],
        "startStamps",
        vec![19279],
        vec![]
    )]
    #[case::extra_keeper(
        &["keepers", "7"],
        "keepers",
        vec![],
        vec![7]
    )]
    #[case::child_without_label(
        &["labels", "1"],
        "labels",
        vec![1],
        vec![]
    )]
    fn rejects_tables_with_different_keys(
        #[case] path: &[&str],
        #[case] table: &'static str,
        #[case] missing: Vec<u64>,
        #[case] unexpected: Vec<u64>,
    ) {
        let replacement = if unexpected.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::json!(["1"])
        };
        let result = Catalogue::from_json(&with(path, replacement));
        assert_eq!(
            result,
            Err(ConfigError::TableKeysDiffer {
                table,
                missing: missing.into_iter().map(WorkflowId::new).collect(),
                unexpected: unexpected.into_iter().map(WorkflowId::new).collect(),
            })
        );
    }

    #[test]
    fn rejects_unsupported_version() {
        let result = Catalogue::from_json(&with(&["version"], serde_json::json!(2)));
        assert_eq!(
            result,
            Err(ConfigError::UnsupportedVersion {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn rejects_project_with_unknown_workflow() {
        let mut doc = valid();
        doc["projects"][0]["workflows"] = serde_json::json!([18504, 42]);
        let result = Catalogue::from_json(&doc.to_string());
        assert_eq!(
            result,
            Err(ConfigError::UnknownProjectWorkflow {
                project: "Minutes & Sheets".to_owned(),
                workflow_id: WorkflowId::new(42),
            })
        );
    }

    #[test]
    fn rejects_split_child_that_is_exported() {
        let result = Catalogue::from_json(&with(
            &["pseudoWorkflowSplit", "childId"],
            serde_json::json!(19279),
        ));
        assert!(matches!(result, Err(ConfigError::InvalidSplit { .. })));
    }

    #[rstest]
    #[case::malformed_json("not valid json")]
    #[case::missing_names(r#"{"version": 1}"#)]
    fn rejects_json_with_parse_error(#[case] json: &str) {
        assert!(matches!(
            Catalogue::from_json(json),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn select_keeps_requested_order_and_rejects_unknown_ids() {
        let catalogue = Catalogue::from_json(VALID_JSON).expect("valid catalogue");
        let requested = [
            WorkflowId::new(19279),
            WorkflowId::new(18504),
            WorkflowId::new(19279),
        ];
        let names: Vec<&str> = catalogue
            .select(Some(&requested))
            .expect("known ids")
            .into_iter()
            .map(WorkflowConfig::name)
            .collect();
        assert_eq!(names, ["herbarium-sheets", "meetings"]);

        let derived = [WorkflowId::new(1)];
        assert_eq!(
            catalogue.select(Some(&derived)),
            Err(ConfigError::UnknownWorkflow {
                workflow_id: WorkflowId::new(1)
            })
        );
    }

    #[rstest]
    #[case("18504", vec![18504])]
    #[case(" 18504, 19279 ,", vec![18504, 19279])]
    fn parses_workflow_lists(#[case] value: &str, #[case] expected: Vec<u64>) {
        let ids = parse_workflow_list(value).expect("valid list");
        assert_eq!(ids, expected.into_iter().map(WorkflowId::new).collect::<Vec<_>>());
    }

    #[rstest]
    #[case("")]
    #[case("18504,abc")]
    fn rejects_bad_workflow_lists(#[case] value: &str) {
        assert!(matches!(
            parse_workflow_list(value),
            Err(ConfigError::InvalidSelection { .. })
        ));
    }

    #[rstest]
    #[case("https://x/{subj.barcode}", vec![
        TemplatePart::Literal("https://x/".to_owned()),
        TemplatePart::Column("subj.barcode".to_owned()),
    ])]
    #[case("{{literal}}", vec![TemplatePart::Literal("{literal}".to_owned())])]
    fn parses_location_templates(#[case] raw: &str, #[case] expected: Vec<TemplatePart>) {
        let template = LocationTemplate::parse(raw).expect("valid template");
        assert_eq!(template.parts(), expected.as_slice());
    }

    #[rstest]
    #[case("https://x/{subj.barcode")]
    #[case("https://x/{}")]
    #[case("https://x/}")]
    fn rejects_malformed_templates(#[case] raw: &str) {
        assert!(matches!(
            LocationTemplate::parse(raw),
            Err(ConfigError::Parse { .. })
        ));
    }
}
