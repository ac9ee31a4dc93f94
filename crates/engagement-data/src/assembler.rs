//! Assembly of per-workflow exports into the unified table.
//!
//! The order of the stages matters. Every raw export is pseudonymised
//! before the unified table is touched, so the identity dictionary covers
//! everyone who ever classified. The pseudo-workflow split runs before the
//! temporal filter, because dropping rows first would change which page of a
//! group comes first.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::catalogue::{Catalogue, PseudoWorkflowSplit, WorkflowId};
use crate::error::{PipelineError, SchemaError};
use crate::identity::{IdentityRegistry, Pseudonym, RawIdentity};
use crate::json_fields::{JsonShape, expand};
use crate::table::{Row, Table};
use crate::workflow_reader::{START_STAMP_COLUMN, WorkflowExport};

/// Prefix of flattened classification metadata.
pub const METADATA_PREFIX: &str = "md";

/// Column holding the pseudonym in the unified table.
pub const PSEUDONYM_COLUMN: &str = "pseudonym";

const IDENTITY_COLUMNS: [&str; 3] = ["user_name", "user_id", "user_ip"];
const UNUSED_COLUMNS: [&str; 2] = ["gold_standard", "expert"];
const ANALYSIS_ONLY_DROPS: [&str; 1] = ["annotations"];

/// A pseudonymised copy of one workflow export.
#[derive(Debug, Clone)]
pub struct PseudonymisedExport {
    /// Export name of the workflow.
    pub name: String,
    /// All rows of the export with identity cells replaced.
    pub table: Table,
}

/// Output of a successful assembly.
#[derive(Debug, Clone)]
pub struct Assembly {
    /// Unified table without the columns analysis never reads.
    pub analysis: Table,
    /// Unified table with every column kept, for per-project sharing.
    pub sharing: Table,
    /// Minimally processed per-workflow exports, in read order.
    pub exports: Vec<PseudonymisedExport>,
}

/// Builds the unified table from prepared workflow exports.
#[derive(Debug)]
pub struct RecordAssembler<'a> {
    catalogue: &'a Catalogue,
}

impl<'a> RecordAssembler<'a> {
    /// Creates an assembler for the given catalogue.
    #[must_use]
    pub const fn new(catalogue: &'a Catalogue) -> Self {
        Self { catalogue }
    }

    /// Runs every assembly stage in order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a row cannot be pseudonymised, a column
    /// is missing, metadata does not expand, or a timestamp cannot be parsed.
    pub fn assemble(
        &self,
        exports: Vec<WorkflowExport>,
        registry: &mut IdentityRegistry,
    ) -> Result<Assembly, PipelineError> {
        let mut pseudonymised = Vec::with_capacity(exports.len());
        let mut prepared = Vec::with_capacity(exports.len());
        for export in exports {
            let name = export.name().to_owned();
            let (raw, table) = export.into_parts();
            prepared.push(table);
            pseudonymised.push(PseudonymisedExport { name, table: raw });
        }

        for export in &mut pseudonymised {
            pseudonymise_export(&mut export.table, registry)?;
        }

        let mut unified = Table::concat(prepared)?;
        attach_pseudonyms(&mut unified, registry)?;

        let mut drops: Vec<&str> = IDENTITY_COLUMNS.to_vec();
        drops.extend(UNUSED_COLUMNS.iter().filter(|column| unified.has_column(column)));
        unified.drop_columns(&drops)?;

        expand(
            &mut unified,
            "metadata",
            self.catalogue.metadata_keepers(),
            METADATA_PREFIX,
            JsonShape::Plain,
        )?;

        if let Some(split) = self.catalogue.split() {
            split_pseudo_workflow(&mut unified, split)?;
        }

        let before = unified.len();
        apply_temporal_cutoffs(&mut unified, self.catalogue.stop_stamp())?;
        unified.drop_columns(&[START_STAMP_COLUMN])?;
        info!(
            kept = unified.len(),
            dropped = before - unified.len(),
            identities = registry.len(),
            "assembled unified table"
        );

        let sharing = unified.clone();
        let mut analysis = unified;
        let analysis_drops: Vec<&str> = ANALYSIS_ONLY_DROPS
            .iter()
            .copied()
            .filter(|column| analysis.has_column(column))
            .collect();
        analysis.drop_columns(&analysis_drops)?;

        Ok(Assembly {
            analysis,
            sharing,
            exports: pseudonymised,
        })
    }
}

fn resolve_all(
    table: &Table,
    registry: &mut IdentityRegistry,
) -> Result<HashMap<u64, Pseudonym>, PipelineError> {
    let user_id = table.require_column("user_id")?;
    let user_ip = table.require_column("user_ip")?;
    let mut resolved = HashMap::with_capacity(table.len());
    for row in table.rows() {
        let identity =
            RawIdentity::from_cells(row.classification_id(), row.cell(user_id), row.cell(user_ip))?;
        resolved.insert(row.classification_id(), registry.resolve(&identity)?);
    }
    Ok(resolved)
}

/// Replaces the identity cells of a raw export.
///
/// `user_name` becomes the pseudonym; `user_id` holds its digits for
/// logged-in volunteers and `user_ip` holds them for anonymous ones, the
/// other cell being emptied.
///
/// # Errors
///
/// Returns [`PipelineError`] if an identity column is missing, a row has no
/// usable identity, or the registry cannot assign a pseudonym.
pub fn pseudonymise_export(
    table: &mut Table,
    registry: &mut IdentityRegistry,
) -> Result<(), PipelineError> {
    table.require_column("user_name")?;
    let resolved = resolve_all(table, registry)?;
    let pseudonym_of = |row: &Row| {
        resolved
            .get(&row.classification_id())
            .ok_or_else(|| SchemaError::InvalidValue {
                classification_id: row.classification_id(),
                column: "user_name".to_owned(),
                value: String::new(),
                message: "row has no resolved identity".to_owned(),
            })
    };

    table.update_column("user_name", |row, _| Ok(pseudonym_of(row)?.as_str().to_owned()))?;
    table.update_column("user_id", |row, _| {
        let pseudonym = pseudonym_of(row)?;
        Ok(if pseudonym.is_anonymous() {
            String::new()
        } else {
            pseudonym.digits().to_owned()
        })
    })?;
    table.update_column("user_ip", |row, _| {
        let pseudonym = pseudonym_of(row)?;
        Ok(if pseudonym.is_anonymous() {
            pseudonym.digits().to_owned()
        } else {
            String::new()
        })
    })?;
    Ok(())
}

fn attach_pseudonyms(
    table: &mut Table,
    registry: &mut IdentityRegistry,
) -> Result<(), PipelineError> {
    let values: HashMap<u64, String> = resolve_all(table, registry)?
        .into_iter()
        .map(|(classification_id, pseudonym)| (classification_id, pseudonym.to_string()))
        .collect();
    table.push_column(PSEUDONYM_COLUMN, values)?;
    Ok(())
}

fn parse_order(row: &Row, index: usize, column: &str) -> Result<u64, SchemaError> {
    let raw = row.cell(index);
    raw.trim().parse().map_err(|_| SchemaError::InvalidValue {
        classification_id: row.classification_id(),
        column: column.to_owned(),
        value: raw.to_owned(),
        message: "page ordering values must be unsigned integers".to_owned(),
    })
}

/// Moves the first page of every group in the parent workflow to the
/// synthetic child workflow.
///
/// Rows of the parent are grouped by the split's group field; every row
/// whose order value equals the smallest order value of its group is
/// reassigned, so all classifications of the first page move together.
/// A table without parent rows is left alone.
///
/// # Errors
///
/// Returns [`SchemaError`] if a required column is missing or an order
/// value of a parent row is not an unsigned integer.
pub fn split_pseudo_workflow(
    table: &mut Table,
    split: &PseudoWorkflowSplit,
) -> Result<usize, SchemaError> {
    let workflow = table.require_column("workflow_id")?;
    let parent = split.parent();
    let in_parent =
        |row: &Row| row.cell(workflow).trim().parse::<WorkflowId>() == Ok(parent);
    if !table.rows().iter().any(&in_parent) {
        return Ok(0);
    }
    let group = table.require_column(split.group_field())?;
    let order = table.require_column(split.order_field())?;

    let (groups, moved) = first_pages(table, split, group, order, &in_parent)?;
    let reassigned = moved.values().filter(|is_first| **is_first).count();

    let is_moved = |row: &Row| moved.get(&row.classification_id()).copied().unwrap_or(false);
    let child_id = split.child_id().to_string();
    table.update_column("workflow_id", |row, current| {
        Ok(if is_moved(row) { child_id.clone() } else { current.to_owned() })
    })?;
    if table.has_column("workflow_name") {
        table.update_column("workflow_name", |row, current| {
            Ok(if is_moved(row) {
                split.child_name().to_owned()
            } else {
                current.to_owned()
            })
        })?;
    }

    info!(
        parent = %parent,
        child = %split.child_id(),
        groups,
        reassigned,
        "split pseudo-workflow"
    );
    Ok(reassigned)
}

/// Finds the rows holding the first page of their group.
///
/// Returns the number of groups and, per row key, whether the row is on the
/// first page of a parent-workflow group.
fn first_pages(
    table: &Table,
    split: &PseudoWorkflowSplit,
    group: usize,
    order: usize,
    in_parent: &impl Fn(&Row) -> bool,
) -> Result<(usize, HashMap<u64, bool>), SchemaError> {
    let mut first: BTreeMap<&str, u64> = BTreeMap::new();
    for row in table.rows().iter().filter(|row| in_parent(*row)) {
        let page = parse_order(row, order, split.order_field())?;
        first
            .entry(row.cell(group))
            .and_modify(|smallest| *smallest = (*smallest).min(page))
            .or_insert(page);
    }

    let mut moved = HashMap::with_capacity(table.len());
    for row in table.rows() {
        let is_first = in_parent(row)
            && first.get(row.cell(group)) == Some(&parse_order(row, order, split.order_field())?);
        moved.insert(row.classification_id(), is_first);
    }
    Ok((first.len(), moved))
}

fn parse_stamp(row: &Row, index: usize, column: &str) -> Result<DateTime<Utc>, SchemaError> {
    let raw = row.cell(index);
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|stamp| stamp.with_timezone(&Utc))
        .map_err(|err| SchemaError::InvalidValue {
            classification_id: row.classification_id(),
            column: column.to_owned(),
            value: raw.to_owned(),
            message: err.to_string(),
        })
}

/// Keeps rows that started at or after their workflow's start timestamp and
/// finished strictly before `stop`.
///
/// # Errors
///
/// Returns [`SchemaError`] if a timestamp column is missing or a value is
/// not an RFC 3339 timestamp.
pub fn apply_temporal_cutoffs(table: &mut Table, stop: DateTime<Utc>) -> Result<(), SchemaError> {
    let started_column = format!("{METADATA_PREFIX}.started_at");
    let finished_column = format!("{METADATA_PREFIX}.finished_at");
    let started = table.require_column(&started_column)?;
    let finished = table.require_column(&finished_column)?;
    let start = table.require_column(START_STAMP_COLUMN)?;

    table.retain(|row| {
        let window_start = parse_stamp(row, start, START_STAMP_COLUMN)?;
        let started_at = parse_stamp(row, started, &started_column)?;
        let finished_at = parse_stamp(row, finished, &finished_column)?;
        Ok(started_at >= window_start && finished_at < stop)
    })
}
