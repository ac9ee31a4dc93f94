//! Column-ordered text tables keyed by classification id.
//!
//! Export files are heterogeneous: each workflow carries its own subject
//! fields and later stages append or remove columns. A [`Table`] keeps the
//! header order of its source and stores every cell as text. Each row keeps
//! its `classification_id` outside the cells, so values computed for a row
//! are joined back by that key rather than by position, and the key survives
//! even if its column is dropped from the output.

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;
use std::io::Read;

use crate::error::SchemaError;

/// Name of the column holding the row key.
pub const CLASSIFICATION_ID: &str = "classification_id";

/// One data row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    classification_id: u64,
    cells: Vec<String>,
}

impl Row {
    /// Returns the row key.
    #[must_use]
    pub const fn classification_id(&self) -> u64 {
        self.classification_id
    }

    /// Returns the cell at `index`, or an empty string when out of range.
    #[must_use]
    pub fn cell(&self, index: usize) -> &str {
        self.cells.get(index).map_or("", String::as_str)
    }

    fn set_cell(&mut self, index: usize, value: String) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = value;
        }
    }
}

/// An in-memory table of text cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
    keys: HashSet<u64>,
}

impl Table {
    /// Creates an empty table with the given header.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::MissingColumn`] when the header lacks
    /// `classification_id`, or [`SchemaError::ColumnCollision`] when a column
    /// name repeats.
    pub fn new(columns: Vec<String>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(SchemaError::ColumnCollision {
                    column: column.clone(),
                });
            }
        }
        if !seen.contains(CLASSIFICATION_ID) {
            return Err(SchemaError::MissingColumn {
                column: CLASSIFICATION_ID.to_owned(),
            });
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
            keys: HashSet::new(),
        })
    }

    /// Reads a headed CSV document.
    ///
    /// `context` names the source in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for malformed CSV, ragged rows, missing or
    /// unparseable classification ids and repeated classification ids.
    pub fn from_csv_reader<R: Read>(reader: R, context: &str) -> Result<Self, SchemaError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let csv_error = |err: csv::Error| SchemaError::Csv {
            context: context.to_owned(),
            message: err.to_string(),
        };

        let header = csv_reader.headers().map_err(csv_error)?;
        let mut table = Self::new(header.iter().map(str::to_owned).collect())?;

        for result in csv_reader.records() {
            let record = result.map_err(csv_error)?;
            table.push_row(record.iter().map(str::to_owned).collect())?;
        }
        Ok(table)
    }

    /// Reads a headed CSV document held in memory.
    ///
    /// # Errors
    ///
    /// See [`Table::from_csv_reader`].
    pub fn from_csv_str(text: &str, context: &str) -> Result<Self, SchemaError> {
        Self::from_csv_reader(text.as_bytes(), context)
    }

    /// Appends a row whose cells follow the header order.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the row is ragged, its classification id is
    /// not an unsigned integer, or the id is already present.
    pub fn push_row(&mut self, cells: Vec<String>) -> Result<(), SchemaError> {
        if cells.len() != self.columns.len() {
            return Err(SchemaError::RaggedRow {
                row: self.rows.len() + 1,
                expected: self.columns.len(),
                actual: cells.len(),
            });
        }
        let key_index = self.require_column(CLASSIFICATION_ID)?;
        let raw_key = cells.get(key_index).map_or("", String::as_str);
        let classification_id =
            raw_key
                .trim()
                .parse::<u64>()
                .map_err(|_| SchemaError::InvalidClassificationId {
                    value: raw_key.to_owned(),
                })?;
        self.insert(Row {
            classification_id,
            cells,
        })
    }

    fn insert(&mut self, row: Row) -> Result<(), SchemaError> {
        if !self.keys.insert(row.classification_id) {
            return Err(SchemaError::DuplicateClassification {
                classification_id: row.classification_id,
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Returns the header.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` when the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the position of `name` in the header.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Returns `true` when the header contains `name`.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Returns the position of `name`, failing when it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::MissingColumn`] when `name` is not a column.
    pub fn require_column(&self, name: &str) -> Result<usize, SchemaError> {
        self.column_index(name)
            .ok_or_else(|| SchemaError::MissingColumn {
                column: name.to_owned(),
            })
    }

    /// Looks up a cell by row key and column name.
    #[must_use]
    pub fn value(&self, classification_id: u64, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows
            .iter()
            .find(|row| row.classification_id == classification_id)
            .map(|row| row.cell(index))
    }

    /// Returns the distinct values of a column in order of first appearance.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::MissingColumn`] when `column` is absent.
    pub fn distinct_values(&self, column: &str) -> Result<Vec<String>, SchemaError> {
        let index = self.require_column(column)?;
        let mut seen = HashSet::new();
        Ok(self
            .rows
            .iter()
            .map(|row| row.cell(index))
            .filter(|value| seen.insert(*value))
            .map(str::to_owned)
            .collect())
    }

    /// Appends a column whose values are supplied per row key.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ColumnCollision`] if `name` already exists, or
    /// [`SchemaError::InvalidValue`] if a row has no supplied value.
    pub fn push_column<S: BuildHasher>(
        &mut self,
        name: &str,
        mut values: HashMap<u64, String, S>,
    ) -> Result<(), SchemaError> {
        if self.has_column(name) {
            return Err(SchemaError::ColumnCollision {
                column: name.to_owned(),
            });
        }
        let mut column = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let value =
                values
                    .remove(&row.classification_id)
                    .ok_or_else(|| SchemaError::InvalidValue {
                        classification_id: row.classification_id,
                        column: name.to_owned(),
                        value: String::new(),
                        message: "no value was supplied for this row".to_owned(),
                    })?;
            column.push(value);
        }
        for (row, value) in self.rows.iter_mut().zip(column) {
            row.cells.push(value);
        }
        self.columns.push(name.to_owned());
        Ok(())
    }

    /// Appends a column holding the same value in every row.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ColumnCollision`] if `name` already exists.
    pub fn push_constant_column(&mut self, name: &str, value: &str) -> Result<(), SchemaError> {
        let values: HashMap<u64, String> = self
            .rows
            .iter()
            .map(|row| (row.classification_id, value.to_owned()))
            .collect();
        self.push_column(name, values)
    }

    /// Rewrites every cell of `column` with `update(row, current)`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::MissingColumn`] when `column` is absent, or the
    /// first error produced by `update`.
    pub fn update_column<F>(&mut self, column: &str, mut update: F) -> Result<(), SchemaError>
    where
        F: FnMut(&Row, &str) -> Result<String, SchemaError>,
    {
        let index = self.require_column(column)?;
        for row in &mut self.rows {
            let next = update(row, row.cell(index))?;
            row.set_cell(index, next);
        }
        Ok(())
    }

    /// Removes the named columns.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::MissingColumn`] for the first name that is not a
    /// column; the table is unchanged in that case.
    pub fn drop_columns(&mut self, names: &[&str]) -> Result<(), SchemaError> {
        for name in names {
            self.require_column(name)?;
        }
        let keep: Vec<bool> = self
            .columns
            .iter()
            .map(|column| !names.contains(&column.as_str()))
            .collect();
        self.columns = retain_flagged(std::mem::take(&mut self.columns), &keep);
        for row in &mut self.rows {
            row.cells = retain_flagged(std::mem::take(&mut row.cells), &keep);
        }
        Ok(())
    }

    /// Keeps only the rows for which `keep` returns `true`.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `keep`; the table is unchanged in
    /// that case.
    pub fn retain<F>(&mut self, mut keep: F) -> Result<(), SchemaError>
    where
        F: FnMut(&Row) -> Result<bool, SchemaError>,
    {
        let flags = self
            .rows
            .iter()
            .map(&mut keep)
            .collect::<Result<Vec<_>, _>>()?;
        self.rows = retain_flagged(std::mem::take(&mut self.rows), &flags);
        self.keys = self.rows.iter().map(Row::classification_id).collect();
        Ok(())
    }

    /// Returns a copy holding only the rows for which `keep` returns `true`.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `keep`.
    pub fn filtered<F>(&self, keep: F) -> Result<Self, SchemaError>
    where
        F: FnMut(&Row) -> Result<bool, SchemaError>,
    {
        let mut copy = self.clone();
        copy.retain(keep)?;
        Ok(copy)
    }

    /// Concatenates tables in order.
    ///
    /// The header is the union of all headers in order of first appearance;
    /// cells for columns a table lacks are empty.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DuplicateClassification`] when a classification
    /// id appears in more than one table, or [`SchemaError::MissingColumn`]
    /// when `tables` is empty.
    pub fn concat(tables: Vec<Self>) -> Result<Self, SchemaError> {
        let mut columns: Vec<String> = Vec::new();
        for table in &tables {
            for column in &table.columns {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        let mut combined = Self::new(columns)?;
        for table in tables {
            let positions: Vec<Option<usize>> = combined
                .columns
                .iter()
                .map(|column| table.column_index(column))
                .collect();
            for row in table.rows {
                let cells = positions
                    .iter()
                    .map(|position| position.map_or_else(String::new, |index| row.cell(index).to_owned()))
                    .collect();
                combined.insert(Row {
                    classification_id: row.classification_id,
                    cells,
                })?;
            }
        }
        Ok(combined)
    }

    /// Serialises the table as CSV with `\n` line endings.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Csv`] if serialisation fails.
    pub fn to_csv(&self) -> Result<Vec<u8>, SchemaError> {
        let csv_error = |message: String| SchemaError::Csv {
            context: "output table".to_owned(),
            message,
        };
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(&self.columns)
            .map_err(|err| csv_error(err.to_string()))?;
        for row in &self.rows {
            writer
                .write_record(&row.cells)
                .map_err(|err| csv_error(err.to_string()))?;
        }
        writer.into_inner().map_err(|err| csv_error(err.to_string()))
    }
}

fn retain_flagged<T>(items: Vec<T>, flags: &[bool]) -> Vec<T> {
    items
        .into_iter()
        .zip(flags)
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect()
}
