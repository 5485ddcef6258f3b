use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use parquet::basic::Type as PhysicalType;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use parquet::schema::types::Type as SchemaType;
use tracing::debug;

use crate::error::PipelineError;

/// Row identifier columns, in lookup order. They are always read as text so
/// integer ids keep every digit.
pub const ID_COLUMNS: [&str; 2] = ["id", "row_id"];

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Column-oriented table holding what was read from one parquet file.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    names: Vec<String>,
    columns: HashMap<String, Column>,
    rows: usize,
}

impl Frame {
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let mut frame = Frame::default();
        for (name, col) in columns {
            frame.insert(name, col)?;
        }
        Ok(frame)
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Adds or replaces a column; the first column fixes the row count.
    pub fn insert(&mut self, name: impl Into<String>, col: Column) -> Result<()> {
        let name = name.into();
        if self.names.is_empty() && self.columns.is_empty() {
            self.rows = col.len();
        }
        if col.len() != self.rows {
            return Err(anyhow!(PipelineError::Shape(format!(
                "column '{}' has {} rows, frame has {}",
                name,
                col.len(),
                self.rows
            ))));
        }
        if !self.columns.contains_key(&name) {
            self.names.push(name.clone());
        }
        self.columns.insert(name, col);
        Ok(())
    }

    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        match self.columns.get(name) {
            Some(Column::Numeric(v)) => Ok(v),
            Some(Column::Text(_)) => Err(anyhow!(PipelineError::NotNumeric(name.to_string()))),
            None => Err(anyhow!("column '{name}' not loaded")),
        }
    }

    /// Any column rendered as strings; used for ids and era labels.
    pub fn labels(&self, name: &str) -> Option<Vec<String>> {
        match self.columns.get(name)? {
            Column::Text(v) => Some(v.clone()),
            Column::Numeric(v) => Some(v.iter().map(|x| format_label(*x)).collect()),
        }
    }

    pub fn require_columns(&self, names: &[String], path: &Path) -> Result<()> {
        if let Some(missing) = names.iter().find(|n| !self.has_column(n)) {
            return Err(anyhow!(PipelineError::MissingColumn {
                column: missing.clone(),
                path: path.to_path_buf(),
            }));
        }
        Ok(())
    }

    /// Adds a constant numeric column for every absent name and returns
    /// the names that were filled.
    pub fn fill_missing(&mut self, names: &[String], value: f64) -> Result<Vec<String>> {
        let mut filled = Vec::new();
        for name in names {
            if !self.has_column(name) {
                self.insert(name.clone(), Column::Numeric(vec![value; self.rows]))?;
                filled.push(name.clone());
            }
        }
        Ok(filled)
    }

    pub fn feature_matrix(&self, names: &[String]) -> Result<FeatureMatrix> {
        let cols = names
            .iter()
            .map(|n| self.numeric(n))
            .collect::<Result<Vec<_>>>()?;
        let mut data = Vec::with_capacity(self.rows * cols.len());
        for row in 0..self.rows {
            for col in &cols {
                data.push(col[row]);
            }
        }
        FeatureMatrix::from_row_major(self.rows, names.len(), data)
    }

    /// Keeps the rows at `indices`, in that order.
    pub fn take_rows(&self, indices: &[usize]) -> Frame {
        let mut columns = HashMap::with_capacity(self.columns.len());
        for (name, col) in &self.columns {
            let taken = match col {
                Column::Numeric(v) => Column::Numeric(indices.iter().map(|&i| v[i]).collect()),
                Column::Text(v) => Column::Text(indices.iter().map(|&i| v[i].clone()).collect()),
            };
            columns.insert(name.clone(), taken);
        }
        Frame {
            names: self.names.clone(),
            columns,
            rows: indices.len(),
        }
    }
}

/// Dense row-major matrix of feature values.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn from_row_major(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if rows * cols != data.len() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "{} values cannot form a {}x{} matrix",
                data.len(),
                rows,
                cols
            ))));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(anyhow!(PipelineError::Shape("ragged rows".to_string())));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::from_row_major(rows.len(), cols, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        &self.data[idx * self.cols..(idx + 1) * self.cols]
    }

    pub fn row_mut(&mut self, idx: usize) -> &mut [f64] {
        &mut self.data[idx * self.cols..(idx + 1) * self.cols]
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.data[r * self.cols + col]).collect()
    }

    pub fn select_rows(&self, indices: &[usize]) -> FeatureMatrix {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        FeatureMatrix {
            rows: indices.len(),
            cols: self.cols,
            data,
        }
    }

    pub fn first_non_finite_column(&self) -> Option<usize> {
        self.data
            .iter()
            .position(|v| !v.is_finite())
            .map(|pos| pos % self.cols.max(1))
    }
}

enum ColumnBuilder {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl ColumnBuilder {
    fn push(&mut self, field: &Field) {
        match self {
            ColumnBuilder::Numeric(v) => v.push(field_as_f64(field)),
            ColumnBuilder::Text(v) => v.push(field_as_string(field)),
        }
    }

    fn finish(self) -> Column {
        match self {
            ColumnBuilder::Numeric(v) => Column::Numeric(v),
            ColumnBuilder::Text(v) => Column::Text(v),
        }
    }
}

/// Reads a flat parquet file. With `columns`, only those that exist in the
/// file are read; callers decide what a missing column means.
pub fn read_parquet(path: &Path, columns: Option<&[String]>) -> Result<Frame> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("open parquet reader {}", path.display()))?;

    let schema = reader.metadata().file_metadata().schema_descr_ptr();
    let root_fields = schema.root_schema().get_fields();

    let selected: Vec<Arc<SchemaType>> = match columns {
        Some(wanted) => {
            let wanted: HashSet<&str> = wanted.iter().map(|s| s.as_str()).collect();
            root_fields
                .iter()
                .filter(|f| wanted.contains(f.name()))
                .cloned()
                .collect()
        }
        None => root_fields.to_vec(),
    };

    let mut order = Vec::with_capacity(selected.len());
    let mut builders: HashMap<String, ColumnBuilder> = HashMap::with_capacity(selected.len());
    for field in &selected {
        let text = ID_COLUMNS.contains(&field.name())
            || (field.is_primitive()
                && matches!(
                    field.get_physical_type(),
                    PhysicalType::BYTE_ARRAY | PhysicalType::FIXED_LEN_BYTE_ARRAY
                ));
        let builder = if text {
            ColumnBuilder::Text(Vec::new())
        } else {
            ColumnBuilder::Numeric(Vec::new())
        };
        order.push(field.name().to_string());
        builders.insert(field.name().to_string(), builder);
    }

    if selected.is_empty() {
        let rows = reader.metadata().file_metadata().num_rows().max(0) as usize;
        debug!(path = %path.display(), rows, "no requested columns present");
        return Ok(Frame {
            names: Vec::new(),
            columns: HashMap::new(),
            rows,
        });
    }

    let projection = SchemaType::group_type_builder("schema")
        .with_fields(selected)
        .build()
        .context("build parquet projection")?;
    let iter = reader
        .get_row_iter(Some(projection))
        .with_context(|| format!("iterate rows of {}", path.display()))?;

    let mut rows = 0usize;
    for row in iter {
        let row = row.with_context(|| format!("decode row {} of {}", rows, path.display()))?;
        for (name, field) in row.get_column_iter() {
            if let Some(builder) = builders.get_mut(name.as_str()) {
                builder.push(field);
            }
        }
        rows += 1;
    }

    let mut frame = Frame::default();
    for name in order {
        if let Some(builder) = builders.remove(&name) {
            frame.insert(name, builder.finish())?;
        }
    }
    debug!(path = %path.display(), rows, cols = frame.names.len(), "parquet loaded");
    Ok(frame)
}

/// Top-level column names from the file footer, without reading any rows.
pub fn parquet_columns(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("open parquet reader {}", path.display()))?;
    Ok(reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .root_schema()
        .get_fields()
        .iter()
        .map(|f| f.name().to_string())
        .collect())
}

/// Row indices per era, eras ascending.
pub fn group_by_era(labels: &[String]) -> Vec<(String, Vec<usize>)> {
    let mut groups: BTreeMap<EraKey, Vec<usize>> = BTreeMap::new();
    let numeric = labels.iter().all(|l| l.trim().parse::<i64>().is_ok());
    for (idx, label) in labels.iter().enumerate() {
        let key = if numeric {
            EraKey::Number(label.trim().parse::<i64>().unwrap_or_default(), label.clone())
        } else {
            EraKey::Text(label.clone())
        };
        groups.entry(key).or_default().push(idx);
    }
    groups
        .into_iter()
        .map(|(key, rows)| (key.into_label(), rows))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EraKey {
    Number(i64, String),
    Text(String),
}

impl EraKey {
    fn into_label(self) -> String {
        match self {
            EraKey::Number(_, label) | EraKey::Text(label) => label,
        }
    }
}

impl Ord for EraKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (EraKey::Number(a, la), EraKey::Number(b, lb)) => a.cmp(b).then_with(|| la.cmp(lb)),
            (EraKey::Text(a), EraKey::Text(b)) => a.cmp(b),
            (EraKey::Number(..), EraKey::Text(_)) => Ordering::Less,
            (EraKey::Text(_), EraKey::Number(..)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for EraKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn field_as_f64(field: &Field) -> f64 {
    match field {
        Field::Bool(v) => {
            if *v {
                1.0
            } else {
                0.0
            }
        }
        Field::Byte(v) => *v as f64,
        Field::Short(v) => *v as f64,
        Field::Int(v) => *v as f64,
        Field::Long(v) => *v as f64,
        Field::UByte(v) => *v as f64,
        Field::UShort(v) => *v as f64,
        Field::UInt(v) => *v as f64,
        Field::ULong(v) => *v as f64,
        Field::Float(v) => *v as f64,
        Field::Double(v) => *v,
        Field::Str(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

fn field_as_string(field: &Field) -> String {
    match field {
        Field::Str(s) => s.clone(),
        Field::Null => String::new(),
        Field::Float(v) => format_label(*v as f64),
        Field::Double(v) => format_label(*v),
        other => other.to_string(),
    }
}

fn format_label(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
