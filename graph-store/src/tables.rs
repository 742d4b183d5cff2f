use std::fs::File;
use std::path::Path;

use arrow_array::{
    Array, Float32Array, Float64Array, Int32Array, Int64Array, LargeListArray, LargeStringArray,
    ListArray, RecordBatch, StringArray,
};
use common::error::AppError;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::debug;

/// Parquet file names inside the context directory. Overridable, with the
/// documented defaults.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub nodes: String,
    pub entities: String,
    pub community_reports: String,
    pub text_units: String,
    pub relationships: String,
    pub covariates: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            nodes: "nodes.parquet".to_string(),
            entities: "entities.parquet".to_string(),
            community_reports: "community_reports.parquet".to_string(),
            text_units: "text_units.parquet".to_string(),
            relationships: "relationships.parquet".to_string(),
            covariates: "covariates.parquet".to_string(),
        }
    }
}

/// Raw columnar tables as read from disk, before projection into domain
/// records. Covariates are optional in the on-disk layout.
#[derive(Debug)]
pub struct GraphTables {
    pub nodes: Vec<RecordBatch>,
    pub entities: Vec<RecordBatch>,
    pub community_reports: Vec<RecordBatch>,
    pub text_units: Vec<RecordBatch>,
    pub relationships: Vec<RecordBatch>,
    pub covariates: Option<Vec<RecordBatch>>,
}

impl GraphTables {
    pub fn from_directory(
        directory: impl AsRef<Path>,
        names: &TableNames,
    ) -> Result<Self, AppError> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            return Err(AppError::DirectoryNotFound(
                directory.display().to_string(),
            ));
        }

        let covariates_path = directory.join(&names.covariates);
        let covariates = if covariates_path.exists() {
            Some(read_table(&covariates_path)?)
        } else {
            None
        };

        let tables = Self {
            nodes: read_table(&directory.join(&names.nodes))?,
            entities: read_table(&directory.join(&names.entities))?,
            community_reports: read_table(&directory.join(&names.community_reports))?,
            text_units: read_table(&directory.join(&names.text_units))?,
            relationships: read_table(&directory.join(&names.relationships))?,
            covariates,
        };
        debug!(
            nodes = row_count(&tables.nodes),
            entities = row_count(&tables.entities),
            community_reports = row_count(&tables.community_reports),
            text_units = row_count(&tables.text_units),
            relationships = row_count(&tables.relationships),
            "Loaded graph tables"
        );
        Ok(tables)
    }
}

fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

fn read_table(path: &Path) -> Result<Vec<RecordBatch>, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::SchemaMismatch(format!("cannot open table {}: {e}", path.display()))
    })?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| {
            AppError::SchemaMismatch(format!("invalid parquet file {}: {e}", path.display()))
        })?
        .build()
        .map_err(|e| {
            AppError::SchemaMismatch(format!("invalid parquet file {}: {e}", path.display()))
        })?;
    reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::SchemaMismatch(format!("cannot read {}: {e}", path.display())))
}

/// Fails with `SchemaMismatch` when a non-empty table lacks `column`.
pub(crate) fn require_column(
    batches: &[RecordBatch],
    table: &str,
    column: &str,
) -> Result<(), AppError> {
    match batches.first() {
        Some(batch) if batch.schema().column_with_name(column).is_none() => Err(
            AppError::SchemaMismatch(format!("table {table} is missing column {column}")),
        ),
        _ => Ok(()),
    }
}

/// String cell value; numeric columns render as their decimal string, which
/// covers community ids stored as integers or floats.
pub(crate) fn utf8_at(batch: &RecordBatch, name: &str, row: usize) -> Option<String> {
    let array = batch.column_by_name(name)?;
    if array.is_null(row) {
        return None;
    }
    if let Some(strings) = array.as_any().downcast_ref::<StringArray>() {
        return Some(strings.value(row).to_string());
    }
    if let Some(strings) = array.as_any().downcast_ref::<LargeStringArray>() {
        return Some(strings.value(row).to_string());
    }
    if let Some(int) = i64_at(batch, name, row) {
        return Some(int.to_string());
    }
    f64_at(batch, name, row).map(|v| {
        if v.fract() == 0.0 {
            format!("{}", v as i64)
        } else {
            v.to_string()
        }
    })
}

pub(crate) fn i64_at(batch: &RecordBatch, name: &str, row: usize) -> Option<i64> {
    let array = batch.column_by_name(name)?;
    if array.is_null(row) {
        return None;
    }
    if let Some(ints) = array.as_any().downcast_ref::<Int64Array>() {
        return Some(ints.value(row));
    }
    if let Some(ints) = array.as_any().downcast_ref::<Int32Array>() {
        return Some(i64::from(ints.value(row)));
    }
    if let Some(floats) = array.as_any().downcast_ref::<Float64Array>() {
        return Some(floats.value(row) as i64);
    }
    None
}

pub(crate) fn f64_at(batch: &RecordBatch, name: &str, row: usize) -> Option<f64> {
    let array = batch.column_by_name(name)?;
    if array.is_null(row) {
        return None;
    }
    if let Some(floats) = array.as_any().downcast_ref::<Float64Array>() {
        return Some(floats.value(row));
    }
    if let Some(floats) = array.as_any().downcast_ref::<Float32Array>() {
        return Some(f64::from(floats.value(row)));
    }
    if let Some(ints) = array.as_any().downcast_ref::<Int64Array>() {
        return Some(ints.value(row) as f64);
    }
    if let Some(ints) = array.as_any().downcast_ref::<Int32Array>() {
        return Some(f64::from(ints.value(row)));
    }
    None
}

pub(crate) fn str_list_at(batch: &RecordBatch, name: &str, row: usize) -> Option<Vec<String>> {
    let array = batch.column_by_name(name)?;
    if array.is_null(row) {
        return None;
    }
    let values = if let Some(list) = array.as_any().downcast_ref::<ListArray>() {
        list.value(row)
    } else if let Some(list) = array.as_any().downcast_ref::<LargeListArray>() {
        list.value(row)
    } else {
        return None;
    };
    let mut out = Vec::with_capacity(values.len());
    if let Some(strings) = values.as_any().downcast_ref::<StringArray>() {
        for i in 0..strings.len() {
            if !strings.is_null(i) {
                out.push(strings.value(i).to_string());
            }
        }
    } else if let Some(strings) = values.as_any().downcast_ref::<LargeStringArray>() {
        for i in 0..strings.len() {
            if !strings.is_null(i) {
                out.push(strings.value(i).to_string());
            }
        }
    } else {
        return None;
    }
    Some(out)
}

pub(crate) fn f32_list_at(batch: &RecordBatch, name: &str, row: usize) -> Option<Vec<f32>> {
    let array = batch.column_by_name(name)?;
    if array.is_null(row) {
        return None;
    }
    let values = if let Some(list) = array.as_any().downcast_ref::<ListArray>() {
        list.value(row)
    } else if let Some(list) = array.as_any().downcast_ref::<LargeListArray>() {
        list.value(row)
    } else {
        return None;
    };
    let mut out = Vec::with_capacity(values.len());
    if let Some(floats) = values.as_any().downcast_ref::<Float64Array>() {
        for i in 0..floats.len() {
            if !floats.is_null(i) {
                out.push(floats.value(i) as f32);
            }
        }
    } else if let Some(floats) = values.as_any().downcast_ref::<Float32Array>() {
        for i in 0..floats.len() {
            if !floats.is_null(i) {
                out.push(floats.value(i));
            }
        }
    } else {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::GraphArtifacts;
    use std::sync::Arc;

    use arrow_array::builder::{Float64Builder, ListBuilder, StringBuilder};
    use arrow_array::ArrayRef;
    use arrow_schema::{DataType, Field, Schema};
    use parquet::arrow::ArrowWriter;

    fn write_parquet(path: &Path, batch: &RecordBatch) {
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(batch).unwrap();
        writer.close().unwrap();
    }

    fn string_column(values: &[&str]) -> StringArray {
        StringArray::from(values.to_vec())
    }

    fn nodes_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("title", DataType::Utf8, false),
            Field::new("level", DataType::Int64, false),
            Field::new("degree", DataType::Int64, false),
            Field::new("community", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(string_column(&["Alpha", "Beta", "Gamma", "Deep"])) as ArrayRef,
                Arc::new(Int64Array::from(vec![0, 0, 1, 3])),
                Arc::new(Int64Array::from(vec![5, 3, 1, 9])),
                Arc::new(Int64Array::from(vec![Some(1), Some(1), Some(2), Some(4)])),
            ],
        )
        .unwrap()
    }

    fn entities_batch() -> RecordBatch {
        let mut embedding = ListBuilder::new(Float64Builder::new());
        for _ in 0..4 {
            embedding.values().append_value(0.6);
            embedding.values().append_value(0.8);
            embedding.append(true);
        }
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("description", DataType::Utf8, true),
            Field::new(
                "description_embedding",
                DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
                true,
            ),
            Field::new(
                "text_unit_ids",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
                true,
            ),
        ]));
        let mut text_units = ListBuilder::new(StringBuilder::new());
        for unit in ["u1", "u2", "u3", "u4"] {
            text_units.values().append_value(unit);
            text_units.append(true);
        }
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(string_column(&["e1", "e2", "e3", "e4"])) as ArrayRef,
                Arc::new(string_column(&["Alpha", "Beta", "Gamma", "Deep"])),
                Arc::new(string_column(&["first", "second", "third", "deep"])),
                Arc::new(embedding.finish()),
                Arc::new(text_units.finish()),
            ],
        )
        .unwrap()
    }

    fn reports_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("community", DataType::Int64, false),
            Field::new("level", DataType::Int64, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("summary", DataType::Utf8, false),
            Field::new("full_content", DataType::Utf8, false),
            Field::new("rank", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(string_column(&["r1", "r2", "r3"])) as ArrayRef,
                Arc::new(Int64Array::from(vec![1, 2, 4])),
                Arc::new(Int64Array::from(vec![0, 1, 3])),
                Arc::new(string_column(&["One", "Two", "Four"])),
                Arc::new(string_column(&["s1", "s2", "s4"])),
                Arc::new(string_column(&["c1", "c2", "c4"])),
                Arc::new(Float64Array::from(vec![Some(7.5), Some(2.0), Some(9.0)])),
            ],
        )
        .unwrap()
    }

    fn relationships_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("target", DataType::Utf8, false),
            Field::new("weight", DataType::Float64, true),
            Field::new("description", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(string_column(&["rel1"])) as ArrayRef,
                Arc::new(string_column(&["Alpha"])),
                Arc::new(string_column(&["Beta"])),
                Arc::new(Float64Array::from(vec![None::<f64>])),
                Arc::new(string_column(&["alpha links beta"])),
            ],
        )
        .unwrap()
    }

    fn text_units_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(string_column(&["u1", "u2"])) as ArrayRef,
                Arc::new(string_column(&["unit one", "unit two"])),
            ],
        )
        .unwrap()
    }

    fn write_fixture_directory(dir: &Path) {
        let names = TableNames::default();
        write_parquet(&dir.join(&names.nodes), &nodes_batch());
        write_parquet(&dir.join(&names.entities), &entities_batch());
        write_parquet(&dir.join(&names.community_reports), &reports_batch());
        write_parquet(&dir.join(&names.relationships), &relationships_batch());
        write_parquet(&dir.join(&names.text_units), &text_units_batch());
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let err = GraphTables::from_directory("/definitely/not/here", &TableNames::default())
            .unwrap_err();
        assert!(matches!(err, AppError::DirectoryNotFound(_)));
    }

    #[test]
    fn test_missing_table_is_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let err = GraphTables::from_directory(dir.path(), &TableNames::default()).unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch(_)));
    }

    #[test]
    fn test_projection_filters_by_community_level() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture_directory(dir.path());

        let tables = GraphTables::from_directory(dir.path(), &TableNames::default()).unwrap();
        let artifacts = GraphArtifacts::load(&tables, 2).unwrap();

        // "Deep" sits at level 3 and must be excluded
        let titles: Vec<&str> = artifacts.entities.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Alpha", "Beta", "Gamma"]);
        let alpha = &artifacts.entities[0];
        assert_eq!(alpha.rank, 5);
        assert_eq!(alpha.community_ids.as_deref(), Some(&["1".to_string()][..]));
        assert_eq!(alpha.description_embedding.as_ref().map(Vec::len), Some(2));

        // report r3 belongs to community 4 which only "Deep" references
        let report_ids: Vec<&str> = artifacts
            .community_reports
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(report_ids, vec!["r1", "r2"]);

        // missing weight falls back to the default
        assert!((artifacts.relationships[0].weight - 1.0).abs() < f64::EPSILON);
        assert_eq!(artifacts.text_units.len(), 2);
        assert!(artifacts.covariates.is_empty());
    }
}
