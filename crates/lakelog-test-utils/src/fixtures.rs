//! Record batch fixtures.
//!
//! All fixtures share one schema so batches from different helpers can be
//! committed to the same table and concatenated by compaction.

use std::sync::Arc;

use arrow::array::{Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

/// Schema shared by every fixture: `id` (non-null i64), `region` and
/// `payload` (non-null utf8).
#[must_use]
pub fn fixture_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("region", DataType::Utf8, false),
        Field::new("payload", DataType::Utf8, false),
    ]))
}

/// Builds a batch of `rows` consecutive ids starting at `first_id`, all in
/// `region`.
#[must_use]
pub fn rows_batch(region: &str, first_id: i64, rows: usize) -> RecordBatch {
    let ids: Vec<i64> = (0..rows)
        .map(|offset| first_id + i64::try_from(offset).expect("row offset fits i64"))
        .collect();
    let regions = vec![region; rows];
    let payloads: Vec<String> = ids.iter().map(|id| format!("event-{id}")).collect();

    RecordBatch::try_new(
        fixture_schema(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(regions)),
            Arc::new(StringArray::from(payloads)),
        ],
    )
    .expect("fixture batch matches schema")
}

/// Collects every `id` value across `batches`, sorted.
#[must_use]
pub fn collect_ids(batches: &[RecordBatch]) -> Vec<i64> {
    let mut ids: Vec<i64> = batches
        .iter()
        .flat_map(|batch| {
            let column = batch
                .column_by_name("id")
                .expect("id column")
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("id is Int64");
            (0..column.len()).map(|i| column.value(i)).collect::<Vec<_>>()
        })
        .collect();
    ids.sort_unstable();
    ids
}
