//! Parquet data files and content fingerprints.
//!
//! Data files are immutable Parquet objects. Encoding is deterministic for
//! identical input, which lets a restarted writer recognise a file it
//! already uploaded.

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};

use crate::error::{Result, TableError};

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Digest of an ingest batch's idempotency key, as stored in the log.
#[must_use]
pub fn batch_digest(idempotency_key: &str) -> String {
    sha256_hex(idempotency_key.as_bytes())
}

/// File id for a writer file derived from the batches it holds.
///
/// Order-independent, so regrouping the same batches yields the same id.
#[must_use]
pub fn file_id_for_batches(digests: &[String]) -> String {
    let mut sorted: Vec<&str> = digests.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut id = sha256_hex(sorted.join("\n").as_bytes());
    id.truncate(32);
    id
}

/// An encoded data file ready for upload.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// Parquet bytes.
    pub data: Bytes,
    /// Rows in the file.
    pub row_count: u64,
    /// SHA-256 of `data`.
    pub fingerprint: String,
}

/// Encodes batches sharing one schema into a single Parquet file.
///
/// # Errors
///
/// Returns `TableError::DataFile` for an empty input, mismatched schemas or
/// writer failures.
pub fn encode(batches: &[RecordBatch]) -> Result<EncodedFile> {
    let first = batches
        .first()
        .ok_or_else(|| TableError::data_file("cannot encode an empty batch list"))?;
    let schema = first.schema();

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, Arc::clone(&schema), Some(props))
        .map_err(|e| TableError::data_file(format!("parquet writer init failed: {e}")))?;
    let mut row_count = 0_u64;
    for batch in batches {
        if batch.schema() != schema {
            return Err(TableError::data_file(
                "all batches in one file must share a schema",
            ));
        }
        writer
            .write(batch)
            .map_err(|e| TableError::data_file(format!("parquet write failed: {e}")))?;
        row_count += batch.num_rows() as u64;
    }
    writer
        .close()
        .map_err(|e| TableError::data_file(format!("parquet close failed: {e}")))?;

    let fingerprint = sha256_hex(&buffer);
    Ok(EncodedFile {
        data: Bytes::from(buffer),
        row_count,
        fingerprint,
    })
}

/// Decodes every batch of a Parquet file.
///
/// # Errors
///
/// Returns `TableError::DataFile` if the bytes are not valid Parquet.
pub fn decode(data: Bytes) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(|e| TableError::data_file(format!("parquet reader init failed: {e}")))?
        .build()
        .map_err(|e| TableError::data_file(format!("parquet reader build failed: {e}")))?;
    reader
        .map(|batch| {
            batch.map_err(|e| TableError::data_file(format!("parquet read batch failed: {e}")))
        })
        .collect()
}

/// Concatenates batches and cuts the result into chunks of at most
/// `rows_per_chunk` rows, preserving row order.
///
/// # Errors
///
/// Returns `TableError::DataFile` if the batches do not share `schema`.
pub fn rechunk(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    rows_per_chunk: usize,
) -> Result<Vec<RecordBatch>> {
    let combined = concat_batches(schema, batches)
        .map_err(|e| TableError::data_file(format!("concat failed: {e}")))?;
    let total = combined.num_rows();
    let chunk = rows_per_chunk.max(1);
    Ok((0..total)
        .step_by(chunk)
        .map(|offset| combined.slice(offset, chunk.min(total - offset)))
        .collect())
}

#[cfg(test)]
mod tests {
    use lakelog_test_utils::{collect_ids, fixture_schema, rows_batch};

    use super::*;

    #[test]
    fn encode_decode_preserves_rows() {
        let batches = vec![rows_batch("eu", 0, 5), rows_batch("eu", 5, 3)];
        let file = encode(&batches).expect("encode");
        assert_eq!(file.row_count, 8);
        assert_eq!(file.fingerprint, sha256_hex(&file.data));

        let decoded = decode(file.data).expect("decode");
        assert_eq!(collect_ids(&decoded), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode(&[rows_batch("eu", 0, 10)]).expect("encode");
        let b = encode(&[rows_batch("eu", 0, 10)]).expect("encode");
        assert_eq!(a.fingerprint, b.fingerprint);
        let c = encode(&[rows_batch("eu", 1, 10)]).expect("encode");
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(encode(&[]), Err(TableError::DataFile { .. })));
        assert!(decode(Bytes::from_static(b"not parquet")).is_err());
    }

    #[test]
    fn file_id_ignores_batch_order() {
        let a = file_id_for_batches(&["x".into(), "y".into()]);
        let b = file_id_for_batches(&["y".into(), "x".into(), "x".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, file_id_for_batches(&["x".into()]));
    }

    #[test]
    fn rechunk_preserves_order_and_bounds_chunk_size() {
        let batches = vec![rows_batch("eu", 0, 4), rows_batch("eu", 4, 3)];
        let chunks = rechunk(&fixture_schema(), &batches, 3).expect("rechunk");
        let sizes: Vec<usize> = chunks.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(collect_ids(&chunks), (0..7).collect::<Vec<_>>());
    }
}
