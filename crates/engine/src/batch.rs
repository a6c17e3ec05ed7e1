//! Accumulates the records written for one command.

use crate::processor::ProcessingError;
use crate::record::{Record, encoded_len};

/// Follow-up records of one processing step, written as one block.
#[derive(Debug)]
pub(crate) struct RecordBatch {
    records: Vec<Record>,
    bytes: usize,
    max_bytes: usize,
    max_records: usize,
}

impl RecordBatch {
    pub(crate) fn new(max_bytes: usize, max_records: usize) -> Self {
        Self {
            records: Vec::new(),
            bytes: 0,
            max_bytes,
            max_records,
        }
    }

    /// Add a record, refusing it if the batch would outgrow its limits.
    pub(crate) fn append(&mut self, record: Record) -> Result<(), ProcessingError> {
        let size = encoded_len(&record).map_err(|e| ProcessingError::Failed(e.to_string()))?;

        if self.records.len() + 1 > self.max_records {
            return Err(ProcessingError::BatchSizeExceeded(format!(
                "more than {} records",
                self.max_records
            )));
        }
        if self.bytes + size > self.max_bytes {
            return Err(ProcessingError::BatchSizeExceeded(format!(
                "{} bytes exceed the limit of {}",
                self.bytes + size,
                self.max_bytes
            )));
        }

        self.bytes += size;
        self.records.push(record);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn into_records(self) -> Vec<Record> {
        self.records
    }
}
