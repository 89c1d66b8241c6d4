//! Columnar record encoder.
//!
//! The [`ColumnarEncoder`] transposes a batch of records into one byte buffer per column, with each value written as a
//! little-endian `u32` length followed by the value bytes. Column buffers are drawn from a [`BufferAllocator`], which is
//! typically a [`BoundedAllocator`][memory_accounting::BoundedAllocator] holding the encoder's memory budget.
//!
//! A batch that cannot be encoded within the budget is aborted as a whole: every buffer taken for it is handed back to
//! the allocator before the error is returned.

use std::fmt;

use memory_accounting::{BufferAllocator, LimitError};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

const LENGTH_PREFIX_LEN: usize = std::mem::size_of::<u32>();
const DEFAULT_INITIAL_CAPACITY: usize = 1024;

/// Error encountered while encoding a batch.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EncodeError {
    /// A column buffer could not be allocated or grown within the memory limit.
    #[snafu(display("failed to allocate buffer for column '{}'", column))]
    Allocation {
        /// Name of the column being written.
        column: String,

        /// The allocator's error.
        source: LimitError,
    },

    /// A record did not have one value per column.
    #[snafu(display("record {} has {} values, expected {}", record, actual, expected))]
    ArityMismatch {
        /// Index of the record within the batch.
        record: usize,

        /// Number of columns.
        expected: usize,

        /// Number of values in the record.
        actual: usize,
    },

    /// A value was too large for its length prefix.
    #[snafu(display("value of {} bytes in column '{}' is too large to encode", len, column))]
    ValueTooLarge {
        /// Name of the column being written.
        column: String,

        /// Length of the value, in bytes.
        len: usize,
    },
}

impl EncodeError {
    /// Returns the allocator's error if the batch was aborted for exceeding the memory limit.
    pub fn limit_error(&self) -> Option<&LimitError> {
        match self {
            Self::Allocation { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A growable byte buffer backed by a [`BufferAllocator`].
///
/// The underlying buffer is freed back to the allocator on drop.
struct ColumnBuffer<'a, A: BufferAllocator> {
    allocator: &'a A,
    buffer: Option<A::Buffer>,
    len: usize,
}

impl<'a, A: BufferAllocator> ColumnBuffer<'a, A> {
    fn new(allocator: &'a A) -> Self {
        Self {
            allocator,
            buffer: None,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.as_ref().len())
    }

    fn reserve(&mut self, additional: usize, initial_capacity: usize) -> Result<(), LimitError> {
        let required = self.len + additional;
        let capacity = self.capacity();
        if required <= capacity {
            return Ok(());
        }

        let new_capacity = required.max(capacity * 2).max(initial_capacity);
        match self.buffer.as_mut() {
            Some(buffer) => self.allocator.reallocate(buffer, new_capacity),
            None => {
                self.buffer = Some(self.allocator.allocate(new_capacity)?);
                Ok(())
            }
        }
    }

    fn extend_from_slice(&mut self, data: &[u8]) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.as_mut()[self.len..self.len + data.len()].copy_from_slice(data);
            self.len += data.len();
        }
    }

    fn as_bytes(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |buffer| &buffer.as_ref()[..self.len])
    }
}

impl<A: BufferAllocator> Drop for ColumnBuffer<'_, A> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.free(buffer);
        }
    }
}

/// Encodes batches of records into column-oriented buffers.
pub struct ColumnarEncoder<A> {
    allocator: A,
    columns: Vec<String>,
    initial_capacity: usize,
}

impl<A: BufferAllocator> ColumnarEncoder<A> {
    /// Creates a new `ColumnarEncoder` with the given column names, drawing buffers from `allocator`.
    pub fn new<I, S>(allocator: A, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allocator,
            columns: columns.into_iter().map(Into::into).collect(),
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }

    /// Sets the size of the first buffer allocated for each column.
    ///
    /// Buffers double in size whenever they run out of room. Defaults to 1KiB.
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns a reference to the allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Encodes a batch of records.
    ///
    /// Each record must have exactly one value per column, in column order.
    ///
    /// ## Errors
    ///
    /// If a record has the wrong number of values, or a column buffer can't be grown within the allocator's limit, the
    /// batch is aborted and an error is returned. All buffers allocated for the batch are freed before returning.
    pub fn encode<I, R, V>(&self, records: I) -> Result<EncodedBatch<'_, A>, EncodeError>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[V]>,
        V: AsRef<[u8]>,
    {
        let mut buffers = self
            .columns
            .iter()
            .map(|_| ColumnBuffer::new(&self.allocator))
            .collect::<Vec<_>>();

        let mut rows = 0;
        for record in records {
            if let Err(e) = self.write_record(&mut buffers, rows, record.as_ref()) {
                debug!(rows_written = rows, error = %e, "Aborting columnar batch.");
                return Err(e);
            }
            rows += 1;
        }

        Ok(EncodedBatch {
            columns: &self.columns,
            buffers,
            rows,
        })
    }

    fn write_record<V: AsRef<[u8]>>(
        &self, buffers: &mut [ColumnBuffer<'_, A>], record: usize, values: &[V],
    ) -> Result<(), EncodeError> {
        if values.len() != self.columns.len() {
            return ArityMismatch {
                record,
                expected: self.columns.len(),
                actual: values.len(),
            }
            .fail();
        }

        for ((column, buffer), value) in self.columns.iter().zip(buffers.iter_mut()).zip(values) {
            let value = value.as_ref();
            let prefix = u32::try_from(value.len()).map_err(|_| EncodeError::ValueTooLarge {
                column: column.clone(),
                len: value.len(),
            })?;

            buffer
                .reserve(LENGTH_PREFIX_LEN + value.len(), self.initial_capacity)
                .context(Allocation { column: column.as_str() })?;
            buffer.extend_from_slice(&prefix.to_le_bytes());
            buffer.extend_from_slice(value);
        }

        Ok(())
    }
}

impl<A> fmt::Debug for ColumnarEncoder<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnarEncoder")
            .field("columns", &self.columns)
            .field("initial_capacity", &self.initial_capacity)
            .finish()
    }
}

/// A batch of encoded records.
///
/// Column buffers stay allocated until the batch is dropped.
pub struct EncodedBatch<'a, A: BufferAllocator> {
    columns: &'a [String],
    buffers: Vec<ColumnBuffer<'a, A>>,
    rows: usize,
}

impl<A: BufferAllocator> EncodedBatch<'_, A> {
    /// Returns the number of records in the batch.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the total number of bytes allocated for the batch.
    pub fn allocated_bytes(&self) -> usize {
        self.buffers.iter().map(ColumnBuffer::capacity).sum()
    }

    /// Returns the encoded column with the given name, if it exists.
    pub fn column(&self, name: &str) -> Option<EncodedColumn<'_>> {
        let idx = self.columns.iter().position(|column| column == name)?;
        Some(EncodedColumn {
            data: self.buffers[idx].as_bytes(),
        })
    }
}

impl<A: BufferAllocator> fmt::Debug for EncodedBatch<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedBatch")
            .field("columns", &self.columns)
            .field("rows", &self.rows)
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

/// A single encoded column.
#[derive(Clone, Copy, Debug)]
pub struct EncodedColumn<'a> {
    data: &'a [u8],
}

impl<'a> EncodedColumn<'a> {
    /// Returns the encoded bytes of the column.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Returns an iterator over the values in the column.
    pub fn values(&self) -> ColumnValues<'a> {
        ColumnValues { remaining: self.data }
    }
}

/// Iterator over the values of an [`EncodedColumn`].
pub struct ColumnValues<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for ColumnValues<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (prefix, rest) = self.remaining.split_first_chunk::<LENGTH_PREFIX_LEN>()?;
        let len = u32::from_le_bytes(*prefix) as usize;
        if rest.len() < len {
            return None;
        }

        let (value, rest) = rest.split_at(len);
        self.remaining = rest;
        Some(value)
    }
}
