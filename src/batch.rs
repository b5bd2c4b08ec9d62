//! Chunked execution of independent operations.
//!
//! Operations are split into consecutive chunks of `min(batch_chunk_size, max_concurrent)`.
//! Each chunk runs concurrently, every operation going through [`Pool::query`], and the next
//! chunk starts only after the whole previous chunk has completed.

use std::{future::Future, num::NonZeroUsize, sync::Arc};

use futures::future::{join_all, try_join_all};
use tracing::{debug, trace_span, Instrument};

use crate::{errors::AdmissionError, executor::Pool};

/// Default number of records per chunk used for bulk inserts.
pub const DEFAULT_INSERT_CHUNK: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(size) => size,
    None => unreachable!(),
};

/// Split records into consecutive chunks of at most `size` records.
///
/// Useful for turning a bulk insert into a list of batch operations, one per chunk.
pub fn chunked<T>(records: Vec<T>, size: NonZeroUsize) -> impl Iterator<Item = Vec<T>> {
    let mut records = records.into_iter().peekable();
    std::iter::from_fn(move || {
        records.peek()?;
        Some(records.by_ref().take(size.get()).collect())
    })
}

impl<C> Pool<C> {
    /// Run independent operations in sequential chunks, returning results in input order.
    ///
    /// Fails fast: the first failing operation fails the whole call, other operations of its
    /// chunk are cancelled, later chunks never start, and results of completed chunks are
    /// discarded. Use [`Self::batch_settled`] to get a result for every operation.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by any operation.
    pub async fn batch<I, F, Fut, T, E>(&self, operations: I) -> Result<Vec<T>, E>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let chunk_size = self.config().effective_chunk_size();
        let mut operations = operations.into_iter();
        let mut results = Vec::with_capacity(operations.size_hint().0);
        let mut chunk_no = 0_usize;
        loop {
            let chunk: Vec<F> = operations.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let span = trace_span!("batch_chunk", chunk = chunk_no, size = chunk.len());
            let chunk_results = try_join_all(chunk.into_iter().map(|op| self.query(op)))
                .instrument(span)
                .await?;
            results.extend(chunk_results);
            chunk_no += 1;
        }
        debug!(
            pool = self.gate().name(),
            operations = results.len(),
            chunks = chunk_no,
            "batch complete"
        );
        Ok(results)
    }

    /// Run independent operations in sequential chunks, collecting every result.
    ///
    /// Chunking is the same as in [`Self::batch`], but failures don't stop other operations.
    pub async fn batch_settled<I, F, Fut, T, E>(&self, operations: I) -> Vec<Result<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let chunk_size = self.config().effective_chunk_size();
        let mut operations = operations.into_iter();
        let mut results = Vec::with_capacity(operations.size_hint().0);
        let mut chunk_no = 0_usize;
        loop {
            let chunk: Vec<F> = operations.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let span = trace_span!("batch_chunk", chunk = chunk_no, size = chunk.len());
            let chunk_results = join_all(chunk.into_iter().map(|op| self.query(op)))
                .instrument(span)
                .await;
            results.extend(chunk_results);
            chunk_no += 1;
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        debug!(
            pool = self.gate().name(),
            operations = results.len(),
            failed,
            chunks = chunk_no,
            "settled batch complete"
        );
        results
    }
}
