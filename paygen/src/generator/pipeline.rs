// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::VecDeque,
    io::Write,
    sync::{Arc, atomic::AtomicBool},
};

use num_traits::ToPrimitive;

use crate::{
    format::compression::Compressor,
    generator::{
        Error, Result, chunk::ChunkWorker, config::Partition, emitter::OperationEmitter,
        progress::ProgressReporter,
    },
    stream::{self, ReadAt},
};

/// Keeps a sliding window of at most `max_workers` chunks in flight and drains
/// them strictly from the front. Workers may finish in any order, but chunks
/// are always emitted in ascending offset order because ordering comes from
/// queue position, not completion time.
pub struct ChunkScheduler {
    compressor: Arc<dyn Compressor>,
    chunk_size: u64,
    max_workers: usize,
}

impl ChunkScheduler {
    pub fn new(compressor: Arc<dyn Compressor>, chunk_size: u64, max_workers: usize) -> Self {
        Self {
            compressor,
            chunk_size,
            max_workers: max_workers.max(1),
        }
    }

    /// Split the first `partition_size` bytes of `source` into chunks, process
    /// them in parallel, and hand them to `emitter` in order. On failure, any
    /// workers still in flight are abandoned.
    pub fn run<R, W>(
        &self,
        partition: Partition,
        source: Arc<R>,
        partition_size: u64,
        emitter: &mut OperationEmitter<W>,
        cancel_signal: &AtomicBool,
    ) -> Result<()>
    where
        R: ReadAt + Send + Sync + 'static,
        W: Write,
    {
        let mut queue = VecDeque::with_capacity(self.max_workers);
        let mut progress = ProgressReporter::new(partition, partition_size);
        let mut bytes_left = partition_size;
        let mut offset = 0;

        while bytes_left > 0 || !queue.is_empty() {
            // Fill the window.
            while queue.len() < self.max_workers && bytes_left > 0 {
                stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

                let size = bytes_left
                    .min(self.chunk_size)
                    .to_usize()
                    .ok_or(Error::IntegerTooLarge("chunk_size"))?;

                let mut worker = ChunkWorker::new(
                    source.clone(),
                    self.compressor.clone(),
                    partition,
                    offset,
                    size,
                );
                worker.start()?;
                queue.push_back(worker);

                // Always advance by the nominal chunk size. The config
                // guarantees that the partition is a whole number of chunks.
                bytes_left = bytes_left.saturating_sub(self.chunk_size);
                offset += self.chunk_size;
            }

            let Some(worker) = queue.pop_front() else {
                break;
            };

            let chunk = worker.finish()?;
            let bytes_done = chunk.offset + chunk.raw.len() as u64;

            emitter.emit(chunk)?;

            progress.update(bytes_done, emitter.data_file_size());
        }

        Ok(())
    }
}
