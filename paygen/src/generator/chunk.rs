// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    mem,
    sync::Arc,
    thread::{self, JoinHandle},
};

use tracing::debug;

use crate::{
    format::compression::Compressor,
    generator::{Error, Result, config::Partition},
    stream::ReadAt,
};

/// The contents of one fully processed chunk. Ownership of the buffers moves
/// from the worker to the emitter exactly once.
#[derive(Debug)]
pub struct CompletedChunk {
    pub partition: Partition,
    /// Byte offset of the chunk within the source image.
    pub offset: u64,
    pub raw: Vec<u8>,
    pub compressed: Vec<u8>,
}

impl CompletedChunk {
    /// Whether compression actually made the data smaller.
    pub fn should_compress(&self) -> bool {
        self.compressed.len() < self.raw.len()
    }
}

struct ChunkBuffers {
    raw: Vec<u8>,
    compressed: Vec<u8>,
}

enum State {
    Idle,
    Running(JoinHandle<Result<ChunkBuffers>>),
    Done(ChunkBuffers),
    Failed,
}

/// Reads one chunk of a partition image at a fixed offset and compresses it on
/// its own thread. The worker must be started with [`Self::start()`] and then
/// waited on with [`Self::wait()`] or [`Self::finish()`]. Dropping a running
/// worker detaches its thread and the result is discarded.
pub struct ChunkWorker<R> {
    source: Arc<R>,
    compressor: Arc<dyn Compressor>,
    partition: Partition,
    offset: u64,
    size: usize,
    state: State,
}

impl<R: ReadAt + Send + Sync + 'static> ChunkWorker<R> {
    pub fn new(
        source: Arc<R>,
        compressor: Arc<dyn Compressor>,
        partition: Partition,
        offset: u64,
        size: usize,
    ) -> Self {
        Self {
            source,
            compressor,
            partition,
            offset,
            size,
            state: State::Idle,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawn the thread that reads and compresses the chunk. Calling this on a
    /// worker that was already started does nothing.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Ok(());
        }

        let source = self.source.clone();
        let compressor = self.compressor.clone();
        let partition = self.partition;
        let offset = self.offset;
        let size = self.size;

        let handle = thread::Builder::new()
            .name(format!("chunk-{partition}-{offset}"))
            .spawn(move || read_and_compress(&*source, &*compressor, partition, offset, size))
            .map_err(|e| Error::SpawnWorker {
                partition,
                offset,
                source: e,
            })?;

        self.state = State::Running(handle);

        Ok(())
    }

    /// Block until the chunk has been read and compressed. The result is
    /// cached, so waiting again does not redo any work. After a failure, the
    /// original error is returned only once and subsequent calls report
    /// [`Error::WorkerFailed`].
    pub fn wait(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, State::Failed) {
            State::Idle => {
                self.state = State::Idle;
                Err(Error::WorkerNotStarted(self.partition, self.offset))
            }
            State::Running(handle) => match handle.join() {
                Ok(Ok(buffers)) => {
                    self.state = State::Done(buffers);
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::WorkerPanicked(self.partition, self.offset)),
            },
            State::Done(buffers) => {
                self.state = State::Done(buffers);
                Ok(())
            }
            State::Failed => Err(Error::WorkerFailed(self.partition, self.offset)),
        }
    }

    /// Whether the compressed data is strictly smaller than the raw data. This
    /// is always false until the worker has finished successfully.
    pub fn should_compress(&self) -> bool {
        match &self.state {
            State::Done(buffers) => buffers.compressed.len() < buffers.raw.len(),
            _ => false,
        }
    }

    /// Wait for the worker and take ownership of the chunk's buffers.
    pub fn finish(mut self) -> Result<CompletedChunk> {
        self.wait()?;

        let State::Done(buffers) = self.state else {
            return Err(Error::WorkerFailed(self.partition, self.offset));
        };

        Ok(CompletedChunk {
            partition: self.partition,
            offset: self.offset,
            raw: buffers.raw,
            compressed: buffers.compressed,
        })
    }
}

fn read_and_compress(
    source: &impl ReadAt,
    compressor: &dyn Compressor,
    partition: Partition,
    offset: u64,
    size: usize,
) -> Result<ChunkBuffers> {
    let mut raw = vec![0u8; size];

    source
        .read_exact_at(&mut raw, offset)
        .map_err(|e| Error::ReadChunk {
            partition,
            offset,
            size,
            source: e,
        })?;

    let compressed = compressor
        .compress(&raw)
        .map_err(|e| Error::Compress {
            partition,
            offset,
            source: e,
        })?;

    debug!(
        "Compressed {partition} chunk at {offset}: {size} -> {} bytes",
        compressed.len(),
    );

    Ok(ChunkBuffers { raw, compressed })
}
