// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Generation of the full update portion of a payload. Instead of diffing
//! against a previous image, the target root filesystem and kernel images are
//! repackaged in fixed-size chunks, each compressed opportunistically and
//! described by a self-contained install operation.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::format::{
    compression,
    payload::{FullUpdateInfo, InstallOperation},
};

pub mod chunk;
pub mod config;
pub mod emitter;
pub mod full;
pub mod pipeline;
pub mod progress;

pub use full::{FullUpdateGenerator, generate_full_update};

use config::Partition;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload generation config")]
    Config(#[from] config::Error),
    #[error("Failed to open {0} image: {1:?}")]
    OpenImage(Partition, PathBuf, #[source] io::Error),
    #[error("Failed to read {size} bytes at offset {offset} of {partition} image")]
    ReadChunk {
        partition: Partition,
        offset: u64,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to compress chunk at offset {offset} of {partition} image")]
    Compress {
        partition: Partition,
        offset: u64,
        #[source]
        source: compression::Error,
    },
    #[error("Failed to write {size} bytes at payload offset {offset}")]
    WritePayload {
        offset: u64,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to spawn worker for chunk at offset {offset} of {partition} image")]
    SpawnWorker {
        partition: Partition,
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Worker for chunk at offset {1} of {0} image panicked")]
    WorkerPanicked(Partition, u64),
    #[error("Worker for chunk at offset {1} of {0} image was never started")]
    WorkerNotStarted(Partition, u64),
    #[error("Worker for chunk at offset {1} of {0} image already failed")]
    WorkerFailed(Partition, u64),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Payload generation was cancelled")]
    Cancelled(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A root filesystem operation plus a synthetic name for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vertex {
    pub label: String,
    pub op: InstallOperation,
}

/// Operation graph shared with the delta generator. For full updates, there
/// are no dependencies between vertices.
pub type Graph = Vec<Vertex>;

/// Output of a full update run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FullUpdate {
    /// Total number of bytes appended to the payload blob.
    pub data_file_size: u64,
    pub graph: Graph,
    /// Indices into [`Self::graph`] in application order. This is always the
    /// insertion order.
    pub final_order: Vec<usize>,
    pub kernel_ops: Vec<InstallOperation>,
}

impl FullUpdate {
    /// Root filesystem operations in application order.
    pub fn rootfs_operations(&self) -> impl Iterator<Item = &InstallOperation> {
        self.final_order.iter().map(|&i| &self.graph[i].op)
    }

    pub fn to_info(&self, block_size: u32) -> FullUpdateInfo {
        FullUpdateInfo {
            block_size,
            data_file_size: self.data_file_size,
            rootfs_operations: self.rootfs_operations().cloned().collect(),
            kernel_operations: self.kernel_ops.clone(),
        }
    }
}
