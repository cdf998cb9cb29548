// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, fs, io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::compression::PayloadCompression;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Block size must be non-zero")]
    ZeroBlockSize,
    #[error("Image path for {0} is empty")]
    EmptyPath(Partition),
    #[error("Size of {0} ({1}) is not aligned to the block size ({2})")]
    UnalignedPartitionSize(Partition, u64, u32),
    #[error("Chunk size must be positive")]
    NonPositiveChunkSize,
    #[error("Chunk size ({0}) is not aligned to the block size ({1})")]
    UnalignedChunkSize(u64, u32),
    #[error("Size of {0} ({1}) is not a multiple of the chunk size ({2})")]
    PartialChunk(Partition, u64, u64),
}

type Result<T> = std::result::Result<T, Error>;

/// The partitions covered by a full update, in processing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Partition {
    Rootfs,
    Kernel,
}

impl Partition {
    pub const ALL: [Self; 2] = [Self::Rootfs, Self::Kernel];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rootfs => "rootfs",
            Self::Kernel => "kernel",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target image descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub rootfs_part: PathBuf,
    pub rootfs_size: u64,
    pub kernel_part: PathBuf,
    pub kernel_size: u64,
}

impl ImageConfig {
    /// Describe the images at the specified paths, using the current file
    /// sizes as the partition sizes.
    pub fn from_paths(rootfs_part: &Path, kernel_part: &Path) -> io::Result<Self> {
        Ok(Self {
            rootfs_part: rootfs_part.to_owned(),
            rootfs_size: fs::metadata(rootfs_part)?.len(),
            kernel_part: kernel_part.to_owned(),
            kernel_size: fs::metadata(kernel_part)?.len(),
        })
    }

    pub fn path(&self, partition: Partition) -> &Path {
        match partition {
            Partition::Rootfs => &self.rootfs_part,
            Partition::Kernel => &self.kernel_part,
        }
    }

    pub fn size(&self, partition: Partition) -> u64 {
        match partition {
            Partition::Rootfs => self.rootfs_size,
            Partition::Kernel => self.kernel_size,
        }
    }
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

/// Settings for a payload generation run. These are immutable for the duration
/// of the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadGenerationConfig {
    pub target: ImageConfig,
    /// Number of bytes of the source images covered by each operation.
    pub chunk_size: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub compression: PayloadCompression,
    /// Maximum number of chunks processed concurrently. Defaults to the number
    /// of CPUs, but no fewer than 4.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<NonZeroUsize>,
}

impl PayloadGenerationConfig {
    pub fn new(target: ImageConfig, chunk_size: u64) -> Self {
        Self {
            target,
            chunk_size,
            block_size: DEFAULT_BLOCK_SIZE,
            compression: PayloadCompression::default(),
            max_workers: None,
        }
    }

    /// Check that the config is internally consistent. This does not look at
    /// the chunk size, which only matters for full updates.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }

        for partition in Partition::ALL {
            if self.target.path(partition).as_os_str().is_empty() {
                return Err(Error::EmptyPath(partition));
            }

            let size = self.target.size(partition);
            if size % u64::from(self.block_size) != 0 {
                return Err(Error::UnalignedPartitionSize(
                    partition,
                    size,
                    self.block_size,
                ));
            }
        }

        Ok(())
    }

    /// Check the preconditions for splitting the images into fixed-size
    /// chunks. Every chunk must cover a whole number of blocks and every
    /// partition must be a whole number of chunks, otherwise the final
    /// operation's destination extent would not match the data it holds.
    pub fn validate_full_update(&self) -> Result<()> {
        self.validate()?;

        if self.chunk_size == 0 {
            return Err(Error::NonPositiveChunkSize);
        }

        if self.chunk_size % u64::from(self.block_size) != 0 {
            return Err(Error::UnalignedChunkSize(self.chunk_size, self.block_size));
        }

        for partition in Partition::ALL {
            let size = self.target.size(partition);
            if size % self.chunk_size != 0 {
                return Err(Error::PartialChunk(partition, size, self.chunk_size));
            }
        }

        Ok(())
    }
}
