// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Write},
    sync::{Arc, atomic::AtomicBool},
};

use tracing::{debug, info};

use crate::{
    format::compression::Compressor,
    generator::{
        Error, FullUpdate, Result,
        config::{Partition, PayloadGenerationConfig},
        emitter::OperationEmitter,
        pipeline::ChunkScheduler,
    },
    stream::ReadAt,
    util::{self, NumBytes},
};

/// Drives a full update run: validate the config, then process the root
/// filesystem image followed by the kernel image. Any failure aborts the whole
/// run. Data already written to the payload writer is left as is.
pub struct FullUpdateGenerator<'a> {
    config: &'a PayloadGenerationConfig,
    compressor: Arc<dyn Compressor>,
}

impl<'a> FullUpdateGenerator<'a> {
    /// Create a generator that uses the compression format from `config`.
    pub fn new(config: &'a PayloadGenerationConfig) -> Self {
        Self {
            config,
            compressor: Arc::new(config.compression),
        }
    }

    /// Use a custom compressor instead of the one selected by the config.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Run with the image files named in the config.
    pub fn run(&self, writer: impl Write, cancel_signal: &AtomicBool) -> Result<FullUpdate> {
        self.run_with(
            |partition| File::open(self.config.target.path(partition)),
            writer,
            cancel_signal,
        )
    }

    /// Run with images obtained from `open_image`, which is called once per
    /// partition, right before that partition is processed.
    pub fn run_with<R>(
        &self,
        mut open_image: impl FnMut(Partition) -> io::Result<R>,
        writer: impl Write,
        cancel_signal: &AtomicBool,
    ) -> Result<FullUpdate>
    where
        R: ReadAt + Send + Sync + 'static,
    {
        let config = self.config;

        config.validate_full_update()?;

        let max_workers = config
            .max_workers
            .map_or_else(util::default_worker_count, |n| n.get());
        info!("Max threads: {max_workers}");

        let scheduler = ChunkScheduler::new(self.compressor.clone(), config.chunk_size, max_workers);
        let mut emitter = OperationEmitter::new(
            writer,
            self.compressor.operation_type(),
            config.block_size,
            config.chunk_size,
        );

        for partition in Partition::ALL {
            let path = config.target.path(partition);
            let size = config.target.size(partition);

            info!("Compressing {partition} image: {path:?}");

            let image = open_image(partition)
                .map(Arc::new)
                .map_err(|e| Error::OpenImage(partition, path.to_owned(), e))?;

            scheduler.run(partition, image, size, &mut emitter, cancel_signal)?;

            debug!(
                "Finished {partition} image; payload is now {:?}",
                NumBytes(emitter.data_file_size()),
            );
        }

        let (_, result) = emitter.finish()?;

        Ok(result)
    }
}

/// Generate the full update operations for the images in `config`, appending
/// the operation data to `writer`.
pub fn generate_full_update(
    config: &PayloadGenerationConfig,
    writer: impl Write,
    cancel_signal: &AtomicBool,
) -> Result<FullUpdate> {
    FullUpdateGenerator::new(config).run(writer, cancel_signal)
}
