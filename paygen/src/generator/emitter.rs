// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::Write;

use crate::{
    format::payload::{Extent, InstallOperation, Sha256Hash, Type},
    generator::{
        Error, FullUpdate, Result, Vertex, chunk::CompletedChunk, config::Partition,
    },
};

/// Turns completed chunks into install operations and appends their data to
/// the payload blob. This runs only on the control thread, so the blob cursor
/// and the operation lists need no synchronization.
pub struct OperationEmitter<W> {
    writer: W,
    compressed_type: Type,
    block_size: u32,
    chunk_size: u64,
    /// Next write offset in the payload blob.
    data_file_size: u64,
    rootfs_counter: u64,
    result: FullUpdate,
}

impl<W: Write> OperationEmitter<W> {
    pub fn new(writer: W, compressed_type: Type, block_size: u32, chunk_size: u64) -> Self {
        Self {
            writer,
            compressed_type,
            block_size,
            chunk_size,
            data_file_size: 0,
            rootfs_counter: 0,
            result: FullUpdate::default(),
        }
    }

    pub fn data_file_size(&self) -> u64 {
        self.data_file_size
    }

    /// Write the chunk's data to the payload and record the install operation
    /// describing it. The compressed data is used only if it is strictly
    /// smaller than the raw data. Nothing is recorded if the write fails.
    pub fn emit(&mut self, chunk: CompletedChunk) -> Result<&InstallOperation> {
        let (type_, data) = if chunk.should_compress() {
            (self.compressed_type, &chunk.compressed)
        } else {
            (Type::Replace, &chunk.raw)
        };

        let data_offset = self.data_file_size;

        self.writer
            .write_all(data)
            .map_err(|e| Error::WritePayload {
                offset: data_offset,
                size: data.len(),
                source: e,
            })?;

        let block_size = u64::from(self.block_size);
        let op = InstallOperation {
            type_,
            data_offset,
            data_length: data.len() as u64,
            dst_extents: vec![Extent {
                start_block: chunk.offset / block_size,
                num_blocks: self.chunk_size / block_size,
            }],
            data_sha256_hash: Sha256Hash::digest(data),
        };

        self.data_file_size += op.data_length;

        let op = match chunk.partition {
            Partition::Rootfs => {
                let graph = &mut self.result.graph;

                graph.push(Vertex {
                    label: format!("<rootfs-operation-{}>", self.rootfs_counter),
                    op,
                });
                self.rootfs_counter += 1;
                self.result.final_order.push(graph.len() - 1);

                &graph[graph.len() - 1].op
            }
            Partition::Kernel => {
                self.result.kernel_ops.push(op);

                &self.result.kernel_ops[self.result.kernel_ops.len() - 1]
            }
        };

        Ok(op)
    }

    /// Flush the writer and return it along with the generated operations.
    pub fn finish(mut self) -> Result<(W, FullUpdate)> {
        self.writer.flush().map_err(|e| Error::WritePayload {
            offset: self.data_file_size,
            size: 0,
            source: e,
        })?;

        self.result.data_file_size = self.data_file_size;

        Ok((self.writer, self.result))
    }
}
