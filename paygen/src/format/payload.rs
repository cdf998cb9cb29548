// SPDX-FileCopyrightText: 2022-2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use bzip2::write::BzDecoder;
use liblzma::write::XzDecoder;
use ring::digest::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::{self, CountingWriter};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected sha256 {0}, but have {1}")]
    MismatchedDigest(String, String),
    #[error("Operation has {0} destination extents, but only 1 is supported")]
    UnsupportedExtentCount(usize),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Decompressed {0} bytes, but destination extent holds {1} bytes")]
    MismatchedDataSize(u64, u64),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Install operation kinds that a full update can produce. The serialized
/// names match the update engine's protobuf enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Data is written to the destination verbatim.
    #[serde(rename = "REPLACE")]
    Replace,
    /// Data is bzip2-compressed.
    #[serde(rename = "REPLACE_BZ")]
    ReplaceBz,
    /// Data is xz-compressed.
    #[serde(rename = "REPLACE_XZ")]
    ReplaceXz,
}

impl Type {
    pub fn is_compressed(self) -> bool {
        self != Self::Replace
    }

    pub fn as_str_name(self) -> &'static str {
        match self {
            Self::Replace => "REPLACE",
            Self::ReplaceBz => "REPLACE_BZ",
            Self::ReplaceXz => "REPLACE_XZ",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

/// A contiguous run of destination blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sha256Hash(
    #[serde(
        serialize_with = "hex::serialize",
        deserialize_with = "hex::deserialize"
    )]
    pub [u8; 32],
);

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Sha256Hash {
    pub fn digest(data: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(digest.as_ref());
        Self(hash)
    }
}

/// A record instructing the update applier to write a section of the payload
/// blob, after optional decompression, into a destination extent. Once
/// emitted, an operation is never modified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOperation {
    #[serde(rename = "type")]
    pub type_: Type,
    /// Offset within the payload blob section.
    pub data_offset: u64,
    pub data_length: u64,
    pub dst_extents: Vec<Extent>,
    /// Digest of the exact blob bytes referenced by this operation.
    pub data_sha256_hash: Sha256Hash,
}

/// Serializable summary of a full update run, intended for assembling the
/// payload manifest. The root filesystem operations are listed in application
/// order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullUpdateInfo {
    pub block_size: u32,
    pub data_file_size: u64,
    pub rootfs_operations: Vec<InstallOperation>,
    pub kernel_operations: Vec<InstallOperation>,
}

/// Apply a partition operation from the payload blob in `reader` to the
/// partition image in `writer`. `reader` must be positioned such that offset 0
/// is the start of the blob section.
pub fn apply_operation(
    mut reader: impl Read + Seek,
    mut writer: impl Write + Seek,
    block_size: u32,
    op: &InstallOperation,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    // Full updates always produce exactly one extent per operation.
    let [extent] = op.dst_extents.as_slice() else {
        return Err(Error::UnsupportedExtentCount(op.dst_extents.len()));
    };

    let out_offset = extent
        .start_block
        .checked_mul(block_size.into())
        .ok_or(Error::IntegerTooLarge("out_offset"))?;
    let out_data_length = extent
        .num_blocks
        .checked_mul(block_size.into())
        .ok_or(Error::IntegerTooLarge("out_data_length"))?;

    reader.seek(SeekFrom::Start(op.data_offset))?;
    writer.seek(SeekFrom::Start(out_offset))?;

    let mut hasher = Context::new(&ring::digest::SHA256);
    let mut counting = CountingWriter::new(&mut writer);

    match op.type_ {
        Type::Replace => {
            stream::copy_n_inspect(
                &mut reader,
                &mut counting,
                op.data_length,
                |data| hasher.update(data),
                cancel_signal,
            )?;
        }
        Type::ReplaceBz => {
            let mut decoder = BzDecoder::new(&mut counting);
            stream::copy_n_inspect(
                &mut reader,
                &mut decoder,
                op.data_length,
                |data| hasher.update(data),
                cancel_signal,
            )?;
            decoder.finish()?;
        }
        Type::ReplaceXz => {
            let mut decoder = XzDecoder::new(&mut counting);
            stream::copy_n_inspect(
                &mut reader,
                &mut decoder,
                op.data_length,
                |data| hasher.update(data),
                cancel_signal,
            )?;
            decoder.finish()?;
        }
    }

    let (_, written) = counting.finish();
    if written != out_data_length {
        return Err(Error::MismatchedDataSize(written, out_data_length));
    }

    let digest = hasher.finish();
    if digest.as_ref() != op.data_sha256_hash.0 {
        return Err(Error::MismatchedDigest(
            hex::encode(op.data_sha256_hash.0),
            hex::encode(digest.as_ref()),
        ));
    }

    Ok(())
}

/// Apply every operation in `ops`, in order.
pub fn apply_operations<'a>(
    mut reader: impl Read + Seek,
    mut writer: impl Write + Seek,
    block_size: u32,
    ops: impl IntoIterator<Item = &'a InstallOperation>,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    for op in ops {
        apply_operation(&mut reader, &mut writer, block_size, op, cancel_signal)?;
    }

    Ok(())
}
