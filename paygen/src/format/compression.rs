// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Write};

use bzip2::write::BzEncoder;
use liblzma::{
    stream::{Check, Stream},
    write::XzEncoder,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::payload::Type;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to initialize XZ encoder")]
    XzInit(#[source] liblzma::stream::Error),
    #[error("Failed to compress {0} bytes")]
    Compress(usize, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A deterministic, pure byte transform used to shrink chunk data. The same
/// input must always produce the same output so that payloads are
/// reproducible.
pub trait Compressor: Send + Sync {
    /// The install operation type that describes data produced by
    /// [`Self::compress()`].
    fn operation_type(&self) -> Type;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadCompression {
    #[default]
    Bzip2,
    Xz,
}

impl PayloadCompression {
    fn compress_bzip2(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::best());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn compress_xz(data: &[u8]) -> Result<Vec<u8>> {
        // The update engine's payload consumer does not support integrity
        // checks during decompression.
        let stream = Stream::new_easy_encoder(9, Check::None).map_err(Error::XzInit)?;
        let mut encoder = XzEncoder::new_stream(Vec::new(), stream);

        encoder
            .write_all(data)
            .map_err(|e| Error::Compress(data.len(), e))?;

        encoder.finish().map_err(|e| Error::Compress(data.len(), e))
    }
}

impl Compressor for PayloadCompression {
    fn operation_type(&self) -> Type {
        match self {
            Self::Bzip2 => Type::ReplaceBz,
            Self::Xz => Type::ReplaceXz,
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Bzip2 => Self::compress_bzip2(data).map_err(|e| Error::Compress(data.len(), e)),
            Self::Xz => Self::compress_xz(data),
        }
    }
}
