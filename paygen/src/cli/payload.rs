// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use rayon::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ring::digest::Digest;
use tracing::info;

use crate::{
    format::{
        compression::PayloadCompression,
        payload::{self, FullUpdateInfo, InstallOperation},
    },
    generator::{
        FullUpdateGenerator,
        config::{ImageConfig, Partition, PayloadGenerationConfig},
    },
    stream,
    util::NumBytes,
};

fn read_config(path: &Path) -> Result<PayloadGenerationConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config TOML: {path:?}"))?;
    let config = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse config TOML: {path:?}"))?;

    Ok(config)
}

fn read_info(path: &Path) -> Result<FullUpdateInfo> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read update info TOML: {path:?}"))?;
    let info = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse update info TOML: {path:?}"))?;

    Ok(info)
}

fn write_info(path: &Path, info: &FullUpdateInfo) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(info)
        .with_context(|| format!("Failed to serialize update info TOML: {path:?}"))?;
    fs::write(path, data)
        .with_context(|| format!("Failed to write update info TOML: {path:?}"))?;

    Ok(())
}

fn build_config(cli: &GenerateCli) -> Result<PayloadGenerationConfig> {
    let mut config = if let Some(path) = &cli.config {
        read_config(path)?
    } else {
        // clap guarantees these are present when --config is not.
        let (Some(rootfs), Some(kernel), Some(chunk_size)) =
            (&cli.rootfs, &cli.kernel, cli.chunk_size)
        else {
            bail!("--rootfs, --kernel, and --chunk-size are required without --config");
        };

        let target = ImageConfig::from_paths(rootfs, kernel)
            .with_context(|| format!("Failed to get image sizes: {rootfs:?}, {kernel:?}"))?;

        PayloadGenerationConfig::new(target, chunk_size)
    };

    if let Some(block_size) = cli.block_size {
        config.block_size = block_size;
    }
    if let Some(compression) = cli.compression {
        config.compression = compression.into();
    }
    if let Some(max_workers) = cli.max_workers {
        config.max_workers = Some(max_workers);
    }

    Ok(config)
}

fn hash_reader(reader: impl Read, size: u64, cancel_signal: &AtomicBool) -> io::Result<Digest> {
    let mut context = ring::digest::Context::new(&ring::digest::SHA256);

    stream::copy_n_inspect(
        reader,
        io::sink(),
        size,
        |data| context.update(data),
        cancel_signal,
    )?;

    Ok(context.finish())
}

/// Rebuild a partition image from the payload blob into a temporary file and
/// compare it against the original image. Operations are applied in parallel
/// using rayon's global thread pool, each with its own file handles.
fn verify_partition(
    partition: Partition,
    blob: &Path,
    image: &Path,
    block_size: u32,
    ops: &[InstallOperation],
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let image_file =
        File::open(image).with_context(|| format!("Failed to open {partition} image: {image:?}"))?;
    let image_size = image_file
        .metadata()
        .with_context(|| format!("Failed to get file size: {image:?}"))?
        .len();

    let temp_file = tempfile::NamedTempFile::new()
        .with_context(|| format!("Failed to create temp file for: {partition}"))?;
    temp_file
        .as_file()
        .set_len(image_size)
        .with_context(|| format!("Failed to resize temp file for: {partition}"))?;

    ops.into_par_iter()
        .enumerate()
        .map(|(i, op)| -> Result<()> {
            let reader = File::open(blob)
                .with_context(|| format!("Failed to open payload blob: {blob:?}"))?;
            let writer = OpenOptions::new()
                .write(true)
                .open(temp_file.path())
                .with_context(|| format!("Failed to reopen temp file for: {partition}"))?;

            payload::apply_operation(reader, writer, block_size, op, cancel_signal)
                .with_context(|| format!("Failed to apply {partition} operation #{i}"))
        })
        .collect::<Result<()>>()?;

    let expected = hash_reader(&image_file, image_size, cancel_signal)
        .with_context(|| format!("Failed to hash {partition} image: {image:?}"))?;
    let actual = hash_reader(temp_file.as_file(), image_size, cancel_signal)
        .with_context(|| format!("Failed to hash rebuilt {partition} image"))?;

    if expected.as_ref() != actual.as_ref() {
        bail!(
            "Rebuilt {partition} image has sha256 {}, but expected {}",
            hex::encode(actual),
            hex::encode(expected),
        );
    }

    info!("Successfully verified {partition} image: {image:?}");

    Ok(())
}

pub fn generate_subcommand(cli: &GenerateCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = build_config(cli)?;

    let mut writer = File::create(&cli.output)
        .map(BufWriter::new)
        .with_context(|| format!("Failed to open payload blob for writing: {:?}", cli.output))?;

    let update = FullUpdateGenerator::new(&config)
        .run(&mut writer, cancel_signal)
        .context("Failed to generate full update")?;

    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Failed to flush payload blob: {:?}", cli.output))?;

    info!(
        "Generated {} rootfs and {} kernel operations ({})",
        update.final_order.len(),
        update.kernel_ops.len(),
        NumBytes(update.data_file_size),
    );

    if let Some(path) = &cli.output_info {
        write_info(path, &update.to_info(config.block_size))?;
    }

    Ok(())
}

pub fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let info = read_info(&cli.info)?;

    let blob_size = fs::metadata(&cli.blob)
        .with_context(|| format!("Failed to get file size: {:?}", cli.blob))?
        .len();
    if blob_size != info.data_file_size {
        bail!(
            "Payload blob is {blob_size} bytes, but update info expects {} bytes",
            info.data_file_size,
        );
    }

    verify_partition(
        Partition::Rootfs,
        &cli.blob,
        &cli.rootfs,
        info.block_size,
        &info.rootfs_operations,
        cancel_signal,
    )?;
    verify_partition(
        Partition::Kernel,
        &cli.blob,
        &cli.kernel,
        info.block_size,
        &info.kernel_operations,
        cancel_signal,
    )?;

    Ok(())
}

pub fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let info = read_info(&cli.info)?;

    println!("{info:#?}");

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CompressionArg {
    Bzip2,
    Xz,
}

impl From<CompressionArg> for PayloadCompression {
    fn from(value: CompressionArg) -> Self {
        match value {
            CompressionArg::Bzip2 => Self::Bzip2,
            CompressionArg::Xz => Self::Xz,
        }
    }
}

/// Generate the full update operations for a root filesystem and kernel image.
///
/// Each image is split into fixed-size chunks. Every chunk is compressed, and
/// the compressed data is used only if it is smaller than the original. The
/// operation data is written to the output blob, and the operations
/// themselves can be written to an info TOML file.
#[derive(Debug, Parser)]
pub struct GenerateCli {
    /// Path to config TOML.
    ///
    /// Options specified on the command line override the values in the file.
    #[arg(long, value_name = "FILE", value_parser)]
    config: Option<PathBuf>,

    /// Path to root filesystem image.
    #[arg(long, value_name = "FILE", value_parser, required_unless_present = "config")]
    rootfs: Option<PathBuf>,

    /// Path to kernel image.
    #[arg(long, value_name = "FILE", value_parser, required_unless_present = "config")]
    kernel: Option<PathBuf>,

    /// Number of image bytes covered by each operation.
    #[arg(long, value_name = "BYTES", required_unless_present = "config")]
    chunk_size: Option<u64>,

    /// Partition block size.
    #[arg(long, value_name = "BYTES")]
    block_size: Option<u32>,

    /// Compression format for chunks that benefit from compression.
    #[arg(long, value_name = "FORMAT")]
    compression: Option<CompressionArg>,

    /// Maximum number of chunks to process in parallel.
    #[arg(long, value_name = "COUNT")]
    max_workers: Option<NonZeroUsize>,

    /// Path to output payload blob.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to output update info TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    output_info: Option<PathBuf>,
}

/// Verify that a payload blob reproduces the original images.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Path to update info TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    info: PathBuf,

    /// Path to payload blob.
    #[arg(long, value_name = "FILE", value_parser)]
    blob: PathBuf,

    /// Path to original root filesystem image.
    #[arg(long, value_name = "FILE", value_parser)]
    rootfs: PathBuf,

    /// Path to original kernel image.
    #[arg(long, value_name = "FILE", value_parser)]
    kernel: PathBuf,
}

/// Display update info.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to update info TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    info: PathBuf,
}
