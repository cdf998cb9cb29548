// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{self, Cursor},
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use assert_matches::assert_matches;
use paygen::{
    format::{
        compression::{self, Compressor, PayloadCompression},
        payload::{self, Extent, Type},
    },
    generator::{
        Error, FullUpdate, FullUpdateGenerator,
        config::{self, ImageConfig, Partition, PayloadGenerationConfig},
        generate_full_update,
    },
    stream::MutexFile,
};

/// Always produces output one byte larger than the input.
struct NeverHelps;

impl Compressor for NeverHelps {
    fn operation_type(&self) -> Type {
        Type::ReplaceBz
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, compression::Error> {
        let mut result = data.to_vec();
        result.push(0);
        Ok(result)
    }
}

/// Shrinks all-zero input to 4 bytes and leaves everything else larger.
struct ZerosShrink;

impl Compressor for ZerosShrink {
    fn operation_type(&self) -> Type {
        Type::ReplaceXz
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, compression::Error> {
        if data.iter().all(|b| *b == 0) {
            Ok(vec![0xff; 4])
        } else {
            NeverHelps.compress(data)
        }
    }
}

/// Tracks how many compressions run at the same time. Chunks starting with
/// lower bytes take longer, so earlier chunks tend to finish last.
#[derive(Default)]
struct Tracking {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Compressor for Tracking {
    fn operation_type(&self) -> Type {
        Type::ReplaceBz
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, compression::Error> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = 50u64.saturating_sub(u64::from(data[0] % 5) * 10);
        thread::sleep(Duration::from_millis(delay));

        self.active.fetch_sub(1, Ordering::SeqCst);

        NeverHelps.compress(data)
    }
}

/// Every chunk is filled with its own index so that misordering is visible.
fn indexed_image(num_chunks: u8, chunk_size: usize) -> Vec<u8> {
    (0..num_chunks)
        .flat_map(|i| std::iter::repeat_n(i, chunk_size))
        .collect()
}

fn test_config(rootfs_size: u64, kernel_size: u64, chunk_size: u64) -> PayloadGenerationConfig {
    let mut config = PayloadGenerationConfig::new(
        ImageConfig {
            rootfs_part: PathBuf::from("rootfs.img"),
            rootfs_size,
            kernel_part: PathBuf::from("kernel.img"),
            kernel_size,
        },
        chunk_size,
    );
    config.block_size = 10;
    config
}

fn run_in_memory(
    config: &PayloadGenerationConfig,
    compressor: Arc<dyn Compressor>,
    rootfs: &[u8],
    kernel: &[u8],
    blob: &mut Vec<u8>,
) -> Result<FullUpdate, Error> {
    let cancel_signal = AtomicBool::new(false);

    FullUpdateGenerator::new(config)
        .with_compressor(compressor)
        .run_with(
            |partition| {
                let data = match partition {
                    Partition::Rootfs => rootfs,
                    Partition::Kernel => kernel,
                };
                Ok(MutexFile::new(Cursor::new(data.to_vec())))
            },
            blob,
            &cancel_signal,
        )
}

#[test]
fn uncompressible_chunks() {
    let config = test_config(40, 20, 10);
    let rootfs = indexed_image(4, 10);
    let kernel = indexed_image(2, 10);
    let mut blob = vec![];

    let update = run_in_memory(&config, Arc::new(NeverHelps), &rootfs, &kernel, &mut blob).unwrap();

    let rootfs_ops = update.rootfs_operations().collect::<Vec<_>>();
    assert_eq!(rootfs_ops.len(), 4);

    for (i, op) in rootfs_ops.iter().enumerate() {
        assert_eq!(op.type_, Type::Replace);
        assert_eq!(op.data_offset, i as u64 * 10);
        assert_eq!(op.data_length, 10);
        assert_eq!(
            op.dst_extents,
            [Extent {
                start_block: i as u64,
                num_blocks: 1,
            }],
        );
    }

    assert_eq!(update.final_order, [0, 1, 2, 3]);
    assert_eq!(update.graph[3].label, "<rootfs-operation-3>");

    // Kernel data follows the rootfs data, but kernel extents start at 0.
    assert_eq!(update.kernel_ops.len(), 2);
    assert_eq!(update.kernel_ops[0].data_offset, 40);
    assert_eq!(update.kernel_ops[1].data_offset, 50);
    assert_eq!(update.kernel_ops[1].dst_extents[0].start_block, 1);

    assert_eq!(update.data_file_size, 60);
    assert_eq!(blob, [rootfs, kernel].concat());
}

#[test]
fn compressed_chunk_shifts_offsets() {
    let config = test_config(40, 0, 10);
    let mut rootfs = indexed_image(4, 10);
    rootfs[..10].fill(0);
    let mut blob = vec![];

    let update = run_in_memory(&config, Arc::new(ZerosShrink), &rootfs, &[], &mut blob).unwrap();
    let ops = update.rootfs_operations().collect::<Vec<_>>();

    assert_eq!(ops[0].type_, Type::ReplaceXz);
    assert_eq!(ops[0].data_length, 4);
    assert_eq!(ops[1].type_, Type::Replace);
    assert_eq!(ops[1].data_offset, 4);
    assert_eq!(ops[3].data_offset, 24);

    assert!(update.kernel_ops.is_empty());
    assert_eq!(update.data_file_size, 34);
    assert_eq!(&blob[..4], &[0xff; 4]);
    assert_eq!(&blob[4..], &rootfs[10..]);
}

#[test]
fn contiguous_and_deterministic() {
    let config = test_config(200, 60, 20);
    let rootfs = indexed_image(10, 20);
    let kernel = indexed_image(3, 20);

    let mut first_blob = vec![];
    let first = run_in_memory(
        &config,
        Arc::new(ZerosShrink),
        &rootfs,
        &kernel,
        &mut first_blob,
    )
    .unwrap();

    let mut expected_offset = 0;
    for op in first.rootfs_operations().chain(&first.kernel_ops) {
        assert_eq!(op.data_offset, expected_offset);
        expected_offset += op.data_length;
    }
    assert_eq!(expected_offset, first.data_file_size);
    assert_eq!(first.final_order, (0..10).collect::<Vec<_>>());

    let mut second_blob = vec![];
    let second = run_in_memory(
        &config,
        Arc::new(ZerosShrink),
        &rootfs,
        &kernel,
        &mut second_blob,
    )
    .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_blob, second_blob);
}

#[test]
fn window_is_bounded_and_ordered() {
    let mut config = test_config(50, 0, 10);
    config.max_workers = NonZeroUsize::new(2);
    let rootfs = indexed_image(5, 10);
    let tracking = Arc::new(Tracking::default());
    let mut blob = vec![];

    let update = run_in_memory(&config, tracking.clone(), &rootfs, &[], &mut blob).unwrap();

    assert!(tracking.max_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(tracking.active.load(Ordering::SeqCst), 0);

    let starts = update
        .rootfs_operations()
        .map(|op| op.dst_extents[0].start_block)
        .collect::<Vec<_>>();
    assert_eq!(starts, [0, 1, 2, 3, 4]);
    assert_eq!(blob, rootfs);
}

#[test]
fn short_image_fails_after_earlier_chunks() {
    let config = test_config(40, 0, 10);
    let rootfs = indexed_image(3, 10);
    let mut blob = vec![];

    let result = run_in_memory(&config, Arc::new(NeverHelps), &rootfs, &[], &mut blob);

    assert_matches!(
        result,
        Err(Error::ReadChunk {
            partition: Partition::Rootfs,
            offset: 30,
            size: 10,
            source,
        }) if source.kind() == io::ErrorKind::UnexpectedEof
    );
    // Chunks before the failing one were already emitted.
    assert_eq!(blob, rootfs);
}

#[test]
fn invalid_config_does_no_io() {
    let config = test_config(40, 0, 0);
    let cancel_signal = AtomicBool::new(false);
    let mut opened = false;
    let mut blob = vec![];

    let result = FullUpdateGenerator::new(&config).run_with(
        |_| {
            opened = true;
            Ok(MutexFile::new(Cursor::new(Vec::<u8>::new())))
        },
        &mut blob,
        &cancel_signal,
    );

    assert_matches!(
        result,
        Err(Error::Config(config::Error::NonPositiveChunkSize))
    );
    assert!(!opened);
    assert!(blob.is_empty());
}

#[test]
fn missing_image() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(0, 0, 10);
    config.target.rootfs_part = temp_dir.path().join("rootfs.img");
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        generate_full_update(&config, io::sink(), &cancel_signal),
        Err(Error::OpenImage(Partition::Rootfs, _, e)) if e.kind() == io::ErrorKind::NotFound
    );
}

#[test]
fn cancelled() {
    let config = test_config(40, 0, 10);
    let rootfs = indexed_image(4, 10);
    let cancel_signal = AtomicBool::new(true);

    let result = FullUpdateGenerator::new(&config)
        .with_compressor(Arc::new(NeverHelps))
        .run_with(
            |_| Ok(MutexFile::new(Cursor::new(rootfs.clone()))),
            io::sink(),
            &cancel_signal,
        );

    assert_matches!(result, Err(Error::Cancelled(_)));
}

fn round_trip(compression: PayloadCompression) {
    let temp_dir = tempfile::tempdir().unwrap();
    let rootfs_path = temp_dir.path().join("rootfs.img");
    let kernel_path = temp_dir.path().join("kernel.img");

    // Mix of compressible and incompressible blocks.
    let mut rootfs = vec![0u8; 4 * 4096];
    for (i, b) in rootfs[8192..].iter_mut().enumerate() {
        *b = (i.wrapping_mul(2_654_435_761) >> 13) as u8;
    }
    let kernel = b"kernel image".repeat(2 * 4096 / 12 + 1)[..2 * 4096].to_vec();

    fs::write(&rootfs_path, &rootfs).unwrap();
    fs::write(&kernel_path, &kernel).unwrap();

    let mut config = PayloadGenerationConfig::new(
        ImageConfig::from_paths(&rootfs_path, &kernel_path).unwrap(),
        4096,
    );
    config.compression = compression;

    let cancel_signal = AtomicBool::new(false);
    let mut blob = Cursor::new(Vec::new());
    let update = generate_full_update(&config, &mut blob, &cancel_signal).unwrap();

    assert_eq!(update.final_order.len(), 4);
    assert_eq!(update.kernel_ops.len(), 2);
    assert_eq!(
        update.rootfs_operations().next().unwrap().type_,
        compression.operation_type(),
    );

    let mut new_rootfs = Cursor::new(vec![0u8; rootfs.len()]);
    payload::apply_operations(
        &mut blob,
        &mut new_rootfs,
        config.block_size,
        update.rootfs_operations(),
        &cancel_signal,
    )
    .unwrap();
    assert_eq!(new_rootfs.into_inner(), rootfs);

    let mut new_kernel = Cursor::new(vec![0u8; kernel.len()]);
    payload::apply_operations(
        &mut blob,
        &mut new_kernel,
        config.block_size,
        &update.kernel_ops,
        &cancel_signal,
    )
    .unwrap();
    assert_eq!(new_kernel.into_inner(), kernel);

    // The info summary survives serialization.
    let info = update.to_info(config.block_size);
    let toml = toml_edit::ser::to_string_pretty(&info).unwrap();
    assert_eq!(toml_edit::de::from_str::<payload::FullUpdateInfo>(&toml).unwrap(), info);
}

#[test]
fn round_trip_bzip2() {
    round_trip(PayloadCompression::Bzip2);
}

#[test]
fn round_trip_xz() {
    round_trip(PayloadCompression::Xz);
}
