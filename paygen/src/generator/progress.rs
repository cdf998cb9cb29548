// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use tracing::info;

use crate::generator::config::Partition;

/// Coarse percent-complete logging for one partition. A line is logged for the
/// first completed chunk, then whenever progress advances by at least 10
/// percentage points, and finally at 100%.
pub struct ProgressReporter {
    partition: Partition,
    partition_size: u64,
    last_reported: Option<u64>,
}

impl ProgressReporter {
    pub fn new(partition: Partition, partition_size: u64) -> Self {
        Self {
            partition,
            partition_size,
            last_reported: None,
        }
    }

    /// Record that the first `bytes_done` bytes of the partition have been
    /// emitted. Returns the percentage if a line was logged.
    pub fn update(&mut self, bytes_done: u64, output_size: u64) -> Option<u64> {
        if self.partition_size == 0 {
            return None;
        }

        // Widen to avoid overflow for huge partitions.
        let progress = (u128::from(bytes_done) * 100 / u128::from(self.partition_size)) as u64;

        let report = match self.last_reported {
            None => true,
            Some(last) => last < progress && (last + 10 <= progress || progress == 100),
        };
        if !report {
            return None;
        }

        info!(
            "{}: {progress}% complete (output size: {output_size})",
            self.partition,
        );
        self.last_reported = Some(progress);

        Some(progress)
    }
}
