//! Size-balanced work partitioning.
//!
//! Splits pending file tasks into groups of roughly equal byte totals so that
//! workers finish at about the same time without work stealing.
//!
//! Files are taken largest first (stable, so ties keep discovery order) and
//! each one is appended to the partition with the smallest running total. The
//! result keeps every partition within one file's size of
//! `ceil(total / count)`, and the spread between the largest and smallest
//! partition never exceeds the largest file.

use crate::model::FileTask;

/// An ordered group of tasks owned by one worker for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub tasks: Vec<FileTask>,
    pub total_bytes: u64,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    fn push(&mut self, task: FileTask) {
        self.total_bytes += task.total_bytes;
        self.tasks.push(task);
    }
}

/// Split `tasks` into `partition_count` size-balanced partitions.
///
/// Returns an empty vector when there are no tasks. Otherwise exactly
/// `partition_count` partitions are returned (a count of 0 is treated as 1);
/// when there are fewer tasks than partitions the surplus ones are empty and
/// callers are expected to skip them.
///
/// Balancing is by `total_bytes`, not by remaining bytes, so a resumed file
/// keeps its place regardless of how far it got.
pub fn partition(mut tasks: Vec<FileTask>, partition_count: usize) -> Vec<Partition> {
    if tasks.is_empty() {
        return Vec::new();
    }

    let count = partition_count.max(1);

    // `sort_by` is stable: equal sizes stay in discovery order.
    tasks.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));

    let mut partitions = vec![Partition::default(); count];
    for task in tasks {
        let lightest = partitions
            .iter()
            .enumerate()
            .min_by_key(|(index, p)| (p.total_bytes, *index))
            .map(|(index, _)| index)
            .unwrap_or(0);
        partitions[lightest].push(task);
    }

    partitions
}

/// Byte target per partition: `ceil(total / count)`.
pub fn target_size(total_bytes: u64, partition_count: usize) -> u64 {
    let count = partition_count.max(1) as u64;
    total_bytes.div_ceil(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    const MIB: u64 = 1024 * 1024;

    fn tasks(sizes: &[u64]) -> Vec<FileTask> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| FileTask::new(format!("file_{i}"), *size))
            .collect()
    }

    fn assert_complete(input: &[FileTask], output: &[Partition]) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for p in output {
            assert_eq!(p.total_bytes, p.tasks.iter().map(|t| t.total_bytes).sum::<u64>());
            for t in &p.tasks {
                *counts.entry(t.relative_path.as_str()).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), input.len(), "every file must be assigned");
        for t in input {
            assert_eq!(counts.get(t.relative_path.as_str()), Some(&1), "{} assigned once", t.relative_path);
        }
    }

    #[test]
    fn test_example_split_keeps_large_file_alone() {
        let input = vec![
            FileTask::new("a", 10 * MIB),
            FileTask::new("b", MIB),
            FileTask::new("c", MIB),
        ];
        let parts = partition(input, 2);

        assert_eq!(parts.len(), 2);
        let names: Vec<Vec<&str>> = parts
            .iter()
            .map(|p| p.tasks.iter().map(|t| t.relative_path.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["a"], vec!["b", "c"]]);
        assert_eq!(parts[0].total_bytes, 10 * MIB);
        assert_eq!(parts[1].total_bytes, 2 * MIB);
        assert_eq!(target_size(12 * MIB, 2), 6 * MIB);
    }

    #[test]
    fn test_zero_files_returns_no_partitions() {
        assert!(partition(Vec::new(), 4).is_empty());
    }

    #[test]
    fn test_more_partitions_than_files() {
        let input = tasks(&[5, 3]);
        let parts = partition(input.clone(), 5);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts.iter().filter(|p| !p.is_empty()).count(), 2);
        assert_complete(&input, &parts);
    }

    #[test]
    fn test_zero_count_treated_as_one() {
        let input = tasks(&[1, 2, 3]);
        let parts = partition(input.clone(), 0);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 3);
        assert_complete(&input, &parts);
    }

    #[test]
    fn test_descending_order_within_partition_and_stable_ties() {
        let parts = partition(tasks(&[4, 7, 4, 9]), 1);
        let order: Vec<&str> = parts[0].tasks.iter().map(|t| t.relative_path.as_str()).collect();
        assert_eq!(order, vec!["file_3", "file_1", "file_0", "file_2"]);
    }

    #[test]
    fn test_equal_sizes_spread_evenly() {
        // Sequential fill against the target would leave 4 | 4 | 12 here.
        let parts = partition(tasks(&[4, 4, 4, 4, 4]), 3);
        let mut totals: Vec<u64> = parts.iter().map(|p| p.total_bytes).collect();
        totals.sort_unstable();
        assert_eq!(totals, vec![4, 8, 8]);
    }

    #[test]
    fn test_random_distributions_balanced_and_complete() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..300 {
            let file_count = rng.gen_range(0..60);
            let sizes: Vec<u64> = (0..file_count)
                .map(|_| match rng.gen_range(0..3) {
                    0 => rng.gen_range(0..16),
                    1 => rng.gen_range(0..10_000),
                    _ => rng.gen_range(0..50 * MIB),
                })
                .collect();
            let count = rng.gen_range(1..12);
            let input = tasks(&sizes);
            let parts = partition(input.clone(), count);

            if input.is_empty() {
                assert!(parts.is_empty());
                continue;
            }

            assert_eq!(parts.len(), count);
            assert_complete(&input, &parts);

            let largest = sizes.iter().copied().max().unwrap_or(0);
            let max = parts.iter().map(|p| p.total_bytes).max().unwrap_or(0);
            let min = parts.iter().map(|p| p.total_bytes).min().unwrap_or(0);
            assert!(
                max - min <= largest,
                "spread {} exceeds largest file {} for sizes {:?} into {}",
                max - min,
                largest,
                sizes,
                count
            );

            let target = target_size(sizes.iter().sum(), count);
            assert!(max <= target + largest);
        }
    }
}
