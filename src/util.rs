//! Convenient utility functions.

use std::{cmp::Ordering, num::NonZeroUsize, thread};

use ndarray::ArrayView1;

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let style = ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let progress_bar = ProgressBar::new(len as u64).with_style(style);
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Return the index of the maximum value in the given array.
pub fn argmax_by<T, F>(array: ArrayView1<T>, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut idx_max = 0;

    for i in 0..array.shape()[0] {
        if compare(&array[i], &array[idx_max]).is_gt() {
            idx_max = i;
        }
    }

    idx_max
}

/// Returns the number of worker threads used for CPU-bound scoring: half of the available
/// hardware threads, at least 1.
pub fn worker_threads() -> usize {
    let available = thread::available_parallelism().map_or(1, NonZeroUsize::get);

    (available / 2).max(1)
}

/// Formats a key as a lowercase hexadecimal string.
pub fn key_to_hex(key: &[u8]) -> String {
    hex::encode(key)
}
