// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Summary of one [`Tree::flush`][crate::Tree::flush] pass.
///
/// Useful for asserting batching behavior in tests and for coarse
/// instrumentation: a caller that flushes after every mutation will see
/// `visited` track tree depth, while a caller that batches sees shared
/// ancestors visited once.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushReport {
    /// Number of dirty nodes recomputed.
    pub visited: usize,
    /// Number of nodes whose cached bound actually changed (and whose change
    /// was reported to listeners).
    pub changed: usize,
}

impl FlushReport {
    /// True if no node's cached bound changed.
    pub fn is_clean(&self) -> bool {
        self.changed == 0
    }
}
