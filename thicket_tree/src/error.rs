// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::fmt;

/// Errors returned by fallible tree operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Entity bounds were non-finite or had inverted extents.
    InvalidBounds,
    /// The key does not name a live entity (never inserted, removed, or the
    /// arena slot has since been reused).
    NotFound,
    /// The operation was invoked while a refresh (bulk build or `flush`) was
    /// already in progress, for example from inside a bound-change listener.
    Reentrant,
    /// `relocate` was called on an entity inserted without
    /// [`EntityFlags::MOBILE`][crate::EntityFlags::MOBILE].
    NotMobile,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBounds => write!(f, "entity bounds are non-finite or inverted"),
            Self::NotFound => write!(f, "no live entity for this key"),
            Self::Reentrant => write!(f, "operation invoked during an in-progress refresh"),
            Self::NotMobile => write!(f, "entity was not inserted as mobile"),
        }
    }
}

impl core::error::Error for Error {}
