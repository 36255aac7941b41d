// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run and workflow identifier generation.
//!
//! Ids are 26-character lowercase Crockford-base32 ULIDs. Lexicographic
//! order matches creation order: the generator is monotonic within a
//! millisecond, and a single module-scoped mutex guards the entropy source
//! so concurrent callers cannot observe out-of-order ids.

use std::sync::{LazyLock, Mutex};

use ulid::{Generator, Ulid};

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Generate a new run or workflow id.
pub fn new_id() -> String {
    let mut generator = match GENERATOR.lock() {
        Ok(guard) => guard,
        // A panic while holding the lock cannot corrupt the generator state.
        Err(poisoned) => poisoned.into_inner(),
    };

    // The monotonic generator only fails when the random component overflows
    // within one millisecond; a fresh ULID keeps the time prefix ordered.
    let ulid = generator.generate().unwrap_or_else(|_| Ulid::new());
    ulid.to_string().to_lowercase()
}
