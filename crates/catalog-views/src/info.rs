/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

pub(crate) struct Info;

impl Info {
    pub(crate) const fn name() -> &'static str {
        env!("CARGO_PKG_NAME")
    }

    pub(crate) const fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
