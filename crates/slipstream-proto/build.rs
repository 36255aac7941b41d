// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io::Result;

fn main() -> Result<()> {
    // Compile the orchestrator protocol (client-facing gRPC surface of the engine)
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/engine.proto"], &["proto/"])?;

    Ok(())
}
