// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod migrate;
mod schema;

pub use loader::{config_dir, load, load_mcp_config, save, state_dir};
pub use migrate::{migrate_to_current, CURRENT_CONFIG_VERSION};
pub use schema::{
    AgentLimits, Config, McpConfig, McpServerConfig, McpTransport, PermissionMode,
    PermissionRulesConfig, ProviderConfig, ProviderKind,
};
