// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::{migrate_to_current, Config, McpConfig, ProviderKind, CURRENT_CONFIG_VERSION};

/// User-level configuration directory (`~/.quill`).
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quill")
}

/// Root for per-session persisted state (snapshots, recordings).
pub fn state_dir() -> PathBuf {
    config_dir()
}

/// Load `config.json`, walking the migration chain and resolving the API
/// key from the environment when the file omits it.
///
/// `explicit` overrides the default location (used by tests and embedders).
/// A missing file yields the defaults — first run needs no setup.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_dir().join("config.json"));

    let mut config = if path.is_file() {
        debug!(path = %path.display(), "loading config");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let raw: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let migrated = migrate_to_current(raw)
            .with_context(|| format!("migrating {}", path.display()))?;
        serde_json::from_value(migrated)
            .with_context(|| format!("deserialising {}", path.display()))?
    } else {
        Config {
            version: CURRENT_CONFIG_VERSION,
            ..Config::default()
        }
    };

    if config.provider.api_key.is_none() {
        let env_var = match config.provider.provider {
            ProviderKind::OpenaiCompat => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        };
        if let Ok(key) = std::env::var(env_var) {
            if !key.is_empty() {
                config.provider.api_key = Some(key);
            }
        }
    }

    Ok(config)
}

/// Write `config.json` atomically with owner-only permissions.
///
/// The file may carry an API key, so it is written 0600 on unix. The temp
/// file lives in the same directory so the rename never crosses a
/// filesystem boundary.
pub fn save(config: &Config, explicit: Option<&Path>) -> anyhow::Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_dir().join("config.json"));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut out = config.clone();
    out.version = CURRENT_CONFIG_VERSION;
    let text = serde_json::to_string_pretty(&out)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", tmp.display()))?;
    }

    std::fs::rename(&tmp, &path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Load `mcp-config.json`. A missing file means no external servers.
pub fn load_mcp_config(explicit: Option<&Path>) -> anyhow::Result<McpConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_dir().join("mcp-config.json"));

    if !path.is_file() {
        return Ok(McpConfig::default());
    }

    debug!(path = %path.display(), "loading mcp config");
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
