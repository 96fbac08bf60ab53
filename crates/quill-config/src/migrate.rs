// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Config schema migrations.
//!
//! `config.json` carries a numeric `version` field. Each released schema
//! change gets one migration step; loading always walks the chain from the
//! file's version to [`CURRENT_CONFIG_VERSION`] before deserialising into
//! [`crate::Config`]. Steps operate on raw JSON so old shapes that no
//! longer deserialise cleanly can still be upgraded.

use anyhow::bail;
use serde_json::{json, Value};
use tracing::debug;

/// Version written by this build.
pub const CURRENT_CONFIG_VERSION: u32 = 4;

/// Walk the migration chain until the value reports the current version.
///
/// Unversioned files (`version` absent or 0) are treated as version 1,
/// the first released schema. A version from the future is an error —
/// downgrading is not supported.
pub fn migrate_to_current(mut raw: Value) -> anyhow::Result<Value> {
    let mut version = raw
        .get("version")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(0)
        .max(1);

    if version > CURRENT_CONFIG_VERSION {
        bail!(
            "config version {version} is newer than this build supports \
             ({CURRENT_CONFIG_VERSION}); refusing to downgrade"
        );
    }

    while version < CURRENT_CONFIG_VERSION {
        debug!(from = version, to = version + 1, "migrating config schema");
        raw = match version {
            1 => v1_to_v2(raw),
            2 => v2_to_v3(raw),
            3 => v3_to_v4(raw),
            other => bail!("no migration step defined from config version {other}"),
        };
        version += 1;
        raw["version"] = json!(version);
    }

    Ok(raw)
}

/// v1 → v2: flat provider fields (`provider`, `baseUrl`, `apiKey`, `model`)
/// move into a nested `provider` object with snake_case keys.
fn v1_to_v2(mut raw: Value) -> Value {
    let provider = raw.get("provider").and_then(|v| v.as_str()).map(str::to_string);
    let base_url = raw.get("baseUrl").and_then(|v| v.as_str()).map(str::to_string);
    let api_key = raw.get("apiKey").and_then(|v| v.as_str()).map(str::to_string);
    let model = raw.get("model").and_then(|v| v.as_str()).map(str::to_string);

    if let Some(obj) = raw.as_object_mut() {
        obj.remove("provider");
        obj.remove("baseUrl");
        obj.remove("apiKey");
        obj.remove("model");

        let mut block = serde_json::Map::new();
        if let Some(p) = provider {
            // v1 stored the raw wire name; "openai" meant the compat shape.
            let kind = if p == "anthropic" { "anthropic" } else { "openai-compat" };
            block.insert("provider".into(), json!(kind));
        }
        if let Some(u) = base_url {
            block.insert("base_url".into(), json!(u));
        }
        if let Some(k) = api_key {
            block.insert("api_key".into(), json!(k));
        }
        if let Some(m) = model {
            block.insert("model".into(), json!(m));
        }
        obj.insert("provider".into(), Value::Object(block));
    }
    raw
}

/// v2 → v3: introduces `permission_mode`. v2 files had a boolean
/// `autoApproveEdits` flag; `true` maps to `auto-edit`, absent/false to
/// `default`.
fn v2_to_v3(mut raw: Value) -> Value {
    let auto_edit = raw
        .get("autoApproveEdits")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if let Some(obj) = raw.as_object_mut() {
        obj.remove("autoApproveEdits");
        obj.entry("permission_mode")
            .or_insert(json!(if auto_edit { "auto-edit" } else { "default" }));
    }
    raw
}

/// v3 → v4: permission rule lists move from a flat `rules` array of
/// `{pattern, decision}` objects into the `permissions.{allow,ask,deny}`
/// lists used today.
fn v3_to_v4(mut raw: Value) -> Value {
    let mut allow = Vec::new();
    let mut ask = Vec::new();
    let mut deny = Vec::new();

    if let Some(rules) = raw.get("rules").and_then(|v| v.as_array()) {
        for rule in rules {
            let pattern = rule.get("pattern").and_then(|v| v.as_str());
            let decision = rule.get("decision").and_then(|v| v.as_str());
            if let (Some(p), Some(d)) = (pattern, decision) {
                match d {
                    "allow" => allow.push(json!(p)),
                    "deny" => deny.push(json!(p)),
                    _ => ask.push(json!(p)),
                }
            }
        }
    }

    if let Some(obj) = raw.as_object_mut() {
        obj.remove("rules");
        obj.entry("permissions").or_insert(json!({
            "allow": allow,
            "ask": ask,
            "deny": deny,
        }));
    }
    raw
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
