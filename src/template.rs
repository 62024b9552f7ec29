//! `${NAME}` substitution over arbitrarily nested YAML values.
//!
//! Used in two places: rendering the cloud-init user-data handed to the
//! cloud provider, and expanding the side-car process environment. A lookup
//! that misses leaves the token byte-identical in the output, so applying a
//! template twice is a no-op once every token has a replacement.

use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Variable names always injected into the cloud-init template. They override
/// any caller-supplied value of the same name.
pub const SERVER_RSA_PRIVATE: &str = "SERVER_RSA_PRIVATE";
pub const SERVER_RSA_PUBLIC: &str = "SERVER_RSA_PUBLIC";
pub const AUTOSCALER_AUTHORIZED_KEY: &str = "AUTOSCALER_AUTHORIZED_KEY";

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{[^}]+?\}").expect("token regex is valid"))
}

/// Replace every `${NAME}` token in `input` for which `lookup` returns a
/// value. Tokens without a replacement are preserved as-is.
pub fn render_str<F>(lookup: &F, input: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    token_re()
        .replace_all(input, |caps: &regex::Captures| {
            let token = &caps[0];
            let key = &token[2..token.len() - 1];
            lookup(key).unwrap_or_else(|| token.to_string())
        })
        .into_owned()
}

/// Recursively substitute tokens in every string reachable from `value`.
/// Sequences and mappings are traversed at any depth; non-string leaves are
/// returned untouched.
pub fn render_value<F>(lookup: &F, value: Value) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => Value::String(render_str(lookup, &s)),
        Value::Sequence(seq) => {
            Value::Sequence(seq.into_iter().map(|v| render_value(lookup, v)).collect())
        }
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, render_value(lookup, v)))
                .collect(),
        ),
        other => other,
    }
}

/// Substitute tokens in the values of a flat string map.
pub fn render_map<F>(lookup: &F, map: &HashMap<String, String>) -> HashMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    map.iter()
        .map(|(k, v)| (k.clone(), render_str(lookup, v)))
        .collect()
}

/// Lookup backed by a string map.
pub fn map_lookup(map: &HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
    |key| map.get(key).cloned()
}

/// Wrap a lookup so that `env.NAME` keys resolve from the process
/// environment (empty string when unset). Only the side-car process
/// environment goes through this; cloud-init substitution does not.
pub fn with_env<F>(lookup: F) -> impl Fn(&str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    move |key| match key.strip_prefix("env.") {
        Some(name) => Some(std::env::var(name).unwrap_or_default()),
        None => lookup(key),
    }
}

/// Render the cloud-init user-data: substitute `variables` (with the three
/// key-material names injected on top) throughout `template` and serialise
/// as YAML behind the `#cloud-config` header line.
pub fn render_cloud_init(
    template: &Mapping,
    variables: &HashMap<String, String>,
    server_private_pem: &str,
    server_public_key: &str,
    authorized_key: &str,
) -> Result<String, serde_yaml::Error> {
    let mut merged = variables.clone();
    merged.insert(SERVER_RSA_PRIVATE.to_string(), server_private_pem.to_string());
    merged.insert(SERVER_RSA_PUBLIC.to_string(), server_public_key.to_string());
    merged.insert(
        AUTOSCALER_AUTHORIZED_KEY.to_string(),
        authorized_key.to_string(),
    );

    let lookup = map_lookup(&merged);
    let rendered = render_value(&lookup, Value::Mapping(template.clone()));
    let yaml = serde_yaml::to_string(&rendered)?;
    Ok(format!("#cloud-config\n{yaml}"))
}
