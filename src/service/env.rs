//! Subprocess environment
//!
//! Every request parameter is handed to the transport as
//! `<NAMESPACE>_<KEY>`. The host environment is passed through, except
//! for anything already inside the namespace.

use std::collections::BTreeMap;

/// Default private namespace for transport variables
pub const DEFAULT_NAMESPACE: &str = "TSUP";

/// Bearer secret used for telemetry callbacks
pub const AUTH_SECRET_KEY: &str = "sauth";

/// Telemetry callback URL
pub const CALLBACK_URL_KEY: &str = "saddr";

/// Name of the environment variable carrying `key`
pub fn env_name(namespace: &str, key: &str) -> String {
    format!("{}_{}", namespace, key.to_ascii_uppercase())
}

/// Request keys are limited to ASCII alphanumerics and `_`.
pub fn key_is_valid(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Compute the complete environment for a transport process.
pub fn build_environment<I>(
    host: I,
    namespace: &str,
    request: &BTreeMap<String, String>,
    auth_secret: &str,
    callback_url: &str,
) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefix = format!("{}_", namespace);
    let mut env: Vec<(String, String)> = host
        .into_iter()
        .filter(|(key, _)| !key.starts_with(&prefix))
        .collect();

    env.extend(
        request
            .iter()
            .filter(|(key, _)| key_is_valid(key))
            .map(|(key, value)| (env_name(namespace, key), value.clone())),
    );
    env.push((env_name(namespace, AUTH_SECRET_KEY), auth_secret.to_string()));
    env.push((env_name(namespace, CALLBACK_URL_KEY), callback_url.to_string()));
    env
}
