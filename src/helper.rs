use std::collections::BTreeMap;

use crate::{Error, Result};
use k8s_openapi::{ByteString, api::core::v1::Secret};

pub static SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

pub fn get_my_namespace() -> Result<String> {
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_PATH)
        .map(|ns| ns.trim_end_matches('\n').to_string())
        .map_err(Error::IoError)
}

pub enum Decoded {
    /// Usually secrets are just short utf8 encoded strings
    Utf8(String),
    /// But it's allowed to just base64 encode binary in the values
    Bytes(Vec<u8>),
}

pub fn decode_secret(secret: &Secret) -> BTreeMap<String, Decoded> {
    let mut res = BTreeMap::new();
    if let Some(data) = secret.data.clone() {
        for (k, v) in data {
            if let Ok(b) = std::str::from_utf8(&v.0) {
                res.insert(k, Decoded::Utf8(b.to_string()));
            } else {
                res.insert(k, Decoded::Bytes(v.0));
            }
        }
    }
    // string_data only shows up on objects that never went through the API server
    if let Some(string_data) = secret.string_data.clone() {
        for (k, v) in string_data {
            res.entry(k).or_insert(Decoded::Utf8(v));
        }
    }
    res
}

/// UTF-8 value of `key`, or `None` when missing or binary
pub fn secret_text(secret: &Secret, key: &str) -> Option<String> {
    match decode_secret(secret).remove(key) {
        Some(Decoded::Utf8(s)) => Some(s),
        _ => None,
    }
}

pub fn set_secret_text(secret: &mut Secret, key: &str, value: &str) {
    secret
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
}
