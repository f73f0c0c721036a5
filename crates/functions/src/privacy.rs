//! Privacy redaction operator: `privacyPolicy`
//!
//! Hashes the value's UTF-8 rendering before it leaves the device.
//! `one-way` is SHA-256; `two-way` is HMAC-SHA-256 keyed by `hashingKey`.
//! Digests are emitted as unpadded base64url. A missing key or an
//! unsupported level passes the value through unchanged with a warning.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::warn;

use sensorlink_core::AttributeValue;

use crate::params::Parameters;
use crate::value::FnValue;

type HmacSha256 = Hmac<Sha256>;

pub(crate) fn redact(params: Parameters<'_>, value: FnValue) -> FnValue {
    let FnValue::Attribute(attribute) = &value else {
        warn!("privacyPolicy applied to a non-attribute value; passing through");
        return value;
    };

    let level = params.str("level").unwrap_or("none");
    let plaintext = attribute.to_string();

    match level {
        "none" => value,
        "one-way" => {
            let digest = Sha256::digest(plaintext.as_bytes());
            FnValue::Attribute(AttributeValue::String(URL_SAFE_NO_PAD.encode(digest)))
        }
        "two-way" => {
            let Some(key) = params.str("hashingKey") else {
                warn!("privacyPolicy level 'two-way' without hashingKey; passing through");
                return value;
            };
            match HmacSha256::new_from_slice(key.as_bytes()) {
                Ok(mut mac) => {
                    mac.update(plaintext.as_bytes());
                    let digest = mac.finalize().into_bytes();
                    FnValue::Attribute(AttributeValue::String(URL_SAFE_NO_PAD.encode(digest)))
                }
                Err(e) => {
                    warn!("privacyPolicy could not key HMAC: {}; passing through", e);
                    value
                }
            }
        }
        other => {
            // 'random' is declared by the wire format but not supported
            warn!("privacyPolicy level '{}' is unsupported; passing through", other);
            value
        }
    }
}
