//! Signed structural contexts.
//!
//! Contexts the authority emits during a normal page render (for example
//! the arguments a menu was rendered with) travel through the client and come
//! back with render requests. The authority signs each one at emission time
//! with a keyed BLAKE3 hash over a canonical (sorted-key) serialization, and
//! refuses to render from a context whose signature no longer matches.

use crate::error::ErrorCode;
use serde_json::Value;

/// Key under which the signature travels inside a context object.
pub const SIGNATURE_KEY: &str = "signature";

/// Domain separation string for deriving the MAC key from the secret.
const KEY_CONTEXT: &str = "partial-refresh 2024-05 structural context signing key";

/// Serialize a JSON value with object keys sorted at every depth.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Signs and verifies structural contexts with a secret key.
#[derive(Clone)]
pub struct ContextSigner {
    key: [u8; 32],
}

impl std::fmt::Debug for ContextSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSigner").finish_non_exhaustive()
    }
}

impl ContextSigner {
    /// Derive a signing key from secret bytes.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret),
        }
    }

    /// Signature over a context, ignoring any embedded signature field.
    #[must_use]
    pub fn signature(&self, context: &Value) -> blake3::Hash {
        let unsigned = strip_signature(context);
        blake3::keyed_hash(&self.key, canonical_json(&unsigned).as_bytes())
    }

    /// Return a copy of the context with its signature embedded.
    ///
    /// Non-object contexts are wrapped as `{"value": ...}` first so that the
    /// signature has somewhere to live.
    #[must_use]
    pub fn sign(&self, context: &Value) -> Value {
        let mut signed = match context {
            Value::Object(_) => strip_signature(context),
            other => serde_json::json!({ "value": other }),
        };
        let signature = self.signature(&signed).to_hex().to_string();
        if let Value::Object(map) = &mut signed {
            map.insert(SIGNATURE_KEY.to_owned(), Value::String(signature));
        }
        signed
    }

    /// Verify a signed context and return it with the signature removed.
    pub fn verify(&self, context: &Value) -> Result<Value, ErrorCode> {
        let claimed = context
            .get(SIGNATURE_KEY)
            .and_then(Value::as_str)
            .ok_or(ErrorCode::MissingSignature)?;
        let claimed = blake3::Hash::from_hex(claimed).map_err(|_| ErrorCode::SignatureMismatch)?;
        // `blake3::Hash` equality is constant-time.
        if self.signature(context) != claimed {
            return Err(ErrorCode::SignatureMismatch);
        }
        Ok(strip_signature(context))
    }
}

/// Copy of a context without its signature field.
#[must_use]
pub fn strip_signature(context: &Value) -> Value {
    match context {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != SIGNATURE_KEY)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
