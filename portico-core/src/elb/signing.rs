//! AWS Signature Version 4 for form-encoded POST requests

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ElbConfig;
use crate::error::{PorticoError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Access credentials for the cloud API
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Explicit credentials from config, else the standard AWS environment variables
    pub fn resolve(config: &ElbConfig) -> Result<Self> {
        Self::resolve_with(config, |key| std::env::var(key).ok())
    }

    fn resolve_with(config: &ElbConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let (Some(id), Some(secret)) = (&config.aws_access_key_id, &config.aws_access_key_secret) {
            return Ok(Self {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: config.aws_session_token.clone(),
            });
        }

        match (lookup("AWS_ACCESS_KEY_ID"), lookup("AWS_SECRET_ACCESS_KEY")) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok(Self {
                access_key_id: id,
                secret_access_key: secret,
                session_token: lookup("AWS_SESSION_TOKEN").filter(|t| !t.is_empty()),
            }),
            _ => Err(PorticoError::MissingCredentials),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| PorticoError::Internal {
        message: format!("Invalid signing key: {}", e),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Derive the per-day signing key
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// Headers to attach to a signed form POST to `/` on `host`
pub fn sign_form_post(
    credentials: &Credentials,
    region: &str,
    service: &str,
    host: &str,
    body: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut canonical_headers = format!(
        "content-type:{}\nhost:{}\nx-amz-date:{}\n",
        FORM_CONTENT_TYPE, host, amz_date
    );
    let mut signed_headers = String::from("content-type;host;x-amz-date");
    if let Some(token) = &credentials.session_token {
        canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
        signed_headers.push_str(";x-amz-security-token");
    }

    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers,
        signed_headers,
        sha256_hex(body.as_bytes())
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(&credentials.secret_access_key, &date, region, service)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    let mut headers = vec![
        ("content-type", FORM_CONTENT_TYPE.to_string()),
        ("x-amz-date", amz_date),
        (
            "authorization",
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                credentials.access_key_id, scope, signed_headers, signature
            ),
        ),
    ];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }
    Ok(headers)
}
