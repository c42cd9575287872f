//! Signed websocket URLs for the speech services.
//! signature = base64(HMAC-SHA256(secret, "host: …\ndate: …\nGET <path> HTTP/1.1"))
//! and the URL carries `authorization`, `date` and `host` query parameters.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use url::Url;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Application credentials shared by recognition and synthesis.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.app_id.is_empty() && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

/// HTTP date in RFC 1123 form, always GMT.
pub fn rfc1123(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Build the signed URL for `endpoint` (e.g. `wss://iat-api.xfyun.cn/v2/iat`).
pub fn signed_url(
    endpoint: &str,
    credentials: &Credentials,
    date: DateTime<Utc>,
) -> Result<String> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("bad endpoint {endpoint}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config(format!("endpoint has no host: {endpoint}")))?
        .to_string();
    let date = rfc1123(date);

    let origin = format!("host: {host}\ndate: {date}\nGET {} HTTP/1.1", url.path());
    let mut mac = HmacSha256::new_from_slice(credentials.api_secret.as_bytes())
        .map_err(|e| Error::Config(format!("bad api secret: {e}")))?;
    mac.update(origin.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let authorization = BASE64.encode(format!(
        "api_key=\"{}\", algorithm=\"hmac-sha256\", \
         headers=\"host date request-line\", signature=\"{}\"",
        credentials.api_key, signature
    ));

    url.query_pairs_mut()
        .append_pair("authorization", &authorization)
        .append_pair("date", &date)
        .append_pair("host", &host);
    Ok(url.into())
}
