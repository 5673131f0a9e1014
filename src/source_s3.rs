//! S3 document source.
//!
//! Lists a bucket prefix with `ListObjectsV2` (following continuation
//! tokens) and downloads objects with signed `GET` requests. Requests are
//! signed with AWS Signature V4 using `hmac` + `sha2`, so no AWS SDK or C
//! crypto library is needed. `endpoint_url` points it at MinIO, LocalStack,
//! or another S3-compatible store (path-style addressing).
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and
//! optionally `AWS_SESSION_TOKEN`.
//!
//! Keys returned by [`S3Source`] are full object keys; glob filters apply
//! to the key with the configured prefix stripped.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::S3SourceConfig;
use crate::sources::{build_globset, DocumentSource, SourceListing};

type HmacSha256 = Hmac<Sha256>;

pub struct S3Source {
    config: S3SourceConfig,
    signer: SigV4Signer,
    client: reqwest::Client,
    include: GlobSet,
    exclude: GlobSet,
}

impl S3Source {
    pub fn new(config: S3SourceConfig) -> Result<Self> {
        let signer = SigV4Signer::from_env(&config.region)?;
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            signer,
            client: reqwest::Client::new(),
            config,
        })
    }

    /// `(scheme, host, path prefix)` for requests.
    fn endpoint(&self) -> (String, String, String) {
        match &self.config.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") { "http" } else { "https" };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme.to_string(), host, format!("/{}", self.config.bucket))
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", self.config.bucket, self.config.region),
                String::new(),
            ),
        }
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        let prefix = self.config.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return key;
        }
        key.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key)
    }

    async fn signed_get(&self, path: &str, query: &[(String, String)]) -> Result<reqwest::Response> {
        let (scheme, host, _) = self.endpoint();
        let signed = self.signer.sign_get(&host, path, query, Utc::now());

        let mut url = format!("{}://{}{}", scheme, host, path);
        if !signed.canonical_query.is_empty() {
            url.push('?');
            url.push_str(&signed.canonical_query);
        }

        let mut request = self.client.get(&url);
        for (name, value) in &signed.headers {
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        request
            .send()
            .await
            .with_context(|| format!("S3 request failed: {}", url))
    }
}

#[async_trait]
impl DocumentSource for S3Source {
    fn name(&self) -> &str {
        "s3"
    }

    async fn list(&self) -> Result<Vec<SourceListing>> {
        let (_, _, bucket_path) = self.endpoint();
        let path = format!("{}/", bucket_path);
        let mut listings = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.config.prefix.is_empty() {
                query.push(("prefix".to_string(), self.config.prefix.clone()));
            }
            if let Some(t) = &token {
                query.push(("continuation-token".to_string(), t.clone()));
            }

            let response = self.signed_get(&path, &query).await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let page = parse_list_objects(&body);
            for object in page.objects {
                let rel = self.relative_key(&object.key);
                if self.exclude.is_match(rel) || !self.include.is_match(rel) {
                    continue;
                }
                listings.push(object);
            }
            match page.next_token {
                Some(next) if page.truncated => token = Some(next),
                _ => break,
            }
        }

        listings.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(bucket = %self.config.bucket, count = listings.len(), "listed S3 objects");
        Ok(listings)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let (_, _, bucket_path) = self.endpoint();
        let encoded = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let path = format!("{}/{}", bucket_path, encoded);

        let response = self.signed_get(&path, &[]).await?;
        if !response.status().is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", response.status(), key);
        }
        Ok(response.bytes().await?.to_vec())
    }
}

// ============ Signature V4 ============

struct SignedRequest {
    canonical_query: String,
    headers: Vec<(String, String)>,
}

struct SigV4Signer {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    region: String,
}

impl SigV4Signer {
    fn from_env(region: &str) -> Result<Self> {
        Ok(Self {
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID")
                .context("AWS_ACCESS_KEY_ID environment variable not set")?,
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY")
                .context("AWS_SECRET_ACCESS_KEY environment variable not set")?,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            region: region.to_string(),
        })
    }

    /// Sign an empty-body `GET`. `path` must already be URI-encoded.
    fn sign_get(
        &self,
        host: &str,
        path: &str,
        query: &[(String, String)],
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let mut sorted: Vec<_> = query.to_vec();
        sorted.sort();
        let canonical_query = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String =
            headers.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();

        let canonical_request = format!(
            "GET\n{}\n{}\n{}\n{}\n{}",
            path, canonical_query, canonical_headers, signed_headers, payload_hash
        );
        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let key = signing_key(&self.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        headers.push((
            "authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                self.access_key_id, scope, signed_headers, signature
            ),
        ));

        SignedRequest {
            canonical_query,
            headers,
        }
    }
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

// ============ ListObjectsV2 parsing ============

struct ListPage {
    objects: Vec<SourceListing>,
    truncated: bool,
    next_token: Option<String>,
}

fn parse_list_objects(xml: &str) -> ListPage {
    let objects = xml
        .split("<Contents>")
        .skip(1)
        .filter_map(|block| {
            let block = block.split("</Contents>").next()?;
            let key = xml_value(block, "Key")?;
            if key.is_empty() || key.ends_with('/') {
                return None;
            }
            let last_modified = xml_value(block, "LastModified")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.timestamp_millis())
                .unwrap_or(0);
            let size_bytes = xml_value(block, "Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some(SourceListing {
                key: xml_unescape(&key),
                last_modified,
                size_bytes,
            })
        })
        .collect();

    ListPage {
        objects,
        truncated: xml_value(xml, "IsTruncated").as_deref() == Some("true"),
        next_token: xml_value(xml, "NextContinuationToken"),
    }
}

/// Text of the first `<tag>…</tag>` (non-nested).
fn xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
