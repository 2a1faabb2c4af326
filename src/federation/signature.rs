//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outbound requests sign `(request-target) host date` plus `digest` when a
//! body digest is supplied. Inbound verification rebuilds the plaintext in
//! whatever order the signer listed its headers.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use url::Url;

use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::federation::key_cache::KeyPairCache;

pub const SIGNATURE_ALGORITHM: &str = "rsa-sha256";

/// Date header value (RFC 7231 IMF-fixdate)
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Host header value for a target URL: host, plus the port when it is not
/// the scheme default
pub fn host_header(url: &Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Build the signature header for a POST to `url`
///
/// Signs `(request-target) host date` and `digest` when given.
pub fn sign_request(
    signing_key: &SigningKey<Sha256>,
    key_id: &str,
    url: &Url,
    date: &str,
    digest: Option<&str>,
) -> Result<String, AppError> {
    let host = host_header(url)?;

    let mut signing_parts = vec![
        format!("(request-target): post {}", path_and_query(url)),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(digest) = digest {
        signing_parts.push(format!("digest: {}", digest));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");
    let signature = signing_key
        .try_sign(signing_string.as_bytes())
        .map_err(|e| AppError::Crypto(format!("Signing failed: {}", e)))?;

    Ok(format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNATURE_ALGORITHM,
        headers_list.join(" "),
        BASE64.encode(signature.to_bytes())
    ))
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 7231)
    pub date: String,
    /// Host header value the signature covers
    pub host: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Signs outbound requests on behalf of local actors
pub struct SignatureService {
    db: Arc<Database>,
    keys: Arc<KeyPairCache>,
    base_url: String,
}

impl SignatureService {
    pub fn new(db: Arc<Database>, keys: Arc<KeyPairCache>, base_url: impl Into<String>) -> Self {
        Self {
            db,
            keys,
            base_url: base_url.into(),
        }
    }

    /// Sign a POST to `url` as `actor`
    ///
    /// # Errors
    /// Fails when the actor's key pair can be neither loaded nor created,
    /// or when `url` is not an absolute URL with a host.
    pub async fn sign(
        &self,
        actor: &Actor,
        url: &str,
        timestamp: DateTime<Utc>,
        digest: Option<String>,
    ) -> Result<SignatureHeaders, AppError> {
        let parsed_url =
            Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
        let keys = self.keys.keys_for(&self.db, actor).await?;

        let date = http_date(timestamp);
        let signature = sign_request(
            &keys.signing_key,
            &actor.key_id(&self.base_url),
            &parsed_url,
            &date,
            digest.as_deref(),
        )?;

        Ok(SignatureHeaders {
            signature,
            date,
            host: host_header(&parsed_url)?,
            digest,
        })
    }

    /// PEM public key of a local actor, creating the key pair if needed
    pub async fn public_key_pem(&self, actor: &Actor) -> Result<String, AppError> {
        Ok(self.keys.keys_for(&self.db, actor).await?.public_key_pem.clone())
    }
}

/// The parts of an inbound request a signature can cover
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

/// Verify an inbound request against a candidate actor's public key
///
/// Returns false when the key is missing, the header does not parse, or the
/// RSA check fails. Failure details are logged at debug level.
pub fn verify_request(
    public_key_pem: Option<&str>,
    request: &InboundRequest<'_>,
    require_digest: bool,
) -> bool {
    let Some(public_key_pem) = public_key_pem else {
        tracing::debug!("Signature check without a public key");
        return false;
    };

    match verify_signature(public_key_pem, request, require_digest) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, path = request.path_and_query, "Signature rejected");
            false
        }
    }
}

/// Verify an HTTP request signature
///
/// # Errors
/// - Validation if the Signature header is missing or malformed
/// - InvalidSignature if the digest or RSA check fails
pub fn verify_signature(
    public_key_pem: &str,
    request: &InboundRequest<'_>,
    require_digest: bool,
) -> Result<(), AppError> {
    // 1. Parse Signature header
    let signature_header = header_value(request.headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    // 2. Digest enforcement
    if require_digest && !request.body.is_empty() {
        if !parsed.headers.iter().any(|h| h == "digest") {
            return Err(AppError::Validation(
                "Signed headers must include: digest".to_string(),
            ));
        }
        if header_value(request.headers, "digest")? != generate_digest(request.body) {
            return Err(AppError::InvalidSignature);
        }
    }

    // 3. Reconstruct signing string in the signer's order.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!(
                "{} {}",
                request.method.to_ascii_lowercase(),
                request.path_and_query
            ),
            name => combined_header_value(request.headers, name)?,
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    // 4. Verify RSA signature.
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))?;
    let verifier = VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(parsed.signature.as_slice())
        .map_err(|_| AppError::InvalidSignature)?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

fn header_value<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// All values of a header, joined the way a proxy would fold them
fn combined_header_value(headers: &http::HeaderMap, name: &str) -> Result<String, AppError> {
    let values = headers
        .get_all(name)
        .iter()
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if values.is_empty() {
        return Err(AppError::Validation(format!("Missing {} header", name)));
    }
    Ok(values.join(", "))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_value(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor.trim_end_matches('/') == actor.trim_end_matches('/')
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Always `rsa-sha256`; anything else is rejected while parsing
    pub algorithm: String,
    /// Signed header names, lowercased, in the signer's order
    pub headers: Vec<String>,
    /// Decoded signature bytes
    pub signature: Vec<u8>,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// Every parameter must be a `name="value"` pair. `algorithm` defaults to
/// `rsa-sha256` and `headers` to `date`. Unknown parameters are skipped,
/// repeated ones are an error.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for (name, value) in split_parameters(header)? {
        let slot = match name {
            "keyId" => &mut key_id,
            "algorithm" => &mut algorithm,
            "headers" => &mut headers,
            "signature" => &mut signature,
            _ => continue,
        };
        if slot.replace(value).is_some() {
            return Err(AppError::Validation(format!(
                "Duplicate signature parameter: {}",
                name
            )));
        }
    }

    let key_id = key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?;
    let parsed_key_id = Url::parse(key_id)
        .map_err(|e| AppError::Validation(format!("Invalid keyId: {}", e)))?;
    if !matches!(parsed_key_id.scheme(), "http" | "https") || parsed_key_id.host_str().is_none() {
        return Err(AppError::Validation(format!("Invalid keyId: {}", key_id)));
    }

    let algorithm = algorithm.unwrap_or(SIGNATURE_ALGORITHM);
    if !algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            algorithm
        )));
    }

    let headers: Vec<String> = headers
        .unwrap_or("date")
        .split_whitespace()
        .map(|h| h.to_ascii_lowercase())
        .collect();
    if headers.is_empty() {
        return Err(AppError::Validation("Empty headers list".to_string()));
    }

    let signature = signature.ok_or_else(|| AppError::Validation("Missing signature".to_string()))?;
    let signature = BASE64
        .decode(signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;

    Ok(ParsedSignature {
        key_id: key_id.to_string(),
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        headers,
        signature,
    })
}

/// Split `a="x", b="y"` into pairs. Values may contain commas.
fn split_parameters(header: &str) -> Result<Vec<(&str, &str)>, AppError> {
    let malformed = || AppError::Validation("Malformed Signature header".to_string());
    let mut pairs = Vec::new();
    let mut rest = header.trim();

    while !rest.is_empty() {
        let (name, after_name) = rest.split_once('=').ok_or_else(malformed)?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(malformed());
        }

        let quoted = after_name.trim_start().strip_prefix('"').ok_or_else(malformed)?;
        let (value, after_value) = quoted.split_once('"').ok_or_else(malformed)?;
        pairs.push((name, value));

        rest = after_value.trim_start();
        if let Some(next) = rest.strip_prefix(',') {
            rest = next.trim_start();
            if rest.is_empty() {
                return Err(malformed());
            }
        } else if !rest.is_empty() {
            return Err(malformed());
        }
    }

    if pairs.is_empty() {
        return Err(malformed());
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::key_cache::generate_keypair;
    use http::{HeaderMap, HeaderValue};
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    const KEY_ID: &str = "https://local.example/actor/alice#main-key";

    fn generate_test_keys() -> (SigningKey<Sha256>, String) {
        let pair = generate_keypair(1024).expect("key generation should work");
        let private_key =
            RsaPrivateKey::from_pkcs8_pem(&pair.private_key_pem).expect("private key pem");
        (SigningKey::<Sha256>::new(private_key), pair.public_key_pem)
    }

    fn build_signed_header_map(url: &str, body: &[u8], key: &SigningKey<Sha256>) -> (HeaderMap, String) {
        let parsed_url = Url::parse(url).expect("valid test url");
        let date = http_date(Utc::now());
        let digest = generate_digest(body);
        let signature =
            sign_request(key, KEY_ID, &parsed_url, &date, Some(&digest)).expect("signed");

        let mut headers = HeaderMap::new();
        headers.insert(
            "host",
            HeaderValue::from_str(&host_header(&parsed_url).unwrap()).expect("host header"),
        );
        headers.insert("date", HeaderValue::from_str(&date).expect("date header"));
        headers.insert("digest", HeaderValue::from_str(&digest).expect("digest header"));
        headers.insert(
            "signature",
            HeaderValue::from_str(&signature).expect("signature header"),
        );

        (headers, path_and_query(&parsed_url))
    }

    fn request<'a>(path: &'a str, headers: &'a HeaderMap, body: &'a [u8]) -> InboundRequest<'a> {
        InboundRequest {
            method: "POST",
            path_and_query: path,
            headers,
            body,
        }
    }

    #[test]
    fn signed_request_verifies() {
        let (key, public_key_pem) = generate_test_keys();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) =
            build_signed_header_map("https://remote.example/inbox?foo=bar", body, &key);

        assert_eq!(path, "/inbox?foo=bar");
        assert!(verify_request(
            Some(&public_key_pem),
            &request(&path, &headers, body),
            true
        ));
    }

    #[test]
    fn signature_covers_non_default_port() {
        let (key, public_key_pem) = generate_test_keys();
        let body = b"{}";
        let (mut headers, path) =
            build_signed_header_map("http://remote.example:8080/inbox", body, &key);
        assert_eq!(headers.get("host").unwrap(), "remote.example:8080");
        assert!(verify_request(Some(&public_key_pem), &request(&path, &headers, body), false));

        headers.insert("host", HeaderValue::from_static("remote.example"));
        assert!(!verify_request(Some(&public_key_pem), &request(&path, &headers, body), false));
    }

    #[test]
    fn tampered_headers_fail_verification() {
        let (key, public_key_pem) = generate_test_keys();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map("https://remote.example/inbox", body, &key);

        let mut wrong_host = headers.clone();
        wrong_host.insert("host", HeaderValue::from_static("evil.example"));
        assert!(!verify_request(Some(&public_key_pem), &request(&path, &wrong_host, body), false));

        let mut wrong_date = headers.clone();
        wrong_date.insert("date", HeaderValue::from_static("Mon, 01 Jan 2001 00:00:00 GMT"));
        assert!(!verify_request(Some(&public_key_pem), &request(&path, &wrong_date, body), false));

        let mut wrong_digest = headers.clone();
        wrong_digest.insert("digest", HeaderValue::from_static("SHA-256=AAAA"));
        assert!(!verify_request(Some(&public_key_pem), &request(&path, &wrong_digest, body), false));

        assert!(!verify_request(
            Some(&public_key_pem),
            &request("/other-inbox", &headers, body),
            false
        ));
    }

    #[test]
    fn tampered_body_fails_only_when_digest_is_required() {
        let (key, public_key_pem) = generate_test_keys();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map("https://remote.example/inbox", body, &key);
        let other_body = br#"{"type":"Undo"}"#;

        assert!(verify_request(
            Some(&public_key_pem),
            &request(&path, &headers, other_body),
            false
        ));
        assert!(!verify_request(
            Some(&public_key_pem),
            &request(&path, &headers, other_body),
            true
        ));
    }

    #[test]
    fn missing_public_key_fails() {
        let (key, _) = generate_test_keys();
        let (headers, path) = build_signed_header_map("https://remote.example/inbox", b"{}", &key);
        assert!(!verify_request(None, &request(&path, &headers, b"{}"), false));
    }

    #[test]
    fn wrong_key_fails() {
        let (key, _) = generate_test_keys();
        let (_, other_public_key_pem) = generate_test_keys();
        let (headers, path) = build_signed_header_map("https://remote.example/inbox", b"{}", &key);
        assert!(!verify_request(
            Some(&other_public_key_pem),
            &request(&path, &headers, b"{}"),
            false
        ));
    }

    #[test]
    fn headers_default_to_date() {
        let (key, public_key_pem) = generate_test_keys();
        let date = http_date(Utc::now());
        let signature = key.try_sign(format!("date: {}", date).as_bytes()).unwrap();
        let header = format!(
            "keyId=\"{}\",signature=\"{}\"",
            KEY_ID,
            BASE64.encode(signature.to_bytes())
        );

        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_str(&date).unwrap());
        headers.insert("signature", HeaderValue::from_str(&header).unwrap());

        let parsed = parse_signature_header(&header).unwrap();
        assert_eq!(parsed.algorithm, "rsa-sha256");
        assert_eq!(parsed.headers, vec!["date"]);
        assert!(verify_request(Some(&public_key_pem), &request("/inbox", &headers, b""), false));
    }

    #[test]
    fn parser_rejects_other_algorithms() {
        let header = format!(
            "keyId=\"{}\",algorithm=\"hs2019\",headers=\"date\",signature=\"ZmFrZQ==\"",
            KEY_ID
        );
        assert!(matches!(
            parse_signature_header(&header),
            Err(AppError::Validation(msg)) if msg.contains("Unsupported signature algorithm")
        ));
    }

    #[test]
    fn parser_rejects_malformed_input() {
        // Unquoted value
        assert!(parse_signature_header("keyId=https://a.example/k,signature=\"ZmFrZQ==\"").is_err());
        // Relative keyId
        assert!(parse_signature_header("keyId=\"/actor/alice\",signature=\"ZmFrZQ==\"").is_err());
        // Non-http keyId
        assert!(parse_signature_header("keyId=\"acct:alice@a.example\",signature=\"ZmFrZQ==\"").is_err());
        // Missing signature
        assert!(parse_signature_header(&format!("keyId=\"{}\"", KEY_ID)).is_err());
        // Bad base64
        assert!(parse_signature_header(&format!("keyId=\"{}\",signature=\"***\"", KEY_ID)).is_err());
        // Duplicated parameter
        assert!(parse_signature_header(&format!(
            "keyId=\"{}\",keyId=\"{}\",signature=\"ZmFrZQ==\"",
            KEY_ID, KEY_ID
        ))
        .is_err());
        // Trailing comma
        assert!(parse_signature_header(&format!("keyId=\"{}\",signature=\"ZmFrZQ==\",", KEY_ID)).is_err());
    }

    #[test]
    fn parser_keeps_commas_inside_values() {
        let header = "keyId=\"https://a.example/k?x=1,2\", headers=\"(request-target) Host Date\", signature=\"ZmFrZQ==\"";
        let parsed = parse_signature_header(header).unwrap();
        assert_eq!(parsed.key_id, "https://a.example/k?x=1,2");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
        assert_eq!(parsed.signature, b"fake");
    }

    #[test]
    fn extract_signature_key_id_reads_key_id() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static(
                "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\"",
            ),
        );

        let key_id = extract_signature_key_id(&headers).expect("keyId should be parsed");
        assert_eq!(key_id, "https://remote.example/users/alice#main-key");
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn digest_is_sha256_base64() {
        assert_eq!(
            generate_digest(b""),
            "SHA-256=47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn http_date_uses_imf_fixdate() {
        let at = DateTime::from_timestamp(0, 0).unwrap();
        assert_eq!(http_date(at), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}
