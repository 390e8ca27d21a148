//! bce-auth-v1 request signing for admin credentials.

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderName, HeaderValue};
use sha2::Sha256;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::{Error, Result};
use crate::transport::RequestDescriptor;

type HmacSha256 = Hmac<Sha256>;

const AUTH_VERSION: &str = "bce-auth-v1";
const DATE_HEADER: &str = "x-bce-date";

/// Headers included in the signature when present on the request.
const SIGNABLE_HEADERS: &[&str] = &["host", "content-length", "content-md5", "content-type"];

/// Percent-encode per the platform's signing rules: RFC 3986 unreserved
/// characters pass through, everything else is `%XX`-encoded. The path form
/// keeps `/` literal.
fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn hmac_hex(key: &[u8], data: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| Error::Internal {
        detail: format!("hmac key rejected: {e}"),
    })?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn canonical_time(now: OffsetDateTime) -> Result<String> {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    now.format(&format).map_err(|e| Error::Internal {
        detail: format!("failed to format signing timestamp: {e}"),
    })
}

fn canonical_uri(request: &RequestDescriptor) -> String {
    uri_encode(request.url.path(), true)
}

fn canonical_query(request: &RequestDescriptor) -> String {
    let mut pairs: Vec<String> = request
        .url
        .query_pairs()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("authorization"))
        .map(|(k, v)| format!("{}={}", uri_encode(&k, false), uri_encode(&v, false)))
        .collect();
    pairs.sort();
    pairs.join("&")
}

fn signable_headers(request: &RequestDescriptor) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            let keep = SIGNABLE_HEADERS.contains(&name.as_str()) || name.starts_with("x-bce-");
            let value = value.to_str().ok()?;
            keep.then(|| (name, value.trim().to_string()))
        })
        .collect();
    headers.sort();
    headers
}

fn canonical_headers(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}:{}", uri_encode(name, false), uri_encode(value, false)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn canonical_request(request: &RequestDescriptor, headers: &[(String, String)]) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        request.method.as_str(),
        canonical_uri(request),
        canonical_query(request),
        canonical_headers(headers),
    )
}

/// Attach a `host` header, an `x-bce-date` header, and the `authorization`
/// signature header to `request`.
pub(crate) fn sign(
    request: &mut RequestDescriptor,
    access_key: &str,
    secret_key: &str,
    expiration_sec: u64,
    now: OffsetDateTime,
) -> Result<()> {
    let host = match (request.url.host_str(), request.url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(Error::Internal { detail: "request URL has no host".to_string() });
        }
    };
    let timestamp = canonical_time(now)?;

    request.headers.insert(
        reqwest::header::HOST,
        HeaderValue::from_str(&host).map_err(|source| Error::InvalidHeaderValue { source })?,
    );
    request.headers.insert(
        HeaderName::from_static(DATE_HEADER),
        HeaderValue::from_str(&timestamp)
            .map_err(|source| Error::InvalidHeaderValue { source })?,
    );

    let headers = signable_headers(request);
    let signed_list =
        headers.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join(";");

    let prefix = format!("{AUTH_VERSION}/{access_key}/{timestamp}/{expiration_sec}");
    let signing_key = hmac_hex(secret_key.as_bytes(), &prefix)?;
    let signature = hmac_hex(signing_key.as_bytes(), &canonical_request(request, &headers))?;

    let authorization = format!("{prefix}/{signed_list}/{signature}");
    request.headers.insert(
        reqwest::header::AUTHORIZATION,
        HeaderValue::from_str(&authorization)
            .map_err(|source| Error::InvalidHeaderValue { source })?,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use time::macros::datetime;
    use url::Url;

    fn request(url: &str) -> RequestDescriptor {
        RequestDescriptor::new(
            Method::POST,
            Url::parse(url).unwrap(),
            serde_json::json!({"hello": "world"}),
        )
    }

    #[test]
    fn uri_encode_keeps_unreserved() {
        assert_eq!(uri_encode("abc-._~123", false), "abc-._~123");
        assert_eq!(uri_encode("a b/c", false), "a%20b%2Fc");
        assert_eq!(uri_encode("a b/c", true), "a%20b/c");
        assert_eq!(uri_encode("中", false), "%E4%B8%AD");
    }

    #[test]
    fn canonical_request_shape() {
        let mut req = request("https://qianfan.baidubce.com/wenxinworkshop/service/list?Action=List&b=2");
        let now = datetime!(2024-03-01 08:30:00 UTC);
        sign(&mut req, "ak", "sk", 1800, now).unwrap();

        let headers = signable_headers(&req);
        let canonical = canonical_request(&req, &headers);
        assert_eq!(
            canonical,
            "POST\n/wenxinworkshop/service/list\nAction=List&b=2\n\
             host:qianfan.baidubce.com\nx-bce-date:2024-03-01T08%3A30%3A00Z"
        );
    }

    #[test]
    fn authorization_header_format() {
        let mut req = request("https://qianfan.baidubce.com/wenxinworkshop/service/list");
        let now = datetime!(2024-03-01 08:30:00 UTC);
        sign(&mut req, "my-access-key", "my-secret-key", 1800, now).unwrap();

        let auth = req.headers.get(reqwest::header::AUTHORIZATION).unwrap().to_str().unwrap();
        let parts: Vec<&str> = auth.split('/').collect();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0], "bce-auth-v1");
        assert_eq!(parts[1], "my-access-key");
        assert_eq!(parts[2], "2024-03-01T08:30:00Z");
        assert_eq!(parts[3], "1800");
        assert_eq!(parts[4], "host;x-bce-date");
        assert_eq!(parts[5].len(), 64);
        assert!(parts[5].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_is_deterministic_and_key_dependent() {
        let now = datetime!(2024-03-01 08:30:00 UTC);
        let auth_for = |sk: &str| {
            let mut req = request("https://qianfan.baidubce.com/wenxinworkshop/service/list");
            sign(&mut req, "ak", sk, 1800, now).unwrap();
            req.headers
                .get(reqwest::header::AUTHORIZATION)
                .unwrap()
                .to_str()
                .unwrap()
                .to_string()
        };
        assert_eq!(auth_for("sk-one"), auth_for("sk-one"));
        assert_ne!(auth_for("sk-one"), auth_for("sk-two"));
    }

    #[test]
    fn query_pairs_are_sorted_and_authorization_excluded() {
        let req =
            request("https://example.com/p?zeta=1&alpha=2&authorization=skip&beta=a%20b");
        assert_eq!(canonical_query(&req), "alpha=2&beta=a%20b&zeta=1");
    }
}
