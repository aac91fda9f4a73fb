//! Encoding and decoding utilities: base64url, base16, RFC3986 URL
//! escaping, and the compact payload number format.

use data_encoding::{DecodeError, BASE64, BASE64URL, BASE64URL_NOPAD, BASE64_NOPAD};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// RFC3986: everything outside the unreserved set (`A-Z a-z 0-9 - _ . ~`)
/// is percent-encoded.
const URL_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Decode a base64url value, with or without padding.
pub fn decode_base64url(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64URL
        .decode(encoded.as_bytes())
        .or_else(|_| BASE64URL_NOPAD.decode(encoded.as_bytes()))
}

/// Encode bytes as unpadded base64url.
pub fn encode_base64url(data: &[u8]) -> String {
    BASE64URL_NOPAD.encode(data)
}

/// Decode a standard-alphabet base64 value, with or without padding.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(encoded.as_bytes())
        .or_else(|_| BASE64_NOPAD.decode(encoded.as_bytes()))
}

/// Encode bytes as padded standard base64.
pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Percent-encode `value` per RFC3986.
pub fn url_encode(value: &str) -> String {
    utf8_percent_encode(value, URL_ESCAPE).to_string()
}

/// Decode a percent-encoded string. Invalid UTF-8 sequences are replaced.
pub fn url_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Format a metric value for the upload payload: two decimal places with
/// trailing zeros (and a bare trailing dot) stripped, so `0.00` becomes
/// `"0"` and `6.10` becomes `"6.1"`.
pub fn to_payload_string(value: f64) -> String {
    let s = format!("{value:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}
