//! Signing primitives for the control and reporting planes.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use data_encoding::HEXUPPER;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::encoding;

type HmacSha1 = Hmac<Sha1>;

const AES_BLOCK: usize = 16;

/// Prefix mixed into the heartbeat signature plaintext. Fixed by the wire
/// protocol, do not change.
const PLAINTEXT_PREFIX: &[u8] = b"hello world:";

#[derive(thiserror::Error, Debug)]
pub enum SignatureError {
    #[error("invalid AES key length {0}, expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),

    #[error("decoding secret: {0}")]
    DecodeError(#[from] data_encoding::DecodeError),
}

/// HMAC-SHA1 of `message` keyed with `key`. Returns the raw 20-byte tag.
pub fn hmac_sha1(key: &[u8], message: &[u8]) -> [u8; 20] {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Metric-upload signature: HMAC-SHA1 of the signing string, rendered as
/// uppercase hex. The result goes into `Authorization: <ak>:<hex>`.
pub fn sign_upload(signing_string: &str, secret: &str) -> String {
    HEXUPPER.encode(&hmac_sha1(secret.as_bytes(), signing_string.as_bytes()))
}

/// Heartbeat body signature.
///
/// The access secret is base64url-decoded into the AES key, the body is
/// HMAC-SHA1'd under that key, and `"hello world:" || mac` is AES-ECB
/// encrypted with PKCS#7 padding. The ciphertext is returned base64url
/// encoded.
pub fn calculate(content: &[u8], secret: &str) -> Result<String, SignatureError> {
    let password = encoding::decode_base64url(secret)?;
    let mac = hmac_sha1(&password, content);

    let mut plaintext = Vec::with_capacity(PLAINTEXT_PREFIX.len() + mac.len() + AES_BLOCK);
    plaintext.extend_from_slice(PLAINTEXT_PREFIX);
    plaintext.extend_from_slice(&mac);

    let ciphertext = aes_ecb_encrypt(&plaintext, &password)?;
    Ok(encoding::encode_base64url(&ciphertext))
}

/// AES-ECB with PKCS#7 padding: every pad byte holds the pad length, and a
/// whole block of padding is appended when the input is already a block
/// multiple.
pub fn aes_ecb_encrypt(src: &[u8], key: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let padding = AES_BLOCK - src.len() % AES_BLOCK;
    let mut buf = Vec::with_capacity(src.len() + padding);
    buf.extend_from_slice(src);
    buf.resize(src.len() + padding, padding as u8);

    match key.len() {
        16 => encrypt_blocks(&Aes128::new_from_slice(key).expect("length checked"), &mut buf),
        24 => encrypt_blocks(&Aes192::new_from_slice(key).expect("length checked"), &mut buf),
        32 => encrypt_blocks(&Aes256::new_from_slice(key).expect("length checked"), &mut buf),
        n => return Err(SignatureError::InvalidKeyLength(n)),
    }

    Ok(buf)
}

fn encrypt_blocks<C: BlockEncrypt>(cipher: &C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(AES_BLOCK) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// MD5 of `data` as uppercase hex. Used for `Content-MD5` and for
/// change-detection of heartbeat responses.
pub fn md5_hex(data: &[u8]) -> String {
    HEXUPPER.encode(&md5::compute(data).0)
}
