use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest as _, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub fn sha256_digest<D: AsRef<[u8]>>(data: D) -> Vec<u8> {
    let mut hasher = Sha256::default();
    hasher.update(data.as_ref());
    hasher.finalize().to_vec()
}

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256<K: AsRef<[u8]>, D: AsRef<[u8]>>(key: K, data: D) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(key.as_ref()).expect("HMAC accepts keys of any length");
    mac.update(data.as_ref());
    mac.finalize().into_bytes().to_vec()
}

pub fn md5_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Md5::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

pub fn base64_encode<D: AsRef<[u8]>>(data: D) -> String {
    STANDARD.encode(data.as_ref())
}

pub fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

pub fn base64url_encode<D: AsRef<[u8]>>(data: D) -> String {
    URL_SAFE.encode(data.as_ref())
}

/// Unpadded URL-safe encoding, used for JWT segments.
pub fn base64url_encode_nopad<D: AsRef<[u8]>>(data: D) -> String {
    URL_SAFE_NO_PAD.encode(data.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn hmac_sha256_matches_known_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex(&mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn md5_hex_matches_known_vector() {
        assert_eq!(md5_hex_digest("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn base64url_uses_urlsafe_alphabet() {
        let encoded = base64url_encode([0xfb, 0xff]);
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert!(encoded.ends_with('='));
        assert_eq!(base64url_encode_nopad([0xfb, 0xff]), "-_8");
    }
}
