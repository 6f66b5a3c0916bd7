//! Hash functions and key derivation
//!
//! MD5 and SHA-1 are fixed by the tunnel protocol: MD5 drives the
//! password-to-key derivation and HMAC-SHA1 authenticates request headers
//! and payload chunks. Neither is used for anything else.

use hmac::Hmac;
use md5::Md5;
use sha1::Digest;
use sha1::Sha1;

pub type HmacSha1 = Hmac<Sha1>;

/// MD5
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// OpenSSL `EVP_BytesToKey` with MD5, one iteration and no salt.
///
/// `D_0 = MD5(password)`, `D_i = MD5(D_{i-1} || password)`, concatenated and
/// truncated to `key_len`. Clients derive the same key, so this must not change.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Option<[u8; 16]> = None;

    while key.len() < key_len {
        let mut block = Vec::with_capacity(16 + password.len());
        if let Some(prev) = prev {
            block.extend_from_slice(&prev);
        }
        block.extend_from_slice(password);
        let digest = md5(&block);
        key.extend_from_slice(&digest);
        prev = Some(digest);
    }

    key.truncate(key_len);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_vector() {
        assert_eq!(hex::encode(md5(b"foobar")), "3858f62230ac3c915f300c664312c63f");
    }

    #[test]
    fn evp_bytes_to_key_chains_md5_blocks() {
        let key = evp_bytes_to_key(b"foobar", 32);
        assert_eq!(key.len(), 32);

        let first = md5(b"foobar");
        assert_eq!(&key[..16], &first);

        let mut second_input = first.to_vec();
        second_input.extend_from_slice(b"foobar");
        assert_eq!(&key[16..], &md5(&second_input));
    }

    #[test]
    fn evp_bytes_to_key_truncates() {
        let long = evp_bytes_to_key(b"barfoo!", 32);
        let short = evp_bytes_to_key(b"barfoo!", 24);
        assert_eq!(short.len(), 24);
        assert_eq!(&long[..24], &short[..]);
    }

    #[test]
    fn hmac_sha1_rfc2202_case_2() {
        use hmac::Mac;

        let mut mac = HmacSha1::new_from_slice(b"Jefe").unwrap();
        mac.update(b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac.finalize().into_bytes()),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }
}
