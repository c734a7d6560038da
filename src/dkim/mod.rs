use aws_lc_rs::{
    aead::{AES_256_GCM, Aad, Nonce, NONCE_LEN, RandomizedNonceKey},
    encoding::AsDer,
    rsa::{KeySize, KeyPair},
    signature::KeyPair as _,
};
use base64ct::{Base64, Encoding};
use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::DkimSigner,
};
use thiserror::Error;

/// Headers covered by the DKIM signature.
const SIGNED_HEADERS: [&str; 7] = [
    "From",
    "To",
    "Subject",
    "Date",
    "Message-ID",
    "MIME-Version",
    "Content-Type",
];

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("cryptographic operation failed")]
    Crypto(#[from] aws_lc_rs::error::Unspecified),
    #[error("key material rejected: {0}")]
    KeyRejected(#[from] aws_lc_rs::error::KeyRejected),
    #[error("DKIM signing failed: {0}")]
    Signing(#[from] mail_auth::Error),
    #[error("master key must be 32 base64-encoded bytes")]
    BadMasterKey,
    #[error("sealed key blob is malformed")]
    BadSealedKey,
}

/// A freshly generated DKIM keypair: PKCS#8 DER private key and X.509 DER
/// public key. The private half never leaves this process unencrypted.
pub struct GeneratedKey {
    pub private_der: Vec<u8>,
    pub public_der: Vec<u8>,
}

pub fn generate_rsa_keypair() -> Result<GeneratedKey, KeyError> {
    let key_pair = KeyPair::generate(KeySize::Rsa2048)?;
    let private_der = key_pair.as_der()?.as_ref().to_vec();
    let public_der = key_pair.public_key().as_der()?.as_ref().to_vec();

    Ok(GeneratedKey {
        private_der,
        public_der,
    })
}

/// The `p=` value published in the domain's DKIM TXT record.
pub fn public_key_txt_value(public_der: &[u8]) -> String {
    Base64::encode_string(public_der)
}

/// Encrypts private key material at rest with AES-256-GCM under the
/// operator-supplied master key. Handler errors from a missing or wrong
/// master key are fatal: the operator must intervene.
#[derive(Clone)]
pub struct KeyVault {
    key_bytes: [u8; 32],
}

impl KeyVault {
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let decoded = Base64::decode_vec(encoded).map_err(|_| KeyError::BadMasterKey)?;
        let key_bytes: [u8; 32] = decoded.try_into().map_err(|_| KeyError::BadMasterKey)?;

        Ok(Self { key_bytes })
    }

    /// Output layout: 12-byte nonce followed by ciphertext and tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let key = RandomizedNonceKey::new(&AES_256_GCM, &self.key_bytes)?;
        let mut in_out = plaintext.to_vec();
        let nonce = key.seal_in_place_append_tag(Aad::empty(), &mut in_out)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(nonce.as_ref());
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, KeyError> {
        if sealed.len() <= NONCE_LEN {
            return Err(KeyError::BadSealedKey);
        }
        let key = RandomizedNonceKey::new(&AES_256_GCM, &self.key_bytes)?;
        let nonce = Nonce::try_assume_unique_for_key(&sealed[..NONCE_LEN])?;
        let mut in_out = sealed[NONCE_LEN..].to_vec();
        let plaintext_len = key.open_in_place(nonce, Aad::empty(), &mut in_out)?.len();
        in_out.truncate(plaintext_len);

        Ok(in_out)
    }
}

/// A decrypted per-domain signing key.
pub struct PrivateKey<'a> {
    domain: &'a str,
    selector: &'a str,
    sign_key: RsaKey<Sha256>,
}

impl<'a> PrivateKey<'a> {
    pub fn from_der(domain: &'a str, selector: &'a str, private_der: &[u8]) -> Result<Self, KeyError> {
        let sign_key = RsaKey::<Sha256>::from_pkcs8_der(private_der)?;

        Ok(Self {
            domain,
            selector,
            sign_key,
        })
    }

    /// Signs the raw RFC 5322 message and returns the DKIM-Signature header
    /// to prepend before DATA.
    pub fn dkim_header(self, raw_message: &[u8]) -> Result<String, KeyError> {
        let signer = DkimSigner::from_key(self.sign_key)
            .domain(self.domain)
            .selector(self.selector)
            .headers(SIGNED_HEADERS);

        Ok(signer.sign(raw_message).map(|s| s.to_header())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_vault() -> KeyVault {
        KeyVault {
            key_bytes: [7u8; 32],
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let vault = test_vault();
        let secret = b"attack at dawn".to_vec();

        let sealed = vault.seal(&secret).unwrap();
        assert_ne!(sealed, secret);
        assert_eq!(vault.open(&sealed).unwrap(), secret);
    }

    #[test]
    fn open_rejects_wrong_key() {
        let sealed = test_vault().seal(b"secret").unwrap();
        let other = KeyVault {
            key_bytes: [8u8; 32],
        };
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn open_rejects_truncated_blob() {
        assert!(matches!(
            test_vault().open(&[0u8; 8]),
            Err(KeyError::BadSealedKey)
        ));
    }

    #[test]
    fn generate_encrypt_decrypt_sign_round_trip() {
        let vault = test_vault();
        let generated = generate_rsa_keypair().unwrap();

        let sealed = vault.seal(&generated.private_der).unwrap();
        let opened = vault.open(&sealed).unwrap();
        assert_eq!(opened, generated.private_der);

        let key = PrivateKey::from_der("x.test", "mr1", &opened).unwrap();
        let raw = b"From: a@x.test\r\nTo: b@y.test\r\nSubject: hi\r\n\r\nbody\r\n";
        let header = key.dkim_header(raw).unwrap();

        assert!(header.starts_with("DKIM-Signature:"));
        assert!(header.contains("d=x.test"));
        assert!(header.contains("s=mr1"));
    }

    #[test]
    fn master_key_must_be_32_bytes() {
        let short = Base64::encode_string(&[1u8; 16]);
        assert!(matches!(
            KeyVault::from_base64(&short),
            Err(KeyError::BadMasterKey)
        ));
        let ok = Base64::encode_string(&[1u8; 32]);
        assert!(KeyVault::from_base64(&ok).is_ok());
    }
}
