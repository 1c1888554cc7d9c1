//! Cryptographic primitives for pairing and stream setup.
//!
//! Everything here is a thin, carefully-shaped wrapper over OpenSSL plus a
//! SHA-256 convenience from `sha2`. The pairing handshake depends on exact
//! byte layouts (AES-128-ECB without padding, raw certificate signatures,
//! lowercase hex without separators), so the helpers below expose those
//! shapes directly rather than hiding them behind higher-level APIs.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use openssl::stack::Stack;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher, Crypter, Mode};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509Name, X509StoreContext, X509};
use sha2::{Digest, Sha256};

use crate::error::{HostError, Result};

/// GCM authentication tag length in bytes.
pub const GCM_TAG_SIZE: usize = 16;

/// Validity period for generated host certificates.
const CERT_VALIDITY_DAYS: u32 = 10 * 365;

/// Alphabet used by [`random_alphabet`] when none is supplied.
pub const DEFAULT_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!%&()=-";

/// Round `size` up to the next PKCS#7 block boundary.
///
/// Callers encrypting into pre-allocated buffers need
/// `round_to_pkcs7_padded(len) + GCM_TAG_SIZE` bytes for the tagged form.
pub const fn round_to_pkcs7_padded(size: usize) -> usize {
    ((size + 15) / 16) * 16
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex without separators.
pub fn hex_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Parse hex (either case) into bytes. Whitespace is not tolerated.
pub fn from_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(HostError::protocol(format!(
            "hex string has odd length {}",
            hex.len()
        )));
    }
    let digit = |c: u8| -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(HostError::protocol(format!("invalid hex digit {:?}", c as char))),
        }
    };
    let bytes = hex.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        out.push(digit(pair[0])? << 4 | digit(pair[1])?);
    }
    Ok(out)
}

/// `n` bytes from the OpenSSL CSPRNG.
pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    openssl::rand::rand_bytes(&mut buf)?;
    Ok(buf)
}

/// Random string of length `n` drawn from `alphabet`.
pub fn random_alphabet(n: usize, alphabet: &str) -> Result<String> {
    let chars: Vec<char> = alphabet.chars().collect();
    let raw = random_bytes(n)?;
    Ok(raw
        .into_iter()
        .map(|b| chars[b as usize % chars.len()])
        .collect())
}

/// Derive the pairing AES-128 key from the client salt and the PIN.
///
/// The key is the first 16 bytes of `sha256(salt ‖ pin)`.
pub fn derive_aes_key(salt: &[u8; 16], pin: &str) -> [u8; 16] {
    let mut input = Vec::with_capacity(16 + pin.len());
    input.extend_from_slice(salt);
    input.extend_from_slice(pin.as_bytes());
    let digest = sha256(&input);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

fn ecb_apply(key: &[u8], data: &[u8], mode: Mode, padding: bool) -> Result<Vec<u8>> {
    let cipher = Cipher::aes_128_ecb();
    let mut crypter = Crypter::new(cipher, mode, key, None)?;
    crypter.pad(padding);
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut written = crypter.update(data, &mut out)?;
    written += crypter.finalize(&mut out[written..])?;
    out.truncate(written);
    Ok(out)
}

/// AES-128-ECB encrypt. The pairing handshake uses `padding = false`.
pub fn aes_ecb_encrypt(key: &[u8], plaintext: &[u8], padding: bool) -> Result<Vec<u8>> {
    ecb_apply(key, plaintext, Mode::Encrypt, padding)
}

/// AES-128-ECB decrypt. The pairing handshake uses `padding = false`.
pub fn aes_ecb_decrypt(key: &[u8], ciphertext: &[u8], padding: bool) -> Result<Vec<u8>> {
    ecb_apply(key, ciphertext, Mode::Decrypt, padding)
}

/// AES-128-CBC encrypt with PKCS#7 padding (audio stream key wrap).
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    Ok(openssl::symm::encrypt(
        Cipher::aes_128_cbc(),
        key,
        Some(iv),
        plaintext,
    )?)
}

/// AES-128-GCM encrypt. Returns `(ciphertext, tag)`; the tag is always
/// [`GCM_TAG_SIZE`] bytes.
pub fn aes_gcm_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; GCM_TAG_SIZE])> {
    let mut tag = [0u8; GCM_TAG_SIZE];
    let ciphertext = encrypt_aead(Cipher::aes_128_gcm(), key, Some(iv), &[], plaintext, &mut tag)?;
    Ok((ciphertext, tag))
}

/// AES-128-GCM decrypt, verifying `tag`. Fails on any tampering.
pub fn aes_gcm_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
    Ok(decrypt_aead(
        Cipher::aes_128_gcm(),
        key,
        Some(iv),
        &[],
        ciphertext,
        tag,
    )?)
}

/// Sign `data` with the host RSA key (SHA-256 digest).
pub fn sign_sha256(key_pem: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let pkey = PKey::private_key_from_pem(key_pem)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

/// Verify an RSA/SHA-256 signature against the public key in `cert_pem`.
///
/// Returns `false` both for bad signatures and for unparsable input; the
/// pairing engine treats either as a failed pair attempt.
pub fn verify_sha256(cert_pem: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let verify = || -> Result<bool> {
        let cert = X509::from_pem(cert_pem)?;
        let pubkey = cert.public_key()?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &pubkey)?;
        verifier.update(data)?;
        Ok(verifier.verify(signature)?)
    };
    verify().unwrap_or(false)
}

/// The raw signature bitstring of an X.509 certificate.
///
/// The pairing handshake mixes this value into its challenge hashes, so it
/// must be the exact DER signature bytes, not a digest of them.
pub fn cert_signature(cert_pem: &[u8]) -> Result<Vec<u8>> {
    let cert = X509::from_pem(cert_pem)?;
    Ok(cert.signature().as_slice().to_vec())
}

/// Freshly generated host credentials, PEM-encoded.
#[derive(Debug, Clone)]
pub struct Creds {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a self-signed RSA certificate for `cn`.
pub fn gen_creds(cn: &str, key_bits: u32) -> Result<Creds> {
    let rsa = Rsa::generate(key_bits)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;

    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    let mut name = X509Name::builder()?;
    name.append_entry_by_text("CN", cn)?;
    let name = name.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.set_pubkey(&pkey)?;
    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.sign(&pkey, MessageDigest::sha256())?;

    let cert = builder.build();
    Ok(Creds {
        cert_pem: String::from_utf8_lossy(&cert.to_pem()?).into_owned(),
        key_pem: String::from_utf8_lossy(&pkey.private_key_to_pem_pkcs8()?).into_owned(),
    })
}

/// Load a PEM private key, verifying it parses.
pub fn load_private_key(key_pem: &[u8]) -> Result<PKey<Private>> {
    Ok(PKey::private_key_from_pem(key_pem)?)
}

/// Trusted-certificate set used by the mutual-TLS listener.
///
/// Each paired client contributes one self-signed leaf certificate; an
/// incoming peer certificate is matched by verifying it against a
/// single-certificate store per client. The matching client UUID is
/// returned so the request can be annotated with the client handle.
pub struct CertChain {
    entries: Vec<(String, X509Store)>,
}

impl CertChain {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register a client certificate under its UUID.
    pub fn add(&mut self, uuid: &str, cert_pem: &str) -> Result<()> {
        let cert = X509::from_pem(cert_pem.as_bytes())?;
        let mut store = X509StoreBuilder::new()?;
        store.add_cert(cert)?;
        self.entries.push((uuid.to_string(), store.build()));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify `peer` against every registered certificate.
    ///
    /// Returns the UUID of the first client whose store accepts the
    /// certificate, or `None` when no client matches.
    pub fn verify(&self, peer: &X509) -> Option<String> {
        for (uuid, store) in &self.entries {
            let verified = (|| -> Result<bool> {
                let chain: Stack<X509> = Stack::new()?;
                let mut ctx = X509StoreContext::new()?;
                Ok(ctx.init(store, peer, &chain, |c| c.verify_cert())?)
            })()
            .unwrap_or(false);
            if verified {
                return Some(uuid.clone());
            }
        }
        None
    }
}

impl Default for CertChain {
    fn default() -> Self {
        Self::new()
    }
}
