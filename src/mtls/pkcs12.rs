//! PKCS#12 algorithms the `p12` crate parses but cannot evaluate.
//!
//! `p12` decrypts the legacy PKCS#12 PBE schemes (RC2, 3DES) and checks
//! SHA-1 MACs. Bundles written by current OpenSSL and Windows use PBES2
//! (PBKDF2 + AES-CBC) for both the key bag and the certificate safe, and
//! SHA-256 for the integrity MAC. Those are handled here on top of
//! `aws-lc-rs`, the same provider rustls and jsonwebtoken run on.

use std::num::NonZeroU32;

use aws_lc_rs::cipher::{
    AES_128, AES_128_KEY_LEN, AES_192, AES_192_KEY_LEN, AES_256, AES_256_KEY_LEN,
    Algorithm as CipherAlgorithm, DecryptionContext, PaddedBlockDecryptingKey, UnboundCipherKey,
};
use aws_lc_rs::iv::FixedLength;
use aws_lc_rs::{digest, hmac, pbkdf2};
use p12::{AlgorithmIdentifier, MacData};
use thiserror::Error;
use yasna::models::ObjectIdentifier;

const OID_PBES2: &[u64] = &[1, 2, 840, 113_549, 1, 5, 13];
const OID_PBKDF2: &[u64] = &[1, 2, 840, 113_549, 1, 5, 12];
const OID_PBMAC1: &[u64] = &[1, 2, 840, 113_549, 1, 5, 14];

const OID_HMAC_SHA1: &[u64] = &[1, 2, 840, 113_549, 2, 7];
const OID_HMAC_SHA256: &[u64] = &[1, 2, 840, 113_549, 2, 9];
const OID_HMAC_SHA384: &[u64] = &[1, 2, 840, 113_549, 2, 10];
const OID_HMAC_SHA512: &[u64] = &[1, 2, 840, 113_549, 2, 11];

const OID_AES128_CBC: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 1, 2];
const OID_AES192_CBC: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 1, 22];
const OID_AES256_CBC: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 1, 42];

const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
const OID_SHA384: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 2];
const OID_SHA512: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 3];

/// PKCS#12 KDF purpose byte for MAC keys (RFC 7292, appendix B.3).
const MAC_KEY_ID: u8 = 3;

/// Failure while evaluating a PKCS#12 algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlgorithmError {
    /// Algorithm identifier we do not implement.
    #[error("unsupported {kind} algorithm {oid}")]
    Unsupported {
        /// What the algorithm was used for
        kind: &'static str,
        /// Dotted OID
        oid: String,
    },

    /// Parameters present but not well formed.
    #[error("malformed {0} parameters")]
    BadParameters(&'static str),

    /// Integrity MAC does not match.
    #[error("MAC mismatch")]
    MacMismatch,

    /// Ciphertext did not decrypt to validly padded plaintext.
    #[error("decryption failed")]
    Decrypt,
}

/// A bundle passphrase in both encodings PKCS#12 needs.
pub struct Passphrase {
    /// UTF-8 bytes, fed to PBKDF2.
    utf8: Vec<u8>,
    /// NUL-terminated UTF-16BE, fed to the PKCS#12 KDF.
    bmp: Vec<u8>,
}

impl Passphrase {
    /// Encode a passphrase.
    #[must_use]
    pub fn new(passphrase: &str) -> Self {
        let mut bmp: Vec<u8> = passphrase.encode_utf16().flat_map(u16::to_be_bytes).collect();
        bmp.extend_from_slice(&[0, 0]);
        Self {
            utf8: passphrase.as_bytes().to_vec(),
            bmp,
        }
    }

    /// Form used by the legacy PKCS#12 schemes.
    #[must_use]
    pub fn bmp(&self) -> &[u8] {
        &self.bmp
    }
}

/// Verify the bundle's integrity MAC over the authenticated safe.
///
/// Supports the SHA-1 and SHA-2 HMACs keyed through the PKCS#12 KDF.
/// Anything else (PBMAC1 included) is reported as unsupported, never
/// silently accepted.
///
/// # Errors
///
/// [`AlgorithmError::MacMismatch`] when the passphrase is wrong, or
/// [`AlgorithmError::Unsupported`] for unknown MAC digests.
pub fn verify_mac(
    mac: &MacData,
    auth_safe: &[u8],
    passphrase: &Passphrase,
) -> Result<(), AlgorithmError> {
    let (digest_alg, hmac_alg) = match &mac.mac.digest_algorithm {
        AlgorithmIdentifier::Sha1 => (
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        ),
        AlgorithmIdentifier::OtherAlg(other) => match other.algorithm_type.components().as_slice() {
            OID_SHA256 => (&digest::SHA256, hmac::HMAC_SHA256),
            OID_SHA384 => (&digest::SHA384, hmac::HMAC_SHA384),
            OID_SHA512 => (&digest::SHA512, hmac::HMAC_SHA512),
            OID_PBMAC1 => return Err(unsupported("MAC", &other.algorithm_type)),
            _ => return Err(unsupported("MAC digest", &other.algorithm_type)),
        },
        AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_)
        | AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_) => {
            return Err(AlgorithmError::BadParameters("MAC"));
        }
    };

    let key = pkcs12_kdf(
        digest_alg,
        passphrase.bmp(),
        &mac.salt,
        MAC_KEY_ID,
        mac.iterations,
        digest_alg.output_len(),
    );
    hmac::verify(&hmac::Key::new(hmac_alg, &key), auth_safe, &mac.mac.digest)
        .map_err(|_| AlgorithmError::MacMismatch)
}

/// Decrypt a shrouded key bag or an encrypted safe.
///
/// Legacy PKCS#12 PBE schemes go through `p12`; PBES2 is evaluated here.
///
/// # Errors
///
/// [`AlgorithmError::Decrypt`] when the ciphertext does not open with this
/// passphrase, [`AlgorithmError::Unsupported`] for unknown schemes.
pub fn decrypt(
    algorithm: &AlgorithmIdentifier,
    ciphertext: &[u8],
    passphrase: &Passphrase,
) -> Result<Vec<u8>, AlgorithmError> {
    match algorithm {
        AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_)
        | AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_) => algorithm
            .decrypt_pbe(ciphertext, passphrase.bmp())
            .ok_or(AlgorithmError::Decrypt),
        AlgorithmIdentifier::OtherAlg(other)
            if other.algorithm_type.components().as_slice() == OID_PBES2 =>
        {
            let params = other
                .params
                .as_deref()
                .ok_or(AlgorithmError::BadParameters("PBES2"))?;
            Pbes2::parse(params)?.decrypt(ciphertext, &passphrase.utf8)
        }
        AlgorithmIdentifier::OtherAlg(other) => {
            Err(unsupported("encryption", &other.algorithm_type))
        }
        AlgorithmIdentifier::Sha1 => Err(AlgorithmError::BadParameters("encryption")),
    }
}

/// PBES2 parameters restricted to PBKDF2 + AES-CBC (RFC 8018).
struct Pbes2 {
    salt: Vec<u8>,
    iterations: NonZeroU32,
    prf: pbkdf2::Algorithm,
    cipher: &'static CipherAlgorithm,
    key_len: usize,
    iv: Vec<u8>,
}

/// PBES2-params as read off the wire, before algorithm lookup.
struct RawPbes2 {
    kdf: ObjectIdentifier,
    salt: Vec<u8>,
    iterations: u32,
    key_length: Option<u32>,
    prf: Option<ObjectIdentifier>,
    cipher: ObjectIdentifier,
    iv: Vec<u8>,
}

impl Pbes2 {
    fn parse(der: &[u8]) -> Result<Self, AlgorithmError> {
        let raw = yasna::parse_der(der, |r| {
            r.read_sequence(|r| {
                let (kdf, salt, iterations, key_length, prf) = r.next().read_sequence(|r| {
                    let kdf = r.next().read_oid()?;
                    let (salt, iterations, key_length, prf) = r.next().read_sequence(|r| {
                        let salt = r.next().read_bytes()?;
                        let iterations = r.next().read_u32()?;
                        let key_length = r.read_optional(|r| r.read_u32())?;
                        let prf = r.read_optional(|r| {
                            r.read_sequence(|r| {
                                let oid = r.next().read_oid()?;
                                r.read_optional(|r| r.read_null())?;
                                Ok(oid)
                            })
                        })?;
                        Ok((salt, iterations, key_length, prf))
                    })?;
                    Ok((kdf, salt, iterations, key_length, prf))
                })?;
                let (cipher, iv) = r.next().read_sequence(|r| {
                    let oid = r.next().read_oid()?;
                    let iv = r.next().read_bytes()?;
                    Ok((oid, iv))
                })?;
                Ok(RawPbes2 {
                    kdf,
                    salt,
                    iterations,
                    key_length,
                    prf,
                    cipher,
                    iv,
                })
            })
        })
        .map_err(|_| AlgorithmError::BadParameters("PBES2"))?;

        if raw.kdf.components().as_slice() != OID_PBKDF2 {
            return Err(unsupported("key derivation", &raw.kdf));
        }

        // Absent PRF means HMAC-SHA1.
        let prf = match raw.prf.as_ref().map(|oid| oid.components().as_slice()) {
            None | Some(OID_HMAC_SHA1) => pbkdf2::PBKDF2_HMAC_SHA1,
            Some(OID_HMAC_SHA256) => pbkdf2::PBKDF2_HMAC_SHA256,
            Some(OID_HMAC_SHA384) => pbkdf2::PBKDF2_HMAC_SHA384,
            Some(OID_HMAC_SHA512) => pbkdf2::PBKDF2_HMAC_SHA512,
            Some(_) => {
                let oid = raw.prf.as_ref().map_or_else(String::new, ToString::to_string);
                return Err(AlgorithmError::Unsupported { kind: "PBKDF2 PRF", oid });
            }
        };

        let (cipher, key_len): (&'static CipherAlgorithm, usize) =
            match raw.cipher.components().as_slice() {
                OID_AES128_CBC => (&AES_128, AES_128_KEY_LEN),
                OID_AES192_CBC => (&AES_192, AES_192_KEY_LEN),
                OID_AES256_CBC => (&AES_256, AES_256_KEY_LEN),
                _ => return Err(unsupported("cipher", &raw.cipher)),
            };

        if raw
            .key_length
            .is_some_and(|len| usize::try_from(len).ok() != Some(key_len))
        {
            return Err(AlgorithmError::BadParameters("PBKDF2 key length"));
        }

        Ok(Self {
            salt: raw.salt,
            iterations: NonZeroU32::new(raw.iterations)
                .ok_or(AlgorithmError::BadParameters("PBKDF2 iteration count"))?,
            prf,
            cipher,
            key_len,
            iv: raw.iv,
        })
    }

    fn decrypt(&self, ciphertext: &[u8], password: &[u8]) -> Result<Vec<u8>, AlgorithmError> {
        let mut key = vec![0u8; self.key_len];
        pbkdf2::derive(self.prf, self.iterations, &self.salt, password, &mut key);

        let iv = FixedLength::<16>::try_from(self.iv.as_slice())
            .map_err(|_| AlgorithmError::BadParameters("AES-CBC IV"))?;
        let key = UnboundCipherKey::new(self.cipher, &key)
            .and_then(PaddedBlockDecryptingKey::cbc_pkcs7)
            .map_err(|_| AlgorithmError::Decrypt)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .decrypt(&mut in_out, DecryptionContext::Iv128(iv))
            .map_err(|_| AlgorithmError::Decrypt)?;
        Ok(plaintext.to_vec())
    }
}

/// PKCS#12 key derivation (RFC 7292, appendix B.2), generic over the digest.
fn pkcs12_kdf(
    alg: &'static digest::Algorithm,
    password: &[u8],
    salt: &[u8],
    id: u8,
    iterations: u32,
    len: usize,
) -> Vec<u8> {
    let v = alg.block_len();
    let fill = |src: &[u8]| -> Vec<u8> {
        if src.is_empty() {
            return Vec::new();
        }
        src.iter()
            .copied()
            .cycle()
            .take(v * src.len().div_ceil(v))
            .collect()
    };

    let mut input = fill(salt);
    input.extend(fill(password));
    let diversifier = vec![id; v];

    let mut out = Vec::with_capacity(len + alg.output_len());
    loop {
        let mut ctx = digest::Context::new(alg);
        ctx.update(&diversifier);
        ctx.update(&input);
        let mut block = ctx.finish();
        for _ in 1..iterations {
            block = digest::digest(alg, block.as_ref());
        }
        out.extend_from_slice(block.as_ref());
        if out.len() >= len {
            break;
        }

        let b: Vec<u8> = block.as_ref().iter().copied().cycle().take(v).collect();
        for chunk in input.chunks_mut(v) {
            let mut carry = 1u16;
            for (byte, add) in chunk.iter_mut().zip(&b).rev() {
                let sum = u16::from(*byte) + u16::from(*add) + carry;
                *byte = sum.to_be_bytes()[1];
                carry = sum >> 8;
            }
        }
    }
    out.truncate(len);
    out
}

fn unsupported(kind: &'static str, oid: &ObjectIdentifier) -> AlgorithmError {
    AlgorithmError::Unsupported {
        kind,
        oid: oid.to_string(),
    }
}
