//! Client TLS identities derived from PKCS#12 bundles.
//!
//! # Pipeline
//!
//! ```text
//! PFX bytes + passphrase
//!   → CredentialCache::resolve   (digest key, TTL, bounded size)
//!       → Pkcs12Decoder::decode  (MAC check, leaf-first PEM chain, PKCS#8 key)
//!   → ScopedMaterial::write      (request-private temp dir: cert.pem / key.pem)
//!   → ScopedMaterial::client_config → rustls ClientConfig with client auth
//!   → [dropped: temp dir removed]
//! ```
//!
//! # Modules
//!
//! - [`bundle`] - PKCS#12 decoding into [`CertificateMaterial`]
//! - [`cache`] - concurrent TTL cache in front of the decoder
//! - [`identity`] - X.509 field extraction and leaf ordering
//! - [`material`] - scoped on-disk materialization and rustls config building
//! - [`pkcs12`] - PBES2 decryption and SHA-2 integrity MACs

pub mod bundle;
pub mod cache;
pub mod identity;
pub mod material;
pub mod pkcs12;

pub use bundle::{BundleDecoder, CertificateMaterial, DecodeError, Pkcs12Decoder};
pub use cache::{CachePolicy, CacheStatsSnapshot, CredentialCache};
pub use identity::CertSummary;
pub use material::{MaterialError, ScopedMaterial, load_certs, load_private_key};
