/*!
 * Update package signatures.
 *
 * Packages are signed with RSA PKCS#1 v1.5 over their SHA-256 digest. The
 * signature lives next to the package as `<package>.sig` (raw bytes) and
 * public keys are exchanged as `RSA PUBLIC KEY` PEM.
 */

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::errors::TranslationError;

pub const PRIVATE_KEY_FILE: &str = "translator-signing-key.pem";
pub const PUBLIC_KEY_FILE: &str = "translator-signing-key.pub";
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Locations written by `generate_signing_keys`
#[derive(Debug, Clone, PartialEq)]
pub struct SigningKeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

fn signature_error(context: &str, error: impl std::fmt::Display) -> TranslationError {
    TranslationError::Signature(format!("{}: {}", context, error))
}

pub fn sign(data: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>, TranslationError> {
    let digest = Sha256::digest(data);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| signature_error("failed to sign data", e))
}

/// Check `signature` over `data`. Any mismatch is an error.
pub fn verify(data: &[u8], signature: &[u8], key: &RsaPublicKey) -> Result<(), TranslationError> {
    let digest = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|e| signature_error("signature verification failed", e))
}

pub fn public_key_pem(key: &RsaPublicKey) -> Result<String, TranslationError> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| signature_error("failed to encode public key", e))
}

pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, TranslationError> {
    RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| signature_error("invalid public key", e))
}

pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, TranslationError> {
    let pem = fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| signature_error(&format!("invalid private key {}", path.display()), e))
}

pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, TranslationError> {
    parse_public_key(&fs::read_to_string(path)?)
}

/// Path of the detached signature for `package`
pub fn signature_path(package: &Path) -> PathBuf {
    let mut name = package.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

/// Sign a package file and write `<package>.sig`
pub fn sign_package(package: &Path, key: &RsaPrivateKey) -> Result<PathBuf, TranslationError> {
    let data = fs::read(package)?;
    let signature = sign(&data, key)?;
    let path = signature_path(package);
    fs::write(&path, signature)?;
    Ok(path)
}

/// Verify a package file against its detached signature and a PEM public key
pub fn verify_package(package: &Path, signature: &Path, public_key: &Path) -> Result<(), TranslationError> {
    let data = fs::read(package)?;
    let signature = fs::read(signature)?;
    verify(&data, &signature, &load_public_key(public_key)?)
}

/// Generate an RSA key pair in `dir`. The private key file is owner-only.
pub fn generate_signing_keys(dir: &Path, bits: usize) -> Result<SigningKeyPaths, TranslationError> {
    fs::create_dir_all(dir)?;

    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| signature_error("failed to generate key", e))?;
    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| signature_error("failed to encode private key", e))?;
    let public_pem = public_key_pem(&RsaPublicKey::from(&private_key))?;

    let paths = SigningKeyPaths {
        private_key: dir.join(PRIVATE_KEY_FILE),
        public_key: dir.join(PUBLIC_KEY_FILE),
    };
    fs::write(&paths.private_key, private_pem.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&paths.private_key, fs::Permissions::from_mode(0o600))?;
    }
    fs::write(&paths.public_key, public_pem)?;

    info!("Generated {}-bit signing keys in {}", bits, dir.display());
    Ok(paths)
}
