/*!
 * Tests for update package signing
 */

use std::fs;

use ebook_translator::distributed::signing::{
    PRIVATE_KEY_FILE, generate_signing_keys, load_private_key, sign_package, verify_package,
};
use ebook_translator::distributed::update_package::create_package;
use ebook_translator::errors::TranslationError;

const TEST_KEY_BITS: usize = 1024;

#[test]
fn test_signedPackage_withMatchingKey_shouldVerify() {
    let keys_dir = tempfile::tempdir().unwrap();
    let keys = generate_signing_keys(keys_dir.path(), TEST_KEY_BITS).unwrap();
    assert!(keys.private_key.ends_with(PRIVATE_KEY_FILE));

    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("translator.toml"), "version = \"1.2.3\"").unwrap();
    let output = tempfile::tempdir().unwrap();
    let package = create_package(source.path(), output.path(), "v1.2.3").unwrap();

    let signature = sign_package(&package, &load_private_key(&keys.private_key).unwrap()).unwrap();
    verify_package(&package, &signature, &keys.public_key).unwrap();
}

#[cfg(unix)]
#[test]
fn test_generateSigningKeys_shouldRestrictPrivateKey() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let keys = generate_signing_keys(dir.path(), TEST_KEY_BITS).unwrap();
    let mode = fs::metadata(&keys.private_key).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_verifyPackage_afterTampering_shouldFail() {
    let dir = tempfile::tempdir().unwrap();
    let keys = generate_signing_keys(dir.path(), TEST_KEY_BITS).unwrap();
    let package = dir.path().join("update.tar.gz");
    fs::write(&package, b"package bytes").unwrap();
    let signature = sign_package(&package, &load_private_key(&keys.private_key).unwrap()).unwrap();

    fs::write(&package, b"package bytez").unwrap();
    let result = verify_package(&package, &signature, &keys.public_key);
    assert!(matches!(result, Err(TranslationError::Signature(_))));
}

#[test]
fn test_verifyPackage_withCorruptSignature_shouldFail() {
    let dir = tempfile::tempdir().unwrap();
    let keys = generate_signing_keys(dir.path(), TEST_KEY_BITS).unwrap();
    let package = dir.path().join("update.tar.gz");
    fs::write(&package, b"package bytes").unwrap();
    let signature = sign_package(&package, &load_private_key(&keys.private_key).unwrap()).unwrap();

    let mut bytes = fs::read(&signature).unwrap();
    bytes[0] ^= 0xff;
    fs::write(&signature, bytes).unwrap();
    assert!(verify_package(&package, &signature, &keys.public_key).is_err());
}

#[test]
fn test_verifyPackage_withOtherKey_shouldFail() {
    let ours = tempfile::tempdir().unwrap();
    let theirs = tempfile::tempdir().unwrap();
    let our_keys = generate_signing_keys(ours.path(), TEST_KEY_BITS).unwrap();
    let their_keys = generate_signing_keys(theirs.path(), TEST_KEY_BITS).unwrap();

    let package = ours.path().join("update.tar.gz");
    fs::write(&package, b"package bytes").unwrap();
    let signature = sign_package(&package, &load_private_key(&our_keys.private_key).unwrap()).unwrap();
    assert!(verify_package(&package, &signature, &their_keys.public_key).is_err());
}

#[test]
fn test_loadPrivateKey_withGarbage_shouldReturnSignatureError() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.pem");
    fs::write(&path, "not a key").unwrap();
    assert!(matches!(load_private_key(&path), Err(TranslationError::Signature(_))));
}
