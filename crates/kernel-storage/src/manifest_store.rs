// SPDX-License-Identifier: MIT

//! Manifest generation, signing, and verification (spec.md §3.6, §4.10).
//! The Recovery Engine's state machine lives in `kernel-runtime`; this
//! module owns the filesystem-facing primitives it composes: hashing a
//! directory tree, signing the result, and verifying a manifest pulled
//! from a restore source.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use kernel_core::{FileRecord, Manifest};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest signature missing")]
    Unsigned,
    #[error("manifest signature invalid")]
    BadSignature,
    #[error("file checksum mismatch for {path}")]
    ChecksumMismatch { path: String },
    #[error("file listed in manifest is missing: {path}")]
    MissingFile { path: String },
}

/// Hash every regular file under `root` (recursively) into a file-record
/// map keyed by path relative to `root`, using forward-slash separators so
/// the manifest is portable across hosts.
pub fn hash_tree(root: &Path) -> Result<BTreeMap<String, FileRecord>, ManifestError> {
    let mut files = BTreeMap::new();
    if root.exists() {
        walk(root, root, &mut files)?;
    }
    Ok(files)
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, FileRecord>) -> Result<(), ManifestError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            let bytes = fs::read(&path)?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let sha256 = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
            let metadata = entry.metadata()?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            out.insert(rel, FileRecord { sha256, size_bytes: bytes.len() as u64, mtime });
        }
    }
    Ok(())
}

/// Build and sign a fresh manifest for the contents of `root`.
pub fn generate_and_sign(
    root: &Path,
    generated_at: u64,
    signing_key: &SigningKey,
) -> Result<Manifest, ManifestError> {
    let files = hash_tree(root)?;
    let mut manifest = Manifest::new(generated_at, files);
    sign(&mut manifest, signing_key);
    Ok(manifest)
}

pub fn sign(manifest: &mut Manifest, signing_key: &SigningKey) {
    let signature = signing_key.sign(&manifest.signing_bytes());
    manifest.signature = Some(hex_encode(&signature.to_bytes()));
}

/// Full integrity check from spec.md §4.10: the manifest's Ed25519
/// signature must verify, and every listed file's checksum must match
/// what's actually on disk under `root`. Extra files on disk that aren't
/// listed are not considered a mismatch (the manifest only promises
/// integrity for what it tracks).
pub fn verify(manifest: &Manifest, root: &Path, verifying_key: &VerifyingKey) -> Result<(), ManifestError> {
    verify_signature(manifest, verifying_key)?;
    for (rel_path, record) in &manifest.files {
        let path = root.join(rel_path);
        let bytes = fs::read(&path).map_err(|_| ManifestError::MissingFile { path: rel_path.clone() })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256: String = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
        if &sha256 != &record.sha256 {
            return Err(ManifestError::ChecksumMismatch { path: rel_path.clone() });
        }
    }
    Ok(())
}

pub fn verify_signature(manifest: &Manifest, verifying_key: &VerifyingKey) -> Result<(), ManifestError> {
    let sig_hex = manifest.signature.as_ref().ok_or(ManifestError::Unsigned)?;
    let sig_bytes = hex_decode(sig_hex).ok_or(ManifestError::BadSignature)?;
    let sig_array: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| ManifestError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_array);
    verifying_key
        .verify(&manifest.signing_bytes(), &signature)
        .map_err(|_| ManifestError::BadSignature)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
