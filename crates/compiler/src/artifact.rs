//! Package archives
//!
//! A package is a small deterministic container: a JSON index naming
//! the members, each member's bytes gzip-compressed, and a sha256
//! checksum sidecar over the whole payload. Signing and registry upload
//! live outside the core toolchain; the format leaves room for their
//! sidecars without understanding them.

use std::io::Write as _;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::diag::{CompileError, Stage};

/// Archive format version.
pub const PACKAGE_VERSION: u32 = 1;

const MAGIC: &[u8; 8] = b"MOLTPKG\0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageIndex {
    pub version: u32,
    pub module_name: String,
    pub module_version: String,
    /// Member name -> (offset, compressed length, raw length) within
    /// the payload section.
    pub members: Vec<PackageMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMember {
    pub name: String,
    pub offset: u64,
    pub compressed_len: u64,
    pub raw_len: u64,
}

pub struct PackageBuilder {
    module_name: String,
    module_version: String,
    members: Vec<(String, Vec<u8>, u64)>,
}

type AResult<T> = Result<T, CompileError>;

fn pkg_err(message: impl Into<String>) -> CompileError {
    CompileError::new(Stage::Backend, message, None)
}

impl PackageBuilder {
    pub fn new(module_name: impl Into<String>, module_version: impl Into<String>) -> Self {
        PackageBuilder {
            module_name: module_name.into(),
            module_version: module_version.into(),
            members: Vec::new(),
        }
    }

    /// Add a member. Compression level is fixed so identical inputs
    /// produce identical archives.
    pub fn add(&mut self, name: impl Into<String>, bytes: &[u8]) -> AResult<&mut Self> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::new(6));
        enc.write_all(bytes)
            .and_then(|_| enc.finish())
            .map(|compressed| {
                self.members
                    .push((name.into(), compressed, bytes.len() as u64));
                &mut *self
            })
            .map_err(|e| pkg_err(format!("compression failed: {}", e)))
    }

    /// Serialize: magic, index length, index JSON, payload. Returns the
    /// archive bytes and the hex sha256 checksum.
    pub fn finish(self) -> AResult<(Vec<u8>, String)> {
        let mut payload = Vec::new();
        let mut index = PackageIndex {
            version: PACKAGE_VERSION,
            module_name: self.module_name,
            module_version: self.module_version,
            members: Vec::new(),
        };
        for (name, compressed, raw_len) in &self.members {
            index.members.push(PackageMember {
                name: name.clone(),
                offset: payload.len() as u64,
                compressed_len: compressed.len() as u64,
                raw_len: *raw_len,
            });
            payload.extend_from_slice(compressed);
        }
        let index_json = serde_json::to_vec(&index)
            .map_err(|e| pkg_err(format!("index encode failed: {}", e)))?;

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(index_json.len() as u64).to_le_bytes());
        out.extend_from_slice(&index_json);
        out.extend_from_slice(&payload);

        let mut hasher = Sha256::new();
        hasher.update(&out);
        let checksum = hex::encode(hasher.finalize());
        Ok((out, checksum))
    }

    /// Write the archive and its `.sha256` sidecar next to it.
    pub fn write_to(self, path: &Path) -> AResult<String> {
        let (bytes, checksum) = self.finish()?;
        std::fs::write(path, &bytes)
            .map_err(|e| pkg_err(format!("cannot write package: {}", e)))?;
        let sidecar = path.with_extension("sha256");
        std::fs::write(&sidecar, format!("{}\n", checksum))
            .map_err(|e| pkg_err(format!("cannot write checksum: {}", e)))?;
        Ok(checksum)
    }
}

/// Read a package index and a member back out (verification, tooling).
pub fn read_package(bytes: &[u8]) -> AResult<(PackageIndex, Vec<u8>)> {
    if bytes.len() < MAGIC.len() + 8 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(pkg_err("not a molt package"));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let index_len = u64::from_le_bytes(len_bytes) as usize;
    let index_end = 16 + index_len;
    if bytes.len() < index_end {
        return Err(pkg_err("truncated package index"));
    }
    let index: PackageIndex = serde_json::from_slice(&bytes[16..index_end])
        .map_err(|e| pkg_err(format!("package index: {}", e)))?;
    Ok((index, bytes[index_end..].to_vec()))
}

pub fn extract_member(index: &PackageIndex, payload: &[u8], name: &str) -> AResult<Vec<u8>> {
    use std::io::Read;
    let member = index
        .members
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| pkg_err(format!("no member '{}'", name)))?;
    let lo = member.offset as usize;
    let hi = lo + member.compressed_len as usize;
    let slice = payload
        .get(lo..hi)
        .ok_or_else(|| pkg_err("member out of bounds"))?;
    let mut dec = flate2::read::GzDecoder::new(slice);
    let mut out = Vec::with_capacity(member.raw_len as usize);
    dec.read_to_end(&mut out)
        .map_err(|e| pkg_err(format!("member decompression failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_members() {
        let mut b = PackageBuilder::new("demo", "1.0.0");
        b.add("module.bin", b"binary contents").unwrap();
        b.add("manifest.json", b"{\"abi_version\":1}").unwrap();
        let (bytes, checksum) = b.finish().unwrap();
        assert_eq!(checksum.len(), 64);

        let (index, payload) = read_package(&bytes).unwrap();
        assert_eq!(index.members.len(), 2);
        assert_eq!(
            extract_member(&index, &payload, "module.bin").unwrap(),
            b"binary contents"
        );
        assert_eq!(
            extract_member(&index, &payload, "manifest.json").unwrap(),
            b"{\"abi_version\":1}"
        );
    }

    #[test]
    fn test_archives_are_reproducible() {
        let build = || {
            let mut b = PackageBuilder::new("demo", "1.0.0");
            b.add("a", b"same bytes").unwrap();
            b.finish().unwrap()
        };
        let (bytes_a, sum_a) = build();
        let (bytes_b, sum_b) = build();
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(sum_a, sum_b);
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(read_package(b"NOTAPKG\0rest").is_err());
    }
}
