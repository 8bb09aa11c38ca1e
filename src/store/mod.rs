// Flat-directory metadata store: one JSON file per VPC, atomically
// replaced on every write. A partially written or unparsable document
// surfaces as corruption instead of silently coercing.

pub mod model;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tempfile::NamedTempFile;

use crate::error::{Result, VpcError};
use crate::policy::PolicyDoc;
use model::VpcDoc;

const VPC_FILE_PREFIX: &str = "vpc_";
const POLICY_FILE_PREFIX: &str = "policy_";
const LOCK_FILE: &str = ".lock";

pub struct MetadataStore {
    dir: PathBuf,
}

/// Exclusive advisory lock over the store, released on drop. Held by
/// mutating operations for their whole duration; readers skip it.
pub struct StoreLock {
    _flock: Flock<File>,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{VPC_FILE_PREFIX}{}.json", encode_name(name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Load a document; `None` means the VPC does not exist.
    pub fn load(&self, name: &str) -> Result<Option<VpcDoc>> {
        let path = self.path_for(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| VpcError::StateCorrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    pub fn require(&self, name: &str) -> Result<VpcDoc> {
        self.load(name)?.ok_or_else(|| VpcError::NotFound {
            kind: "VPC",
            name: name.to_string(),
        })
    }

    /// Atomic replace: serialize to a temp file in the same directory,
    /// then rename over the target.
    pub fn save(&self, doc: &VpcDoc) -> Result<()> {
        self.write_json(&self.path_for(&doc.name), doc)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all stored VPCs, sorted for a total order.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(encoded) = file_name
                .strip_prefix(VPC_FILE_PREFIX)
                .and_then(|s| s.strip_suffix(".json"))
            {
                if let Some(name) = decode_name(encoded) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Write an applied or auto-generated policy next to the VPC documents
    /// for inspection. The authoritative copy lives in the VPC document.
    pub fn save_policy_file(&self, vpc: &str, subnet: &str, doc: &PolicyDoc) -> Result<PathBuf> {
        let path = self.dir.join(format!(
            "{POLICY_FILE_PREFIX}{}_{}.json",
            encode_name(vpc),
            encode_name(subnet)
        ));
        self.write_json(&path, doc)?;
        Ok(path)
    }

    /// Best-effort removal of a VPC's policy files.
    pub fn remove_policy_files(&self, vpc: &str) {
        let prefix = format!("{POLICY_FILE_PREFIX}{}_", encode_name(vpc));
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            if let Some(file_name) = entry.file_name().to_str() {
                if file_name.starts_with(&prefix) && file_name.ends_with(".json") {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    pub fn lock(&self) -> Result<StoreLock> {
        self.ensure_dir()?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from_raw_os_error(errno as i32))?;
        Ok(StoreLock { _flock: flock })
    }

    fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir()?;
        let mut body = serde_json::to_string_pretty(value)?;
        body.push('\n');
        let tmp = NamedTempFile::new_in(&self.dir)?;
        fs::write(tmp.path(), body)?;
        tmp.persist(path).map_err(|e| VpcError::Io(e.error))?;
        Ok(())
    }
}

/// Encode a logical VPC name into a filename-safe form. Every byte outside
/// `[A-Za-z0-9._-]` is percent-escaped, so any printable ASCII name maps to
/// a unique, reversible filename.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
