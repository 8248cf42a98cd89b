//! Stable-storage persistence of client identities.
//!
//! Each confirmed client gets one small record file, replicated under every
//! configured storage path:
//!
//! ```text
//! <path>/v4_state/<leaf>      written on confirmation
//! <path>/v4_oldstate/<leaf>   records from the previous instance
//! ```
//!
//! Record layout, little-endian:
//!
//! | offset | size   | field                     |
//! |--------|--------|---------------------------|
//! | 0      | 4      | version (i32, always 1)   |
//! | 4      | 8      | client verifier           |
//! | 12     | 4      | id length (u32)           |
//! | 16     | id len | client-supplied id bytes  |
//!
//! Recovery is two-phase per path: [`StableStorage::scan_old`] reads the
//! old-state directory without touching it, then
//! [`StableStorage::drain_current`] reads the state directory and moves every
//! valid record into the old-state directory, so each record can be reclaimed
//! only once.

use crate::config::RecordOwner;
use crate::error::{Result, StateError};
use crate::ids::{ClientId, Verifier, VERIFIER_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Record format version.
pub const RECORD_VERSION: i32 = 1;
/// Directory holding records written by this instance.
pub const STATE_DIR: &str = "v4_state";
/// Directory holding records of the previous instance.
pub const OLDSTATE_DIR: &str = "v4_oldstate";

const HEADER_LEN: usize = 4 + VERIFIER_SIZE + 4;

/// The persisted identity of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Client boot verifier
    pub verifier: Verifier,
    /// Client identity string
    pub id: Vec<u8>,
}

impl ClientRecord {
    /// On-disk form: version, verifier, id length, id.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.id.len());
        buf.put_i32_le(RECORD_VERSION);
        buf.put_slice(&self.verifier);
        buf.put_u32_le(self.id.len() as u32);
        buf.put_slice(&self.id);
        buf.to_vec()
    }

    /// Parses a record, rejecting short files, unknown versions, empty ids
    /// and id lengths that run past the end of the data.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() <= HEADER_LEN {
            return Err(StateError::Record {
                reason: format!("{} bytes is too short", data.len()),
            });
        }
        let mut buf = data;
        let version = buf.get_i32_le();
        if version != RECORD_VERSION {
            return Err(StateError::Record {
                reason: format!("unknown version {}", version),
            });
        }
        let mut verifier = [0u8; VERIFIER_SIZE];
        buf.copy_to_slice(&mut verifier);
        let id_len = buf.get_u32_le() as usize;
        if id_len == 0 {
            return Err(StateError::Record {
                reason: "empty client id".to_string(),
            });
        }
        if id_len > buf.remaining() {
            return Err(StateError::Record {
                reason: format!("id length {} exceeds record", id_len),
            });
        }
        Ok(Self {
            verifier,
            id: buf[..id_len].to_vec(),
        })
    }
}

/// Record file name for a client: its address, then the clientid in hex.
/// IPv4 octets are zero-padded to three digits.
pub fn leaf_name(addr: IpAddr, clientid: ClientId) -> String {
    let host = match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{:03}.{:03}.{:03}.{:03}", o[0], o[1], o[2], o[3])
        }
        IpAddr::V6(v6) => v6.to_string(),
    };
    format!("{}-{:x}", host, clientid.as_u64())
}

/// A record found during recovery, with the leaf it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldStateRecord {
    /// File name under the state directory
    pub leaf: String,
    /// Decoded contents
    pub record: ClientRecord,
}

/// Which directory under a storage path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDir {
    /// Records of the running instance
    State,
    /// Records of previous instances
    OldState,
}

impl StableDir {
    /// Directory name.
    pub fn name(self) -> &'static str {
        match self {
            StableDir::State => STATE_DIR,
            StableDir::OldState => OLDSTATE_DIR,
        }
    }

    /// This directory below `path`.
    pub fn under(self, path: &Path) -> PathBuf {
        path.join(self.name())
    }
}

/// Byte-level durable storage.
pub trait StableFs: Send + Sync {
    /// File names in `dir`, excluding temporaries.
    fn list(&self, dir: &Path) -> io::Result<Vec<String>>;
    /// Whole contents of `path`.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Replaces `path` with `data` atomically.
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Moves a record between directories.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Deletes a record.
    fn remove(&self, path: &Path) -> io::Result<()>;
    /// Creates `dir` and its parents.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    /// Changes the owner of a record.
    fn set_owner(&self, path: &Path, owner: RecordOwner) -> io::Result<()>;
}

/// [`StableFs`] over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.tmp", name))
    }
}

impl StableFs for LocalFs {
    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let tmp = Self::temp_path(path);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    #[cfg(unix)]
    fn set_owner(&self, path: &Path, owner: RecordOwner) -> io::Result<()> {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
    }

    #[cfg(not(unix))]
    fn set_owner(&self, _path: &Path, _owner: RecordOwner) -> io::Result<()> {
        Ok(())
    }
}

/// Client record persistence over a [`StableFs`].
pub struct StableStorage {
    fs: Arc<dyn StableFs>,
    owner: Option<RecordOwner>,
}

impl StableStorage {
    /// Storage over `fs`, creating files as `owner` when set.
    pub fn new(fs: Arc<dyn StableFs>, owner: Option<RecordOwner>) -> Self {
        Self { fs, owner }
    }

    /// Storage on the local filesystem.
    pub fn local(owner: Option<RecordOwner>) -> Self {
        Self::new(Arc::new(LocalFs), owner)
    }

    /// Creates both record directories under `path`.
    pub fn prepare(&self, path: &Path) -> Result<()> {
        self.fs.create_dir_all(&StableDir::State.under(path))?;
        self.fs.create_dir_all(&StableDir::OldState.under(path))?;
        Ok(())
    }

    /// Reads every valid record in `path`'s old-state directory, leaving
    /// the directory as it is apart from deleting malformed records.
    pub fn scan_old(&self, path: &Path) -> Vec<OldStateRecord> {
        self.read_dir_records(&StableDir::OldState.under(path))
    }

    /// Reads every valid record in `path`'s state directory and moves it
    /// into the old-state directory. A record whose move fails is still
    /// returned.
    pub fn drain_current(&self, path: &Path) -> Vec<OldStateRecord> {
        let state = StableDir::State.under(path);
        let oldstate = StableDir::OldState.under(path);
        let records = self.read_dir_records(&state);
        if records.is_empty() {
            return records;
        }
        if let Err(e) = self.fs.create_dir_all(&oldstate) {
            warn!(dir = %oldstate.display(), error = %e, "cannot create old-state directory");
            return records;
        }
        for rec in &records {
            let from = state.join(&rec.leaf);
            let to = oldstate.join(&rec.leaf);
            if let Err(e) = self.fs.rename(&from, &to) {
                warn!(from = %from.display(), error = %e, "failed to move record to old state");
            }
        }
        records
    }

    fn read_dir_records(&self, dir: &Path) -> Vec<OldStateRecord> {
        let names = match self.fs.list(dir) {
            Ok(names) => names,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "no stable-storage directory");
                return Vec::new();
            }
        };
        let mut records = Vec::with_capacity(names.len());
        for leaf in names {
            let path = dir.join(&leaf);
            let data = match self.fs.read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable record skipped");
                    continue;
                }
            };
            match ClientRecord::decode(&data) {
                Ok(record) => records.push(OldStateRecord { leaf, record }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "deleting malformed record");
                    if let Err(e) = self.fs.remove(&path) {
                        warn!(path = %path.display(), error = %e, "failed to delete malformed record");
                    }
                }
            }
        }
        records
    }

    /// Writes `record` as `leaf` into the state directory of every path.
    /// Failures are logged; returns how many paths were written.
    pub fn write_record(&self, paths: &[PathBuf], leaf: &str, record: &ClientRecord) -> usize {
        let data = record.encode();
        let mut written = 0;
        for path in paths {
            let dir = StableDir::State.under(path);
            let file = dir.join(leaf);
            let res = self
                .fs
                .create_dir_all(&dir)
                .and_then(|_| self.fs.write(&file, &data));
            if let Err(e) = res {
                warn!(path = %file.display(), error = %e, "failed to write client record");
                continue;
            }
            if let Some(owner) = self.owner {
                if let Err(e) = self.fs.set_owner(&file, owner) {
                    warn!(path = %file.display(), error = %e, "failed to set record owner");
                }
            }
            written += 1;
        }
        written
    }

    /// Removes `leaf` from `dir` under every path. Missing files are fine.
    pub fn remove_leaf(&self, paths: &[PathBuf], dir: StableDir, leaf: &str) {
        for path in paths {
            let file = dir.under(path).join(leaf);
            match self.fs.remove(&file) {
                Ok(()) => debug!(path = %file.display(), "removed client record"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), error = %e, "failed to remove client record"),
            }
        }
    }
}
