use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Guard files older than this are left over from a crashed writer.
const GUARD_STALE: Duration = Duration::from_secs(5);
/// How long a writer waits for a busy guard before giving up.
const GUARD_WAIT: Duration = Duration::from_secs(2);

/// Filesystem-backed key/value store used as the default KV engine.
///
/// Several processes may share one directory: every write runs under an
/// exclusive per-key guard file, so [`Kv::compare_and_swap`] is atomic across
/// all of them.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// In-process KV; clones share the same map.
#[derive(Clone, Default)]
pub struct MemKv {
    map: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// All keys starting with `prefix`, in byte order.
    fn keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>>;
    /// Atomically replace the value at `key` with `new` (`None` deletes) if the
    /// current value equals `expected` (`None` means absent). Returns whether
    /// the swap happened.
    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, new: Option<&[u8]>) -> Result<bool>;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
impl<T: Kv> KvSerde for T {}

/// `bincode` encoding shared by every record type.
pub fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>> {
    bincode::serialize(val).with_context(|| "bincode serialize")
}

/// Inverse of [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize::<T>(bytes).with_context(|| "bincode deserialize")
}

/// Default KV type exported by this crate (FS-backed).
pub type DefaultKv = FsKv;

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<DefaultKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

/* --------------------- impl FsKv --------------------- */

impl FsKv {
    /// Directory holding the records.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Windows-safe: map arbitrary bytes to a hex file name.
        let mut name = String::with_capacity(key.len() * 2);
        for &b in key {
            name.push(hex_digit(b >> 4));
            name.push(hex_digit(b & 0xF));
        }
        self.root.join(name)
    }

    fn read(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Write temp then rename, so readers never see a torn value.
    fn write(path: &Path, val: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val)?;
        f.sync_all()?;
        fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn guard(&self, path: &Path) -> Result<Guard> {
        Guard::acquire(path.with_extension("lock"))
    }
}

/// Exclusive per-key guard file holding its owner's nonce; removed on drop
/// if it still belongs to that owner.
///
/// Waiting on a busy guard sleeps the calling thread; async callers go
/// through [`crate::jobstore::off_thread`].
struct Guard {
    path: PathBuf,
    nonce: String,
}

impl Guard {
    fn acquire(path: PathBuf) -> Result<Self> {
        let nonce = Uuid::new_v4().to_string();
        let started = SystemTime::now();
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    if let Err(e) = f.write_all(nonce.as_bytes()) {
                        let _ = fs::remove_file(&path);
                        return Err(e).with_context(|| format!("write guard {}", path.display()));
                    }
                    return Ok(Guard { path, nonce });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_abandoned(&path) {
                        break_abandoned(&path)?;
                    }
                    if started.elapsed().unwrap_or_default() > GUARD_WAIT {
                        bail!("kv guard busy: {}", path.display());
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(e) => return Err(e).with_context(|| format!("create guard {}", path.display())),
            }
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        // A guard broken as abandoned may already belong to someone else.
        if fs::read(&self.path).is_ok_and(|owner| owner == self.nonce.as_bytes()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn is_abandoned(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|m| m.elapsed().ok())
        .is_some_and(|age| age > GUARD_STALE)
}

/// Remove an abandoned guard. Breakers serialize on a sibling `.break` file
/// and re-check age under it, so a guard that was already replaced by a
/// live writer is never removed.
fn break_abandoned(guard: &Path) -> Result<()> {
    let breaker = guard.with_extension("break");
    match fs::OpenOptions::new().write(true).create_new(true).open(&breaker) {
        Ok(_) => {
            if is_abandoned(guard) {
                tracing::warn!(guard = %guard.display(), "breaking abandoned kv guard");
                let _ = fs::remove_file(guard);
            }
            let _ = fs::remove_file(&breaker);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // Another breaker is at work; only clear its file if it died there.
            if is_abandoned(&breaker) {
                let _ = fs::remove_file(&breaker);
            }
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("create breaker {}", breaker.display())),
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

fn unhex(name: &str) -> Option<Vec<u8>> {
    if name.len() % 2 != 0 {
        return None;
    }
    (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect()
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::read(&self.path_for(key))
    }

    fn keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("list kv dir {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            // Temp and guard files carry an extension; record names never do.
            let Some(key) = name.to_str().and_then(unhex) else { continue };
            if key.starts_with(prefix) {
                out.push(key);
            }
        }
        out.sort();
        Ok(out)
    }

    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, new: Option<&[u8]>) -> Result<bool> {
        let path = self.path_for(key);
        let _guard = self.guard(&path)?;
        let current = Self::read(&path)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(val) => Self::write(&path, val)?,
            None => {
                Self::remove(&path)?;
            }
        }
        Ok(true)
    }
}

/* --------------------- impl MemKv --------------------- */

impl MemKv {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map().get(key).cloned())
    }

    fn keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .map()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, new: Option<&[u8]>) -> Result<bool> {
        let mut map = self.map();
        if map.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        match new {
            Some(val) => map.insert(key.to_vec(), val.to_vec()),
            None => map.remove(key),
        };
        Ok(true)
    }
}
