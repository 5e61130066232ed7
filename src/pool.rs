//! The versioned binary store the build graph persists into.
//!
//! One append-only byte buffer plus an object table. Primitives serialize
//! inline; complex shared objects (rules, property maps, script sources)
//! receive a stable id the first time they are stored and only the id on
//! every later visit, so sharing and cycles survive a round trip. Node
//! `parents` are not stored at all; the loader rebuilds them from
//! `children`.

use crate::{
    error::{Error, ErrorKind, Result},
    language::JsonValue,
    utils::FileTime,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::Any,
    collections::HashMap,
    fs,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

const MAGIC: &[u8; 8] = b"QRYBG\0\0\0";
pub const FORMAT_VERSION: u32 = 4;

/// Type tag preceding every object record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Null = 0,
    SharedDef = 1,
    SharedRef = 2,
    ArtifactNode = 3,
    RuleNode = 4,
    Transformer = 5,
    FileDependency = 6,
    Product = 7,
    Project = 8,
    RescueData = 9,
}

impl Tag {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Tag::Null,
            1 => Tag::SharedDef,
            2 => Tag::SharedRef,
            3 => Tag::ArtifactNode,
            4 => Tag::RuleNode,
            5 => Tag::Transformer,
            6 => Tag::FileDependency,
            7 => Tag::Product,
            8 => Tag::Project,
            9 => Tag::RescueData,
            _ => return None,
        })
    }
}

/// Serializes a build graph into the pool format.
#[derive(Debug)]
pub struct PoolWriter {
    buf: Vec<u8>,
    shared_ids: HashMap<usize, u32>,
    next_shared_id: u32,
}

impl PoolWriter {
    /// Starts a pool with the header: magic, format version and the
    /// build-configuration snapshot the project identity derives from.
    pub fn new(configuration: &JsonValue) -> Self {
        let mut writer =
            Self { buf: Vec::new(), shared_ids: HashMap::new(), next_shared_id: 0 };
        writer.buf.extend_from_slice(MAGIC);
        writer.write_u32(FORMAT_VERSION);
        let snapshot = serde_json::to_vec(configuration).unwrap_or_default();
        writer.write_bytes(&snapshot);
        writer
    }

    pub fn write_tag(&mut self, tag: Tag) {
        self.buf.push(tag as u8);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_usize(&mut self, value: usize) {
        self.write_u64(value as u64);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_path(&mut self, value: &Path) {
        self.write_str(&value.to_string_lossy());
    }

    pub fn write_opt_u32(&mut self, value: Option<u32>) {
        match value {
            Some(v) => {
                self.write_bool(true);
                self.write_u32(v);
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_file_time(&mut self, value: FileTime) {
        let bytes = serde_json::to_vec(&value).unwrap_or_default();
        self.write_bytes(&bytes);
    }

    pub fn write_opt_file_time(&mut self, value: Option<FileTime>) {
        match value {
            Some(t) => {
                self.write_bool(true);
                self.write_file_time(t);
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_u32_iter(&mut self, values: impl ExactSizeIterator<Item = u32>) {
        self.write_u64(values.len() as u64);
        for v in values {
            self.write_u32(v);
        }
    }

    /// Stores a complex object under its interning key: the full payload
    /// on first visit, only the id afterwards.
    pub fn write_shared<T: Serialize>(&mut self, key: usize, value: &T) -> Result<()> {
        if let Some(&id) = self.shared_ids.get(&key) {
            self.write_tag(Tag::SharedRef);
            self.write_u32(id);
            return Ok(());
        }
        let id = self.next_shared_id;
        self.next_shared_id += 1;
        self.shared_ids.insert(key, id);
        self.write_tag(Tag::SharedDef);
        self.write_u32(id);
        let payload = serde_json::to_vec(value)
            .map_err(|err| Error::internal(format!("cannot serialize shared object: {err}")))?;
        self.write_bytes(&payload);
        Ok(())
    }

    /// Serializes a plain value inline via its serde representation.
    pub fn write_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| Error::internal(format!("cannot serialize value: {err}")))?;
        self.write_bytes(&payload);
        Ok(())
    }

    /// Writes the pool to `path`, replacing any previous file atomically.
    pub fn commit(self, path: &Path) -> Result<()> {
        crate::utils::create_parent_dir_all(path)?;
        let tmp = path.with_extension("bg.tmp");
        fs::write(&tmp, &self.buf).map_err(|err| Error::io(err, &tmp))?;
        fs::rename(&tmp, path).map_err(|err| Error::io(err, path))?;
        trace!("stored build graph ({} bytes) at {}", self.buf.len(), path.display());
        Ok(())
    }
}

/// Reads a pool written by [`PoolWriter`].
pub struct PoolReader {
    buf: Vec<u8>,
    pos: usize,
    path: PathBuf,
    shared_raw: HashMap<u32, Vec<u8>>,
    shared_restored: HashMap<u32, Box<dyn Any>>,
}

impl std::fmt::Debug for PoolReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolReader")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .field("len", &self.buf.len())
            .finish()
    }
}

impl PoolReader {
    /// Opens `path` and validates the header. Returns the reader plus the
    /// stored configuration snapshot.
    pub fn open(path: &Path) -> Result<(Self, JsonValue)> {
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(Error::new(
                    ErrorKind::NoBuildGraph,
                    format!("no build graph exists at {}", path.display()),
                ))
            }
            Err(err) => return Err(Error::io(err, path)),
        };
        let mut reader = Self {
            buf,
            pos: 0,
            path: path.to_path_buf(),
            shared_raw: HashMap::new(),
            shared_restored: HashMap::new(),
        };
        let magic = reader.take(MAGIC.len())?;
        if magic != &MAGIC[..] {
            return Err(reader.corrupt("bad magic"));
        }
        let version = reader.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(Error::new(
                ErrorKind::SchemaMismatch,
                format!(
                    "build graph at {} has format version {version}, expected {FORMAT_VERSION}",
                    path.display()
                ),
            ));
        }
        let snapshot = reader.read_raw_bytes()?;
        let configuration = serde_json::from_slice(&snapshot)
            .map_err(|_| reader.corrupt("configuration snapshot is not valid JSON"))?;
        Ok((reader, configuration))
    }

    fn corrupt(&self, what: &str) -> Error {
        Error::new(
            ErrorKind::CorruptBuildGraph,
            format!("corrupt build graph at {}: {what}", self.path.display()),
        )
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.pos + len > self.buf.len() {
            return Err(self.corrupt("unexpected end of data"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_tag(&mut self) -> Result<Tag> {
        let byte = self.take(1)?[0];
        Tag::from_u8(byte).ok_or_else(|| self.corrupt("unknown object tag"))
    }

    /// Reads a tag and fails unless it matches.
    pub fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let tag = self.read_tag()?;
        if tag != expected {
            return Err(self.corrupt(&format!("expected tag {expected:?}, found {tag:?}")));
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_usize(&mut self) -> Result<usize> {
        Ok(self.read_u64()? as usize)
    }

    fn read_raw_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.read_raw_bytes()?;
        String::from_utf8(bytes).map_err(|_| self.corrupt("string is not valid UTF-8"))
    }

    pub fn read_path(&mut self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.read_str()?))
    }

    pub fn read_opt_u32(&mut self) -> Result<Option<u32>> {
        Ok(if self.read_bool()? { Some(self.read_u32()?) } else { None })
    }

    pub fn read_file_time(&mut self) -> Result<FileTime> {
        let bytes = self.read_raw_bytes()?;
        serde_json::from_slice(&bytes).map_err(|_| self.corrupt("bad file time"))
    }

    pub fn read_opt_file_time(&mut self) -> Result<Option<FileTime>> {
        Ok(if self.read_bool()? { Some(self.read_file_time()?) } else { None })
    }

    pub fn read_u32_vec(&mut self) -> Result<Vec<u32>> {
        let len = self.read_u64()? as usize;
        let mut out = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            out.push(self.read_u32()?);
        }
        Ok(out)
    }

    /// Restores a shared object, preserving identity: every read of the
    /// same id yields the same `Arc`.
    pub fn read_shared<T: DeserializeOwned + 'static>(&mut self) -> Result<Arc<T>> {
        let tag = self.read_tag()?;
        let id = match tag {
            Tag::SharedDef => {
                let id = self.read_u32()?;
                let payload = self.read_raw_bytes()?;
                self.shared_raw.insert(id, payload);
                id
            }
            Tag::SharedRef => self.read_u32()?,
            other => return Err(self.corrupt(&format!("expected shared object, found {other:?}"))),
        };
        if let Some(restored) = self.shared_restored.get(&id) {
            if let Some(arc) = restored.downcast_ref::<Arc<T>>() {
                return Ok(arc.clone());
            }
            return Err(self.corrupt("shared object restored under two types"));
        }
        let payload = self
            .shared_raw
            .get(&id)
            .ok_or_else(|| self.corrupt("reference to unknown shared object"))?;
        let value: T = serde_json::from_slice(payload)
            .map_err(|_| self.corrupt("cannot deserialize shared object"))?;
        let arc = Arc::new(value);
        self.shared_restored.insert(id, Box::new(arc.clone()));
        Ok(arc)
    }

    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_raw_bytes()?;
        serde_json::from_slice(&bytes).map_err(|_| self.corrupt("cannot deserialize value"))
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Rule;

    #[test]
    fn primitives_round_trip() {
        let writer = {
            let mut w = PoolWriter::new(&serde_json::json!({"profile": "gcc"}));
            w.write_u32(42);
            w.write_str("hello");
            w.write_bool(true);
            w.write_path(Path::new("/tmp/x"));
            w
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bg");
        writer.commit(&path).unwrap();

        let (mut reader, config) = PoolReader::open(&path).unwrap();
        assert_eq!(config, serde_json::json!({"profile": "gcc"}));
        assert_eq!(reader.read_u32().unwrap(), 42);
        assert_eq!(reader.read_str().unwrap(), "hello");
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_path().unwrap(), PathBuf::from("/tmp/x"));
        assert!(reader.at_end());
    }

    #[test]
    fn shared_objects_keep_identity() {
        let rule = Arc::new(Rule { name: "compiler".into(), ..Default::default() });
        let mut w = PoolWriter::new(&JsonValue::Null);
        let key = Arc::as_ptr(&rule) as usize;
        w.write_shared(key, &*rule).unwrap();
        w.write_shared(key, &*rule).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bg");
        w.commit(&path).unwrap();

        let (mut reader, _) = PoolReader::open(&path).unwrap();
        let first: Arc<Rule> = reader.read_shared().unwrap();
        let second: Arc<Rule> = reader.read_shared().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name, "compiler");
    }

    #[test]
    fn missing_file_and_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.bg");
        let err = PoolReader::open(&missing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoBuildGraph);

        let path = dir.path().join("old.bg");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&(FORMAT_VERSION - 1).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        let err = PoolReader::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);

        let garbage = dir.path().join("garbage.bg");
        fs::write(&garbage, b"not a build graph").unwrap();
        let err = PoolReader::open(&garbage).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptBuildGraph);
    }
}
