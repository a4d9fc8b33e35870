use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::Compression;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{fsync_dir, temp_path_for};
use crate::hash::{hash_object, object_header, HashKind, ObjectId, Prefix};
use crate::object::{compress, inflate, parse_header, MAX_HEADER_LEN};
use crate::types::{ObjectType, RawObject};

/// one zlib file per object under `<objects>/<2 hex>/<rest hex>`
#[derive(Clone, Debug)]
pub struct LooseStore {
    root: PathBuf,
    hash: HashKind,
    compression: Compression,
    fsync: bool,
}

impl LooseStore {
    pub fn new(root: impl Into<PathBuf>, hash: HashKind, compression: Compression, fsync: bool) -> Self {
        Self {
            root: root.into(),
            hash,
            compression,
            fsync,
        }
    }

    /// the objects directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash
    }

    /// get the filesystem path to an object
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.to_path_components();
        self.root.join(dir).join(file)
    }

    /// write an object to the store
    ///
    /// returns the object id; writing an object that is already present is a no-op.
    pub fn write(&self, kind: ObjectType, payload: &[u8]) -> Result<ObjectId> {
        let id = hash_object(self.hash, kind, payload);
        let path = self.object_path(&id);

        // deduplication: if the object already exists, we're done
        if path.exists() {
            return Ok(id);
        }

        let header = object_header(kind, payload.len());
        let compressed = compress(self.compression, &[&header, payload]).with_path(&path)?;

        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir).with_path(&dir)?;

        // atomic write: temp file -> fsync -> rename
        let tmp_path = temp_path_for(&path);
        let written = (|| {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(&compressed).with_path(&tmp_path)?;
            if self.fsync {
                tmp_file.sync_all().with_path(&tmp_path)?;
            }
            fs::rename(&tmp_path, &path).with_path(&path)
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
            return written.map(|_| id);
        }

        if self.fsync {
            fsync_dir(&dir)?;
        }

        debug!(%id, kind = %kind, size = payload.len(), "wrote loose object");
        Ok(id)
    }

    /// check if an object exists (stat only)
    pub fn exists(&self, id: &ObjectId) -> bool {
        id.kind() == self.hash && self.object_path(id).is_file()
    }

    /// read and inflate an object
    pub fn read(&self, id: &ObjectId) -> Result<RawObject> {
        let path = self.object_path(id);
        let compressed = self.open_bytes(id, &path)?;

        let data = inflate(&compressed)
            .map_err(|e| Error::corrupt_object(*id, format!("inflate failed: {e}")))?;
        let (kind, len, header_len) = parse_header(&data)
            .ok_or_else(|| Error::corrupt_object(*id, "malformed object header"))?;

        let payload = &data[header_len..];
        if payload.len() != len {
            return Err(Error::corrupt_object(
                *id,
                format!("header declares {} bytes, found {}", len, payload.len()),
            ));
        }

        Ok(RawObject::new(kind, payload))
    }

    /// read only the type and size, inflating no more than the header
    pub fn read_header(&self, id: &ObjectId) -> Result<(ObjectType, u64)> {
        let path = self.object_path(id);
        let file = File::open(&path).map_err(|e| not_found_or_io(e, id, &path))?;

        let mut decoder = ZlibDecoder::new(file);
        let mut head = Vec::with_capacity(MAX_HEADER_LEN);
        let mut byte = [0u8; 1];
        while head.len() < MAX_HEADER_LEN {
            let n = decoder
                .read(&mut byte)
                .map_err(|e| Error::corrupt_object(*id, format!("inflate failed: {e}")))?;
            if n == 0 {
                break;
            }
            head.push(byte[0]);
            if byte[0] == 0 {
                break;
            }
        }

        let (kind, len, _) = parse_header(&head)
            .ok_or_else(|| Error::corrupt_object(*id, "malformed object header"))?;
        Ok((kind, len as u64))
    }

    /// read, then check the content hashes back to `id`
    pub fn verify(&self, id: &ObjectId) -> Result<RawObject> {
        let object = self.read(id)?;
        let actual = object.id(self.hash);
        if actual != *id {
            return Err(Error::corrupt_object(*id, format!("content hashes to {actual}")));
        }
        Ok(object)
    }

    /// delete an object file, e.g. after it has been packed
    pub fn remove(&self, id: &ObjectId) -> Result<bool> {
        crate::fs::remove_if_exists(&self.object_path(id))
    }

    /// enumerate stored ids lazily; fan-out directories are read one at a time
    pub fn iter(&self) -> impl Iterator<Item = Result<ObjectId>> + '_ {
        WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        return None;
                    }
                    self.id_from_path(entry.path()).map(Ok)
                }
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                    // the objects dir not existing yet just means "no objects"
                    if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) {
                        return None;
                    }
                    Some(Err(Error::Io {
                        path,
                        source: e.into(),
                    }))
                }
            })
    }

    /// all stored ids starting with `prefix`
    pub fn find_prefix(&self, prefix: &Prefix) -> Result<Vec<ObjectId>> {
        let hex = prefix.to_string();
        let dir = self.root.join(&hex[..2]);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).with_path(&dir),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.with_path(&dir)?;
            if let Some(id) = self.id_from_path(&entry.path()) {
                if prefix.matches(&id) {
                    found.push(id);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    fn id_from_path(&self, path: &Path) -> Option<ObjectId> {
        let file = path.file_name()?.to_str()?;
        let dir = path.parent()?.file_name()?.to_str()?;
        if dir.len() != 2 || file.len() != self.hash.hex_len() - 2 {
            return None;
        }
        let id = ObjectId::from_hex_kind(self.hash, &format!("{dir}{file}")).ok()?;
        // reject upper-case spellings so ids map back to the same path
        (id.to_hex() == format!("{dir}{file}")).then_some(id)
    }

    fn open_bytes(&self, id: &ObjectId, path: &Path) -> Result<Vec<u8>> {
        if id.kind() != self.hash {
            return Err(Error::ObjectNotFound(*id));
        }
        fs::read(path).map_err(|e| not_found_or_io(e, id, path))
    }
}

fn not_found_or_io(e: std::io::Error, id: &ObjectId, path: &Path) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::ObjectNotFound(*id)
    } else {
        Error::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}
