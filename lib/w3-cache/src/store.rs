/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use url::Url;

use crate::{BINARY_HEADER_LEN, CacheEntryError, EntryHeader, EntryText};

/// strip user-info and fragment: two requests differing only there must
/// share one cache entry
pub fn canonical_url(url: &Url) -> String {
    let mut u = url.clone();
    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_fragment(None);
    u.to_string()
}

/// cache filename: lowercase hex sha-1 of the canonical url
pub fn entry_filename(canonical: &str) -> String {
    hex::encode(Sha1::digest(canonical.as_bytes()))
}

pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn open(dir: &Path) -> std::io::Result<CacheStore> {
        std::fs::create_dir_all(dir)?;
        Ok(CacheStore {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, canonical: &str) -> PathBuf {
        self.dir.join(entry_filename(canonical))
    }

    /// Open the entry for reading, verifying the binary header and that the
    /// stored url really is ours (the filename is just a hash). Any kind of
    /// corruption silently invalidates the entry: the caller falls back to
    /// the network.
    pub fn open_read(&self, canonical: &str) -> Option<CacheReader> {
        let path = self.entry_path(canonical);
        match CacheReader::open(&path, canonical) {
            Ok(reader) => Some(reader),
            Err(CacheEntryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!("invalidating cache entry {}: {e}", path.display());
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Start a new entry. Any open read handle for it must be given up
    /// first; the old file is removed so a failed write cannot resurrect it.
    pub fn begin_write(
        &self,
        canonical: &str,
        header: EntryHeader,
        text: EntryText,
    ) -> CacheWriter {
        let final_path = self.entry_path(canonical);
        let _ = std::fs::remove_file(&final_path);
        CacheWriter {
            dir: self.dir.clone(),
            final_path,
            header,
            text,
            file: None,
            bytes_written: 0,
        }
    }

    pub fn remove(&self, canonical: &str) {
        let _ = std::fs::remove_file(self.entry_path(canonical));
    }

    /// Rewrite the binary header in place after a successful revalidation:
    /// new expire date, bumped use count. The payload is untouched.
    pub fn update_expire(
        &self,
        canonical: &str,
        expire_date: i64,
        served_date: i64,
    ) -> Result<EntryHeader, CacheEntryError> {
        let path = self.entry_path(canonical);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut buf = [0u8; BINARY_HEADER_LEN];
        file.read_exact(&mut buf)?;
        let mut header = EntryHeader::decode(&buf)?;
        header.expire_date = expire_date;
        if served_date >= 0 {
            header.served_date = served_date;
        }
        header.use_count += 1;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        Ok(header)
    }
}

/// open entry, positioned past both headers; reads yield payload bytes
pub struct CacheReader {
    file: BufReader<File>,
    header: EntryHeader,
    text: EntryText,
}

impl CacheReader {
    fn open(path: &Path, canonical: &str) -> Result<CacheReader, CacheEntryError> {
        let mut file = BufReader::new(File::open(path)?);
        let mut buf = [0u8; BINARY_HEADER_LEN];
        file.read_exact(&mut buf)?;
        let header = EntryHeader::decode(&buf)?;
        let text = EntryText::read_from(&mut file)?;
        if text.url != canonical {
            return Err(CacheEntryError::UrlMismatch);
        }
        Ok(CacheReader { file, header, text })
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn text(&self) -> &EntryText {
        &self.text
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// A pending cache entry. Nothing touches the disk until the first payload
/// byte arrives, so empty responses never leave a file behind. `commit`
/// renames the temp file into place; dropping without commit deletes it.
pub struct CacheWriter {
    dir: PathBuf,
    final_path: PathBuf,
    header: EntryHeader,
    text: EntryText,
    file: Option<NamedTempFile>,
    bytes_written: u64,
}

impl CacheWriter {
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn write_payload(&mut self, data: &[u8]) -> Result<(), CacheEntryError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.file.is_none() {
            let mut f = NamedTempFile::new_in(&self.dir)?;
            f.write_all(&self.header.encode())?;
            self.text.write_to(&mut f)?;
            self.file = Some(f);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
            self.bytes_written += data.len() as u64;
        }
        Ok(())
    }

    /// finalize: fix up the payload size in the header and move the file to
    /// its hashed name. Returns the header as written, or None when no
    /// payload byte was ever produced.
    pub fn commit(mut self) -> Result<Option<EntryHeader>, CacheEntryError> {
        let Some(mut file) = self.file.take() else {
            return Ok(None);
        };
        self.header.payload_size = u32::try_from(self.bytes_written).unwrap_or(u32::MAX);
        file.as_file_mut().seek(SeekFrom::Start(0))?;
        file.as_file_mut().write_all(&self.header.encode())?;
        file.as_file_mut().flush()?;
        file.persist(&self.final_path)
            .map_err(|e| CacheEntryError::Io(e.error))?;
        Ok(Some(self.header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text(url: &str) -> EntryText {
        EntryText {
            url: url.to_string(),
            etag: "\"abc\"".to_string(),
            mime: "text/plain".to_string(),
            headers: vec![
                "HTTP/1.1 200 OK".to_string(),
                "ETag: \"abc\"".to_string(),
            ],
        }
    }

    #[test]
    fn canonicalization() {
        let url = Url::parse("http://user:pw@host:8080/p?q=1#frag").unwrap();
        assert_eq!(canonical_url(&url), "http://host:8080/p?q=1");
        assert_eq!(entry_filename("x").len(), 40);
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let canonical = "http://host/file";

        let header = EntryHeader {
            use_count: 1,
            served_date: 100,
            last_modified: 50,
            expire_date: 200,
            payload_size: 0,
        };
        let mut writer = store.begin_write(canonical, header, sample_text(canonical));
        writer.write_payload(b"hello ").unwrap();
        writer.write_payload(b"world").unwrap();
        let committed = writer.commit().unwrap().unwrap();
        assert_eq!(committed.payload_size, 11);

        let mut reader = store.open_read(canonical).unwrap();
        assert_eq!(reader.header().expire_date, 200);
        assert_eq!(reader.text().etag, "\"abc\"");
        assert_eq!(reader.text().headers.len(), 2);
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn empty_body_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let canonical = "http://host/empty";

        let writer = store.begin_write(canonical, EntryHeader::default(), sample_text(canonical));
        assert!(writer.commit().unwrap().is_none());
        assert!(store.open_read(canonical).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn dropped_writer_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let canonical = "http://host/dropped";

        let mut writer =
            store.begin_write(canonical, EntryHeader::default(), sample_text(canonical));
        writer.write_payload(b"partial").unwrap();
        drop(writer);
        assert!(store.open_read(canonical).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn url_mismatch_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        let mut writer = store.begin_write(
            "http://host/real",
            EntryHeader::default(),
            sample_text("http://host/other"),
        );
        writer.write_payload(b"x").unwrap();
        writer.commit().unwrap();

        // hash collision evidence: the entry is dropped, not served
        assert!(store.open_read("http://host/real").is_none());
        assert!(!store.entry_path("http://host/real").exists());
    }

    #[test]
    fn update_expire_rewrites_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let canonical = "http://host/reval";

        let mut writer = store.begin_write(
            canonical,
            EntryHeader {
                expire_date: 100,
                ..Default::default()
            },
            sample_text(canonical),
        );
        writer.write_payload(b"body").unwrap();
        writer.commit().unwrap();

        let updated = store.update_expire(canonical, 160, 120).unwrap();
        assert_eq!(updated.expire_date, 160);
        assert_eq!(updated.served_date, 120);
        assert_eq!(updated.use_count, 1);

        let mut reader = store.open_read(canonical).unwrap();
        assert_eq!(reader.header().expire_date, 160);
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"body");
    }
}
