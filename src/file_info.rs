//! Stat records returned by the facade and the listing engine.
//!
//! Generalizes the teacher's `Kind` (`src/kind.rs`, `File | Dir | Symlink |
//! Unknown`) into `FileType`: a local `fs::FileType` always resolves to
//! something, but an S3 stat can come back `NotFound`, so that variant is
//! added here.

use std::collections::HashMap;

use time::OffsetDateTime;

use crate::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FileType {
    NotFound,
    File,
    Directory,
    Unknown,
}

/// A stat record: `{path, type, size, mtime}`.
///
/// Directory records always have `size == 0` and are not obliged to carry
/// an `mtime`.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub path: Path,
    pub file_type: FileType,
    pub size: i64,
    pub mtime: Option<OffsetDateTime>,
}

impl FileInfo {
    pub fn not_found(path: Path) -> Self {
        FileInfo {
            path,
            file_type: FileType::NotFound,
            size: 0,
            mtime: None,
        }
    }

    pub fn directory(path: Path) -> Self {
        FileInfo {
            path,
            file_type: FileType::Directory,
            size: 0,
            mtime: None,
        }
    }

    pub fn file(path: Path, size: i64, mtime: Option<OffsetDateTime>) -> Self {
        FileInfo {
            path,
            file_type: FileType::File,
            size,
            mtime,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    /// Classify a key/size/content-type triple as file or directory, per
    /// the facade's `stat` rule: nonzero content length is always a file;
    /// a trailing slash or an `application/x-directory` content type is a
    /// directory; otherwise it's a file.
    pub fn classify_object(key: &str, content_length: i64, content_type: Option<&str>) -> FileType {
        if content_length > 0 {
            return FileType::File;
        }
        let is_directory_marker = key.ends_with('/')
            || content_type
                .map(|ct| ct.starts_with("application/x-directory"))
                .unwrap_or(false);
        if is_directory_marker {
            FileType::Directory
        } else {
            FileType::File
        }
    }
}

/// Metadata accepted on write and emitted on read.
///
/// Keys accepted on write: `ACL`, `Cache-Control`, `Content-Type`,
/// `Content-Language`, `Expires`. Other keys passed by a caller are
/// ignored, not rejected.
pub type ObjectMetadata = HashMap<String, String>;

/// Build the read-side metadata map from a `HeadObject`/`GetObject` result.
pub fn metadata_from_head(
    content_length: i64,
    cache_control: Option<&str>,
    content_type: Option<&str>,
    content_language: Option<&str>,
    etag: Option<&str>,
    version_id: Option<&str>,
    last_modified: Option<OffsetDateTime>,
    expires: Option<&str>,
) -> ObjectMetadata {
    let mut meta = ObjectMetadata::new();
    meta.insert("Content-Length".to_owned(), content_length.to_string());
    if let Some(v) = cache_control {
        meta.insert("Cache-Control".to_owned(), v.to_owned());
    }
    if let Some(v) = content_type {
        meta.insert("Content-Type".to_owned(), v.to_owned());
    }
    if let Some(v) = content_language {
        meta.insert("Content-Language".to_owned(), v.to_owned());
    }
    if let Some(v) = etag {
        meta.insert("ETag".to_owned(), v.to_owned());
    }
    if let Some(v) = version_id {
        meta.insert("VersionId".to_owned(), v.to_owned());
    }
    if let Some(v) = last_modified {
        meta.insert(
            "Last-Modified".to_owned(),
            v.format(&time::format_description::well_known::Rfc2822)
                .unwrap_or_default(),
        );
    }
    if let Some(v) = expires {
        meta.insert("Expires".to_owned(), v.to_owned());
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_nonzero_length_is_always_file() {
        assert_eq!(
            FileInfo::classify_object("dir/", 5, Some("application/x-directory")),
            FileType::File
        );
    }

    #[test]
    fn classify_trailing_slash_zero_length_is_directory() {
        assert_eq!(FileInfo::classify_object("dir/", 0, None), FileType::Directory);
    }

    #[test]
    fn classify_directory_content_type_is_directory() {
        assert_eq!(
            FileInfo::classify_object("dir", 0, Some("application/x-directory")),
            FileType::Directory
        );
    }

    #[test]
    fn classify_plain_empty_object_is_file() {
        assert_eq!(FileInfo::classify_object("empty.txt", 0, Some("text/plain")), FileType::File);
    }
}
