//! Path model: parse, validate, split, and rejoin `bucket[/key]` paths.
//!
//! Grounded on `apath.rs`'s segment validation (`apath_valid` rejects
//! empty/`.`/`..` segments) and `transport/s3.rs`'s `join_paths` (slash-safe
//! joining with debug-asserted invariants), generalized to a two-part
//! `bucket` + `key` grammar instead of a single relative path string.

use std::fmt;

use crate::error::{Error, Result};

/// A parsed `bucket[/key]` path.
///
/// Equality and hashing are defined over `(bucket, key)` only, per the
/// spec. The empty path (`bucket` and `key` both empty) denotes the
/// filesystem root.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Path {
    bucket: String,
    key: String,
}

impl Path {
    /// The root of the filesystem: no bucket, no key.
    pub fn root() -> Self {
        Path {
            bucket: String::new(),
            key: String::new(),
        }
    }

    /// A path naming just a bucket.
    pub fn bucket(bucket: impl Into<String>) -> Self {
        Path {
            bucket: bucket.into(),
            key: String::new(),
        }
    }

    /// A path naming a bucket and a key.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Path {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_root(&self) -> bool {
        self.bucket.is_empty()
    }

    pub fn is_bucket_only(&self) -> bool {
        !self.bucket.is_empty() && self.key.is_empty()
    }

    /// Parse an internal-form (`bucket/key`) or `s3://bucket/key` path.
    ///
    /// Policy: a URI-looking string (`scheme://...`) that is not `s3://`
    /// is rejected; a leading `/` is rejected; a trailing `/` is stripped
    /// before parsing; `.`/`..`/empty intermediate segments are rejected.
    pub fn parse(s: &str) -> Result<Path> {
        if let Some(idx) = s.find("://") {
            let scheme = &s[..idx];
            if scheme != "s3" {
                return Err(Error::invalid_input(format!(
                    "unsupported URI scheme {scheme:?} in path {s:?}"
                )));
            }
            let url = url::Url::parse(s)
                .map_err(|e| Error::invalid_input(format!("invalid s3:// URI {s:?}: {e}")))?;
            let bucket = url.host_str().unwrap_or_default().to_owned();
            let key = url.path().trim_start_matches('/');
            return Self::from_parts(bucket, key);
        }

        if s.starts_with('/') {
            return Err(Error::invalid_input(format!(
                "path must not start with '/': {s:?}"
            )));
        }

        let s = s.trim_end_matches('/');
        if s.is_empty() {
            return Ok(Path::root());
        }

        match s.split_once('/') {
            Some((bucket, key)) => Self::from_parts(bucket, key),
            None => Self::from_parts(s, ""),
        }
    }

    fn from_parts(bucket: impl Into<String>, key: &str) -> Result<Path> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(Error::invalid_input("bucket name must not be empty"));
        }
        let path = Path {
            bucket,
            key: key.trim_end_matches('/').to_owned(),
        };
        path.validate()?;
        Ok(path)
    }

    /// Reject `.`/`..`/empty intermediate segments in the key.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Ok(());
        }
        for segment in self.key.split('/') {
            if segment.is_empty() {
                return Err(Error::invalid_input(format!(
                    "empty path segment in key {:?}",
                    self.key
                )));
            }
            if segment == "." || segment == ".." {
                return Err(Error::invalid_input(format!(
                    "'{segment}' segment not allowed in key {:?}",
                    self.key
                )));
            }
        }
        Ok(())
    }

    /// The wire form used for S3 requests: `bucket/key`, with no trailing
    /// slash added here (callers append one when they need a directory
    /// marker or listing prefix).
    pub fn to_wire(&self) -> String {
        join_paths(&self.bucket, &self.key)
    }

    /// Percent-encode each path segment individually, preserving `/`.
    pub fn to_url_encoded(&self) -> String {
        let encoded_bucket = urlencoding::encode(&self.bucket).into_owned();
        if self.key.is_empty() {
            return encoded_bucket;
        }
        let encoded_key = self
            .key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{encoded_bucket}/{encoded_key}")
    }

    /// True if this path has a parent within the same bucket, i.e. the key
    /// is non-empty.
    pub fn has_parent(&self) -> bool {
        !self.key.is_empty()
    }

    /// The parent of this path. Requires a non-empty key.
    pub fn parent(&self) -> Result<Path> {
        if self.key.is_empty() {
            return Err(Error::invalid_input(
                "path has no parent: key is already empty",
            ));
        }
        let parent_key = match self.key.rsplit_once('/') {
            Some((parent, _leaf)) => parent.to_owned(),
            None => String::new(),
        };
        Ok(Path {
            bucket: self.bucket.clone(),
            key: parent_key,
        })
    }

    /// The final path segment, i.e. the file or directory name.
    pub fn leaf(&self) -> &str {
        if self.key.is_empty() {
            &self.bucket
        } else {
            self.key.rsplit('/').next().unwrap_or(&self.key)
        }
    }

    /// A new path formed by appending `segment` to this path's key.
    pub fn join(&self, segment: &str) -> Path {
        Path {
            bucket: self.bucket.clone(),
            key: join_paths(&self.key, segment),
        }
    }

    /// The key with a single trailing slash, as required for directory
    /// markers and listing prefixes. Empty key (bucket root) yields `""`.
    pub fn key_with_trailing_slash(&self) -> String {
        if self.key.is_empty() {
            String::new()
        } else {
            format!("{}/", self.key)
        }
    }

    /// Number of non-empty `/`-separated segments in the key.
    pub fn depth(&self) -> usize {
        if self.key.is_empty() {
            0
        } else {
            self.key.split('/').count()
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bucket.is_empty() {
            write!(f, "/")
        } else if self.key.is_empty() {
            write!(f, "{}", self.bucket)
        } else {
            write!(f, "{}/{}", self.bucket, self.key)
        }
    }
}

/// Join two path components with a single `/`, never producing a leading,
/// trailing, or doubled slash.
///
/// Mirrors `transport/s3.rs::join_paths` exactly, generalized to be a
/// free function usable by both [`Path`] and the listing engine's prefix
/// arithmetic.
pub fn join_paths(a: &str, b: &str) -> String {
    if b.is_empty() {
        return a.to_owned();
    }
    if a.is_empty() {
        return b.to_owned();
    }
    let mut result = a.to_owned();
    if !result.ends_with('/') {
        result.push('/');
    }
    result.push_str(b);
    debug_assert!(!result.contains("//"), "result must not contain //: {result:?}");
    debug_assert!(!result.starts_with('/'), "result must not start with /: {result:?}");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_root() {
        let p = Path::parse("").unwrap();
        assert!(p.is_root());
        assert_eq!(p.to_wire(), "");
    }

    #[test]
    fn parse_bucket_only() {
        let p = Path::parse("my-bucket").unwrap();
        assert!(p.is_bucket_only());
        assert_eq!(p.bucket_name(), "my-bucket");
        assert_eq!(p.key(), "");
    }

    #[test]
    fn parse_bucket_and_key() {
        let p = Path::parse("my-bucket/a/b.dat").unwrap();
        assert_eq!(p.bucket_name(), "my-bucket");
        assert_eq!(p.key(), "a/b.dat");
        assert_eq!(p.to_wire(), "my-bucket/a/b.dat");
    }

    #[test]
    fn parse_strips_trailing_slash() {
        let p = Path::parse("my-bucket/dir/").unwrap();
        assert_eq!(p.key(), "dir");
    }

    #[test]
    fn parse_rejects_leading_slash() {
        assert!(Path::parse("/my-bucket/a").is_err());
    }

    #[test]
    fn parse_rejects_uri_like_strings() {
        assert!(Path::parse("http://example.com/a").is_err());
        assert!(Path::parse("ftp://host/path").is_err());
    }

    #[test]
    fn parse_accepts_s3_uri() {
        let p = Path::parse("s3://my-bucket/a/b").unwrap();
        assert_eq!(p.bucket_name(), "my-bucket");
        assert_eq!(p.key(), "a/b");
    }

    #[test]
    fn parse_rejects_dot_segments() {
        assert!(Path::parse("bucket/./a").is_err());
        assert!(Path::parse("bucket/../a").is_err());
        assert!(Path::parse("bucket/a/../b").is_err());
    }

    #[test]
    fn parse_rejects_empty_intermediate_segment() {
        assert!(Path::parse("bucket/a//b").is_err());
    }

    #[test]
    fn parent_and_has_parent() {
        let p = Path::parse("bucket/a/b/c").unwrap();
        assert!(p.has_parent());
        let parent = p.parent().unwrap();
        assert_eq!(parent.key(), "a/b");
        let grandparent = parent.parent().unwrap();
        assert_eq!(grandparent.key(), "a");
        let bucket_root = grandparent.parent().unwrap();
        assert_eq!(bucket_root.key(), "");
        assert!(!bucket_root.has_parent());
        assert!(bucket_root.parent().is_err());
    }

    #[test]
    fn equality_ignores_other_fields() {
        let a = Path::parse("bucket/a/b").unwrap();
        let b = Path::new("bucket", "a/b");
        assert_eq!(a, b);
    }

    #[test]
    fn url_encoding_preserves_slashes() {
        let p = Path::new("bucket", "a dir/b file.txt");
        assert_eq!(p.to_url_encoded(), "bucket/a%20dir/b%20file.txt");
    }

    #[test]
    fn join_paths_never_doubles_slashes() {
        assert_eq!(join_paths("a", "b"), "a/b");
        assert_eq!(join_paths("a/", "b"), "a/b");
        assert_eq!(join_paths("", "b"), "b");
        assert_eq!(join_paths("a", ""), "a");
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(Path::new("b", "").depth(), 0);
        assert_eq!(Path::new("b", "a").depth(), 1);
        assert_eq!(Path::new("b", "a/b/c").depth(), 3);
    }
}
