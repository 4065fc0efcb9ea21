//! Backend quirks.
//!
//! A handful of code paths need to branch on which concrete S3
//! implementation sits behind the configured endpoint. Kept as a plain
//! enum rather than a trait: the set of quirks is small and fixed.

/// The concrete S3 implementation behind the configured endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Backend {
    #[default]
    Aws,
    Minio,
    Other,
}

impl Backend {
    /// Some backends 404 a `HeadObject` on an empty directory's trailing-slash
    /// marker unless the probe itself is issued with the trailing slash
    /// preserved in the key; this reports whether that extra probe is worth
    /// attempting for this backend. AWS and Minio both benefit from it, so
    /// only `Other` skips it (unknown backends may reject trailing-slash keys
    /// outright).
    pub fn probe_trailing_slash_for_empty_directory(self) -> bool {
        !matches!(self, Backend::Other)
    }

    /// Whether directory creation should be preceded by a defensive
    /// existence check that rejects non-directory occupants, even when the
    /// caller didn't ask for `check_directory_existence_before_creation`.
    pub fn forces_directory_existence_check(self) -> bool {
        matches!(self, Backend::Minio)
    }
}
