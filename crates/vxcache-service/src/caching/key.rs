use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use md5::{Digest, Md5};

/// Longest client key that is stored verbatim.
///
/// The platform hands us full URLs and sometimes inline document text as
/// keys; everything above this length is folded through a digest so table
/// memory stays bounded no matter what callers throw at us.
const MAX_VERBATIM_LEN: usize = 256;

/// A normalized cache key.
///
/// Client keys of up to 256 bytes are kept as-is. Longer keys are replaced
/// by the URL-safe Base64 encoding of their MD5 digest, a fixed-length form
/// that is a pure function of the raw bytes: the same client key always
/// folds to the same `CacheKey`, regardless of when or how often it is
/// normalized.
///
/// Normalization is idempotent: feeding an already-folded key back through
/// [`normalize`](Self::normalize) yields the same key, so callers may
/// address entries by either the client key or the final key reported at
/// open time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<[u8]>);

impl CacheKey {
    /// Normalizes a client-supplied key.
    pub fn normalize(raw: impl AsRef<[u8]>) -> Self {
        let raw = raw.as_ref();
        if raw.len() <= MAX_VERBATIM_LEN {
            return CacheKey(Arc::from(raw));
        }

        let digest = Md5::digest(raw);
        CacheKey(Arc::from(URL_SAFE.encode(digest).into_bytes()))
    }

    /// The raw bytes of the normalized key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for CacheKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}
