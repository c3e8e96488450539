//! Session cache: one [`DecodeSession`] per canonical media path.
//!
//! The `SessionCache` handles:
//! - Path canonicalization (filesystem canonical path, lexical fallback)
//! - Lazy, single-flight session creation: the first `get` for a path opens
//!   it while holding the cache lock, so concurrent first requests cause
//!   exactly one open
//! - Remembering open failures, so every caller sees the same error until
//!   the entry is removed
//! - Explicit teardown (`remove`, `clear`)

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use se_common::{DecodeError, EngineConfig, FrameNumber, OpenError};
use se_demux::MediaOpener;

use crate::convert::{PixelConverter, YuvToRgba};
use crate::session::{DecodeSession, Delivery, StreamSummary};

enum Slot {
    Ready(Arc<DecodeSession>),
    Failed(OpenError),
}

/// Registry of open decode sessions keyed by canonical path.
///
/// The cache lock covers lookup-or-insert only (including the first open of
/// a path); decoding runs under the per-session lock.
pub struct SessionCache {
    opener: Arc<dyn MediaOpener>,
    converter: Arc<dyn PixelConverter>,
    config: EngineConfig,
    sessions: Mutex<HashMap<PathBuf, Slot>>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.sessions.lock();
        let failed = sessions
            .values()
            .filter(|s| matches!(s, Slot::Failed(_)))
            .count();
        f.debug_struct("SessionCache")
            .field("open_sessions", &(sessions.len() - failed))
            .field("failed_paths", &failed)
            .field("config", &self.config)
            .finish()
    }
}

impl SessionCache {
    /// Create a cache converting frames to RGBA8 with the default configuration.
    pub fn new(opener: Arc<dyn MediaOpener>) -> Self {
        Self {
            opener,
            converter: Arc::new(YuvToRgba),
            config: EngineConfig::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn PixelConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Session for `path`, opening it on first use.
    ///
    /// # Errors
    /// The open failure of this path, now or from an earlier attempt.
    pub fn get(&self, path: &Path) -> Result<Arc<DecodeSession>, OpenError> {
        let key = canonical_path(path);
        let mut sessions = self.sessions.lock();
        match sessions.get(&key) {
            Some(Slot::Ready(session)) => return Ok(session.clone()),
            Some(Slot::Failed(err)) => return Err(err.clone()),
            None => {}
        }

        match DecodeSession::open(
            &key,
            self.opener.as_ref(),
            self.converter.clone(),
            self.config.clone(),
        ) {
            Ok(session) => {
                let session = Arc::new(session);
                info!(path = %key.display(), "Opened decode session");
                sessions.insert(key, Slot::Ready(session.clone()));
                Ok(session)
            }
            Err(err) => {
                warn!(path = %key.display(), error = %err, "Failed to open media");
                sessions.insert(key, Slot::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Decode presentation frame `frame` of `stream` in `path` into `out`.
    pub fn decode_frame(
        &self,
        path: &Path,
        stream: usize,
        frame: FrameNumber,
        allow_nearest: bool,
        out: &mut [u8],
    ) -> Result<Delivery, DecodeError> {
        let session = self.get(path)?;
        session.decode_frame(stream, frame, allow_nearest, out)
    }

    /// Cached metadata of `stream` in `path`.
    pub fn info(&self, path: &Path, stream: usize) -> Result<StreamSummary, OpenError> {
        self.get(path)?.info(stream)
    }

    /// Drop the entry for `path` (session or remembered failure).
    ///
    /// Callers still holding the session keep it alive until they finish.
    pub fn remove(&self, path: &Path) -> bool {
        let key = canonical_path(path);
        if self.sessions.lock().remove(&key).is_some() {
            info!(path = %key.display(), "Closed decode session");
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut sessions = self.sessions.lock();
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            info!(count, "Closed all decode sessions");
        }
    }

    /// Number of entries, failed opens included.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.sessions.lock().contains_key(&canonical_path(path))
    }
}

/// Cache key of `path`: the filesystem canonical path when it exists,
/// otherwise an absolute, lexically normalized path.
pub fn canonical_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| lexical_normalize(path))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::PackedCopy;
    use crate::synthetic::{SyntheticClip, SyntheticOpener};

    fn cache(opener: SyntheticOpener) -> (SessionCache, Arc<SyntheticOpener>) {
        let opener = Arc::new(opener);
        let cache = SessionCache::new(opener.clone()).with_converter(Arc::new(PackedCopy));
        (cache, opener)
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(
            lexical_normalize(Path::new("/media/./a/../clip.mov")),
            PathBuf::from("/media/clip.mov")
        );
        assert!(lexical_normalize(Path::new("clip.mov")).is_absolute());
    }

    #[test]
    fn equivalent_paths_share_a_session() {
        let (cache, opener) =
            cache(SyntheticOpener::new().with_clip("/media/clip.mov", SyntheticClip::new(10)));
        let a = cache.get(Path::new("/media/clip.mov")).unwrap();
        let b = cache.get(Path::new("/media/x/../clip.mov")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(opener.open_count(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(Path::new("/media/./clip.mov")));
    }

    #[test]
    fn failures_are_remembered_until_removed() {
        let (cache, opener) = cache(SyntheticOpener::new());
        let path = Path::new("/media/missing.mov");
        let first = cache.get(path).unwrap_err();
        let second = cache.get(path).unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(first, OpenError::NotFound { .. }));
        assert_eq!(opener.open_count(), 1);

        assert!(cache.remove(path));
        assert!(!cache.remove(path));
        let _ = cache.get(path);
        assert_eq!(opener.open_count(), 2);
    }

    #[test]
    fn decode_and_info_through_the_cache() {
        let clip = SyntheticClip::new(20);
        let (cache, _) = cache(SyntheticOpener::new().with_clip("/media/clip.mov", clip.clone()));
        let path = Path::new("/media/clip.mov");
        assert_eq!(cache.info(path, 0).unwrap().frame_count, 20);

        let mut out = vec![0u8; clip.resolution.rgba_byte_size()];
        let d = cache
            .decode_frame(path, 0, FrameNumber(5), false, &mut out)
            .unwrap();
        assert_eq!(d, Delivery::Exact { frame: FrameNumber(5) });
        assert_eq!(out, clip.expected_rgba(5));

        cache.clear();
        assert!(cache.is_empty());
    }
}
