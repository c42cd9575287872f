//! On-disk cache of synthesized audio.
//! Content-addressed artifacts: `normal_<blake3(voice|speed|volume|pitch|format|text)>.<ext>`.
//! Named prompts: `<tag>.<ext>`, prepared once and never evicted.
//! Artifacts only appear at their final path through a rename, so readers
//! never see a partial file.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::tts::{Synthesizer, VoiceParams};

const CONTENT_PREFIX: &str = "normal_";
const PARTIAL_SUFFIX: &str = ".partial";
const NAMED_EXTENSIONS: [&str; 3] = ["mp3", "wav", "pcm"];

/// Result of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub kept: usize,
    pub removed: usize,
    pub bytes_kept: u64,
}

pub struct ResultCache {
    dir: PathBuf,
    /// Per-key gates so one key is synthesized at most once at a time.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResultCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Cache(format!("create {}: {e}", dir.display())))?;
        info!(dir = %dir.display(), "synthesis cache ready");
        Ok(Self {
            dir,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compute the cache key from synthesis parameters and text.
    pub fn compute_key(text: &str, params: &VoiceParams) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(params.voice.as_bytes());
        hasher.update(b"|");
        hasher.update(&[params.speed]);
        hasher.update(b"|");
        hasher.update(&[params.volume]);
        hasher.update(b"|");
        hasher.update(&[params.pitch]);
        hasher.update(b"|");
        hasher.update(params.format.extension().as_bytes());
        hasher.update(b"|");
        hasher.update(text.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn path_for(&self, text: &str, params: &VoiceParams) -> PathBuf {
        self.dir.join(format!(
            "{CONTENT_PREFIX}{}.{}",
            Self::compute_key(text, params),
            params.format.extension()
        ))
    }

    /// Cached artifact for `text`, synthesizing it on a miss. `None` when
    /// synthesis or relocation failed.
    pub async fn get_or_synthesize(&self, text: &str, synth: &dyn Synthesizer) -> Option<PathBuf> {
        self.get_or_synthesize_with(text, synth.params(), |t| async move {
            synth.synthesize(&t).await
        })
        .await
    }

    /// As `get_or_synthesize`, with any function producing a temporary artifact.
    pub async fn get_or_synthesize_with<F, Fut>(
        &self,
        text: &str,
        params: &VoiceParams,
        synthesize: F,
    ) -> Option<PathBuf>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let key = Self::compute_key(text, params);
        let final_path = self.path_for(text, params);

        let gate = Arc::clone(self.inflight.lock().entry(key.clone()).or_default());
        let result = {
            let _held = gate.lock().await;
            if final_path.exists() {
                debug!(key = %key, "synthesis cache hit");
                Ok(final_path.clone())
            } else {
                debug!(key = %key, "synthesis cache miss");
                match synthesize(text.to_string()).await {
                    Ok(temp) => self.relocate(&temp, &final_path).map(|()| final_path.clone()),
                    Err(e) => Err(e),
                }
            }
        };
        self.release_gate(&key, gate);

        match result {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(key = %key, error = %e, class = e.class(), "synthesis cache fill failed");
                None
            }
        }
    }

    /// Pre-seeded prompt by tag. `None` until prepared.
    pub fn get_named(&self, tag: &str) -> Option<PathBuf> {
        let found = NAMED_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{tag}.{ext}")))
            .find(|p| p.is_file());
        if found.is_none() {
            warn!(tag, "named prompt not cached");
        }
        found
    }

    /// Synthesize every prompt not yet on disk. Returns how many are available.
    pub async fn prepare_named(
        &self,
        prompts: &BTreeMap<String, String>,
        synth: &dyn Synthesizer,
    ) -> usize {
        let ext = synth.params().format.extension();
        let mut ready = 0;
        for (tag, text) in prompts {
            let target = self.dir.join(format!("{tag}.{ext}"));
            if target.is_file() {
                debug!(tag = %tag, "named prompt already cached");
                ready += 1;
                continue;
            }
            info!(tag = %tag, text = %text, "preparing named prompt");
            let outcome = match synth.synthesize(text).await {
                Ok(temp) => self.relocate(&temp, &target),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => ready += 1,
                Err(e) => {
                    warn!(tag = %tag, error = %e, class = e.class(), "named prompt unavailable")
                }
            }
        }
        ready
    }

    /// Keep the most recently modified content artifacts: at most
    /// `max_entries`, and no more than `max_total_bytes` cumulatively.
    /// Only content-addressed (`normal_`) artifacts count; named prompts are
    /// never evicted.
    pub fn evict(&self, max_entries: usize, max_total_bytes: u64) -> EvictionReport {
        let mut artifacts = match self.content_artifacts() {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "cache listing failed, eviction skipped");
                return EvictionReport::default();
            }
        };
        artifacts.sort_by(|a, b| b.1.cmp(&a.1));

        let mut report = EvictionReport::default();
        let mut total = 0u64;
        for (index, (path, _, size)) in artifacts.into_iter().enumerate() {
            total += size;
            if index >= max_entries || total > max_total_bytes {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), size, "evicted cache artifact");
                        report.removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "cache eviction failed"),
                }
            } else {
                report.kept += 1;
                report.bytes_kept += size;
            }
        }
        report
    }

    fn content_artifacts(&self) -> std::io::Result<Vec<(PathBuf, SystemTime, u64)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(CONTENT_PREFIX) || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            out.push((entry.path(), meta.modified()?, meta.len()));
        }
        Ok(out)
    }

    /// Move `temp` to `target` atomically. Across filesystems the bytes are
    /// first copied next to the target and then renamed over it.
    fn relocate(&self, temp: &Path, target: &Path) -> Result<()> {
        if std::fs::rename(temp, target).is_ok() {
            return Ok(());
        }

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Cache(format!("bad cache path {}", target.display())))?;
        let staging = self.dir.join(format!(".{file_name}{PARTIAL_SUFFIX}"));
        let copied = std::fs::copy(temp, &staging).and_then(|_| std::fs::rename(&staging, target));
        if let Err(e) = copied {
            let _ = std::fs::remove_file(&staging);
            return Err(Error::Cache(format!(
                "relocate {} -> {}: {e}",
                temp.display(),
                target.display()
            )));
        }
        if let Err(e) = std::fs::remove_file(temp) {
            debug!(path = %temp.display(), error = %e, "temporary artifact left behind");
        }
        Ok(())
    }

    fn release_gate(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        drop(gate);
        let mut inflight = self.inflight.lock();
        // Only the map holds it: nobody is waiting on the key.
        if inflight.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            inflight.remove(key);
        }
    }
}
