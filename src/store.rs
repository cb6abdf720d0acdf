//! Repository snapshots and the index cache.
//!
//! A [`Snapshot`] holds the source declaration and every declared source
//! file of one repository, read once and never mutated. Its revision is a
//! content address, so identical bytes always map to the same revision.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{load_mcp_config, McpConfig, MCP_CONFIG_FILENAME};
use crate::errors::{Result, XmlGraphError};
use crate::index::{build_index, EntityIndex};

/// Immutable view of one repository at one revision.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Repository identity, e.g. `owner/repo`.
    pub repo: String,
    /// Content address of the declaration and all source files.
    pub revision: String,
    pub config: Arc<McpConfig>,
    files: HashMap<String, Arc<Vec<u8>>>,
    missing: HashMap<String, String>,
}

impl Snapshot {
    /// Builds a snapshot from in-memory parts.
    ///
    /// `files` maps declared source paths to their content. Declared paths
    /// absent from `files` are reported as unreadable by [`read_file`].
    ///
    /// [`read_file`]: Snapshot::read_file
    pub fn from_parts(
        repo: &str,
        config_bytes: &[u8],
        config: McpConfig,
        files: HashMap<String, Vec<u8>>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config_bytes);
        for source in &config.sources {
            hasher.update(source.path.as_bytes());
            hasher.update([0u8]);
            if let Some(content) = files.get(&source.path) {
                hasher.update(content);
            }
            hasher.update([0u8]);
        }

        let missing = config
            .sources
            .iter()
            .filter(|s| !files.contains_key(&s.path))
            .map(|s| (s.path.clone(), "file not found".to_string()))
            .collect();

        Self {
            repo: repo.to_string(),
            revision: hex::encode(hasher.finalize()),
            config: Arc::new(config),
            files: files
                .into_iter()
                .map(|(path, bytes)| (path, Arc::new(bytes)))
                .collect(),
            missing,
        }
    }

    /// Reads a repository directory containing `mcp.yaml`.
    pub fn load_dir(dir: &Path, repo: &str) -> Result<Self> {
        let config_path = dir.join(MCP_CONFIG_FILENAME);
        let config_bytes = fs::read(&config_path).map_err(|e| XmlGraphError::Source {
            message: format!("failed to read source declaration: {}", e),
            path: config_path.display().to_string(),
        })?;
        let config = load_mcp_config(&config_bytes, repo)?;

        let mut files = HashMap::new();
        let mut missing = HashMap::new();
        for source in &config.sources {
            let Some(path) = safe_join(dir, &source.path) else {
                missing.insert(source.path.clone(), "path escapes repository".to_string());
                continue;
            };
            match fs::read(&path) {
                Ok(bytes) => {
                    files.insert(source.path.clone(), bytes);
                }
                Err(e) => {
                    warn!(repo, path = %source.path, "declared source unreadable: {}", e);
                    missing.insert(source.path.clone(), e.to_string());
                }
            }
        }

        let mut snapshot = Self::from_parts(repo, &config_bytes, config, files);
        snapshot.missing.extend(missing);
        Ok(snapshot)
    }

    /// Returns the content of a declared source file.
    pub fn read_file(&self, path: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(bytes) = self.files.get(path) {
            return Ok(bytes.clone());
        }
        let reason = self
            .missing
            .get(path)
            .cloned()
            .unwrap_or_else(|| "not a declared source".to_string());
        Err(XmlGraphError::Source {
            message: format!("cannot read source at revision {}: {}", self.revision, reason),
            path: path.to_string(),
        })
    }
}

/// Joins a relative path onto `base`, refusing anything that could escape it.
fn safe_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Some(base.join(relative))
    } else {
        None
    }
}

/// Length and modification time of one file, or `None` when unreadable.
type FileStamp = Option<(u64, Option<SystemTime>)>;

fn file_stamp(path: &Path) -> FileStamp {
    fs::metadata(path)
        .ok()
        .map(|meta| (meta.len(), meta.modified().ok()))
}

/// Stamps of the declaration followed by every declared source.
fn repo_stamps(dir: &Path, config: &McpConfig) -> Vec<FileStamp> {
    std::iter::once(file_stamp(&dir.join(MCP_CONFIG_FILENAME)))
        .chain(
            config
                .sources
                .iter()
                .map(|source| safe_join(dir, &source.path).and_then(|p| file_stamp(&p))),
        )
        .collect()
}

#[derive(Debug)]
struct CachedSnapshot {
    stamps: Vec<FileStamp>,
    snapshot: Arc<Snapshot>,
}

/// Directory of repositories laid out as `<root>/<owner>/<repo>/`.
///
/// Snapshots are reused until the metadata of the declaration or of a
/// declared source changes, so unchanged repositories are not re-read and
/// re-hashed on every request.
#[derive(Debug)]
pub struct RepoStore {
    root: PathBuf,
    snapshots: Mutex<HashMap<String, CachedSnapshot>>,
}

impl RepoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a repository directory, or `None` if the names are invalid
    /// or no declaration exists there.
    pub fn repo_dir(&self, owner: &str, repo: &str) -> Option<PathBuf> {
        if !is_path_segment(owner) || !is_path_segment(repo) {
            return None;
        }
        let dir = self.root.join(owner).join(repo);
        dir.join(MCP_CONFIG_FILENAME).is_file().then_some(dir)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedSnapshot>> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes a snapshot of `owner/repo`, reusing the previous one when no
    /// file it was read from has changed on disk.
    pub fn snapshot(&self, owner: &str, repo: &str) -> Result<Arc<Snapshot>> {
        let name = format!("{}/{}", owner, repo);
        let dir = self.repo_dir(owner, repo).ok_or_else(|| XmlGraphError::Source {
            message: "repository not found".to_string(),
            path: name.clone(),
        })?;

        if let Some(cached) = self.lock().get(&name) {
            if repo_stamps(&dir, &cached.snapshot.config) == cached.stamps {
                debug!(repo = %name, "snapshot cache hit");
                return Ok(cached.snapshot.clone());
            }
        }

        let snapshot = Arc::new(Snapshot::load_dir(&dir, &name)?);
        let stamps = repo_stamps(&dir, &snapshot.config);

        self.lock().insert(
            name,
            CachedSnapshot {
                stamps,
                snapshot: snapshot.clone(),
            },
        );
        Ok(snapshot)
    }
}

fn is_path_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repo: String,
    revision: String,
    path: String,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Arc<EntityIndex>>,
    order: VecDeque<CacheKey>,
}

/// Bounded cache of built indexes keyed by repository, revision and path.
///
/// Builds run without the lock held. Concurrent misses for the same key
/// may build twice; the first inserted result wins.
#[derive(Debug)]
pub struct IndexCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl IndexCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the index for `path` in `snapshot`, building it on a miss.
    pub fn get_or_build(&self, snapshot: &Snapshot, path: &str) -> Result<Arc<EntityIndex>> {
        let key = CacheKey {
            repo: snapshot.repo.clone(),
            revision: snapshot.revision.clone(),
            path: path.to_string(),
        };
        if let Some(index) = self.lock().entries.get(&key) {
            debug!(repo = %key.repo, path, "index cache hit");
            return Ok(index.clone());
        }

        let bytes = snapshot.read_file(path)?;
        let built = Arc::new(build_index(&bytes, path, &snapshot.revision)?);
        info!(
            repo = %key.repo,
            path,
            revision = %key.revision,
            entities = built.stats.total_entities,
            "indexed source"
        );

        let mut inner = self.lock();
        if let Some(existing) = inner.entries.get(&key) {
            return Ok(existing.clone());
        }
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, built.clone());
        Ok(built)
    }

    /// Returns the index backing the tools: the first declared XML source.
    pub fn primary_index(&self, snapshot: &Snapshot) -> Result<Arc<EntityIndex>> {
        let source = snapshot
            .config
            .primary_source()
            .ok_or_else(|| XmlGraphError::Config {
                message: format!("repository {} declares no XML source", snapshot.repo),
            })?;
        self.get_or_build(snapshot, &source.path)
    }
}
