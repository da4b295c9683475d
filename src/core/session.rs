// src/core/session.rs

use crate::cli::Options;
use crate::core::error::{ProbeError, ProbeResult};
use crate::core::events::EventBus;
use crate::core::limiter::ConcurrencyLimiter;
use crate::core::models::{Page, PageRecord};
use crate::core::similarity::Cluster;
use crate::core::stats::{Stats, StatsSnapshot};
use color_eyre::eyre::{Result, WrapErr};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subdirectories of the output root every run needs.
pub const OUTPUT_SUBDIRS: &[&str] = &["headers", "html", "screenshots"];

const REPORT_DIR_PREFIX: &str = "vanguardReport_";

/// Persisted form of a finished run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSnapshot {
    pub version: String,
    pub stats: StatsSnapshot,
    pub pages: BTreeMap<String, PageRecord>,
    pub page_similarity_clusters: BTreeMap<String, Vec<String>>,
}

impl SessionSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .wrap_err_with(|| format!("reading session file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .wrap_err_with(|| format!("parsing session file {}", path.display()))
    }
}

/// Per-run context shared by the driver and every agent.
pub struct Session {
    pub options: Options,
    pub stats: Stats,
    pub bus: EventBus,
    pub limiter: ConcurrencyLimiter,
    root: PathBuf,
    pages: RwLock<HashMap<String, Arc<Page>>>,
    clusters: RwLock<Vec<Cluster>>,
}

impl Session {
    /// Builds the session and its output root. Failing to create the output
    /// directories is fatal for the run.
    pub fn new(options: Options) -> Result<Self> {
        let root = init_directories(&options.out_dir)?;
        info!(root = %root.display(), threads = options.threads, ports = options.ports.len(), "Session created.");
        Ok(Self {
            limiter: ConcurrencyLimiter::new(options.threads),
            stats: Stats::new(),
            bus: EventBus::new(),
            root,
            pages: RwLock::new(HashMap::new()),
            clusters: RwLock::new(Vec::new()),
            options,
        })
    }

    pub fn start(&self) {
        self.stats.start();
    }

    pub fn end(&self) {
        self.stats.finish();
    }

    pub fn ports(&self) -> &[u16] {
        &self.options.ports
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // --- Page Registry ---

    /// Returns the page for `url`, creating it on first sight.
    pub fn add_page(&self, url: &str) -> ProbeResult<Arc<Page>> {
        if let Some(page) = self.get_page(url) {
            return Ok(page);
        }
        let mut pages = self.pages.write();
        if let Some(page) = pages.get(url) {
            return Ok(page.clone());
        }
        let page = Arc::new(Page::new(url).map_err(|e| ProbeError::InvalidUrl(format!("{url}: {e}")))?);
        debug!(url, id = page.id(), "Registered page.");
        pages.insert(url.to_string(), page.clone());
        Ok(page)
    }

    pub fn get_page(&self, url: &str) -> Option<Arc<Page>> {
        self.pages.read().get(url).cloned()
    }

    /// Like [`Session::get_page`], but a miss is a [`ProbeError::MissingPage`].
    pub fn require_page(&self, url: &str) -> ProbeResult<Arc<Page>> {
        self.get_page(url)
            .ok_or_else(|| ProbeError::MissingPage(url.to_string()))
    }

    pub fn get_page_by_id(&self, id: &str) -> Option<Arc<Page>> {
        self.pages.read().values().find(|p| p.id() == id).cloned()
    }

    /// All pages, ordered by URL.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        let mut pages: Vec<_> = self.pages.read().values().cloned().collect();
        pages.sort_by(|a, b| a.url().cmp(b.url()));
        pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    pub fn set_clusters(&self, clusters: Vec<Cluster>) {
        *self.clusters.write() = clusters;
    }

    #[cfg(test)]
    pub fn clusters(&self) -> Vec<Cluster> {
        self.clusters.read().clone()
    }

    // --- Files ---

    /// Deterministic artifact name for a URL:
    /// `scheme__host_with_underscores__<first 16 hex of sha1(path + fragment)>`.
    ///
    /// Host, port and path are taken as written, so `http://h:80` and `http://h`
    /// name different files, as do `http://h` and `http://h/`.
    pub fn base_filename(page_url: &str) -> ProbeResult<String> {
        let parsed = url::Url::parse(page_url)
            .map_err(|e| ProbeError::InvalidUrl(format!("{page_url}: {e}")))?;
        let (authority, path, fragment) = raw_parts(page_url);

        let mut hasher = Sha1::new();
        hasher.update(path.as_bytes());
        hasher.update(fragment.as_bytes());
        let digest = hex::encode(hasher.finalize());

        let host = authority.replacen(':', "__", 1).replace('.', "_");
        Ok(format!("{}__{}__{}", parsed.scheme(), host, &digest[..16]).to_lowercase())
    }

    pub fn file_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn read_file(&self, relative: impl AsRef<Path>) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.file_path(relative))
    }

    pub fn write_file(&self, relative: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
        std::fs::write(self.file_path(relative), contents)
    }

    // --- Persistence ---

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            version: VERSION.to_string(),
            stats: self.stats.snapshot(),
            pages: self
                .pages
                .read()
                .iter()
                .map(|(url, page)| (url.clone(), page.snapshot()))
                .collect(),
            page_similarity_clusters: self
                .clusters
                .read()
                .iter()
                .map(|c| (c.id.clone(), c.members.clone()))
                .collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    pub fn save_to_file(&self, relative: impl AsRef<Path>) -> ProbeResult<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        self.write_file(relative, json)?;
        Ok(())
    }

    /// A session over the same output root whose registry, stats and clusters
    /// come from a loaded snapshot. A record without an id, or reusing an id
    /// an earlier record already holds, is given a fresh one so lookups by id
    /// stay unambiguous.
    pub fn restore(&self, snapshot: SessionSnapshot) -> Self {
        let restored = Self {
            options: self.options.clone(),
            stats: Stats::from_snapshot(snapshot.stats),
            bus: EventBus::new(),
            limiter: ConcurrencyLimiter::new(self.options.threads),
            root: self.root.clone(),
            pages: RwLock::new(HashMap::new()),
            clusters: RwLock::new(
                snapshot
                    .page_similarity_clusters
                    .into_iter()
                    .map(|(id, members)| Cluster { id, members })
                    .collect(),
            ),
        };
        for (url, mut record) in snapshot.pages {
            if record.uuid.is_empty() || restored.get_page_by_id(&record.uuid).is_some() {
                let fresh = Uuid::new_v4().to_string();
                warn!(%url, old = %record.uuid, new = %fresh, "Page id missing or reused; assigned a new one.");
                record.uuid = fresh;
            }
            restored.pages.write().insert(url, Arc::new(Page::from_record(record)));
        }
        info!(pages = restored.page_count(), version = %snapshot.version, "Session restored from snapshot.");
        restored
    }
}

/// Host with port, path and fragment of `raw` exactly as written. Userinfo
/// and query are dropped.
fn raw_parts(raw: &str) -> (&str, &str, &str) {
    let rest = raw.trim().split_once(':').map_or("", |(_, rest)| rest);
    let (rest, fragment) = rest.split_once('#').unwrap_or((rest, ""));
    let rest = rest.split_once('?').map_or(rest, |(before, _)| before);
    let Some(rest) = rest.strip_prefix("//") else {
        return ("", rest, fragment);
    };
    let (authority, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    (host, path, fragment)
}

/// Creates `<out>/vanguardReport_<MM-DD-YYYY>` (with a `(n)` suffix when that
/// name is taken) and its artifact subdirectories.
pub fn init_directories(out_dir: &Path) -> Result<PathBuf> {
    let name = format!("{REPORT_DIR_PREFIX}{}", chrono::Local::now().format("%m-%d-%Y"));
    let mut root = out_dir.join(&name);
    let mut suffix = 1;
    while root.exists() {
        root = out_dir.join(format!("{name}({suffix})"));
        suffix += 1;
    }
    for sub in OUTPUT_SUBDIRS {
        let dir = root.join(sub);
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create required directory {}", dir.display()))?;
    }
    Ok(root)
}

#[cfg(test)]
pub(crate) fn test_session(dir: &Path) -> Session {
    Session::new(Options {
        out_dir: dir.to_path_buf(),
        threads: 4,
        ..Default::default()
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_root_layout() {
        let dir = tempfile::tempdir().unwrap();
        let first = test_session(dir.path());
        let second = test_session(dir.path());
        assert_ne!(first.root(), second.root());
        assert!(second.root().file_name().unwrap().to_str().unwrap().ends_with("(1)"));
        for sub in OUTPUT_SUBDIRS {
            assert!(first.root().join(sub).is_dir());
        }
    }

    #[test]
    fn test_add_page_is_idempotent_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(test_session(dir.path()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.add_page("http://example.com/").unwrap())
            })
            .collect();
        let pages: Vec<Arc<Page>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(session.page_count(), 1);
        for page in &pages {
            assert!(Arc::ptr_eq(page, &pages[0]));
            assert_eq!(page.id(), pages[0].id());
        }
    }

    #[test]
    fn test_lookup_by_url_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let page = session.add_page("https://example.com/a").unwrap();
        assert!(session.get_page("https://example.com/b").is_none());
        assert!(matches!(
            session.require_page("https://example.com/b"),
            Err(ProbeError::MissingPage(_))
        ));
        let by_id = session.get_page_by_id(page.id()).unwrap();
        assert!(Arc::ptr_eq(&page, &by_id));
        assert!(session.add_page("not a url").is_err());
    }

    #[test]
    fn test_base_filename() {
        let mut hasher = Sha1::new();
        hasher.update(b"/app/login");
        hasher.update(b"top");
        let hash = hex::encode(hasher.finalize());
        assert_eq!(
            Session::base_filename("https://WWW.Example.com:8443/app/login#top").unwrap(),
            format!("https__www_example_com__8443__{}", &hash[..16])
        );

        let name = Session::base_filename("http://10.0.0.5/").unwrap();
        assert!(name.starts_with("http__10_0_0_5__"));
        assert_eq!(name.len(), "http__10_0_0_5__".len() + 16);
        assert!(Session::base_filename("::nope").is_err());
    }

    #[test]
    fn test_base_filename_keeps_url_as_written() {
        let hash = |input: &[u8]| hex::encode(Sha1::digest(input))[..16].to_string();
        assert_eq!(
            Session::base_filename("http://h:80").unwrap(),
            format!("http__h__80__{}", hash(b""))
        );
        assert_eq!(
            Session::base_filename("http://h").unwrap(),
            format!("http__h__{}", hash(b""))
        );
        assert_eq!(
            Session::base_filename("http://user:pw@h/x?q=1#f").unwrap(),
            format!("http__h__{}", hash(b"/xf"))
        );
        assert_eq!(
            Session::base_filename("http://[::1]:8080/").unwrap(),
            format!("http__[__:1]:8080__{}", hash(b"/"))
        );
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let page = session.add_page("http://example.com/").unwrap();
        page.lock().status = "200 OK".into();
        page.add_tag("nginx", "info", Some("http://example.com/"));
        session.stats.increment_request_successful();
        session.set_clusters(vec![Cluster {
            id: "c1".into(),
            members: vec!["http://example.com/".into()],
        }]);
        session.end();
        session.save_to_file("vanguard_session.json").unwrap();

        let loaded = SessionSnapshot::load(&session.file_path("vanguard_session.json")).unwrap();
        assert_eq!(loaded.version, VERSION);
        assert_eq!(loaded.stats.request_successful, 1);
        assert_eq!(loaded.pages["http://example.com/"].status, "200 OK");
        assert_eq!(loaded.page_similarity_clusters["c1"], vec!["http://example.com/"]);

        let restored = session.restore(loaded);
        let again = restored.get_page("http://example.com/").unwrap();
        assert_eq!(again.id(), page.id());
        assert_eq!(again.snapshot().tags.len(), 1);
        assert_eq!(restored.clusters().len(), 1);
    }

    #[test]
    fn test_restore_gives_duplicate_and_missing_ids_fresh_ones() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let record = |url: &str, uuid: &str| PageRecord {
            url: url.into(),
            uuid: uuid.into(),
            ..Default::default()
        };
        let mut snapshot = SessionSnapshot::default();
        snapshot.pages.insert("http://a/".into(), record("http://a/", "same"));
        snapshot.pages.insert("http://b/".into(), record("http://b/", "same"));
        snapshot.pages.insert("http://c/".into(), record("http://c/", ""));

        let restored = session.restore(snapshot);
        assert_eq!(restored.page_count(), 3);
        assert_eq!(restored.get_page_by_id("same").unwrap().url(), "http://a/");
        let b = restored.get_page("http://b/").unwrap();
        let c = restored.get_page("http://c/").unwrap();
        assert_ne!(b.id(), "same");
        assert!(!c.id().is_empty());
        assert_eq!(b.snapshot().uuid, b.id());
        assert!(Arc::ptr_eq(&restored.get_page_by_id(c.id()).unwrap(), &c));
    }
}
