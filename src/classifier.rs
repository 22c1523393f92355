use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHashSet};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::journal::{FilingCacheEntry, Journal};
use crate::pinyin;

/// Filing cache entries older than this are treated as absent.
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Suffixes where the registrant sits one label deeper.
const SPECIAL_SUFFIXES: [&str; 5] = ["com.cn", "net.cn", "org.cn", "gov.cn", "edu.cn"];

/// Immutable set of domestic suffixes loaded once at startup from a
/// dnsmasq-style list (`server=/suffix/upstream` lines).
pub struct OfflineDomainSet {
    suffixes: FxHashSet<String>,
}

impl OfflineDomainSet {
    #[allow(dead_code)]
    pub fn empty() -> Self {
        Self {
            suffixes: FxHashSet::default(),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut suffixes = FxHashSet::default();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("server=/") {
                let suffix = rest
                    .split('/')
                    .next()
                    .unwrap_or("")
                    .trim_start_matches('.');
                if !suffix.is_empty() {
                    suffixes.insert(suffix.to_lowercase());
                }
            }
        }
        Self { suffixes }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read domain list {}", path.display()))?;
        let set = Self::parse(&text);
        info!(path = %path.display(), count = set.len(), "domestic domain list loaded");
        Ok(set)
    }

    /// Uses the local copy when present, otherwise downloads it once. The
    /// download lands in a temp file first so a failed transfer never leaves
    /// a half-written list behind.
    pub async fn ensure(path: &Path, url: &str) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        info!(url, "domain list missing, downloading");
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let body = client
            .get(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("download domain list from {url}"))?
            .bytes()
            .await
            .context("read domain list body")?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("rename {} into place", tmp.display()))?;

        Self::load(path)
    }

    /// Membership of the name or any parent suffix. `name` is expected
    /// lowercased without a trailing dot.
    pub fn contains(&self, name: &str) -> bool {
        let mut search = name;
        loop {
            if self.suffixes.contains(search) {
                return true;
            }
            match search.find('.') {
                Some(idx) => search = &search[idx + 1..],
                None => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }
}

/// 提取主域名 / the shortest registrant-identifying suffix: a two-label
/// tail, or three labels under the special second-level suffixes.
fn main_domain(name: &str) -> Option<String> {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return None;
    }

    let tail2 = format!("{}.{}", labels[labels.len() - 2], labels[labels.len() - 1]);
    if SPECIAL_SUFFIXES.contains(&tail2.as_str()) {
        if labels.len() >= 3 {
            Some(labels[labels.len() - 3..].join("."))
        } else {
            None
        }
    } else {
        Some(tail2)
    }
}

#[derive(Debug, Error)]
enum FilingError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status {0}")]
    Status(u16),
    #[error("parse body: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct FilingLookupBody {
    #[serde(rename = "StateCode", default)]
    state_code: Option<i64>,
    #[serde(rename = "Reason", default)]
    reason: Option<String>,
    #[serde(rename = "Result", default)]
    result: Option<serde_json::Value>,
}

/// A domain is filed iff the lookup answered `StateCode == 1` with a
/// non-null `Result`. Transport, status and parse failures bubble up so the
/// caller can skip caching them.
async fn fetch_filing(
    http: &reqwest::Client,
    url: &str,
    domain: &str,
) -> Result<(bool, String), FilingError> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(FilingError::Status(status.as_u16()));
    }

    let raw = response.text().await?;
    let body: FilingLookupBody = serde_json::from_str(&raw)?;
    let filed = body.state_code == Some(1) && body.result.as_ref().is_some_and(|v| !v.is_null());
    debug!(
        domain,
        filed,
        reason = body.reason.as_deref().unwrap_or_default(),
        "filing lookup answered"
    );
    Ok((filed, raw))
}

type Waiters = Vec<oneshot::Sender<bool>>;

/// Routes a name to the domestic or the overseas side. Deterministic for a
/// given cache state and never fails; anything unexpected resolves to
/// overseas.
pub struct DomainClassifier {
    offline: OfflineDomainSet,
    journal: Arc<dyn Journal>,
    api_key: Option<String>,
    api_url: String,
    http: reqwest::Client,
    // 同域名并发查询合并为一次外呼 / concurrent lookups for one main domain
    // collapse onto a single outbound fetch
    inflight: Arc<DashMap<String, Waiters, FxBuildHasher>>,
}

impl DomainClassifier {
    pub fn new(
        offline: OfflineDomainSet,
        journal: Arc<dyn Journal>,
        api_key: Option<String>,
        api_url: String,
    ) -> Self {
        Self {
            offline,
            journal,
            api_key,
            api_url,
            http: reqwest::Client::builder()
                .use_rustls_tls()
                .timeout(LOOKUP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            inflight: Arc::new(DashMap::with_hasher(FxBuildHasher::default())),
        }
    }

    /// Decision order: offline list, then the domestic TLDs, then the filing
    /// cache and lookup for the main domain. Case and trailing-dot
    /// insensitive.
    pub async fn is_domestic(&self, request_id: Uuid, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_lowercase();
        if name.split('.').count() < 2 {
            return false;
        }

        if self.offline.contains(&name) {
            debug!(request_id = %request_id, domain = %name, "domestic via offline list");
            return true;
        }

        if name.ends_with(".cn") || name.ends_with(".中国") {
            debug!(request_id = %request_id, domain = %name, "domestic via tld");
            return true;
        }

        let Some(main) = main_domain(&name) else {
            return false;
        };

        if self.api_key.is_some() {
            self.filing_status(request_id, &main).await
        } else {
            // 没有 API key 时退回拼音启发式 / without a key, fall back to the
            // syllable heuristic on the bare registrant label
            let label = main.split('.').next().unwrap_or("");
            pinyin::is_pinyin_word(label)
        }
    }

    async fn filing_status(&self, request_id: Uuid, main: &str) -> bool {
        match self.journal.get_cache(main).await {
            Ok(Some(entry)) if !is_stale(&entry) => {
                debug!(request_id = %request_id, domain = main, cached = entry.is_domestic, "filing cache hit");
                return entry.is_domestic;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(request_id = %request_id, domain = main, error = %err, "filing cache read failed");
            }
        }

        let (rx, leader) = {
            use dashmap::mapref::entry::Entry;
            let (tx, rx) = oneshot::channel();
            match self.inflight.entry(main.to_string()) {
                Entry::Occupied(mut occupied) => {
                    occupied.get_mut().push(tx);
                    (rx, false)
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(vec![tx]);
                    (rx, true)
                }
            }
        };

        if leader {
            self.spawn_lookup(request_id, main.to_string());
        }

        // the fetch task owns the sender side; a dropped task reads as not
        // filed rather than an error
        rx.await.unwrap_or(false)
    }

    /// Runs the lookup in a detached task: a waiter hitting its own deadline
    /// must not abort the shared fetch, and the cache is populated either
    /// way.
    fn spawn_lookup(&self, request_id: Uuid, main: String) {
        let Some(key) = self.api_key.as_deref() else {
            return;
        };
        let url = format!("{}?key={}&domainName={}", self.api_url, key, main);
        let http = self.http.clone();
        let journal = Arc::clone(&self.journal);
        let inflight = Arc::clone(&self.inflight);

        tokio::spawn(async move {
            // a fetch that raced ahead of this registration may have already
            // filled the cache, re-check before going to the network
            if let Ok(Some(entry)) = journal.get_cache(&main).await {
                if !is_stale(&entry) {
                    let waiters = inflight.remove(&main).map(|(_, v)| v).unwrap_or_default();
                    for tx in waiters {
                        let _ = tx.send(entry.is_domestic);
                    }
                    return;
                }
            }

            let outcome = match fetch_filing(&http, &url, &main).await {
                Ok((filed, raw)) => {
                    if let Err(err) = journal.put_cache(&main, filed, &raw).await {
                        warn!(request_id = %request_id, domain = %main, error = %err, "filing cache write failed");
                    }
                    filed
                }
                Err(err) => {
                    // failures are not cached, the next query retries
                    warn!(request_id = %request_id, domain = %main, error = %err, "filing lookup failed");
                    false
                }
            };

            // entry comes out only after the outcome is decided, so late
            // arrivals either joined this fetch or will see the cache
            let waiters = inflight.remove(&main).map(|(_, v)| v).unwrap_or_default();
            for tx in waiters {
                let _ = tx.send(outcome);
            }
        });
    }
}

fn is_stale(entry: &FilingCacheEntry) -> bool {
    let age = Utc::now().signed_duration_since(entry.updated_at);
    age.to_std().map_or(false, |age| age > CACHE_MAX_AGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalError, QueryRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct MockJournal {
        cache: Mutex<HashMap<String, FilingCacheEntry>>,
    }

    impl MockJournal {
        fn backdate(&self, domain: &str, hours: i64) {
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get_mut(domain) {
                entry.updated_at = Utc::now() - chrono::Duration::hours(hours);
            }
        }
    }

    #[async_trait]
    impl Journal for MockJournal {
        async fn append(&self, _record: &QueryRecord) -> Result<(), JournalError> {
            Ok(())
        }

        async fn get_cache(&self, domain: &str) -> Result<Option<FilingCacheEntry>, JournalError> {
            Ok(self.cache.lock().unwrap().get(domain).cloned())
        }

        async fn put_cache(
            &self,
            domain: &str,
            is_domestic: bool,
            api_response: &str,
        ) -> Result<(), JournalError> {
            self.cache.lock().unwrap().insert(
                domain.to_string(),
                FilingCacheEntry {
                    is_domestic,
                    api_response: api_response.to_string(),
                    updated_at: Utc::now(),
                },
            );
            Ok(())
        }

        async fn delete_cache_older_than(&self, max_age: Duration) -> Result<u64, JournalError> {
            let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap();
            let mut cache = self.cache.lock().unwrap();
            let before = cache.len();
            cache.retain(|_, entry| entry.updated_at >= cutoff);
            Ok((before - cache.len()) as u64)
        }
    }

    /// Counting filing-API stub. Each accepted connection is one lookup.
    async fn spawn_filing_stub(
        body: &'static str,
        delay: Duration,
        hits: Arc<AtomicUsize>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 2048];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                head.extend_from_slice(&buf[..n]);
                                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    tokio::time::sleep(delay).await;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn rid() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn offline_set_parses_dnsmasq_lines() {
        let set = OfflineDomainSet::parse(
            "# comment\nserver=/qq.com/114.114.114.114\nserver=/.weixin.com/114.114.114.114\nnameserver 1.1.1.1\n",
        );
        assert_eq!(set.len(), 2);
        assert!(set.contains("qq.com"));
        assert!(set.contains("www.qq.com"));
        assert!(set.contains("weixin.com"));
        assert!(!set.contains("myqq.com"));
        assert!(!set.contains("example.org"));
    }

    #[test]
    fn main_domain_extraction() {
        assert_eq!(main_domain("www.taobao.com").as_deref(), Some("taobao.com"));
        assert_eq!(main_domain("taobao.com").as_deref(), Some("taobao.com"));
        assert_eq!(
            main_domain("www.sina.com.cn").as_deref(),
            Some("sina.com.cn")
        );
        assert_eq!(main_domain("www.gov.cn").as_deref(), Some("www.gov.cn"));
        assert_eq!(main_domain("com.cn"), None);
        assert_eq!(main_domain("localhost"), None);
    }

    fn classifier_without_key(journal: Arc<MockJournal>, offline: OfflineDomainSet) -> DomainClassifier {
        DomainClassifier::new(offline, journal, None, String::new())
    }

    #[tokio::test]
    async fn single_label_and_empty_names_are_overseas() {
        let classifier = classifier_without_key(Arc::default(), OfflineDomainSet::empty());
        assert!(!classifier.is_domestic(rid(), "x.").await);
        assert!(!classifier.is_domestic(rid(), ".").await);
        assert!(!classifier.is_domestic(rid(), "localhost").await);
    }

    #[tokio::test]
    async fn domestic_tlds_short_circuit() {
        let classifier = classifier_without_key(Arc::default(), OfflineDomainSet::empty());
        assert!(classifier.is_domestic(rid(), "www.gov.cn.").await);
        assert!(classifier.is_domestic(rid(), "example.中国.").await);
    }

    #[tokio::test]
    async fn classification_is_case_and_dot_invariant() {
        let journal = Arc::new(MockJournal::default());
        let offline = OfflineDomainSet::parse("server=/qq.com/1.1.1.1\n");
        let classifier = classifier_without_key(journal, offline);

        let plain = classifier.is_domestic(rid(), "www.qq.com").await;
        let shouty = classifier.is_domestic(rid(), "WWW.QQ.COM.").await;
        assert!(plain);
        assert_eq!(plain, shouty);
    }

    #[tokio::test]
    async fn pinyin_fallback_applies_without_api_key() {
        let classifier = classifier_without_key(Arc::default(), OfflineDomainSet::empty());
        assert!(classifier.is_domestic(rid(), "www.taobao.com.").await);
        assert!(!classifier.is_domestic(rid(), "www.google.com.").await);
    }

    #[tokio::test]
    async fn filing_lookup_populates_cache_and_routes_domestic() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_filing_stub(
            r#"{"StateCode":1,"Reason":"ok","Result":{}}"#,
            Duration::ZERO,
            hits.clone(),
        )
        .await;

        let journal = Arc::new(MockJournal::default());
        let classifier = DomainClassifier::new(
            OfflineDomainSet::empty(),
            journal.clone(),
            Some("test-key".to_string()),
            url,
        );

        assert!(classifier.is_domestic(rid(), "www.taobao.com.").await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let entry = journal
            .get_cache("taobao.com")
            .await
            .unwrap()
            .expect("cached");
        assert!(entry.is_domestic);

        // second query is served from the cache
        assert!(classifier.is_domestic(rid(), "img.taobao.com.").await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_filing_stub(
            r#"{"StateCode":1,"Reason":"ok","Result":{}}"#,
            Duration::from_millis(150),
            hits.clone(),
        )
        .await;

        let journal = Arc::new(MockJournal::default());
        let classifier = Arc::new(DomainClassifier::new(
            OfflineDomainSet::empty(),
            journal,
            Some("test-key".to_string()),
            url,
        ));

        let tasks = (0..8)
            .map(|_| {
                let classifier = Arc::clone(&classifier);
                async move { classifier.is_domestic(rid(), "www.taobao.com.").await }
            })
            .collect::<Vec<_>>();

        let results = futures::future::join_all(tasks).await;
        assert!(results.into_iter().all(|domestic| domestic));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unfiled_and_null_results_are_overseas_but_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_filing_stub(
            r#"{"StateCode":1,"Reason":"","Result":null}"#,
            Duration::ZERO,
            hits.clone(),
        )
        .await;

        let journal = Arc::new(MockJournal::default());
        let classifier = DomainClassifier::new(
            OfflineDomainSet::empty(),
            journal.clone(),
            Some("test-key".to_string()),
            url,
        );

        assert!(!classifier.is_domestic(rid(), "www.example.org.").await);
        let entry = journal
            .get_cache("example.org")
            .await
            .unwrap()
            .expect("negative outcome is cached");
        assert!(!entry.is_domestic);
    }

    #[tokio::test]
    async fn lookup_failures_are_overseas_and_not_cached() {
        // nothing listens on this port, the request errors out
        let journal = Arc::new(MockJournal::default());
        let classifier = DomainClassifier::new(
            OfflineDomainSet::empty(),
            journal.clone(),
            Some("test-key".to_string()),
            "http://127.0.0.1:9".to_string(),
        );

        assert!(!classifier.is_domestic(rid(), "www.example.org.").await);
        assert!(journal.get_cache("example.org").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_cache_entries_trigger_a_refetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_filing_stub(
            r#"{"StateCode":1,"Reason":"ok","Result":{}}"#,
            Duration::ZERO,
            hits.clone(),
        )
        .await;

        let journal = Arc::new(MockJournal::default());
        journal.put_cache("taobao.com", false, "{}").await.unwrap();
        journal.backdate("taobao.com", 25);

        let classifier = DomainClassifier::new(
            OfflineDomainSet::empty(),
            journal.clone(),
            Some("test-key".to_string()),
            url,
        );

        // the stale negative entry is ignored and the fresh lookup wins
        assert!(classifier.is_domestic(rid(), "www.taobao.com.").await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
