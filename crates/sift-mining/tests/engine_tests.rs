//! End-to-end tests of the mining engine with scripted fetchers.

use async_trait::async_trait;
use parking_lot::Mutex;
use sift_mining::prelude::*;
use sift_mining::{FetchError, JobStatusReport, Page};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use url::Url;

fn key(url: &str) -> String {
    Url::parse(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string())
}

/// Fetcher that replays canned responses per URL and counts calls.
#[derive(Default)]
struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Vec<Result<FetchResponse, FetchError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    started: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedFetcher {
    fn new() -> Self {
        Self::default()
    }

    fn page(self, url: &str, body: &str) -> Self {
        self.script(url, vec![Ok(FetchResponse::ok(key(url), body))])
    }

    /// Responses are used in order; the last one repeats.
    fn script(self, url: &str, responses: Vec<Result<FetchResponse, FetchError>>) -> Self {
        self.scripts.lock().insert(key(url), responses);
        self
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(&key(url)).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// When each fetch began, in call order.
    fn started_at(&self, url: &str) -> Vec<Instant> {
        let url = key(url);
        self.started
            .lock()
            .iter()
            .filter(|(u, _)| *u == url)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        let url = key(url);
        self.started.lock().push((url.clone(), Instant::now()));
        let n = {
            let mut calls = self.calls.lock();
            let n = calls.entry(url.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let scripts = self.scripts.lock();
        match scripts.get(&url) {
            Some(responses) if !responses.is_empty() => {
                responses[(n - 1).min(responses.len() - 1)].clone()
            }
            _ => Ok(FetchResponse {
                status: 404,
                body: String::new(),
                final_url: url,
            }),
        }
    }
}

fn test_config(workers: usize) -> MiningConfig {
    MiningConfig {
        workers,
        retry_base_ms: 10,
        retry_max_ms: 100,
        idle_poll_ms: 10,
        ..Default::default()
    }
}

fn job_config() -> JobConfig {
    JobConfig {
        rate_limit_ms: 0,
        timeout_ms: 5_000,
        ..Default::default()
    }
}

const PAGE: &str =
    "<html><head><title>Hello</title></head><body><h1>Hi</h1><p>Body text</p></body></html>";

/// One seed, one auto-detected `title` attribute.
fn title_job(subject: &str, seed: &str) -> JobSpec {
    JobSpec::new(subject, vec![seed.to_string()], vec![AttributeSpec::new("title", 1)])
}

async fn start(
    fetcher: Arc<ScriptedFetcher>,
    workers: usize,
) -> (MiningEngine, Arc<InMemoryResultStore>) {
    let store = Arc::new(InMemoryResultStore::new());
    let engine = MiningEngine::start(test_config(workers), fetcher, store.clone())
        .await
        .unwrap();
    (engine, store)
}

async fn finish(engine: &MiningEngine, job_id: sift_core::JobId) -> JobStatusReport {
    tokio::time::timeout(Duration::from_secs(30), engine.wait_for_terminal(job_id))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

#[tokio::test]
async fn test_single_url_two_attributes_in_priority_order() {
    let fetcher = Arc::new(ScriptedFetcher::new().page("http://a.test", PAGE));
    let (engine, store) = start(fetcher.clone(), 1).await;

    let spec = JobSpec::new(
        "scenario",
        vec!["http://a.test".to_string()],
        vec![AttributeSpec::new("title", 10), AttributeSpec::new("body", 1)],
    )
    .with_config(JobConfig {
        max_urls: 1,
        ..job_config()
    });

    let job_id = engine.create_job(spec).await.unwrap();
    assert_eq!(engine.expand_job(job_id).unwrap(), 2);
    engine.start_job(job_id).await.unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.progress.tasks_total, 2);
    assert_eq!(report.progress.succeeded, 2);
    assert_eq!(report.progress.urls_done, 1);

    let order: Vec<_> = store.records().into_iter().map(|r| r.attribute).collect();
    assert_eq!(order, vec!["title", "body"]);

    let saved = engine.load_job_state(job_id).await.unwrap().unwrap();
    assert_eq!(saved.status, JobStatus::Completed);
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_attempted_max_attempts_times() {
    let fetcher = Arc::new(ScriptedFetcher::new().script(
        "http://flaky.test/",
        vec![Err(FetchError::Connection("connection reset".into()))],
    ));
    let (engine, store) = start(fetcher.clone(), 2).await;

    let spec = JobSpec::new(
        "retry",
        vec!["http://flaky.test/".to_string()],
        vec![AttributeSpec::new("title", 1)],
    )
    .with_config(JobConfig {
        max_attempts: 3,
        ..job_config()
    });
    let job_id = engine.submit(spec).await.unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(fetcher.calls("http://flaky.test/"), 3);
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.progress.failed, 1);
    assert_eq!(report.progress.succeeded, 0);
    assert!(store.records().is_empty());
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success() {
    let fetcher = Arc::new(ScriptedFetcher::new().script(
        "http://a.test/",
        vec![
            Ok(FetchResponse {
                status: 503,
                body: String::new(),
                final_url: "http://a.test/".into(),
            }),
            Err(FetchError::Timeout(Duration::from_secs(1))),
            Ok(FetchResponse::ok("http://a.test/", PAGE)),
        ],
    ));
    let (engine, _store) = start(fetcher.clone(), 1).await;

    let job_id = engine
        .submit(
            title_job("retry", "http://a.test/").with_config(job_config()),
        )
        .await
        .unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(fetcher.calls("http://a.test/"), 3);
    assert_eq!(report.progress.succeeded, 1);
    assert_eq!(report.progress.failed, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_validation_and_http_errors_are_not_retried() {
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .page("http://a.test/", PAGE)
            .script(
                "http://gone.test/",
                vec![Ok(FetchResponse {
                    status: 404,
                    body: String::new(),
                    final_url: "http://gone.test/".into(),
                })],
            ),
    );
    let (engine, _store) = start(fetcher.clone(), 2).await;

    let sku = AttributeSpec::new("sku", 1)
        .with_selector(".sku")
        .with_validation(ValidationRules {
            required: true,
            ..Default::default()
        });
    let job_id = engine
        .submit(
            JobSpec::new(
                "invalid",
                vec!["http://a.test/".into(), "http://gone.test/".into()],
                vec![sku],
            )
            .with_config(job_config()),
        )
        .await
        .unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(fetcher.calls("http://a.test/"), 1);
    assert_eq!(fetcher.calls("http://gone.test/"), 1);
    assert_eq!(report.progress.failed, 2);
    assert_eq!(report.status, JobStatus::Completed);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_then_resume_loses_nothing() {
    let urls: Vec<String> = (0..10).map(|i| format!("http://site{i}.test/")).collect();
    let mut fetcher = ScriptedFetcher::new();
    for url in &urls {
        fetcher = fetcher.page(url, PAGE);
    }
    let fetcher = Arc::new(fetcher);
    let (engine, store) = start(fetcher.clone(), 2).await;

    let job_id = engine
        .submit(
            JobSpec::new("pause", urls.clone(), vec![AttributeSpec::new("title", 1)]).with_config(
                JobConfig {
                    max_urls: 10,
                    ..job_config()
                },
            ),
        )
        .await
        .unwrap();
    engine.pause_job(job_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let processed_before = fetcher.total_calls();
    let report = engine.get_status(job_id).unwrap();
    assert_eq!(report.status, JobStatus::Paused);
    assert_eq!(processed_before + report.pending_tasks, 10);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetcher.total_calls(), processed_before);

    engine.resume_job(job_id).await.unwrap();
    let report = finish(&engine, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.progress.succeeded, 10);
    assert_eq!(store.records().len(), 10);
    assert_eq!(fetcher.total_calls(), 10);
    engine.shutdown().await.unwrap();
}

/// Holds every fetch until the test hands out permits.
struct GatedFetcher {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedFetcher {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for GatedFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|_| FetchError::Connection("gate closed".into()))?
            .forget();
        Ok(FetchResponse::ok(url, PAGE))
    }
}

#[tokio::test]
async fn test_stop_purges_pending_work() {
    let urls: Vec<String> = (0..10).map(|i| format!("http://stop{i}.test/")).collect();
    let fetcher = Arc::new(GatedFetcher::new());
    let engine = MiningEngine::start(
        test_config(1),
        fetcher.clone(),
        Arc::new(InMemoryResultStore::new()),
    )
    .await
    .unwrap();

    let job_id = engine
        .create_job(
            JobSpec::new("stop", urls, vec![AttributeSpec::new("title", 1)]).with_config(JobConfig {
                max_urls: 10,
                ..job_config()
            }),
        )
        .await
        .unwrap();
    engine.expand_job(job_id).unwrap();

    // A job that never ran cannot be stopped.
    assert!(matches!(
        engine.stop_job(job_id).await,
        Err(MiningError::InvalidTransition { .. })
    ));
    assert_eq!(engine.get_status(job_id).unwrap().status, JobStatus::Pending);

    engine.start_job(job_id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while fetcher.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first fetch never started");

    // One task is in flight; the other nine are purged.
    assert_eq!(engine.stop_job(job_id).await.unwrap(), 9);
    let report = finish(&engine, job_id).await;
    assert_eq!(report.status, JobStatus::Stopped);
    assert_eq!(report.pending_tasks, 0);

    fetcher.gate.add_permits(10);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(engine.get_status(job_id).unwrap().status, JobStatus::Stopped);

    assert!(engine.resume_job(job_id).await.is_err());
    engine.delete_job(job_id).await.unwrap();
    assert!(engine.get_status(job_id).is_err());
    engine.shutdown().await.unwrap();
}

/// Answers every request, but only after `delay`.
struct SlowFetcher {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for SlowFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(FetchResponse::ok(url, PAGE))
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_hits_timeout_and_is_retried() {
    let fetcher = Arc::new(SlowFetcher {
        delay: Duration::from_secs(60),
        calls: AtomicUsize::new(0),
    });
    let store = Arc::new(InMemoryResultStore::new());
    let engine = MiningEngine::start(test_config(1), fetcher.clone(), store.clone())
        .await
        .unwrap();

    let started = Instant::now();
    let job_id = engine
        .submit(
            title_job("slow", "http://slow.test/")
                .with_config(JobConfig {
                    timeout_ms: 200,
                    max_attempts: 2,
                    ..job_config()
                }),
        )
        .await
        .unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.progress.failed, 1);
    assert_eq!(report.progress.succeeded, 0);
    assert!(store.records().is_empty());
    // Two bounded attempts plus one backoff, nowhere near the fetcher's delay.
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_requests_to_one_host_are_spaced_by_rate_limit() {
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .page("http://shop.test/1", PAGE)
            .page("http://shop.test/2", PAGE)
            .page("http://other.test/", PAGE),
    );
    let (engine, _store) = start(fetcher.clone(), 2).await;

    let job_id = engine
        .submit(
            JobSpec::new(
                "polite",
                vec![
                    "http://shop.test/1".into(),
                    "http://shop.test/2".into(),
                    "http://other.test/".into(),
                ],
                vec![AttributeSpec::new("title", 1)],
            )
            .with_config(JobConfig {
                max_urls: 3,
                rate_limit_ms: 1_000,
                ..job_config()
            }),
        )
        .await
        .unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(report.progress.succeeded, 3);

    let first = fetcher.started_at("http://shop.test/1")[0];
    let second = fetcher.started_at("http://shop.test/2")[0];
    let other = fetcher.started_at("http://other.test/")[0];
    let (early, late) = if first <= second { (first, second) } else { (second, first) };
    assert!(late - early >= Duration::from_millis(1_000), "{:?}", late - early);
    // Another host is not held back by the shop's limit.
    assert!(other < late, "{other:?} vs {late:?}");
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_process_each_task_once() {
    let urls: Vec<String> = (0..50).map(|i| format!("http://host{}.test/p{i}", i % 5)).collect();
    let mut fetcher = ScriptedFetcher::new();
    for url in &urls {
        fetcher = fetcher.page(url, PAGE);
    }
    let fetcher = Arc::new(fetcher);
    let (engine, store) = start(fetcher.clone(), 8).await;

    let job_id = engine
        .submit(
            JobSpec::new(
                "stress",
                urls.clone(),
                vec![
                    AttributeSpec::new("title", 3),
                    AttributeSpec::new("h1", 2),
                    AttributeSpec::new("body", 1),
                ],
            )
            .with_config(JobConfig {
                max_urls: 50,
                ..job_config()
            }),
        )
        .await
        .unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.progress.tasks_done, 150);
    assert_eq!(report.progress.succeeded, 150);
    assert_eq!(report.progress.urls_done, 50);

    let records = store.records();
    let unique: HashSet<_> = records.iter().map(|r| (r.url.clone(), r.attribute.clone())).collect();
    assert_eq!(records.len(), 150);
    assert_eq!(unique.len(), 150);
    for url in &urls {
        assert_eq!(fetcher.calls(url), 3, "{url}");
    }
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fresh_results_are_skipped_until_schema_bump() {
    let fetcher = Arc::new(ScriptedFetcher::new().page("http://a.test/", PAGE));
    let (engine, _store) = start(fetcher.clone(), 2).await;
    let spec = |version: &str| {
        JobSpec::new(
            "fresh",
            vec!["http://a.test/".into()],
            vec![AttributeSpec::new("title", 1).with_schema_version(version)],
        )
        .with_config(job_config())
    };

    let first = engine.submit(spec("1.0.0")).await.unwrap();
    assert_eq!(finish(&engine, first).await.progress.succeeded, 1);
    assert!(engine.cache().is_fresh("http://a.test/", "title"));

    let second = engine.submit(spec("1.0.0")).await.unwrap();
    let report = finish(&engine, second).await;
    assert_eq!(report.progress.skipped_fresh, 1);
    assert_eq!(report.progress.succeeded, 0);
    assert_eq!(report.progress.tasks_done, 1);
    assert_eq!(fetcher.calls("http://a.test/"), 1);

    let third = engine.submit(spec("2.0.0")).await.unwrap();
    let report = finish(&engine, third).await;
    assert_eq!(report.progress.succeeded, 1);
    assert_eq!(fetcher.calls("http://a.test/"), 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_link_discovery_follows_patterns_and_depth() {
    let home = r#"<html><head><title>Home</title></head><body>
        <a href="/a">A</a>
        <a href="/b#top">B</a>
        <a href="/admin">Admin</a>
        <a href="http://elsewhere.test/">Out</a>
    </body></html>"#;
    let leaf = r#"<html><head><title>Leaf</title></head>
        <body><a href="/deeper">Deeper</a></body></html>"#;
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .page("http://site.test/", home)
            .page("http://site.test/a", leaf)
            .page("http://site.test/b", leaf),
    );
    let (engine, store) = start(fetcher.clone(), 2).await;

    let job_id = engine
        .submit(
            title_job("crawl", "http://site.test/")
                .with_config(JobConfig {
                    max_depth: 1,
                    max_urls: 10,
                    url_patterns: UrlPatterns {
                        include: vec!["^http://site\\.test/".into()],
                        exclude: vec!["/admin".into()],
                    },
                    ..job_config()
                }),
        )
        .await
        .unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(report.progress.urls_total, 3);
    assert_eq!(report.progress.succeeded, 3);
    assert_eq!(fetcher.calls("http://site.test/deeper"), 0);
    assert_eq!(fetcher.calls("http://site.test/admin"), 0);

    let urls: HashSet<_> = store.records().into_iter().map(|r| r.url).collect();
    assert!(urls.contains("http://site.test/b"));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fresh_seed_still_leads_to_its_links() {
    let home = r#"<html><head><title>Home</title></head><body>
        <a href="/a">A</a>
        <a href="/b">B</a>
    </body></html>"#;
    let leaf = "<html><head><title>Leaf</title></head><body></body></html>";
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .page("http://site.test/", home)
            .page("http://site.test/a", leaf)
            .page("http://site.test/b", leaf),
    );
    let (engine, _store) = start(fetcher.clone(), 2).await;
    let spec = || {
        title_job("recrawl", "http://site.test/")
            .with_config(JobConfig {
                max_depth: 1,
                max_urls: 10,
                ..job_config()
            })
    };

    let first = engine.submit(spec()).await.unwrap();
    let report = finish(&engine, first).await;
    assert_eq!(report.progress.urls_total, 3);
    assert_eq!(report.progress.succeeded, 3);

    let second = engine.submit(spec()).await.unwrap();
    let report = finish(&engine, second).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.progress.urls_total, 3);
    assert_eq!(report.progress.skipped_fresh, 3);
    assert_eq!(report.progress.succeeded, 0);
    // The seed is fetched again for its links; the fresh leaves are not.
    assert_eq!(fetcher.calls("http://site.test/"), 2);
    assert_eq!(fetcher.calls("http://site.test/a"), 1);
    assert_eq!(fetcher.calls("http://site.test/b"), 1);
    engine.shutdown().await.unwrap();
}

struct Explodes;

impl CustomExtractor for Explodes {
    fn id(&self) -> &str {
        "explodes"
    }

    fn extract(&self, _page: Page<'_>) -> Result<Option<String>, sift_mining::ExtractError> {
        panic!("extractor bug");
    }
}

#[tokio::test]
async fn test_worker_panic_fails_the_job() {
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .page("http://a.test/", PAGE)
            .page("http://b.test/", PAGE),
    );
    let store = Arc::new(InMemoryResultStore::new());
    let engine = MiningEngine::builder(test_config(1))
        .fetcher(fetcher.clone())
        .store(store)
        .extractors(ExtractorRegistry::new().with(Arc::new(Explodes)))
        .start()
        .await
        .unwrap();

    let job_id = engine
        .submit(
            JobSpec::new(
                "crash",
                vec!["http://a.test/".into(), "http://b.test/".into()],
                vec![AttributeSpec::new("score", 1).with_selector("custom:explodes")],
            )
            .with_config(job_config()),
        )
        .await
        .unwrap();

    let report = finish(&engine, job_id).await;
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.failure.unwrap().contains("extractor bug"));
    assert_eq!(report.pending_tasks, 0);

    // The pool survives the panic.
    let healthy = engine
        .submit(
            title_job("after", "http://a.test/").with_config(job_config()),
        )
        .await
        .unwrap();
    assert_eq!(finish(&engine, healthy).await.status, JobStatus::Completed);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_specs_fail_before_enqueueing() {
    let (engine, _store) = start(Arc::new(ScriptedFetcher::new()), 1).await;

    let bad_selector = JobSpec::new(
        "bad",
        vec!["http://a.test/".into()],
        vec![AttributeSpec::new("price", 1).with_selector("span[[")],
    );
    assert!(matches!(
        engine.create_job(bad_selector).await,
        Err(MiningError::InvalidAttribute { .. })
    ));

    let no_seeds = JobSpec::new("bad", vec![], vec![AttributeSpec::new("title", 1)]);
    assert!(matches!(engine.create_job(no_seeds).await, Err(MiningError::InvalidJob(_))));
    assert!(engine.registry().queue().is_empty());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cache_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("cache.json");
    let config = MiningConfig {
        cache_snapshot_path: Some(snapshot.clone()),
        ..test_config(1)
    };
    let fetcher = Arc::new(ScriptedFetcher::new().page("http://a.test/", PAGE));
    let spec = || title_job("persist", "http://a.test/").with_config(job_config());

    let store = Arc::new(InMemoryResultStore::new());
    let engine = MiningEngine::start(config.clone(), fetcher.clone(), store).await.unwrap();
    let job_id = engine.submit(spec()).await.unwrap();
    finish(&engine, job_id).await;
    engine.shutdown().await.unwrap();
    assert!(snapshot.exists());

    let engine = MiningEngine::start(config, fetcher.clone(), Arc::new(InMemoryResultStore::new()))
        .await
        .unwrap();
    let job_id = engine.submit(spec()).await.unwrap();
    let report = finish(&engine, job_id).await;
    assert_eq!(report.progress.skipped_fresh, 1);
    assert_eq!(fetcher.calls("http://a.test/"), 1);
    engine.shutdown().await.unwrap();
}
