use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gamefeed_adapters::{AdapterError, ContentSource};
use gamefeed_core::{
    CandidateRecord, ContentItem, DetectionResult, Image, JobPhase, RunStatus, SynthesisDraft,
};
use gamefeed_ingest::{
    build_scheduler, DedupCheck, DetectionStage, Detector, IngestPipeline, InMemoryRecordStore, JobController,
    RecordStore, SearchHit, SynthesisStage, Synthesizer, Toolbox, WebLookup,
};
use gamefeed_storage::{FetchError, ImageDownload, ImageResolver, NoImageSearch, PrivateNetworkGuard};
use tokio::sync::Notify;

struct StaticSource {
    items: Vec<ContentItem>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl ContentSource for StaticSource {
    fn source_id(&self) -> &str {
        "static"
    }

    async fn fetch_batch(&self) -> Result<Vec<ContentItem>, AdapterError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.items.clone())
    }
}

struct BrokenSource;

#[async_trait]
impl ContentSource for BrokenSource {
    fn source_id(&self) -> &str {
        "broken"
    }

    async fn fetch_batch(&self) -> Result<Vec<ContentItem>, AdapterError> {
        Err(AdapterError::Message("listing unavailable".into()))
    }
}

/// Candidate is the item's source URL; a body of "explode" fails detection.
struct SourceUrlDetector;

#[async_trait]
impl Detector for SourceUrlDetector {
    async fn detect(&self, item: &ContentItem) -> anyhow::Result<DetectionResult> {
        if item.body == "explode" {
            anyhow::bail!("model unavailable");
        }
        Ok(DetectionResult::new(item.source_url.is_some(), item.source_url.clone()))
    }
}

/// Counts sessions; declines URLs containing "blog", fails URLs containing "flaky".
#[derive(Default)]
struct SpySynthesizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for SpySynthesizer {
    async fn synthesize(&self, url: &str, _tools: &Toolbox) -> anyhow::Result<Option<SynthesisDraft>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if url.contains("flaky") {
            anyhow::bail!("session crashed");
        }
        if url.contains("blog") {
            return Ok(None);
        }
        Ok(Some(SynthesisDraft {
            name: format!("Game at {url}"),
            description: "An educational game".into(),
            tag_ids: vec![],
        }))
    }
}

struct OfflineWeb;

#[async_trait]
impl WebLookup for OfflineWeb {
    async fn fetch_page_text(&self, _url: &str) -> anyhow::Result<String> {
        anyhow::bail!("offline")
    }

    async fn search(&self, _query: &str) -> anyhow::Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

struct NoDownload;

#[async_trait]
impl ImageDownload for NoDownload {
    async fn download(&self, url: &str) -> Result<Image, FetchError> {
        Err(FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

struct Harness {
    controller: Arc<JobController>,
    store: Arc<InMemoryRecordStore>,
    synthesizer: Arc<SpySynthesizer>,
}

fn harness(source: Arc<dyn ContentSource>, store: Arc<InMemoryRecordStore>, concurrency: usize) -> Harness {
    let synthesizer = Arc::new(SpySynthesizer::default());
    let images = Arc::new(ImageResolver::new(
        Arc::new(NoImageSearch),
        Arc::new(PrivateNetworkGuard::default()),
        Arc::new(NoDownload),
    ));
    let toolbox = Toolbox {
        store: store.clone(),
        web: Arc::new(OfflineWeb),
    };
    let pipeline = IngestPipeline::new(
        source,
        DetectionStage::new(Arc::new(SourceUrlDetector), Duration::from_secs(5)),
        DedupCheck::new(store.clone()),
        SynthesisStage::new(
            synthesizer.clone(),
            toolbox,
            store.clone(),
            images,
            Duration::from_secs(5),
        ),
    )
    .with_item_concurrency(concurrency);

    Harness {
        controller: JobController::new(Arc::new(pipeline)),
        store,
        synthesizer,
    }
}

fn post(title: &str, url: Option<&str>) -> ContentItem {
    ContentItem::new(title, url.map(str::to_string), "")
}

fn static_source(items: Vec<ContentItem>) -> Arc<dyn ContentSource> {
    Arc::new(StaticSource { items, gate: None })
}

async fn seeded_store(url: &str) -> Arc<InMemoryRecordStore> {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .create(CandidateRecord {
            name: "Existing".into(),
            description: String::new(),
            url: url.into(),
            tag_ids: vec![],
        })
        .await
        .unwrap();
    store
}

async fn run(controller: &Arc<JobController>) {
    assert!(controller.start());
    controller.wait_idle().await;
}

#[tokio::test]
async fn three_item_batch_end_to_end() {
    let store = seeded_store("https://games.example/known").await;
    let items = vec![
        post("Discussion thread", None),
        post("Known game", Some("https://games.example/known")),
        post("New game", Some("https://games.example/new")),
    ];
    let h = harness(static_source(items), store, 1);

    run(&h.controller).await;

    let stats = h.controller.stats();
    assert_eq!(stats.phase, JobPhase::Idle);
    assert_eq!(stats.items_found, 3);
    assert_eq!(stats.items_processed, 3);
    assert_eq!(stats.candidates_found, 2);
    assert_eq!(stats.records_created, 1);
    assert_eq!(stats.items_failed, 0);

    let report = h.controller.last_run().unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.items_found, 3);
    assert_eq!(report.outcomes.no_candidate, 1);
    assert_eq!(report.outcomes.duplicate, 1);
    assert_eq!(report.outcomes.created, 1);
    assert_eq!(report.outcomes.total(), 3);

    // The duplicate never reached synthesis.
    assert_eq!(h.synthesizer.calls.load(Ordering::SeqCst), 1);
    assert!(h.store.find_by_url("https://games.example/new").await.unwrap().is_some());
}

#[tokio::test]
async fn second_run_over_same_batch_creates_nothing() {
    let items = vec![
        post("A", Some("https://a.example/play")),
        post("B", Some("https://b.example/play")),
    ];
    let h = harness(static_source(items), Arc::new(InMemoryRecordStore::new()), 1);

    run(&h.controller).await;
    assert_eq!(h.controller.stats().records_created, 2);
    let first_run = h.controller.last_run().unwrap().run_id;

    run(&h.controller).await;
    let stats = h.controller.stats();
    assert_eq!(stats.items_found, 2);
    assert_eq!(stats.candidates_found, 2);
    assert_eq!(stats.records_created, 0);
    assert_eq!(h.store.len().await, 2);
    assert_eq!(h.synthesizer.calls.load(Ordering::SeqCst), 2);

    let report = h.controller.last_run().unwrap();
    assert_ne!(report.run_id, first_run);
    assert_eq!(report.outcomes.duplicate, 2);
}

#[tokio::test]
async fn item_failures_are_isolated_and_counted() {
    let items = vec![
        ContentItem::new("Detector blows up", Some("https://x.example".into()), "explode"),
        post("Synthesis crashes", Some("https://flaky.example/game")),
        post("Just a blog", Some("https://blog.example/post")),
        post("Real game", Some("https://ok.example/game")),
    ];
    let h = harness(static_source(items), Arc::new(InMemoryRecordStore::new()), 1);

    run(&h.controller).await;

    let stats = h.controller.stats();
    assert_eq!(stats.items_processed, 4);
    assert_eq!(stats.candidates_found, 3);
    assert_eq!(stats.records_created, 1);
    assert_eq!(stats.items_failed, 2);

    let outcomes = h.controller.last_run().unwrap().outcomes;
    assert_eq!(outcomes.failed, 2);
    assert_eq!(outcomes.declined, 1);
    assert_eq!(outcomes.created, 1);
}

#[tokio::test]
async fn fetch_failure_aborts_run_and_returns_to_idle() {
    let h = harness(Arc::new(BrokenSource), Arc::new(InMemoryRecordStore::new()), 1);

    run(&h.controller).await;

    let stats = h.controller.stats();
    assert_eq!(stats.phase, JobPhase::Idle);
    assert_eq!(stats.items_found, 0);
    assert_eq!(stats.items_processed, 0);
    let report = h.controller.last_run().unwrap();
    assert!(matches!(
        report.status,
        RunStatus::FetchFailed { ref reason } if reason.contains("listing unavailable")
    ));

    // A failed run does not block the next one.
    run(&h.controller).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_exactly_one_run() {
    let gate = Arc::new(Notify::new());
    let source = Arc::new(StaticSource {
        items: vec![post("A", Some("https://a.example/play"))],
        gate: Some(gate.clone()),
    });
    let h = harness(source, Arc::new(InMemoryRecordStore::new()), 1);

    let attempts = (0..16)
        .map(|_| {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.start() })
        })
        .collect::<Vec<_>>();
    let mut admitted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(h.controller.stats().phase, JobPhase::Running);
    assert!(!h.controller.start());

    gate.notify_one();
    h.controller.wait_idle().await;
    assert_eq!(h.controller.stats().records_created, 1);
    assert_eq!(h.controller.stats().phase, JobPhase::Idle);
}

#[tokio::test]
async fn counters_reset_when_a_run_starts() {
    let gate = Arc::new(Notify::new());
    let source = Arc::new(StaticSource {
        items: vec![post("A", Some("https://a.example/play"))],
        gate: Some(gate.clone()),
    });
    let h = harness(source, Arc::new(InMemoryRecordStore::new()), 1);

    gate.notify_one();
    run(&h.controller).await;
    assert_eq!(h.controller.stats().items_found, 1);

    assert!(h.controller.start());
    let stats = h.controller.stats();
    assert_eq!(stats.phase, JobPhase::Running);
    assert_eq!(stats.items_found, 0);
    assert_eq!(stats.records_created, 0);

    gate.notify_one();
    h.controller.wait_idle().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_items_never_create_the_same_url_twice() {
    let items = (0..6)
        .map(|i| post(&format!("Repost {i}"), Some("https://same.example/game")))
        .collect();
    let h = harness(static_source(items), Arc::new(InMemoryRecordStore::new()), 4);

    run(&h.controller).await;

    let stats = h.controller.stats();
    assert_eq!(stats.items_processed, 6);
    assert_eq!(stats.candidates_found, 6);
    assert_eq!(stats.records_created, 1);
    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.synthesizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.last_run().unwrap().outcomes.duplicate, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_stay_consistent_while_items_run_in_parallel() {
    let items = (0..120)
        .map(|i| {
            let title = format!("Post {i}");
            match i % 4 {
                0 => post(&title, None),
                1 => post(&title, Some(format!("https://blog.example/{i}").as_str())),
                _ => post(&title, Some(format!("https://games.example/{i}").as_str())),
            }
        })
        .collect();
    let h = harness(static_source(items), Arc::new(InMemoryRecordStore::new()), 8);

    assert!(h.controller.start());
    let reader = {
        let controller = h.controller.clone();
        tokio::spawn(async move {
            let mut samples = 0u64;
            loop {
                let s = controller.stats();
                samples += 1;
                assert!(s.items_processed <= s.items_found, "{s:?}");
                assert!(s.candidates_found <= s.items_processed, "{s:?}");
                assert!(s.records_created <= s.candidates_found, "{s:?}");
                assert!(s.items_failed <= s.items_processed, "{s:?}");
                if s.phase == JobPhase::Idle {
                    return samples;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    h.controller.wait_idle().await;
    assert!(reader.await.unwrap() > 0);

    let stats = h.controller.stats();
    assert_eq!(stats.items_processed, 120);
    assert_eq!(stats.candidates_found, 90);
    assert_eq!(stats.records_created, 60);
    assert_eq!(h.controller.last_run().unwrap().outcomes.declined, 30);
}

#[tokio::test]
async fn scheduler_validates_cron() {
    let h = harness(static_source(vec![]), Arc::new(InMemoryRecordStore::new()), 1);
    assert!(build_scheduler(h.controller.clone(), "0 0 6 * * *").await.is_ok());
    assert!(build_scheduler(h.controller.clone(), "whenever").await.is_err());
}
