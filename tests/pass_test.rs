use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};

use doodle_listener::bsky::{
    AuthError, Authenticator, LoginOutcome, LoginRequest, SearchApi, SearchPage, SearchQuery,
    UpstreamError,
};
use doodle_listener::cursor::CursorOptions;
use doodle_listener::db::{self, keys, SqliteStore, Store};
use doodle_listener::extract::ExtractOptions;
use doodle_listener::fanout::IngestRules;
use doodle_listener::model::{Author, Embed, ImageView, Post, PostRecord, Session};
use doodle_listener::scheduler::{PollScheduler, Poller, SchedulerState};
use doodle_listener::session::{CodePrompt, Credentials, SessionManager};
use sqlx::sqlite::SqlitePoolOptions;

async fn setup_store() -> Arc<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

fn doodle(n: u32, handle: &str, images: usize) -> Post {
    Post {
        uri: format!("at://did:plc:x/app.bsky.feed.post/{}", n),
        author: Author {
            handle: handle.into(),
            display_name: None,
        },
        record: PostRecord {
            text: format!("sketch {} #DailyDoodle", n),
            created_at: "2024-05-01T10:00:00Z".into(),
        },
        embed: Some(Embed::Images {
            images: (0..images)
                .map(|i| ImageView {
                    fullsize: format!("https://cdn/{}/{}.jpg", n, i),
                    thumb: None,
                    alt: None,
                })
                .collect(),
        }),
        labels: vec![],
    }
}

/// Newest-first, as the search endpoint returns them.
fn newest_first(mut posts: Vec<Post>) -> SearchPage {
    posts.reverse();
    SearchPage {
        posts,
        cursor: None,
        ..Default::default()
    }
}

#[derive(Default)]
struct ScriptedSearch {
    pages: Mutex<VecDeque<Result<SearchPage, UpstreamError>>>,
    calls: AtomicUsize,
    called: Notify,
}

impl ScriptedSearch {
    fn new(pages: Vec<Result<SearchPage, UpstreamError>>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(VecDeque::from(pages)),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SearchApi for ScriptedSearch {
    async fn search_posts(&self, _query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.pages.lock().await.pop_front();
        self.called.notify_one();
        next.unwrap_or_else(|| Ok(SearchPage::default()))
    }
}

/// Delegates to SQLite but fails record appends after `budget` successes.
struct FlakyStore {
    inner: Arc<SqliteStore>,
    budget: AtomicUsize,
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value).await
    }
    async fn del(&self, key: &str) -> Result<()> {
        self.inner.del(key).await
    }
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.inner.range(key, start, stop).await
    }
    async fn list_len(&self, key: &str) -> Result<i64> {
        self.inner.list_len(key).await
    }
    async fn is_member(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.is_member(key, member).await
    }
    async fn add_member(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.add_member(key, member).await
    }
    async fn set_size(&self, key: &str) -> Result<i64> {
        self.inner.set_size(key).await
    }
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>> {
        self.inner.hash_get_all(key).await
    }
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.inner.hash_set(key, field, value).await
    }
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool> {
        self.inner.hash_del(key, field).await
    }
    async fn push_with_member(
        &self,
        list_key: &str,
        value: &str,
        set_key: &str,
        member: &str,
    ) -> Result<()> {
        let ok = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_ok();
        if !ok {
            return Err(anyhow!("disk full"));
        }
        self.inner.push_with_member(list_key, value, set_key, member).await
    }
}

fn rules() -> IngestRules {
    IngestRules::new(
        "#DailyDoodle",
        &["#nsfw".into()],
        &["sexual".into()],
        ExtractOptions::default(),
    )
}

fn cursor_opts() -> CursorOptions {
    CursorOptions {
        hashtag: "#DailyDoodle".into(),
        batch_size: 100,
        max_pages: 20,
    }
}

#[tokio::test]
async fn test_pass_advances_marker_to_newest() {
    let store = setup_store().await;
    db::bind_filter(&*store, "all-doodles", "bob-only", Some("bob.test"))
        .await
        .unwrap();
    let api = ScriptedSearch::new(vec![Ok(newest_first(vec![
        doodle(1, "alice.test", 1),
        doodle(2, "bob.test", 2),
        doodle(3, "alice.test", 0),
    ]))]);
    let poller = Poller::new(api, store.clone(), rules(), cursor_opts(), "all-doodles");

    let report = poller.run_pass().await.unwrap();
    assert_eq!(report.new_posts, 3);
    assert_eq!(report.accepted_posts, 2);
    assert_eq!(report.records, 1 + 2 + 2);
    assert_eq!(report.marker.as_deref(), Some(doodle(3, "x", 0).uri.as_str()));
    assert_eq!(
        store.get(keys::CURSOR_LAST_SEEN).await.unwrap(),
        Some(doodle(3, "x", 0).uri)
    );

    let all = db::read_records(&*store, "all-doodles", 0, -1).await.unwrap();
    let order: Vec<&str> = all.iter().map(|r| r.uri.rsplit('/').next().unwrap()).collect();
    assert_eq!(order, vec!["1#image0", "2#image0", "2#image1"]);
    assert_eq!(store.list_len(&keys::records("bob-only")).await.unwrap(), 2);
}

#[tokio::test]
async fn test_overlapping_second_pass_writes_nothing() {
    let store = setup_store().await;
    let first = newest_first(vec![doodle(1, "alice.test", 2), doodle(2, "alice.test", 1)]);
    let api = ScriptedSearch::new(vec![Ok(first.clone()), Ok(first)]);
    let poller = Poller::new(api, store.clone(), rules(), cursor_opts(), "all-doodles");

    assert_eq!(poller.run_pass().await.unwrap().records, 3);
    // Marker is post 2, the newest, so the redelivered page yields nothing new.
    let second = poller.run_pass().await.unwrap();
    assert_eq!(second.records, 0);
    assert_eq!(second.new_posts, 0);
    assert_eq!(store.list_len(&keys::records("all-doodles")).await.unwrap(), 3);
}

#[tokio::test]
async fn test_failed_pass_leaves_marker_unchanged() {
    let sqlite = setup_store().await;
    sqlite
        .set(keys::CURSOR_LAST_SEEN, &doodle(10, "x", 0).uri)
        .await
        .unwrap();
    let store = Arc::new(FlakyStore {
        inner: sqlite.clone(),
        budget: AtomicUsize::new(2),
    });
    let api = ScriptedSearch::new(vec![Ok(newest_first(vec![
        doodle(10, "alice.test", 1),
        doodle(11, "alice.test", 1),
        doodle(12, "alice.test", 1),
        doodle(13, "alice.test", 1),
    ]))]);
    let poller = Poller::new(api, store, rules(), cursor_opts(), "all-doodles");

    let err = poller.run_pass().await.unwrap_err();
    assert!(format!("{:#}", err).contains("disk full"));
    assert_eq!(
        sqlite.get(keys::CURSOR_LAST_SEEN).await.unwrap(),
        Some(doodle(10, "x", 0).uri)
    );
    assert_eq!(sqlite.list_len(&keys::records("all-doodles")).await.unwrap(), 2);
}

#[tokio::test]
async fn test_malformed_post_does_not_stall_the_marker() {
    let store = setup_store().await;
    let page: SearchPage = serde_json::from_value(serde_json::json!({
        "posts": [
            {
                "uri": "at://did:plc:x/app.bsky.feed.post/22",
                "author": { "handle": "alice.test" },
                "record": { "text": "quote #DailyDoodle", "createdAt": "2024-05-02T10:00:00Z" },
                "embed": { "$type": "app.bsky.embed.recordWithMedia#view", "record": {} }
            },
            { "uri": "at://did:plc:x/app.bsky.feed.post/21", "record": {} },
            {
                "uri": "at://did:plc:x/app.bsky.feed.post/20",
                "author": { "handle": "alice.test" },
                "record": { "text": "sketch #DailyDoodle", "createdAt": "2024-05-01T10:00:00Z" },
                "embed": {
                    "$type": "app.bsky.embed.images#view",
                    "images": [{ "fullsize": "https://cdn/20/0.jpg" }]
                }
            }
        ]
    }))
    .unwrap();
    assert_eq!(page.posts.len(), 2);
    assert_eq!(page.skipped, 1);

    let api = ScriptedSearch::new(vec![Ok(page)]);
    let poller = Poller::new(api, store.clone(), rules(), cursor_opts(), "all-doodles");

    let report = poller.run_pass().await.unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.records, 1);
    assert_eq!(
        store.get(keys::CURSOR_LAST_SEEN).await.unwrap().as_deref(),
        Some("at://did:plc:x/app.bsky.feed.post/22")
    );
    let all = db::read_records(&*store, "all-doodles", 0, -1).await.unwrap();
    assert_eq!(all[0].image_urls, vec!["https://cdn/20/0.jpg".to_string()]);
}

#[tokio::test]
async fn test_search_failure_leaves_marker_unchanged() {
    let store = setup_store().await;
    store.set(keys::CURSOR_LAST_SEEN, "at://did:plc:x/app.bsky.feed.post/5").await.unwrap();
    let api = ScriptedSearch::new(vec![Err(UpstreamError::Parse("bad page".into()))]);
    let poller = Poller::new(api, store.clone(), rules(), cursor_opts(), "all-doodles");

    assert!(poller.run_pass().await.is_err());
    assert_eq!(
        store.get(keys::CURSOR_LAST_SEEN).await.unwrap().as_deref(),
        Some("at://did:plc:x/app.bsky.feed.post/5")
    );
}

struct ScriptedAuth(Mutex<Option<Result<LoginOutcome, AuthError>>>);

#[async_trait]
impl Authenticator for ScriptedAuth {
    async fn resume_session(&self, saved: Session) -> Result<Session, AuthError> {
        Ok(saved)
    }

    async fn create_session(&self, _login: &LoginRequest) -> Result<LoginOutcome, AuthError> {
        self.0
            .lock()
            .await
            .take()
            .unwrap_or(Err(AuthError::RateLimited))
    }
}

struct NoPrompt;

#[async_trait]
impl CodePrompt for NoPrompt {
    async fn one_time_code(&self, _message: &str) -> Result<String, AuthError> {
        Err(AuthError::ChallengeRequired)
    }
}

fn scheduler(
    store: Arc<SqliteStore>,
    api: Arc<ScriptedSearch>,
    login: Result<LoginOutcome, AuthError>,
    interval: Duration,
) -> PollScheduler {
    let session = SessionManager::new(
        Arc::new(ScriptedAuth(Mutex::new(Some(login)))),
        store.clone(),
        Arc::new(NoPrompt),
        Credentials {
            identifier: "doodles.test".into(),
            password: "pw".into(),
        },
    );
    let poller = Poller::new(api, store, rules(), cursor_opts(), "all-doodles");
    PollScheduler::new(session, poller, interval)
}

fn logged_in() -> Result<LoginOutcome, AuthError> {
    Ok(LoginOutcome {
        session: Session {
            access_jwt: "a".into(),
            refresh_jwt: "r".into(),
            handle: "doodles.test".into(),
            did: "did:plc:doodles".into(),
        },
        rate_limit_remaining: None,
    })
}

#[tokio::test]
async fn test_rate_limited_login_shuts_down_without_polling() {
    let store = setup_store().await;
    let api = ScriptedSearch::new(vec![]);
    let mut sched = scheduler(store, api.clone(), Err(AuthError::RateLimited), Duration::from_millis(10));
    let (_tx, rx) = watch::channel(false);

    tokio::time::timeout(Duration::from_secs(5), sched.run(rx))
        .await
        .expect("scheduler should stop on its own")
        .unwrap();
    assert_eq!(sched.state(), SchedulerState::Stopped);
    assert_eq!(api.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_credentials_are_fatal() {
    let store = setup_store().await;
    let api = ScriptedSearch::new(vec![]);
    let mut sched = scheduler(
        store,
        api.clone(),
        Err(AuthError::InvalidCredentials("bad password".into())),
        Duration::from_millis(10),
    );
    let (_tx, rx) = watch::channel(false);

    assert!(sched.run(rx).await.is_err());
    assert_eq!(api.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_sleep() {
    let store = setup_store().await;
    let api = ScriptedSearch::new(vec![Ok(newest_first(vec![doodle(1, "alice.test", 1)]))]);
    let mut sched = scheduler(store.clone(), api.clone(), logged_in(), Duration::from_secs(3600));
    let (tx, rx) = watch::channel(false);

    let waiter = api.clone();
    let stopper = tokio::spawn(async move {
        waiter.called.notified().await;
        tx.send(true).unwrap();
    });

    tokio::time::timeout(Duration::from_secs(5), sched.run(rx))
        .await
        .expect("shutdown should cancel the hour-long sleep")
        .unwrap();
    stopper.await.unwrap();

    assert_eq!(sched.state(), SchedulerState::Stopped);
    assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.list_len(&keys::records("all-doodles")).await.unwrap(), 1);
    assert!(store.get(keys::SESSION_BLOB).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_pass_is_retried_next_wake_up() {
    let store = setup_store().await;
    let api = ScriptedSearch::new(vec![
        Err(UpstreamError::Network("timeout".into())),
        Ok(newest_first(vec![doodle(7, "alice.test", 1)])),
    ]);
    let mut sched = scheduler(store.clone(), api.clone(), logged_in(), Duration::from_millis(20));
    let (tx, rx) = watch::channel(false);

    let waiter = api.clone();
    let stopper = tokio::spawn(async move {
        waiter.called.notified().await;
        waiter.called.notified().await;
        tx.send(true).unwrap();
    });

    tokio::time::timeout(Duration::from_secs(5), sched.run(rx))
        .await
        .expect("scheduler should stop after the second pass")
        .unwrap();
    stopper.await.unwrap();

    assert!(api.calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(store.list_len(&keys::records("all-doodles")).await.unwrap(), 1);
    assert_eq!(
        store.get(keys::CURSOR_LAST_SEEN).await.unwrap(),
        Some(doodle(7, "x", 0).uri)
    );
}
