use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tanjun_core::{stop_pair, LabelSelector, ObjectKey, ObjectSource, SourceError};
use tanjun_informer::{Handler, HandlerError, HandlerFuncs, Health, Informer, InformerConfig, InformerError};
use tanjun_kubehub::{MemorySource, Tanjunchen, TanjunchenSpec};

fn tj(name: &str, age: i32) -> Tanjunchen {
    Tanjunchen::namespaced(
        "test",
        name,
        TanjunchenSpec { name: name.into(), location: "shenzhen".into(), age, occupations: "engineer".into() },
    )
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced("test", name)
}

fn fast_config() -> InformerConfig {
    InformerConfig {
        resync_secs: 0,
        backoff_initial_ms: 10,
        backoff_max_secs: 1,
        backoff_jitter: 0.0,
        ..InformerConfig::namespaced("test")
    }
}

fn label(t: &Tanjunchen) -> String {
    format!("{}@{}", t.spec.name, t.spec.age)
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, ev: String) {
        self.events.lock().unwrap().push(ev);
    }
}

impl Handler<Tanjunchen> for Recorder {
    fn on_add(&self, obj: &Tanjunchen) -> Result<(), HandlerError> {
        self.push(format!("add({})", label(obj)));
        Ok(())
    }

    fn on_update(&self, old: &Tanjunchen, new: &Tanjunchen) -> Result<(), HandlerError> {
        self.push(format!("update({}->{})", label(old), label(new)));
        Ok(())
    }

    fn on_delete(&self, obj: &Tanjunchen) -> Result<(), HandlerError> {
        self.push(format!("delete({})", label(obj)));
        Ok(())
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_watching(informer: &Informer<Tanjunchen>) {
    let mut health = informer.health();
    tokio::time::timeout(Duration::from_secs(3), health.wait_for(|h| *h == Health::Watching))
        .await
        .expect("watch never opened")
        .expect("reflector gone");
}

fn informer_over(source: &Arc<MemorySource<Tanjunchen>>) -> Informer<Tanjunchen> {
    let source: Arc<dyn ObjectSource<Tanjunchen>> = source.clone();
    Informer::new(source, fast_config()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_then_watch_updates_cache_and_handlers() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 1));
    source.apply(tj("b", 1));
    let informer = informer_over(&source);
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let (stop, signal) = stop_pair();
    let run = informer.start(signal.clone()).unwrap();

    assert!(informer.wait_for_sync(&signal).await);
    let lister = informer.lister();
    assert_eq!(lister.list(Some("test")).len(), 2);
    assert_eq!(lister.get("test", "a").map(|t| t.spec.age), Some(1));

    source.apply(tj("a", 2));
    source.delete(&key("b"));
    wait_until("four callbacks", || rec.events().len() == 4).await;

    assert_eq!(rec.events(), vec!["add(a@1)", "add(b@1)", "update(a@1->a@2)", "delete(b@1)"]);
    let all: Vec<_> = lister.list(None).iter().map(|t| label(t)).collect();
    assert_eq!(all, vec!["a@2"]);
    assert!(lister.get("test", "b").is_none());

    stop.stop();
    tokio::time::timeout(Duration::from_secs(3), run.join()).await.expect("informer did not stop").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_cursor_relist_reports_changes_missed_during_outage() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 1));
    source.apply(tj("b", 1));
    let informer = informer_over(&source);
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let (stop, signal) = stop_pair();
    let _run = informer.start(signal.clone()).unwrap();
    assert!(informer.wait_for_sync(&signal).await);
    wait_watching(&informer).await;

    source.apply_silently(tj("a", 2));
    source.delete_silently(&key("b"));
    source.apply_silently(tj("c", 1));
    source.expire_watches();

    wait_until("relist callbacks", || rec.events().len() == 5).await;
    assert_eq!(rec.events()[2..], ["update(a@1->a@2)", "add(c@1)", "delete(b@1)"]);
    let names: Vec<_> = informer.lister().list(Some("test")).iter().map(|t| label(t)).collect();
    assert_eq!(names, vec!["a@2", "c@1"]);
    assert!(informer.has_synced());
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relisting_identical_items_only_resyncs() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 1));
    source.apply(tj("b", 1));
    let informer = informer_over(&source);
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let (stop, signal) = stop_pair();
    let _run = informer.start(signal.clone()).unwrap();
    assert!(informer.wait_for_sync(&signal).await);

    for round in 0..2 {
        wait_watching(&informer).await;
        source.compact();
        source.expire_watches();
        wait_until("resync callbacks", || rec.events().len() == 4 + 2 * round).await;
    }

    let events = rec.events();
    assert_eq!(&events[..2], ["add(a@1)", "add(b@1)"]);
    assert!(events[2..].iter().all(|e| e == "update(a@1->a@1)" || e == "update(b@1->b@1)"), "{:?}", events);
    assert_eq!(source.list_calls(), 3);
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_key_order_survives_concurrent_relists() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 0));
    let informer = informer_over(&source);
    let ages = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&ages);
    informer.add_handler(
        HandlerFuncs::new()
            .on_add({
                let seen = Arc::clone(&seen);
                move |t: &Tanjunchen| {
                    seen.lock().unwrap().push(t.spec.age);
                    Ok(())
                }
            })
            .on_update(move |_: &Tanjunchen, t: &Tanjunchen| {
                seen.lock().unwrap().push(t.spec.age);
                Ok(())
            }),
    );
    let (stop, signal) = stop_pair();
    let _run = informer.start(signal.clone()).unwrap();
    assert!(informer.wait_for_sync(&signal).await);

    for age in 1..=60 {
        source.apply(tj("a", age));
        if age % 15 == 0 {
            source.expire_watches();
        }
        tokio::task::yield_now().await;
    }
    wait_until("last update", || ages.lock().unwrap().last() == Some(&60)).await;

    let ages = ages.lock().unwrap().clone();
    assert!(ages.windows(2).all(|w| w[0] <= w[1]), "out of order: {:?}", ages);
    assert_eq!(informer.lister().get("test", "a").map(|t| t.spec.age), Some(60));
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handlers_do_not_block_others() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 1));
    let informer = informer_over(&source);
    informer.add_handler(HandlerFuncs::new().on_add(|_: &Tanjunchen| panic!("handler bug")));
    informer.add_handler(HandlerFuncs::new().on_add(|t: &Tanjunchen| Err(HandlerError::new(format!("rejecting {}", t.spec.name)))));
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let (stop, signal) = stop_pair();
    let _run = informer.start(signal.clone()).unwrap();
    assert!(informer.wait_for_sync(&signal).await);

    source.apply(tj("b", 1));
    wait_until("both adds", || rec.events().len() == 2).await;
    assert_eq!(rec.events(), vec!["add(a@1)", "add(b@1)"]);
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_handlers_get_the_cache_replayed() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 1));
    source.apply(tj("b", 1));
    let informer = informer_over(&source);
    let (stop, signal) = stop_pair();
    let _run = informer.start(signal.clone()).unwrap();
    assert!(informer.wait_for_sync(&signal).await);

    let late = Recorder::default();
    let id = informer.add_handler(late.clone());
    assert_eq!(late.events(), vec!["add(a@1)", "add(b@1)"]);

    source.apply(tj("c", 1));
    wait_until("live add", || late.events().len() == 3).await;

    assert!(informer.remove_handler(id));
    source.apply(tj("d", 1));
    wait_until("d cached", || informer.lister().get("test", "d").is_some()).await;
    assert_eq!(late.events().len(), 3);
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_can_register_handlers_from_a_callback() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 1));
    let informer = Arc::new(informer_over(&source));
    let (stop, signal) = stop_pair();
    let _run = informer.start(signal.clone()).unwrap();
    assert!(informer.wait_for_sync(&signal).await);

    let nested = Recorder::default();
    let spawned = nested.clone();
    let weak = Arc::downgrade(&informer);
    informer.add_handler(HandlerFuncs::new().on_add(move |t: &Tanjunchen| {
        if t.spec.name == "b" {
            if let Some(informer) = weak.upgrade() {
                informer.add_handler(spawned.clone());
            }
        }
        Ok(())
    }));

    source.apply(tj("b", 1));
    wait_until("nested replay", || nested.events().len() == 2).await;
    source.apply(tj("c", 1));
    wait_until("nested live add", || nested.events().len() == 3).await;
    assert_eq!(nested.events(), vec!["add(a@1)", "add(b@1)", "add(c@1)"]);
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lister_filters_by_labels() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.apply(tj("a", 1).with_label("team", "core"));
    source.apply(tj("b", 1).with_label("team", "web"));
    source.apply(tj("c", 1));
    let informer = informer_over(&source);
    let (stop, signal) = stop_pair();
    let _run = informer.start(signal.clone()).unwrap();
    assert!(informer.wait_for_sync(&signal).await);

    let lister = informer.lister();
    let core: LabelSelector = "team=core".parse().unwrap();
    let labelled: LabelSelector = "team".parse().unwrap();
    let names = |sel: &LabelSelector| lister.list_matching(Some("test"), sel).iter().map(|t| label(t)).collect::<Vec<_>>();
    assert_eq!(names(&core), vec!["a@1"]);
    assert_eq!(names(&labelled), vec!["a@1", "b@1"]);
    assert!(lister.list_matching(Some("elsewhere"), &labelled).is_empty());
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_releases_waiters_before_sync() {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    source.fail_next_list(SourceError::Permission("tanjunchens is forbidden".into()));
    let denied = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&denied);
    let informer = informer_over(&source).with_error_hook(Arc::new(move |err: &SourceError| {
        if matches!(err, SourceError::Permission(_)) {
            flag.store(true, Ordering::SeqCst);
        }
    }));
    let (stop, signal) = stop_pair();
    let run = informer.start(signal.clone()).unwrap();
    assert!(matches!(informer.start(signal.clone()), Err(InformerError::AlreadyStarted)));

    wait_until("permission error", || denied.load(Ordering::SeqCst)).await;
    assert!(!informer.has_synced());

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();
    });
    let synced = tokio::time::timeout(Duration::from_secs(3), informer.wait_for_sync(&signal)).await.unwrap();
    assert!(!synced);
    stopper.await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), run.join()).await.expect("informer did not stop").unwrap();
    assert_eq!(*informer.health().borrow(), Health::Stopped);
}

#[test]
fn invalid_config_is_rejected() {
    let source: Arc<dyn ObjectSource<Tanjunchen>> = Arc::new(MemorySource::<Tanjunchen>::new());
    let cfg = InformerConfig { backoff_jitter: 1.5, ..InformerConfig::default() };
    assert!(matches!(Informer::new(source, cfg), Err(InformerError::Config(_))));
}
