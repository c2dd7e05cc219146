use search_core::{CoordStore, Error, Job, JobQueue, Keys, SledStore, TokenStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn store() -> Arc<dyn CoordStore> {
    Arc::new(SledStore::temporary(Keys::new("queue-test")).unwrap())
}

fn manifest(n: usize) -> HashMap<String, String> {
    (0..n).map(|i| (format!("{}/{}", i / 10, i % 10), format!("http://example.test/{i}"))).collect()
}

#[tokio::test]
async fn bootstrap_enqueues_each_manifest_job_once() {
    let store = store();
    let queue = JobQueue::new(store.clone());
    let m = manifest(25);
    assert_eq!(queue.bootstrap(&m).await.unwrap(), 25);

    let idle: Vec<Job> = queue.idle().await.unwrap();
    let active: Vec<Job> = queue.active().await.unwrap();
    assert!(active.is_empty());
    let paths: HashSet<String> = idle.iter().map(|j| j.path.clone()).collect();
    assert_eq!(paths.len(), idle.len());
    assert_eq!(paths, m.keys().cloned().collect::<HashSet<_>>());
    // deepest first
    assert_eq!(idle[0].path, "2/4");
    assert_eq!(idle.last().unwrap().path, "0/0");
}

#[tokio::test]
async fn bootstrap_is_a_no_op_once_work_exists() {
    let queue = JobQueue::new(store());
    queue.bootstrap(&manifest(3)).await.unwrap();
    let err = queue.bootstrap(&manifest(3)).await.unwrap_err();
    assert!(matches!(err, Error::BootstrapConflict { idle: 3, active: 0, completed: false }));
    assert_eq!(queue.idle_len().await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pulls_hand_out_each_job_exactly_once() {
    let store = store();
    let queue = JobQueue::new(store.clone());
    queue.bootstrap(&manifest(40)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let q = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(job) = q.pull_next().await.unwrap() {
                got.push(job.path);
            }
            got
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    assert_eq!(all.len(), 40);
    assert_eq!(all.iter().collect::<HashSet<_>>().len(), 40);
    assert!(queue.pull_next().await.unwrap().is_none());
    assert!(queue.is_exhausted().await.unwrap());
    assert_eq!(queue.active_len().await.unwrap(), 40);
}

#[tokio::test]
async fn complete_removes_the_job_from_active() {
    let queue = JobQueue::new(store());
    queue.enqueue_idle(&[Job::new("0/0", "http://a"), Job::new("0/1", "http://b")]).await.unwrap();
    let job = queue.pull_next().await.unwrap().unwrap();
    assert_eq!(job.path, "0/0");
    assert_eq!(queue.active_len().await.unwrap(), 1);
    queue.complete(&job).await.unwrap();
    assert_eq!(queue.active_len().await.unwrap(), 0);
    assert_eq!(queue.idle_len().await.unwrap(), 1);
    assert!(!queue.is_exhausted().await.unwrap());
}

#[tokio::test]
async fn requeue_all_active_is_idempotent() {
    let store = store();
    let queue = JobQueue::new(store.clone());
    let tokens = TokenStore::new(store.clone());
    queue.bootstrap(&manifest(5)).await.unwrap();
    for _ in 0..3 {
        queue.pull_next().await.unwrap().unwrap();
    }
    assert_eq!(tokens.document_count().await.unwrap(), 3);
    assert_eq!(queue.requeue_all_active().await.unwrap(), 3);
    let idle_after_first = queue.idle().await.unwrap();
    assert_eq!(idle_after_first.len(), 5);
    assert_eq!(tokens.document_count().await.unwrap(), 0);

    assert_eq!(queue.requeue_all_active().await.unwrap(), 0);
    assert_eq!(queue.active_len().await.unwrap(), 0);
    assert_eq!(queue.idle().await.unwrap(), idle_after_first);
    assert_eq!(tokens.document_count().await.unwrap(), 0);
}

#[tokio::test]
async fn malformed_entries_are_skipped() {
    let store = store();
    store.push_all(search_core::List::Idle, &["not a job".to_string(), Job::new("0/0", "http://a").encode()]).await.unwrap();
    let queue = JobQueue::new(store.clone());
    let job = queue.pull_next().await.unwrap().unwrap();
    assert_eq!(job.path, "0/0");
    assert_eq!(queue.active().await.unwrap(), vec![job]);
    assert_eq!(queue.active_len().await.unwrap(), 1);
    assert_eq!(queue.idle_len().await.unwrap(), 0);
    assert_eq!(TokenStore::new(store).document_count().await.unwrap(), 1);
}
