//! Gossip search across a three node line: alice - bob - carol
//!
//! Run with: cargo test --test integration_mesh_search

mod common;

use ananta_core::search::{SearchFilter, SearchResponse};
use ananta_core::Node;
use common::{pair, wait_until, Mesh};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct Line {
    alice: Node,
    bob: Node,
    carol: Node,
    responses: Arc<Mutex<Vec<SearchResponse>>>,
}

async fn line() -> Line {
    let mut mesh = Mesh::new();
    let (alice, _) = mesh.node().await;
    let (bob, _) = mesh.node().await;
    let (carol, _) = mesh.node().await;
    pair(&alice, &bob).await;
    pair(&bob, &carol).await;

    bob.shared_files()
        .share("/media/holiday_video.mp4", 4_000, None)
        .unwrap();
    carol
        .shared_files()
        .share("/srv/share/video_final.mkv", 9_000, Some("abc123".into()))
        .unwrap();
    carol.shared_files().share("/srv/share/notes.txt", 10, None).unwrap();

    let responses = Arc::new(Mutex::new(Vec::new()));
    let sink = responses.clone();
    alice
        .search_manager()
        .add_listener(Arc::new(move |response: &SearchResponse| {
            sink.lock().push(response.clone())
        }));

    Line {
        alice,
        bob,
        carol,
        responses,
    }
}

#[tokio::test]
async fn test_search_reaches_two_hops_and_returns_along_path() {
    let line = line().await;
    let request_id = line.alice.search("VIDEO").unwrap();

    assert!(wait_until(|| line.responses.lock().len() >= 2).await);
    // Echoes of the flood must not produce duplicate answers
    tokio::time::sleep(Duration::from_millis(200)).await;
    let responses = line.responses.lock().clone();
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.request_id == request_id));

    let from_bob = responses
        .iter()
        .find(|r| r.peer_id == line.bob.local_id())
        .expect("bob answered");
    assert_eq!(from_bob.path, vec![line.bob.local_id().to_string()]);
    assert_eq!(from_bob.results[0].name, "holiday_video.mp4");
    assert_eq!(from_bob.trust_rank, Some(0.0));

    let from_carol = responses
        .iter()
        .find(|r| r.peer_id == line.carol.local_id())
        .expect("carol answered through bob");
    assert_eq!(
        from_carol.path,
        vec![
            line.carol.local_id().to_string(),
            line.bob.local_id().to_string()
        ]
    );
    assert_eq!(from_carol.results.len(), 1);
    assert_eq!(from_carol.results[0].name, "video_final.mkv");
    assert_eq!(from_carol.results[0].hash.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_filtered_search_only_matches_types() {
    let line = line().await;
    let filter = SearchFilter {
        types: vec![".MKV".into()],
        ..Default::default()
    };
    line.alice.search_with("video", filter).unwrap();

    assert!(wait_until(|| !line.responses.lock().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let responses = line.responses.lock().clone();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].peer_id, line.carol.local_id());
}

#[tokio::test]
async fn test_search_without_matches_is_silent() {
    let line = line().await;
    line.alice.search("spreadsheet").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(line.responses.lock().is_empty());
}
