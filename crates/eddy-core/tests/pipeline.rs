//! End-to-end pipeline tests: cache → operators → bridge, the way a
//! transport-facing service composes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use eddy_core::{
    AutoRefreshConfig, BridgeConfig, BridgeTerminal, ChangeReason, ChangeSetStreamExt,
    PropertyChange, PropertyChangeSource, SourceCache, TrackChanges, TreeKey,
};

#[derive(Debug, Clone, serde::Serialize)]
struct Person {
    id: String,
    name: String,
    parent_id: Option<String>,
    #[serde(skip)]
    feed: Option<Arc<PropertyChangeSource>>,
}

impl Person {
    fn new(id: &str, name: &str, parent_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            feed: None,
        }
    }

    fn observable(mut self) -> Self {
        self.feed = Some(Arc::new(PropertyChangeSource::new(16)));
        self
    }
}

impl PartialEq for Person {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name && self.parent_id == other.parent_id
    }
}

impl TrackChanges for Person {
    fn property_changes(&self) -> Option<tokio::sync::broadcast::Receiver<PropertyChange>> {
        self.feed.as_ref().map(|feed| feed.subscribe())
    }
}

fn pivot(person: &Person) -> TreeKey<String> {
    match &person.parent_id {
        Some(parent) => TreeKey::Key(parent.clone()),
        None => TreeKey::Root,
    }
}

#[tokio::test]
async fn pipeline_delivers_filtered_batches_to_transport() {
    let cache: SourceCache<String, Person> = SourceCache::new();

    let (mut reader, _handle) = cache
        .connect()
        .unwrap()
        .not_empty()
        .bridge(&BridgeConfig::bounded(8));

    // Empty cache: not_empty swallows the catch-up batch, so the first
    // thing the transport sees is real data.
    cache.add_or_update("p1".into(), Person::new("p1", "alice", None));
    let batch = reader.recv().await.unwrap();
    assert_eq!(batch.adds(), 1);

    cache.add_or_update("p1".into(), Person::new("p1", "alicia", None));
    let batch = reader.recv().await.unwrap();
    assert_eq!(batch.updates(), 1);

    cache.close();
    assert!(reader.recv().await.is_none());
    assert_eq!(reader.terminal(), Some(BridgeTerminal::Completed));
}

#[tokio::test]
async fn batches_serialize_for_the_wire() {
    let cache: SourceCache<String, Person> = SourceCache::new();
    let (mut reader, _handle) = cache
        .connect()
        .unwrap()
        .not_empty()
        .bridge(&BridgeConfig::new());

    cache.add_or_update("p1".into(), Person::new("p1", "alice", None));
    let batch = reader.recv().await.unwrap();

    let json = serde_json::to_value(&batch).unwrap();
    let change = &json[0];
    assert_eq!(change["reason"], "add");
    assert_eq!(change["key"], "p1");
    assert_eq!(change["current"]["name"], "alice");
    assert!(change["previous"].is_null());
}

#[tokio::test]
async fn auto_refresh_feeds_the_transport() {
    let cache: SourceCache<String, Person> = SourceCache::new();
    let person = Person::new("p1", "alice", None).observable();
    cache.add_or_update("p1".into(), person.clone());

    let (mut reader, _handle) = cache
        .connect()
        .unwrap()
        .auto_refresh(AutoRefreshConfig::new().properties(["name"]))
        .bridge(&BridgeConfig::new());

    reader.recv().await.unwrap(); // catch-up

    person.feed.as_ref().unwrap().notify("name");
    let batch = reader.recv().await.unwrap();
    assert_eq!(batch.refreshes(), 1);
    assert_eq!(batch.iter().next().unwrap().key, "p1");
}

#[tokio::test]
async fn tree_projection_follows_reparenting() {
    let cache: SourceCache<String, Person> = SourceCache::new();
    let tree = cache.connect().unwrap().transform_to_tree(pivot);
    let mut roots = tree.roots().connect().unwrap();
    roots.next().await.unwrap(); // empty catch-up

    cache.add_or_update("p1".into(), Person::new("p1", "alice", None));
    roots.next().await.unwrap();
    cache.add_or_update("p2".into(), Person::new("p2", "bob", Some("p1")));

    let p1 = tree.roots().lookup(&"p1".to_string()).unwrap();
    let mut p1_children = p1.children().connect().unwrap();
    let first = p1_children.next().await.unwrap();
    // Depending on timing the child is in the catch-up or the next batch.
    let batch = if first.is_empty() {
        p1_children.next().await.unwrap()
    } else {
        first
    };
    assert_eq!(batch.adds(), 1);

    // Reparent p2 to the top level.
    cache.add_or_update("p2".into(), Person::new("p2", "bob", None));
    let removed = p1_children.next().await.unwrap();
    assert_eq!(removed.removes(), 1);
    let added = roots.next().await.unwrap();
    assert_eq!(added.adds(), 1);
    assert_eq!(tree.roots().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn expiry_flows_through_the_whole_pipeline() {
    const TTL: Duration = Duration::from_secs(30);
    const POLL: Duration = Duration::from_secs(5);

    let cache: SourceCache<String, Person> = SourceCache::new();
    let _guard = cache.expire_after(|_| Some(TTL), POLL);

    let (mut reader, _handle) = cache
        .connect()
        .unwrap()
        .not_empty()
        .bridge(&BridgeConfig::new());

    cache.add_or_update("p1".into(), Person::new("p1", "alice", None));
    assert_eq!(reader.recv().await.unwrap().adds(), 1);

    // The entry ages out; the transport sees a plain Remove batch.
    let batch = reader.recv().await.unwrap();
    assert_eq!(batch.removes(), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn replay_reconstructs_the_cache() {
    let cache: SourceCache<String, Person> = SourceCache::new();
    let mut stream = cache.connect().unwrap();

    cache.add_or_update("p1".into(), Person::new("p1", "alice", None));
    cache.add_or_update("p2".into(), Person::new("p2", "bob", Some("p1")));
    cache.add_or_update("p1".into(), Person::new("p1", "alicia", None));
    cache.remove(&"p2".to_string());
    cache.add_or_update("p3".into(), Person::new("p3", "carol", None));
    cache.close();

    let mut replayed: HashMap<String, Person> = HashMap::new();
    while let Some(batch) = stream.next().await {
        for change in &batch {
            match change.reason {
                ChangeReason::Add | ChangeReason::Update => {
                    replayed.insert(change.key.clone(), change.current.clone().unwrap());
                }
                ChangeReason::Remove => {
                    replayed.remove(&change.key);
                }
                ChangeReason::Refresh | ChangeReason::Move => {}
            }
        }
    }

    let snapshot = cache.snapshot();
    assert_eq!(replayed.len(), snapshot.len());
    for entry in snapshot {
        assert_eq!(replayed.get(entry.key()), Some(entry.value()));
    }
}
