//! Full and incremental synchronization against a real vault on disk.

use docgraph_core::{
    codec::{DocCodec, ParsedDocument},
    config::StoreConfig,
    event::{FileEvent, PathChange},
    identity::is_stable_id,
    query::{Direction, HubMetric},
    store::DocumentStore,
    DocGraphError,
};
use std::{fs, sync::Arc, time::Duration};
use tempfile::TempDir;
use test_log::test;

mod common;
use common::{
    create_test_vault, node_titled, open_store, test_config, touch_later, write_doc, WarnCounter,
};
use tracing_subscriber::layer::SubscriberExt;

#[test(tokio::test)]
async fn links_resolve_by_title_and_dangling_targets_stay_literal() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;

    let report = store.sync().await.unwrap();
    assert_eq!(report.parsed, 3);
    assert_eq!(report.upserted, 3);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.ambiguous_links, 0);
    // alpha -> beta and gamma -> {alpha, beta, Nonexistent}; beta links nowhere.
    assert_eq!(report.links_updated, 2);

    let alpha = node_titled(&store, "Alpha").await;
    let beta = node_titled(&store, "Beta").await;
    let gamma = node_titled(&store, "gamma").await;
    assert_eq!(
        gamma.outgoing_links,
        vec![alpha.id.clone(), beta.id.clone(), "Nonexistent".to_string()]
    );
    assert_eq!(gamma.raw_links, vec!["Alpha", "Beta", "Nonexistent"]);
    assert_eq!(alpha.outgoing_links, vec![beta.id.clone()]);
    assert_eq!(alpha.tags, vec!["Project", "a"]);
    assert_eq!(alpha.properties["status"], serde_json::json!("draft"));
    assert_eq!(alpha.source.path, "notes/alpha.md");

    store.shutdown().await;
}

#[test(tokio::test)]
async fn first_sync_mints_and_writes_back_ids() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();

    let gamma = node_titled(&store, "gamma").await;
    assert!(is_stable_id(&gamma.id));
    let text = fs::read_to_string(root.join("gamma.md")).unwrap();
    assert!(text.starts_with("---\nid: "), "header missing: {text}");
    assert!(text.contains(&gamma.id));
    assert!(text.contains("See [[Alpha]]"));

    // The write-back's own modification time is what got cached.
    let second = store.sync().await.unwrap();
    assert!(second.is_noop(), "{second:?}");
    assert_eq!(second.parsed, 0);

    store.shutdown().await;
}

#[test(tokio::test)]
async fn ids_fall_back_to_paths_when_write_back_is_disabled() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("vault");
    write_doc(&root, "Plain.md", "Just text.\n");

    let mut config = test_config(&root);
    config.write_ids = false;
    let mut store = DocumentStore::open(config).await.unwrap();
    store.sync().await.unwrap();

    let ids = store.get_all_node_ids().await.unwrap();
    assert_eq!(ids, vec!["plain.md".to_string()]);
    assert_eq!(
        fs::read_to_string(root.join("Plain.md")).unwrap(),
        "Just text.\n"
    );
    store.shutdown().await;
}

#[test(tokio::test)]
async fn second_sync_without_changes_is_a_noop() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let before = store.db().all_centrality().await.unwrap();

    let report = store.sync().await.unwrap();
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(store.db().all_centrality().await.unwrap(), before);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn centrality_and_graph_queries_follow_resolved_links() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();

    let alpha = node_titled(&store, "Alpha").await;
    let beta = node_titled(&store, "Beta").await;
    let gamma = node_titled(&store, "gamma").await;

    let beta_c = store.get_centrality(&beta.id).await.unwrap().unwrap();
    assert_eq!((beta_c.in_degree, beta_c.out_degree), (2, 0));
    // The dangling target is not a vertex and does not count.
    let gamma_c = store.get_centrality(&gamma.id).await.unwrap().unwrap();
    assert_eq!((gamma_c.in_degree, gamma_c.out_degree), (0, 2));

    let hubs = store.get_hubs(1, HubMetric::InDegree).await.unwrap();
    assert_eq!(hubs.len(), 1);
    assert_eq!(hubs[0].0.id, beta.id);
    assert_eq!(hubs[0].1, 2);

    let mut incoming = store
        .get_neighbors(&beta.id, Direction::Incoming, None)
        .await
        .unwrap()
        .into_iter()
        .map(|node| node.id)
        .collect::<Vec<_>>();
    incoming.sort();
    let mut expected = vec![alpha.id.clone(), gamma.id.clone()];
    expected.sort();
    assert_eq!(incoming, expected);
    assert_eq!(
        store
            .get_neighbors(&beta.id, Direction::Incoming, Some(1))
            .await
            .unwrap()
            .len(),
        1
    );

    assert_eq!(
        store.find_path(&gamma.id, &beta.id).unwrap(),
        Some(vec![gamma.id.clone(), beta.id.clone()])
    );
    assert_eq!(store.find_path(&beta.id, &gamma.id).unwrap(), None);
    assert!(matches!(
        store.find_path(&gamma.id, "missing"),
        Err(DocGraphError::NotFound(_))
    ));
    assert!(matches!(
        store.get_neighbors("missing", Direction::Both, None).await,
        Err(DocGraphError::NotFound(_))
    ));
    store.shutdown().await;
}

#[test(tokio::test)]
async fn same_base_name_is_ambiguous_and_picks_the_first_id() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("vault");
    write_doc(&root, "a/note.md", "First.\n");
    write_doc(&root, "b/note.md", "Second.\n");
    write_doc(&root, "c.md", "Which [[note]]? This [[Note#Intro]], or [[note]]?\n");
    let mut store = open_store(&root).await;

    let warnings = WarnCounter::new("docgraph_core::resolver");
    let report = {
        let _capture =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));
        store.sync().await.unwrap()
    };
    assert_eq!(report.ambiguous_links, 1);
    assert_eq!(warnings.count(), 1);

    let a = store.db().get_node_by_path("a/note.md").await.unwrap().unwrap();
    let b = store.db().get_node_by_path("b/note.md").await.unwrap().unwrap();
    let c = store.db().get_node_by_path("c.md").await.unwrap().unwrap();
    assert_eq!(c.outgoing_links, vec![a.id.clone().min(b.id.clone())]);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn hyphen_and_fragment_variants_resolve() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("vault");
    write_doc(&root, "my-note.md", "Body.\n");
    write_doc(
        &root,
        "index.md",
        "---\ntitle: Index\n---\n[[My Note]] and [[my-note#Details]] and [[folder/my-note]]\n",
    );
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();

    let target = node_titled(&store, "my-note").await;
    let index = node_titled(&store, "Index").await;
    // Both spellings land on the same node and are recorded once.
    assert_eq!(
        index.outgoing_links,
        vec![target.id.clone(), "folder/my-note".to_string()]
    );
    store.shutdown().await;
}

#[test(tokio::test)]
async fn edited_files_are_reparsed_and_keep_their_id() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let alpha = node_titled(&store, "Alpha").await;
    let beta = node_titled(&store, "Beta").await;

    // Rewritten without its id header: the id cached for this path is reused.
    let path = write_doc(&root, "beta.md", "---\ntitle: Beta\n---\nNow points at [[Alpha]].\n");
    touch_later(&path, 5);

    let report = store.sync().await.unwrap();
    assert_eq!(report.parsed, 1);
    assert_eq!(report.upserted, 1);
    let updated = store.get_node(&beta.id).await.unwrap().unwrap();
    assert_eq!(updated.outgoing_links, vec![alpha.id.clone()]);
    assert!(fs::read_to_string(&path).unwrap().contains(&beta.id));
    assert_eq!(store.get_all_node_ids().await.unwrap().len(), 3);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn removed_files_are_deleted_on_full_sync() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let beta = node_titled(&store, "Beta").await;
    let gamma = node_titled(&store, "gamma").await;

    fs::remove_file(root.join("gamma.md")).unwrap();
    let report = store.sync().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(store.get_node(&gamma.id).await.unwrap().is_none());
    assert!(store.get_centrality(&gamma.id).await.unwrap().is_none());
    let beta_c = store.get_centrality(&beta.id).await.unwrap().unwrap();
    assert_eq!(beta_c.in_degree, 1);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn copied_file_with_a_taken_id_gets_a_fresh_one() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let alpha = node_titled(&store, "Alpha").await;

    fs::copy(root.join("notes/alpha.md"), root.join("copy.md")).unwrap();
    store.sync().await.unwrap();

    let copy = store.db().get_node_by_path("copy.md").await.unwrap().unwrap();
    assert_ne!(copy.id, alpha.id);
    assert!(is_stable_id(&copy.id));
    assert_eq!(
        store.get_node(&alpha.id).await.unwrap().unwrap().source.path,
        "notes/alpha.md"
    );
    store.shutdown().await;
}

#[test(tokio::test)]
async fn broken_front_matter_degrades_to_content() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("vault");
    write_doc(&root, "broken.md", "---\ntitle: [unclosed\n---\nBody with [[Else]].\n");
    let mut config = test_config(&root);
    config.write_ids = false;
    let mut store = DocumentStore::open(config).await.unwrap();

    let report = store.sync().await.unwrap();
    assert_eq!(report.skipped, 0);
    let node = store.get_node("broken.md").await.unwrap().unwrap();
    assert_eq!(node.title, "broken");
    assert!(node.content.starts_with("---\ntitle: [unclosed"));
    assert_eq!(node.outgoing_links, vec!["Else".to_string()]);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn rename_within_the_window_keeps_id_and_embedding() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let alpha = node_titled(&store, "Alpha").await;
    let gamma = node_titled(&store, "gamma").await;
    store
        .store_embedding(&alpha.id, "test", vec![1.0, 0.0, 0.0])
        .await
        .unwrap();

    let old = root.join("notes/alpha.md");
    let new = root.join("archive/alpha-moved.md");
    fs::create_dir_all(new.parent().unwrap()).unwrap();
    fs::rename(&old, &new).unwrap();

    let report = store
        .sync_changes(vec![
            PathChange {
                path: old,
                key: "notes/alpha.md".to_string(),
                event: FileEvent::Unlink,
            },
            PathChange {
                path: new,
                key: "archive/alpha-moved.md".to_string(),
                event: FileEvent::Add,
            },
        ])
        .await
        .unwrap();
    assert_eq!(report.renamed, 1);

    let moved = store.get_node(&alpha.id).await.unwrap().unwrap();
    assert_eq!(moved.source.path, "archive/alpha-moved.md");
    assert_eq!(moved.title, "Alpha");
    assert!(store.vectors().get(&alpha.id).is_some());
    assert!(store.db().get_embedding(&alpha.id).await.unwrap().is_some());
    assert_eq!(store.pending_renames().count(), 0);
    let gamma = store.get_node(&gamma.id).await.unwrap().unwrap();
    assert_eq!(gamma.outgoing_links[0], alpha.id);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn rename_found_by_a_later_full_sync() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let alpha = node_titled(&store, "Alpha").await;
    store
        .store_embedding(&alpha.id, "test", vec![0.0, 1.0])
        .await
        .unwrap();

    let old = root.join("notes/alpha.md");
    fs::rename(&old, root.join("alpha.md")).unwrap();
    let unlinked = store
        .sync_changes(vec![PathChange {
            path: old,
            key: "notes/alpha.md".to_string(),
            event: FileEvent::Unlink,
        }])
        .await
        .unwrap();
    assert_eq!(unlinked.deleted, 1);
    assert!(store.get_node(&alpha.id).await.unwrap().is_none());

    assert_eq!(store.pending_renames().count(), 1);

    let report = store.sync().await.unwrap();
    assert_eq!(report.renamed, 1);
    assert_eq!(store.pending_renames().count(), 0);
    let moved = store.get_node(&alpha.id).await.unwrap().unwrap();
    assert_eq!(moved.source.path, "alpha.md");
    assert_eq!(
        store.vectors().get(&alpha.id).map(|r| r.vector.clone()),
        Some(vec![0.0, 1.0])
    );
    store.shutdown().await;
}

#[test(tokio::test)]
async fn expired_rename_window_means_delete_and_create() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut config: StoreConfig = test_config(&root);
    config.rename_ttl_ms = 0;
    let mut store = DocumentStore::open(config).await.unwrap();
    store.sync().await.unwrap();
    let alpha = node_titled(&store, "Alpha").await;
    store
        .store_embedding(&alpha.id, "test", vec![1.0, 0.0])
        .await
        .unwrap();

    let old = root.join("notes/alpha.md");
    let new = root.join("alpha.md");
    fs::rename(&old, &new).unwrap();
    store
        .sync_changes(vec![PathChange {
            path: old,
            key: "notes/alpha.md".to_string(),
            event: FileEvent::Unlink,
        }])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = store
        .sync_changes(vec![PathChange {
            path: new,
            key: "alpha.md".to_string(),
            event: FileEvent::Add,
        }])
        .await
        .unwrap();
    assert_eq!(report.renamed, 0);
    assert_eq!(report.upserted, 1);
    // The declared id survives in the file, the embedding does not.
    let recreated = store.get_node(&alpha.id).await.unwrap().unwrap();
    assert_eq!(recreated.source.path, "alpha.md");
    assert!(store.vectors().get(&alpha.id).is_none());
    store.shutdown().await;
}

#[test(tokio::test)]
async fn stale_add_for_a_vanished_file_changes_nothing() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let before = store.get_all_node_ids().await.unwrap();

    let report = store
        .sync_changes(vec![PathChange {
            path: root.join("ghost.md"),
            key: "ghost.md".to_string(),
            event: FileEvent::Add,
        }])
        .await
        .unwrap();
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(store.get_all_node_ids().await.unwrap(), before);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn changes_outside_the_root_are_skipped() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let outside = write_doc(temp.path(), "elsewhere/x.md", "Outside.\n");
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();

    let report = store
        .sync_changes(vec![PathChange {
            path: outside,
            key: "x.md".to_string(),
            event: FileEvent::Add,
        }])
        .await
        .unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.upserted, 0);
    store.shutdown().await;
}

#[test(tokio::test)]
async fn cache_survives_reopening() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let beta = node_titled(&store, "Beta").await;
    store
        .store_embedding(&beta.id, "test", vec![0.5, 0.5])
        .await
        .unwrap();
    store.shutdown().await;
    store.shutdown().await;

    let mut reopened = open_store(&root).await;
    assert_eq!(reopened.graph().node_count(), 3);
    assert_eq!(reopened.vectors().len(), 1);
    assert_eq!(
        reopened.get_centrality(&beta.id).await.unwrap().unwrap().in_degree,
        2
    );
    assert!(reopened.sync().await.unwrap().is_noop());
    reopened.shutdown().await;
}

#[test(tokio::test)]
async fn ignored_and_unregistered_files_are_not_indexed() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("vault");
    write_doc(&root, "kept.md", "Kept.\n");
    write_doc(&root, ".obsidian/workspace.md", "Editor state.\n");
    write_doc(&root, "notes.txt", "Not markdown.\n");
    write_doc(&root, ".hidden.md", "Hidden.\n");
    let mut store = open_store(&root).await;

    let report = store.sync().await.unwrap();
    assert_eq!(report.parsed, 1);
    assert_eq!(store.get_all_node_ids().await.unwrap().len(), 1);
    store.shutdown().await;
}

/// Reads whole files as content and cannot write anything back.
struct ReadOnlyCodec;

impl DocCodec for ReadOnlyCodec {
    fn parse(&self, bytes: &[u8]) -> ParsedDocument {
        ParsedDocument {
            content: String::from_utf8_lossy(bytes).into_owned(),
            ..Default::default()
        }
    }

    fn serialize(&self, _doc: &ParsedDocument) -> Result<String, DocGraphError> {
        Err(DocGraphError::Codec("read-only format".to_string()))
    }
}

#[test(tokio::test)]
async fn failed_id_write_back_still_indexes_under_the_location() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("vault");
    write_doc(&root, "note.txt", "Plain text without a header.\n");
    write_doc(&root, "index.md", "See [[note]].\n");
    let mut config = test_config(&root);
    config.extensions = vec!["md".to_string(), "txt".to_string()];
    let mut store = DocumentStore::open(config).await.unwrap();
    store
        .register_codec(&["txt"], Arc::new(ReadOnlyCodec))
        .unwrap();

    let report = store.sync().await.unwrap();
    assert_eq!(report.skipped, 0);
    assert_eq!(report.upserted, 2);

    let note = store.get_node("note.txt").await.unwrap().unwrap();
    assert_eq!(note.source.path, "note.txt");
    assert_eq!(
        fs::read_to_string(root.join("note.txt")).unwrap(),
        "Plain text without a header.\n"
    );
    let index = node_titled(&store, "index").await;
    assert!(is_stable_id(&index.id));
    assert_eq!(index.outgoing_links, vec!["note.txt".to_string()]);

    assert!(store.sync().await.unwrap().is_noop());
    store.shutdown().await;
}

#[test(tokio::test)]
async fn renamed_directory_moves_every_node_beneath_it() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    write_doc(&root, "notes/deep/inner.md", "Inner note.\n");
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let alpha = node_titled(&store, "Alpha").await;
    let inner = node_titled(&store, "inner").await;
    store
        .store_embedding(&alpha.id, "test", vec![1.0, 0.0])
        .await
        .unwrap();

    // The OS reports the directory only, never the files inside it.
    fs::rename(root.join("notes"), root.join("Archive")).unwrap();
    let report = store
        .sync_changes(vec![
            PathChange {
                path: root.join("notes"),
                key: "notes".to_string(),
                event: FileEvent::Unlink,
            },
            PathChange {
                path: root.join("Archive"),
                key: "archive".to_string(),
                event: FileEvent::Add,
            },
        ])
        .await
        .unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.renamed, 2);
    assert_eq!(store.pending_renames().count(), 0);

    let moved = store.get_node(&alpha.id).await.unwrap().unwrap();
    assert_eq!(moved.source.path, "Archive/alpha.md");
    let moved_inner = store.get_node(&inner.id).await.unwrap().unwrap();
    assert_eq!(moved_inner.source.path, "Archive/deep/inner.md");
    assert_eq!(
        store.vectors().get(&alpha.id).map(|r| r.vector.clone()),
        Some(vec![1.0, 0.0])
    );
    let gamma = node_titled(&store, "gamma").await;
    assert!(gamma.outgoing_links.contains(&alpha.id));
    store.shutdown().await;
}

#[test(tokio::test)]
async fn directory_moved_out_of_the_root_removes_its_nodes() {
    let temp = TempDir::new().unwrap();
    let root = create_test_vault(&temp);
    let mut store = open_store(&root).await;
    store.sync().await.unwrap();
    let alpha = node_titled(&store, "Alpha").await;
    let beta = node_titled(&store, "Beta").await;

    fs::rename(root.join("notes"), temp.path().join("elsewhere")).unwrap();
    let report = store
        .sync_changes(vec![PathChange {
            path: root.join("notes"),
            key: "notes".to_string(),
            event: FileEvent::Unlink,
        }])
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(store.get_node(&alpha.id).await.unwrap().is_none());
    assert!(store.get_node(&beta.id).await.unwrap().is_some());
    store.shutdown().await;
}
