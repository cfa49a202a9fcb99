//! Catalog lifecycle integration tests: file round-trips, diff application,
//! read-only behaviour, and kit ownership against a real directory.

use std::sync::Arc;

use magg::config::{compute_diff, Catalog, ConfigStore, ServerConfig};
use magg::kit::KitLoader;
use magg::Error;
use pretty_assertions::assert_eq;

fn stdio_server(command: &str) -> ServerConfig {
    ServerConfig {
        command: Some(command.to_string()),
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn catalog_file_round_trips_exactly() {
    // Round-trip property: parse(serialize(C)) = C.
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("config.json"), "_", false);

    let mut catalog = Catalog::default();
    catalog.servers.insert(
        "calc".into(),
        ServerConfig {
            prefix: Some("calc".into()),
            args: Some(vec!["-y".into(), "calc-mcp".into()]),
            env: Some([("DEBUG".to_string(), "1".to_string())].into()),
            notes: Some("calculator".into()),
            kits: vec!["math".into()],
            ..stdio_server("npx")
        },
    );
    catalog.servers.insert(
        "web".into(),
        ServerConfig {
            uri: Some("https://example.com/mcp".into()),
            enabled: false,
            ..ServerConfig::default()
        },
    );

    store.save(catalog.clone()).await.unwrap();
    let loaded = store.load().await.unwrap();
    assert_eq!(*loaded, catalog);
}

#[tokio::test]
async fn external_edit_is_visible_after_reload_and_diff_classifies_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let store = ConfigStore::new(path.clone(), "_", false);

    let mut catalog = Catalog::default();
    catalog.servers.insert("a".into(), stdio_server("npx a"));
    store.save(catalog).await.unwrap();

    // Another process rewrites the file: a modified, b added.
    let edited = serde_json::json!({
        "servers": {
            "a": {"command": "npx a-v2"},
            "b": {"command": "npx b"},
        }
    });
    tokio::fs::write(&path, edited.to_string()).await.unwrap();

    let old = store.current();
    let new = store.load().await.unwrap();
    let diff = compute_diff(&old, &new);

    assert_eq!(diff.updated, ["a"]);
    assert_eq!(diff.added, ["b"]);
    assert!(diff.removed.is_empty());
}

#[tokio::test]
async fn read_only_mode_allows_in_memory_reload_but_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    // Seed the file with a writable store, then reopen read-only.
    let writable = ConfigStore::new(path.clone(), "_", false);
    let mut catalog = Catalog::default();
    catalog.servers.insert("a".into(), stdio_server("npx a"));
    writable.save(catalog).await.unwrap();

    let store = ConfigStore::new(path.clone(), "_", true);
    store.load().await.unwrap();

    // External edit still lands in memory via reload.
    let edited = serde_json::json!({"servers": {"a": {"command": "npx a"}, "b": {"command": "npx b"}}});
    tokio::fs::write(&path, edited.to_string()).await.unwrap();
    let reloaded = store.load().await.unwrap();
    assert!(reloaded.servers.contains_key("b"));

    // A concurrent mutation is rejected with a read-only error.
    let err = store
        .mutate(|catalog| {
            catalog.servers.insert("c".into(), stdio_server("npx c"));
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));

    // And the file was not touched.
    let on_disk: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
    assert!(on_disk["servers"].get("c").is_none());
}

#[tokio::test]
async fn invalid_reload_keeps_previous_catalog_in_force() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let store = ConfigStore::new(path.clone(), "_", false);

    let mut catalog = Catalog::default();
    catalog.servers.insert("a".into(), stdio_server("npx a"));
    store.save(catalog).await.unwrap();

    // Corrupt edit: server with both transports.
    let bad = serde_json::json!({
        "servers": {"a": {"command": "npx a", "uri": "http://localhost/mcp"}}
    });
    tokio::fs::write(&path, bad.to_string()).await.unwrap();

    assert!(store.load().await.is_err());
    assert!(store.current().servers.contains_key("a"));
    assert_eq!(
        store.current().servers["a"].command.as_deref(),
        Some("npx a")
    );
}

#[tokio::test]
async fn kit_load_unload_round_trip_through_the_store() {
    // Scenario: load K1 and K2 (both define s), unload K1 then K2.
    let dir = tempfile::tempdir().unwrap();
    let kit_dir = dir.path().join("kit.d");
    tokio::fs::create_dir_all(&kit_dir).await.unwrap();

    for kit in ["k1", "k2"] {
        let body = serde_json::json!({
            "name": kit,
            "description": "shared test kit",
            "servers": {"s": {"command": "npx shared"}},
        });
        tokio::fs::write(kit_dir.join(format!("{kit}.json")), body.to_string())
            .await
            .unwrap();
    }

    let store = Arc::new(ConfigStore::new(dir.path().join("config.json"), "_", false));
    store.load().await.unwrap();
    let kits = KitLoader::new(kit_dir);

    kits.load("k1", &store).await.unwrap();
    kits.load("k2", &store).await.unwrap();
    assert_eq!(store.current().servers["s"].kits, ["k1", "k2"]);

    let removed = kits.unload("k1", &store).await.unwrap();
    assert!(removed.is_empty());
    assert_eq!(store.current().servers["s"].kits, ["k2"]);

    let removed = kits.unload("k2", &store).await.unwrap();
    assert_eq!(removed, ["s"]);
    assert!(store.current().servers.is_empty());

    // Ownership survives a disk round trip too.
    let reloaded = store.load().await.unwrap();
    assert!(reloaded.servers.is_empty());
}
