//! Integration tests for remote filesystem channels.
//!
//! Tests cover: opening channels, sorted listings, cursor movement,
//! mutations with refreshed listings, error isolation, and closing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

use std::sync::Arc;

use helpers::MockTransport;
use sshdeck::remote::{ChannelId, EntryKind, FilesystemManager, FsError};
use sshdeck::transport::{Endpoint, TransportError};

fn endpoint() -> Endpoint {
    Endpoint::new("files.example.com", 22, "deploy").with_password("secret")
}

fn manager(transport: &MockTransport) -> FilesystemManager {
    FilesystemManager::new(Arc::new(transport.clone()))
}

fn sample_tree() -> MockTransport {
    let transport = MockTransport::new();
    transport.add_file("/srv/readme.md", b"hello");
    transport.add_file("/srv/Zeta.txt", b"z");
    transport.add_dir("/srv/www");
    transport.add_dir("/srv/Backups");
    transport.add_file("/srv/alpha.log", b"0123456789");
    transport
}

fn names(listing: &sshdeck::remote::DirectoryListing) -> Vec<&str> {
    listing.entries.iter().map(|e| e.name.as_str()).collect()
}

// ============================================================================
// Open and List Tests
// ============================================================================

#[tokio::test]
async fn test_open_lists_default_path() {
    let transport = sample_tree();
    let manager = manager(&transport);

    let listing = manager.open_channel(&endpoint(), None).await.unwrap();

    assert_eq!(listing.path, "/");
    assert_eq!(names(&listing), ["srv"]);
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn test_listing_sorts_directories_first() {
    let transport = sample_tree();
    let manager = manager(&transport);

    let listing = manager.open_channel(&endpoint(), Some("/srv")).await.unwrap();

    assert_eq!(
        names(&listing),
        ["Backups", "www", "alpha.log", "readme.md", "Zeta.txt"]
    );
    assert_eq!(listing.entries[0].kind, EntryKind::Directory);
    assert_eq!(listing.entries[2].size, 10);
    assert_eq!(listing.entries[2].path, "/srv/alpha.log");
}

#[tokio::test]
async fn test_open_with_configured_default_path() {
    let transport = sample_tree();
    let manager = manager(&transport).with_default_path("/srv/www");

    let listing = manager.open_channel(&endpoint(), None).await.unwrap();
    assert_eq!(listing.path, "/srv/www");
    assert!(listing.entries.is_empty());
}

#[tokio::test]
async fn test_list_moves_cursor_and_resolves_relative_paths() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), None).await.unwrap().channel_id;

    let listing = manager.list_directory(id, "srv").await.unwrap();
    assert_eq!(listing.path, "/srv");
    assert_eq!(manager.current_path(id).await.unwrap(), "/srv");

    let listing = manager.list_directory(id, "www/..").await.unwrap();
    assert_eq!(listing.path, "/srv");

    let listing = manager.list_directory(id, "..").await.unwrap();
    assert_eq!(listing.path, "/");
}

#[tokio::test]
async fn test_go_up_walks_to_root() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), Some("/srv/www")).await.unwrap().channel_id;

    let listing = manager.go_up(id).await.unwrap();
    assert_eq!(listing.path, "/srv");
    assert!(names(&listing).contains(&"www"));

    assert_eq!(manager.go_up(id).await.unwrap().path, "/");
    assert_eq!(manager.go_up(id).await.unwrap().path, "/");
    assert_eq!(manager.current_path(id).await.unwrap(), "/");
}

#[tokio::test]
async fn test_connect_failure_opens_nothing() {
    let transport = MockTransport::new();
    transport.fail_connect(TransportError::ConnectionFailed("refused".to_string()));
    let manager = manager(&transport);

    let result = manager.open_channel(&endpoint(), None).await;

    assert!(matches!(result, Err(FsError::Connection(ref m)) if m.contains("refused")));
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_subsystem_failure_closes_connection() {
    let transport = MockTransport::new();
    transport.fail_filesystem(TransportError::ChannelFailed("sftp disabled".to_string()));
    let manager = manager(&transport);

    assert!(manager.open_channel(&endpoint(), None).await.is_err());
    assert!(manager.is_empty().await);
    assert_eq!(transport.closes(), 1);
}

#[tokio::test]
async fn test_failed_initial_listing_keeps_channel() {
    let transport = sample_tree();
    let manager = manager(&transport);

    let result = manager.open_channel(&endpoint(), Some("/missing")).await;

    let (channel_id, message) = match result {
        Err(FsError::Channel {
            channel_id,
            message,
        }) => (channel_id, message),
        other => panic!("expected channel error, got {:?}", other),
    };
    assert!(message.contains("No such file"));
    assert_eq!(manager.channel_ids().await, vec![channel_id]);

    let listing = manager.list_directory(channel_id, "/srv").await.unwrap();
    assert_eq!(listing.channel_id, channel_id);
}

// ============================================================================
// Mutation Tests
// ============================================================================

#[tokio::test]
async fn test_mkdir_returns_refreshed_listing() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), Some("/srv")).await.unwrap().channel_id;

    let outcome = manager.create_directory(id, "logs").await.unwrap();

    assert_eq!(outcome.path, "/srv/logs");
    assert!(transport.exists("/srv/logs"));
    let listing = outcome.listing.unwrap();
    assert_eq!(listing.path, "/srv");
    assert!(names(&listing).contains(&"logs"));
}

#[tokio::test]
async fn test_rename_and_delete() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), Some("/srv")).await.unwrap().channel_id;

    let outcome = manager.rename(id, "readme.md", "README.md").await.unwrap();
    assert_eq!(outcome.path, "/srv/README.md");
    assert_eq!(transport.file_content("/srv/README.md").unwrap(), b"hello");
    assert!(!transport.exists("/srv/readme.md"));

    let outcome = manager.delete_entry(id, "/srv/README.md").await.unwrap();
    assert!(!names(&outcome.listing.unwrap()).contains(&"README.md"));

    let outcome = manager.delete_entry(id, "www").await.unwrap();
    assert_eq!(outcome.path, "/srv/www");
    assert!(!transport.exists("/srv/www"));
}

#[tokio::test]
async fn test_delete_non_empty_directory_fails() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), None).await.unwrap().channel_id;

    let err = manager.delete_entry(id, "/srv").await.unwrap_err();
    assert!(err.to_string().contains("Directory not empty"));
    assert!(transport.exists("/srv"));
}

#[tokio::test]
async fn test_delete_root_is_refused() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), None).await.unwrap().channel_id;

    let result = manager.delete_entry(id, "/srv/..").await;
    assert!(matches!(result, Err(FsError::Channel { channel_id, .. }) if channel_id == id));
    assert!(transport.exists("/srv"));
}

#[tokio::test]
async fn test_upload_defaults_to_cursor_directory() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), Some("/srv/www")).await.unwrap().channel_id;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("index.html");
    std::fs::write(&local, b"<html></html>").unwrap();

    let outcome = manager.upload_file(id, &local, None).await.unwrap();

    assert_eq!(outcome.path, "/srv/www/index.html");
    assert_eq!(outcome.bytes, Some(13));
    assert_eq!(
        transport.file_content("/srv/www/index.html").unwrap(),
        b"<html></html>"
    );
    assert_eq!(names(&outcome.listing.unwrap()), ["index.html"]);
}

#[tokio::test]
async fn test_upload_missing_local_file() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), None).await.unwrap().channel_id;

    let dir = tempfile::tempdir().unwrap();
    let result = manager
        .upload_file(id, &dir.path().join("absent.bin"), Some("/srv/absent.bin"))
        .await;

    assert!(result.is_err());
    assert!(manager.last_error(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_download_to_download_dir() {
    let transport = sample_tree();
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&transport).with_download_dir(dir.path());
    let id = manager.open_channel(&endpoint(), Some("/srv")).await.unwrap().channel_id;

    let outcome = manager.download_file(id, "alpha.log", None).await.unwrap();

    assert_eq!(outcome.remote_path, "/srv/alpha.log");
    assert_eq!(outcome.local_path, dir.path().join("alpha.log"));
    assert_eq!(outcome.bytes, 10);
    assert_eq!(std::fs::read(dir.path().join("alpha.log")).unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_download_explicit_local_path() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), None).await.unwrap().channel_id;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("copy.md");
    let outcome = manager
        .download_file(id, "/srv/readme.md", Some(local.as_path()))
        .await
        .unwrap();

    assert_eq!(outcome.local_path, local);
    assert_eq!(std::fs::read(&local).unwrap(), b"hello");
}

// ============================================================================
// Error Isolation Tests
// ============================================================================

#[tokio::test]
async fn test_error_keeps_channel_open_and_clears_on_success() {
    let transport = sample_tree();
    transport.deny("/srv/www");
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), Some("/srv")).await.unwrap().channel_id;

    let err = manager.list_directory(id, "www").await.unwrap_err();
    assert_eq!(
        err,
        FsError::Channel {
            channel_id: id,
            message: "File error: /srv/www: Permission denied".to_string(),
        }
    );
    assert_eq!(manager.current_path(id).await.unwrap(), "/srv");
    assert!(manager.last_error(id).await.unwrap().is_some());

    manager.list_directory(id, "Backups").await.unwrap();
    assert_eq!(manager.last_error(id).await.unwrap(), None);
}

#[tokio::test]
async fn test_channels_are_independent() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let a = manager.open_channel(&endpoint(), Some("/srv")).await.unwrap().channel_id;
    let b = manager.open_channel(&endpoint(), None).await.unwrap().channel_id;
    assert_ne!(a, b);

    manager.list_directory(a, "www").await.unwrap();
    assert_eq!(manager.current_path(a).await.unwrap(), "/srv/www");
    assert_eq!(manager.current_path(b).await.unwrap(), "/");

    assert!(manager.list_directory(a, "/nope").await.is_err());
    assert_eq!(manager.last_error(b).await.unwrap(), None);
}

// ============================================================================
// Close Tests
// ============================================================================

#[tokio::test]
async fn test_close_channel_is_idempotent() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = manager.open_channel(&endpoint(), None).await.unwrap().channel_id;

    assert!(manager.close_channel(id).await);
    assert!(!manager.close_channel(id).await);
    assert_eq!(transport.closes(), 1);

    let result = manager.list_directory(id, "/").await;
    assert_eq!(result.unwrap_err(), FsError::NotFound(id));
}

#[tokio::test]
async fn test_operations_on_unknown_channel() {
    let transport = sample_tree();
    let manager = manager(&transport);
    let id = ChannelId(7);

    assert_eq!(
        manager.create_directory(id, "/x").await.unwrap_err(),
        FsError::NotFound(id)
    );
    assert_eq!(manager.current_path(id).await.unwrap_err(), FsError::NotFound(id));
}

#[tokio::test]
async fn test_close_all() {
    let transport = sample_tree();
    let manager = manager(&transport);
    manager.open_channel(&endpoint(), None).await.unwrap();
    manager.open_channel(&endpoint(), None).await.unwrap();

    manager.close_all().await;

    assert!(manager.is_empty().await);
    assert_eq!(transport.closes(), 2);
}
