//! Integration tests for loading cache entries from static files.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use xixibase::config::CacheConfig;
use xixibase::{CacheError, CacheManager, FileLoader, ManualClock, MimeTypes};

fn create_cache(item_size_max: usize) -> CacheManager {
    CacheManager::builder()
        .memory_limit(4 * 1024 * 1024)
        .item_size_max(item_size_max)
        .clock(Arc::new(ManualClock::new(10_000)))
        .build()
}

fn create_site() -> tempfile::TempDir {
    let home = tempfile::tempdir().unwrap();
    let webapps = home.path().join("webapps");
    fs::create_dir_all(webapps.join("img")).unwrap();
    fs::write(webapps.join("index.html"), b"<html>hi</html>").unwrap();
    fs::write(webapps.join("img/logo.png"), [0x89, b'P', b'N', b'G']).unwrap();
    fs::write(webapps.join("notes.md"), b"# notes").unwrap();
    fs::write(webapps.join("big.bin"), vec![0u8; 8 * 1024]).unwrap();
    home
}

#[test]
fn test_load_file_with_mime_type() {
    let home = create_site();
    let cache = create_cache(64 * 1024);
    let loader = FileLoader::new(home.path(), MimeTypes::default());

    let item = loader.load(&cache, 0, b"/index.html", 0, 0).unwrap();
    assert_eq!(item.data(), b"<html>hi</html>");
    assert_eq!(item.ext(), b"text/html");
    let cache_id = item.cache_id();
    drop(item);

    let cached = cache.get(0, b"/index.html", 0).unwrap();
    assert_eq!(cached.cache_id(), cache_id);

    let logo = loader.load(&cache, 0, b"/img/logo.png", 0, 0).unwrap();
    assert_eq!(logo.ext(), b"image/png");
    assert_eq!(logo.data().len(), 4);
    cache.check_invariants().unwrap();
}

#[test]
fn test_load_returns_existing_item() {
    let home = create_site();
    let cache = create_cache(64 * 1024);
    let loader = FileLoader::new(home.path(), MimeTypes::default());

    let item = cache
        .new_item(0, b"/index.html", b"cached", b"", 0, 0)
        .unwrap();
    let cache_id = cache.add(item, 0).unwrap();

    let loaded = loader.load(&cache, 0, b"/index.html", 0, 0).unwrap();
    assert_eq!(loaded.cache_id(), cache_id);
    assert_eq!(loaded.data(), b"cached");
    drop(loaded);
    assert_eq!(cache.arena_len(), 1);
}

#[test]
fn test_load_missing_and_escaping_paths() {
    let home = create_site();
    let cache = create_cache(64 * 1024);
    let loader = FileLoader::new(home.path(), MimeTypes::default());

    assert_eq!(
        loader.load(&cache, 0, b"/missing.html", 0, 0).unwrap_err(),
        CacheError::NotFound
    );
    assert_eq!(
        loader.load(&cache, 0, b"/../secret", 0, 0).unwrap_err(),
        CacheError::NotFound
    );
    assert_eq!(cache.item_count(), 0);
}

#[test]
fn test_load_too_large() {
    let home = create_site();
    let cache = create_cache(4 * 1024);
    let loader = FileLoader::new(home.path(), MimeTypes::default());
    let used = cache.memory_used();

    assert_eq!(
        loader.load(&cache, 0, b"/big.bin", 0, 0).unwrap_err(),
        CacheError::TooLarge
    );
    assert_eq!(cache.memory_used(), used);
}

#[test]
fn test_load_with_expiration_and_watch() {
    let home = create_site();
    let cache = create_cache(64 * 1024);
    let loader = FileLoader::new(home.path(), MimeTypes::default());

    assert_eq!(
        loader.load(&cache, 0, b"/index.html", 42, 0).unwrap_err(),
        CacheError::WatchNotFound
    );

    let watch_id = cache.create_watch(0, 60).unwrap();
    let item = loader.load(&cache, 0, b"/index.html", watch_id, 30).unwrap();
    assert_eq!(item.expiration(), 30);
}

#[test]
fn test_loader_from_config() {
    let home = create_site();
    let config = CacheConfig {
        home_dir: home.path().to_path_buf(),
        mime_types: HashMap::from([("md".to_string(), "text/markdown".to_string())]),
        ..CacheConfig::default()
    };
    let cache = create_cache(64 * 1024);
    let loader = FileLoader::from_config(&config);
    assert_eq!(loader.root(), home.path().join("webapps"));

    let notes = loader.load(&cache, 0, b"/notes.md", 0, 0).unwrap();
    assert_eq!(notes.ext(), b"text/markdown");
}
