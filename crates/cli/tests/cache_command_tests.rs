//! End-to-end tests for `pictor cache` commands through the library entry point

#![allow(clippy::unwrap_used, clippy::expect_used)]

use pictor_cli::CliError;
use pictor_cli::commands::{Command, Context, execute};
use pictor_journal::{DiskLruCache, Header};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn context(dir: &Path, json: bool) -> Context {
    Context {
        config: None,
        dir: Some(dir.to_path_buf()),
        json,
    }
}

fn run(command: Command, context: &Context) -> Result<Vec<u8>, CliError> {
    let mut out = Vec::new();
    execute(command, context, &mut out)?;
    Ok(out)
}

fn run_json(command: Command, context: &Context) -> Value {
    let out = run(command, context).unwrap();
    let value: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value["status"], "ok");
    value["data"].clone()
}

fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn put(ctx: &Context, key: &str, files: Vec<PathBuf>) {
    run(
        Command::CachePut {
            key: key.to_string(),
            files,
        },
        ctx,
    )
    .unwrap();
}

// =============================================================================
// put / get
// =============================================================================

#[test]
fn test_put_then_get_streams_raw_bytes() {
    let work = TempDir::new().unwrap();
    let cache_dir = work.path().join("cache");
    let ctx = context(&cache_dir, false);
    let input = write_file(&work, "thumb.bin", b"decoded pixels");

    put(&ctx, "thumb-1", vec![input]);

    let out = run(
        Command::CacheGet {
            key: "thumb-1".to_string(),
            index: 0,
            out: None,
        },
        &ctx,
    )
    .unwrap();
    assert_eq!(out, b"decoded pixels");

    let header = Header::read(&cache_dir).unwrap().unwrap();
    assert_eq!(header.value_count, 1);
}

#[test]
fn test_get_to_file_reports_length() {
    let work = TempDir::new().unwrap();
    let ctx = context(&work.path().join("cache"), true);
    let input = write_file(&work, "in.bin", &[7; 32]);
    put(&ctx, "k", vec![input]);

    let dest = work.path().join("out.bin");
    let data = run_json(
        Command::CacheGet {
            key: "k".to_string(),
            index: 0,
            out: Some(dest.clone()),
        },
        &ctx,
    );
    assert_eq!(data["length"], 32);
    assert_eq!(data["written_to"], dest.display().to_string());
    assert_eq!(std::fs::read(&dest).unwrap(), vec![7; 32]);
}

#[test]
fn test_get_missing_entry_is_not_found() {
    let work = TempDir::new().unwrap();
    let ctx = context(&work.path().join("cache"), false);
    let err = run(
        Command::CacheGet {
            key: "absent".to_string(),
            index: 0,
            out: None,
        },
        &ctx,
    )
    .unwrap_err();
    assert!(matches!(err, CliError::NotFound { ref key } if key == "absent"));
    assert_eq!(pictor_cli::exit_code_for(&err), pictor_cli::EXIT_FAILURE);
}

#[test]
fn test_put_rejects_wrong_value_count() {
    let work = TempDir::new().unwrap();
    let ctx = context(&work.path().join("cache"), false);
    let a = write_file(&work, "a.bin", b"a");
    let b = write_file(&work, "b.bin", b"b");

    let err = run(
        Command::CachePut {
            key: "k".to_string(),
            files: vec![a, b],
        },
        &ctx,
    )
    .unwrap_err();
    assert!(matches!(err, CliError::Config { help: Some(_), .. }));
    assert_eq!(pictor_cli::exit_code_for(&err), pictor_cli::EXIT_CLI);
}

#[test]
fn test_put_respects_existing_value_count() {
    let work = TempDir::new().unwrap();
    let cache_dir = work.path().join("cache");
    DiskLruCache::open(&cache_dir, 3, 2, 1024)
        .unwrap()
        .close()
        .unwrap();
    let ctx = context(&cache_dir, true);
    let a = write_file(&work, "a.bin", b"source");
    let b = write_file(&work, "b.bin", b"meta");

    let data = run_json(
        Command::CachePut {
            key: "pair".to_string(),
            files: vec![a, b],
        },
        &ctx,
    );
    assert_eq!(data["lengths"], serde_json::json!([6, 4]));

    let cache = DiskLruCache::open(&cache_dir, 3, 2, 1024).unwrap();
    let snapshot = cache.get("pair").unwrap().unwrap();
    assert_eq!(snapshot.read(1).unwrap(), b"meta");
}

#[test]
fn test_put_missing_file_is_io_error() {
    let work = TempDir::new().unwrap();
    let ctx = context(&work.path().join("cache"), false);
    let err = run(
        Command::CachePut {
            key: "k".to_string(),
            files: vec![work.path().join("nope.bin")],
        },
        &ctx,
    )
    .unwrap_err();
    assert!(matches!(err, CliError::File { .. }));
    assert_eq!(err.category(), "io");
}

#[test]
fn test_invalid_key_exits_with_cli_code() {
    let work = TempDir::new().unwrap();
    let ctx = context(&work.path().join("cache"), false);
    let input = write_file(&work, "in.bin", b"x");
    let err = run(
        Command::CachePut {
            key: "has space".to_string(),
            files: vec![input],
        },
        &ctx,
    )
    .unwrap_err();
    assert!(matches!(err, CliError::Journal(_)));
    assert_eq!(pictor_cli::exit_code_for(&err), pictor_cli::EXIT_CLI);
}

// =============================================================================
// info / remove / trim / clear
// =============================================================================

#[test]
fn test_info_reports_usage() {
    let work = TempDir::new().unwrap();
    let cache_dir = work.path().join("cache");
    let ctx = context(&cache_dir, true);

    let data = run_json(Command::CacheInfo, &ctx);
    assert_eq!(data["exists"], false);

    put(&ctx, "a", vec![write_file(&work, "a.bin", &[1; 10])]);
    put(&ctx, "b", vec![write_file(&work, "b.bin", &[2; 20])]);

    let data = run_json(Command::CacheInfo, &ctx);
    assert_eq!(data["exists"], true);
    assert_eq!(data["entries"], 2);
    assert_eq!(data["size_bytes"], 30);
    assert_eq!(data["value_count"], 1);
}

#[test]
fn test_remove_reports_whether_entry_existed() {
    let work = TempDir::new().unwrap();
    let ctx = context(&work.path().join("cache"), true);
    put(&ctx, "a", vec![write_file(&work, "a.bin", b"x")]);

    let remove = || Command::CacheRemove {
        key: "a".to_string(),
    };
    assert_eq!(run_json(remove(), &ctx)["removed"], true);
    assert_eq!(run_json(remove(), &ctx)["removed"], false);
}

#[test]
fn test_trim_evicts_least_recently_used() {
    let work = TempDir::new().unwrap();
    let cache_dir = work.path().join("cache");
    let ctx = context(&cache_dir, true);
    for key in ["old", "mid", "new"] {
        put(&ctx, key, vec![write_file(&work, key, &[0; 10])]);
    }

    let data = run_json(Command::CacheTrim { max_bytes: 20 }, &ctx);
    assert_eq!(data["evicted"], 1);
    assert_eq!(data["size_before"], 30);
    assert_eq!(data["size_after"], 20);

    let cache = DiskLruCache::open(&cache_dir, 1, 1, u64::MAX).unwrap();
    assert!(cache.get("old").unwrap().is_none());
    assert!(cache.get("new").unwrap().is_some());
}

#[test]
fn test_clear_removes_directory() {
    let work = TempDir::new().unwrap();
    let cache_dir = work.path().join("cache");
    let ctx = context(&cache_dir, true);
    put(&ctx, "a", vec![write_file(&work, "a.bin", &[0; 5])]);

    let data = run_json(Command::CacheClear, &ctx);
    assert_eq!(data["entries"], 1);
    assert_eq!(data["bytes"], 5);
    assert!(!cache_dir.exists());
}

#[test]
fn test_config_file_supplies_directory() {
    let work = TempDir::new().unwrap();
    let cache_dir = work.path().join("from-config");
    let config = work.path().join("pictor.toml");
    std::fs::write(
        &config,
        format!(
            "[disk_cache]\ndirectory = {:?}\n",
            cache_dir.display().to_string()
        ),
    )
    .unwrap();
    let ctx = Context {
        config: Some(config),
        dir: None,
        json: true,
    };

    put(&ctx, "a", vec![write_file(&work, "a.bin", b"x")]);
    assert!(Header::read(&cache_dir).unwrap().is_some());
}

#[test]
fn test_bad_config_file_is_config_error() {
    let work = TempDir::new().unwrap();
    let config = work.path().join("pictor.toml");
    std::fs::write(&config, "[pools]\ndisk_threads = 0\n").unwrap();
    let ctx = Context {
        config: Some(config),
        dir: Some(work.path().join("cache")),
        json: false,
    };
    let err = run(Command::CacheInfo, &ctx).unwrap_err();
    assert_eq!(err.category(), "config");
    assert_eq!(pictor_cli::exit_code_for(&err), pictor_cli::EXIT_CLI);
}
