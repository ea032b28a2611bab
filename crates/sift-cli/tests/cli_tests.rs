use sift_cli::SiftConfig;
use sift_cli::commands::{load_job_spec, run_context, run_index, run_search};
use sift_mining::{DataType, ExtractMethod};
use std::path::Path;
use tempfile::TempDir;

fn test_config(data_dir: &Path) -> SiftConfig {
    let mut config = SiftConfig::default();
    config.general.data_dir = data_dir.to_path_buf();
    config.semantic.embedding.dimension = 256;
    config.semantic.chunking.chunk_size = 4;
    config.semantic.chunking.overlap = 1;
    config
}

fn write_tree(root: &Path) {
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(
        root.join("docs/cache.md"),
        "# Cache\n\nEntries expire after the ttl.\nA schema version bump invalidates entries.\n",
    )
    .unwrap();
    std::fs::write(
        root.join("docs/queue.md"),
        "# Queue\n\nHigher priority tasks run first.\nPaused jobs keep their tasks.\n",
    )
    .unwrap();
}

#[tokio::test]
async fn test_index_then_search_and_context() {
    let data = TempDir::new().unwrap();
    let tree = TempDir::new().unwrap();
    write_tree(tree.path());
    let config = test_config(data.path());

    let summary = run_index(&config, tree.path(), None).await.unwrap();
    assert_eq!(summary.report.files_seen, 2);
    assert_eq!(summary.report.files_indexed, 2);
    assert!(summary.chunks > 0);
    assert!(config.index_path().exists());

    let hits = run_search(&config, "schema version ttl", Some(3), Some(-1.0), None)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.len() <= 3);

    let bundle = run_context(&config, "priority tasks", 30, None).await.unwrap();
    assert!(bundle.token_estimate <= 30);

    // Second run sees nothing new.
    let again = run_index(&config, tree.path(), None).await.unwrap();
    assert_eq!(again.report.files_unchanged, 2);
    assert_eq!(again.report.chunks_embedded, 0);
}

#[tokio::test]
async fn test_search_with_switched_model_fails_loudly() {
    let data = TempDir::new().unwrap();
    let tree = TempDir::new().unwrap();
    write_tree(tree.path());
    let config = test_config(data.path());
    run_index(&config, tree.path(), None).await.unwrap();

    let mut switched = config.clone();
    switched.semantic.embedding.dimension = 128;

    let err = run_search(&switched, "cache", None, None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("DIMENSION_MISMATCH"), "{err}");
}

#[tokio::test]
async fn test_search_without_index_explains_next_step() {
    let data = TempDir::new().unwrap();
    let config = test_config(data.path());

    let err = run_search(&config, "anything", None, None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("sift index"));
}

#[test]
fn test_job_file_parses() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.toml");
    std::fs::write(
        &path,
        r#"
subject = "product pages"
seed_urls = ["https://example.com/a", "https://example.com/b"]

[config]
max_depth = 1
rate_limit_ms = 500

[config.url_patterns]
include = ["^https://example\\.com/"]

[[attributes]]
name = "title"
priority = 10

[[attributes]]
name = "price"
selector = ".price"
data_type = "number"
priority = 5

[attributes.validation]
required = true
min = 0.0

[[attributes]]
name = "canonical"
selector = "link[rel=canonical]"
method = { attr = "href" }
"#,
    )
    .unwrap();

    let spec = load_job_spec(&path).unwrap();
    assert_eq!(spec.seed_urls.len(), 2);
    assert_eq!(spec.config.max_depth, 1);
    assert_eq!(spec.config.max_attempts, 3);
    assert_eq!(spec.attributes.len(), 3);
    assert_eq!(spec.attributes[1].data_type, DataType::Number);
    assert!(spec.attributes[1].validation.required);
    assert_eq!(spec.attributes[2].method, ExtractMethod::Attr("href".to_string()));
    assert_eq!(spec.attributes[2].schema_version, "1.0.0");
}
