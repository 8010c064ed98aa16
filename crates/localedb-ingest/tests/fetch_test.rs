//! Fetcher behavior against a mock HTTP server
//!
//! These tests validate:
//! - Cache hits issue no request
//! - Transient failures are retried up to the attempt budget
//! - Permanent failures are not retried
//! - No partial file survives a failed fetch

use localedb_common::types::Domain;
use localedb_ingest::config::FetchConfig;
use localedb_ingest::{Fetcher, IngestError};
use std::path::Path;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn fetcher(cache: &Path, max_attempts: u32) -> Fetcher {
    let config = FetchConfig {
        max_attempts,
        retry_delay_ms: 1,
        ..FetchConfig::default()
    };
    Fetcher::new(cache, &config)
        .expect("Failed to build fetcher")
        .with_progress(false)
}

fn part_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_cache_hit_issues_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/TRACT/2010/tl_2010_02_tract10.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zipbytes".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let geo = cache.path().join("geo");
    std::fs::create_dir_all(&geo).unwrap();
    std::fs::write(geo.join("tl_2010_02_tract10.zip"), b"cached").unwrap();

    let locator = format!("{}/TRACT/2010/tl_2010_02_tract10.zip", server.uri());
    let fetched = fetcher(cache.path(), 3)
        .fetch(Domain::Geo, &locator)
        .await
        .unwrap();

    assert!(fetched.from_cache);
    assert_eq!(fetched.attempts, 0);
    assert_eq!(std::fs::read(&fetched.path).unwrap(), b"cached");
}

#[tokio::test]
async fn test_empty_cache_file_is_refetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ak.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"population".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let pop = cache.path().join("pop");
    std::fs::create_dir_all(&pop).unwrap();
    std::fs::write(pop.join("ak.zip"), b"").unwrap();

    let f = fetcher(cache.path(), 3);
    let locator = format!("{}/ak.zip", server.uri());
    let first = f.fetch(Domain::Pop, &locator).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.attempts, 1);

    let second = f.fetch(Domain::Pop, &locator).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(std::fs::read(&second.path).unwrap(), b"population");
}

#[tokio::test]
async fn test_server_errors_exhaust_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/time_series_covid19_confirmed_global.csv"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let locator = format!("{}/time_series_covid19_confirmed_global.csv", server.uri());
    let err = fetcher(cache.path(), 3)
        .fetch(Domain::Disease, &locator)
        .await
        .unwrap_err();

    match err {
        IngestError::Fetch { attempts, message, .. } => {
            assert_eq!(attempts, 3);
            assert!(message.contains("500"));
        },
        other => panic!("unexpected error: {other}"),
    }

    let dir = cache.path().join("dis");
    assert!(!dir.join("time_series_covid19_confirmed_global.csv").exists());
    assert_eq!(part_files(&dir), 0);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let locator = format!("{}/TABBLOCK/2010/tl_2010_02_tabblock10.zip", server.uri());
    let err = fetcher(cache.path(), 5)
        .fetch(Domain::Geo, &locator)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Fetch { attempts: 1, .. }));
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fips,date,tmax\n"))
        .expect(1)
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let locator = format!("{}/weather/ak.csv", server.uri());
    let fetched = fetcher(cache.path(), 3)
        .fetch(Domain::Weather, &locator)
        .await
        .unwrap();

    assert_eq!(fetched.attempts, 2);
    assert!(fetched.path.ends_with("weather/ak.csv"));
    assert_eq!(part_files(&cache.path().join("weather")), 0);
}
