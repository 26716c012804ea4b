use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use grantscout_adapters::AdapterRegistry;
use grantscout_core::{Importer, RawOpportunity};
use grantscout_storage::{HttpClientConfig, HttpFetcher, MemoryImporter};
use grantscout_sync::{Engine, Normaliser, SourceRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const YOUTH_GRANT: &str = r#"<html><head><title>Youth Development Grant Programme | NYDA</title></head>
<body><main>
  <h1>Youth Development Grant Programme</h1>
  <p>Grant funding for youth-owned survivalist and start-up businesses.</p>
  <p>Closing date: 2025-12-31</p>
  <h3>Eligibility criteria</h3>
  <ul><li>South African citizen aged 18 to 35</li><li>Business must be youth-owned</li></ul>
  <a href="https://nyda.gov.za/apply">Apply now</a>
</main></body></html>"#;

const LOGIN_WALL: &str = r#"<html><body><h1>Members area</h1>
  <form action="/session"><input type="password" name="pw"></form></body></html>"#;

const FEE_PAGE: &str = r#"<html><body><main><h1>Instant Business Grant</h1>
  <p>A once-off application fee of R350 secures your slot.</p>
  <a href="https://fees.example/apply">Apply here</a></main></body></html>"#;

/// Loopback HTTP/1.1 server returning canned pages; every requested path is logged.
async fn serve() -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let paths = Arc::new(Mutex::new(Vec::new()));
    let log = paths.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let log = log.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                log.lock().unwrap().push(path.clone());
                let (status, body) = match path.as_str() {
                    "/robots.txt" => (200, "User-agent: *\nDisallow: /private/\n"),
                    "/funding/youth-grant" => (200, YOUTH_GRANT),
                    "/funding/members" => (200, LOGIN_WALL),
                    "/funding/instant" => (200, FEE_PAGE),
                    _ => (404, "not found"),
                };
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{addr}"), paths)
}

fn registry(base: &str) -> SourceRegistry {
    SourceRegistry::from_yaml_str(&format!(
        r#"
sources:
  - source_id: youth
    source_name: National Youth Development Agency
    base_url: {base}
    scrape_urls:
      - {base}/funding/youth-grant
      - {base}/private/draft
      - {base}/funding/members
      - {base}/funding/instant
      - {base}/funding/gone
    category: government
    adapter: html-detail
    rate_limit_seconds: 0
    hints:
      funder_name: NYDA
      funder_type: government
      funding_type: grant
      business_stage: startup
"#
    ))
    .unwrap()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
}

async fn engine(base: &str, importer: Arc<MemoryImporter>) -> Engine {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        default_delay: Duration::ZERO,
        ..Default::default()
    })
    .unwrap();
    Engine::new(registry(base), Arc::new(http), importer)
        .unwrap()
        .with_today(today())
}

#[tokio::test]
async fn end_to_end_scrape_creates_active_record() {
    let (base, paths) = serve().await;
    let importer = Arc::new(MemoryImporter::new());
    let engine = engine(&base, importer.clone()).await;

    let result = engine.run(Some("youth"), false).await.unwrap();
    assert_eq!(result.records_found, 5);
    assert_eq!(result.records_created, 1);
    assert_eq!(result.records_rejected, 1);
    assert_eq!(result.records_skipped, 3);
    assert_eq!(
        result.records_found,
        result.records_created + result.records_updated + result.records_skipped + result.records_rejected
    );
    assert!(result.success());
    assert!(!paths.lock().unwrap().iter().any(|p| p.starts_with("/private/")));

    let stored = importer.records().await;
    assert_eq!(stored.len(), 1);
    let record = &stored[0];
    assert_eq!(record.row.funding_name, "Youth Development Grant Programme");
    assert_eq!(record.row.status, "active");
    assert_eq!(record.row.apply_link, "https://nyda.gov.za/apply");
    assert_eq!(record.provinces, vec!["National".to_string()]);

    let audit = importer.audit_log().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "created_by_scraper");
}

#[tokio::test]
async fn second_run_updates_instead_of_recreating() {
    let (base, _) = serve().await;
    let importer = Arc::new(MemoryImporter::new());
    let engine = engine(&base, importer.clone()).await;

    engine.run(None, false).await.unwrap();
    let again = engine.run(None, false).await.unwrap();
    assert_eq!(again.records_created, 0);
    assert_eq!(again.records_updated, 1);

    let stored = importer.records().await;
    assert_eq!(stored.len(), 1);
    let audit = importer.audit_log().await;
    assert_eq!(audit.last().unwrap().action, "updated_by_scraper");
    assert_eq!(audit.last().unwrap().opportunity_id, stored[0].id);
}

#[tokio::test]
async fn apply_url_match_updates_seeded_record() {
    let (base, _) = serve().await;
    let importer = Arc::new(MemoryImporter::new());
    let seeded = Normaliser::with_today(today()).normalise(
        &RawOpportunity {
            title: Some("NYDA Grant".into()),
            funder_name: Some("NYDA".into()),
            apply_url: Some("https://nyda.gov.za/apply".into()),
            source_url: "https://www.nyda.gov.za/old-grant-page".into(),
            ..Default::default()
        },
        "NYDA",
    );
    let id = importer.seed(&seeded).await;
    let engine = engine(&base, importer.clone()).await;

    let result = engine.run(None, false).await.unwrap();
    assert_eq!(result.records_updated, 1);
    assert_eq!(result.records_created, 0);

    let existing = importer.list_existing_records().await.unwrap();
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0].id, id);
    assert_eq!(existing[0].title, "Youth Development Grant Programme");
}

#[tokio::test]
async fn dry_run_exports_json_without_importing() {
    let (base, _) = serve().await;
    let importer = Arc::new(MemoryImporter::new());
    let engine = engine(&base, importer.clone()).await;

    let json = engine.scrape_to_json(Some("youth")).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let items = value.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"], "Active");
    assert_eq!(items[0]["funder_type"], "Gov");
    assert_eq!(items[0]["business_stage"], "Startup");
    assert_eq!(items[0]["deadline_date"], "2025-12-31");
    assert_eq!(items[0]["province_tags"], serde_json::json!(["National"]));
    assert!(items[0]["funding_amount_min"].is_null());
    assert!(importer.records().await.is_empty());
}

#[test]
fn bundled_source_registry_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
    let registry = SourceRegistry::load(&path).unwrap();
    assert!(registry.active().count() > 0);
    let adapters = AdapterRegistry::for_sources(&registry.sources).unwrap();
    assert_eq!(adapters.len(), registry.sources.len());
}
