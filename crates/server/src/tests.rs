use super::*;
use agentcanvas_engine::{default_factions, ManualClock};
use axum::body::Body;
use axum::http::Request;
use serde_json::{json, Value};
use tower::ServiceExt;

const ADMIN: &str = "server-admin";
const T0: i64 = 1_700_000_000_000;

fn temp_engine() -> (Engine, ManualClock) {
    let p = std::env::temp_dir().join(format!(
        "agentcanvas-server-test-{}-{}.db",
        std::process::id(),
        time::OffsetDateTime::now_utc().unix_timestamp_nanos()
    ));
    let clock = ManualClock::new(T0);
    let engine = Engine::new(p)
        .with_clock(clock.clone())
        .with_admin_key(Some(ADMIN));
    let _ = engine.open().expect("open db");
    (engine, clock)
}

fn app(engine: &Engine) -> Router {
    build_router(AppState::new(engine.clone(), Duration::from_secs(5)))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

async fn register(app: &Router, name: &str) -> String {
    let (status, _, body) = call(app, post("/api/register", json!({ "name": name }))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["apiKey"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn register_and_place_with_header_key() {
    let (engine, _) = temp_engine();
    let app = app(&engine);
    let key = register(&app, "painter").await;

    let mut req = post("/api/pixel", json!({ "x": 3, "y": 4, "color": "#ff0000" }));
    req.headers_mut()
        .insert(X_API_KEY, HeaderValue::from_str(&key).unwrap());
    let (status, _, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["pool"]["remaining"], json!(9));
    assert_eq!(body["pool"]["max"], json!(10));
    assert_eq!(body["pool"]["nextRegenAt"], json!(T0 + 300_000));

    let (status, _, canvas) = call(&app, get_req("/api/canvas")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canvas["dimensions"], json!({ "width": 500, "height": 500 }));
    assert_eq!(canvas["pixels"].as_array().unwrap().len(), 1);
    assert_eq!(canvas["pixels"][0]["color"], json!("#ff0000"));
}

#[tokio::test]
async fn palette_index_and_bearer_token() {
    let (engine, _) = temp_engine();
    let app = app(&engine);
    let key = register(&app, "bearer").await;

    let mut req = post("/api/pixel", json!({ "x": 0, "y": 0, "color": 5 }));
    req.headers_mut().insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {key}")).unwrap(),
    );
    let (status, _, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["color"], json!(5));
}

#[tokio::test]
async fn exhausted_pool_is_429_with_retry_after() {
    let (engine, _) = temp_engine();
    let app = app(&engine);
    let key = register(&app, "spender").await;

    for i in 0..10 {
        let (status, _, _) = call(
            &app,
            post("/api/pixel", json!({ "x": i, "y": 0, "color": 1, "apiKey": key })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) = call(
        &app,
        post("/api/pixel", json!({ "x": 11, "y": 0, "color": 1, "apiKey": key })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "300");
    assert_eq!(body["code"], json!("pool_exhausted"));
    assert_eq!(body["retryAfterSeconds"], json!(300));
}

#[tokio::test]
async fn validation_and_auth_failures_map_to_status_codes() {
    let (engine, _) = temp_engine();
    let app = app(&engine);
    let key = register(&app, "checker").await;

    let cases = [
        (json!({ "x": 0, "y": 0, "color": "red", "apiKey": key }), StatusCode::BAD_REQUEST),
        (json!({ "x": 0, "y": 0, "color": 16, "apiKey": key }), StatusCode::BAD_REQUEST),
        (json!({ "x": 500, "y": 0, "color": 1, "apiKey": key }), StatusCode::BAD_REQUEST),
        (json!({ "x": 0, "y": 0, "color": 1, "apiKey": "nope" }), StatusCode::UNAUTHORIZED),
        (json!({ "x": 0, "y": 0, "color": 1 }), StatusCode::BAD_REQUEST),
    ];
    for (body, expected) in cases {
        let (status, _, resp) = call(&app, post("/api/pixel", body.clone())).await;
        assert_eq!(status, expected, "{body} -> {resp}");
    }

    let (status, _, _) = call(&app, post("/api/register", json!({ "name": "checker" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _, _) = call(&app, post("/api/register", json!({ "name": "!!" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_reflects_regeneration() {
    let (engine, clock) = temp_engine();
    let app = app(&engine);
    let key = register(&app, "waiter").await;
    for i in 0..3 {
        call(
            &app,
            post("/api/pixel", json!({ "x": i, "y": 1, "color": 2, "apiKey": key })),
        )
        .await;
    }
    clock.advance(300_000);

    let (status, _, body) = call(&app, post("/api/agent/status", json!({ "apiKey": key }))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["pool"]["remaining"], json!(8));
    assert_eq!(body["pixelsPlaced"], json!(3));
}

#[tokio::test]
async fn factions_join_detail_and_missing() {
    let (engine, _) = temp_engine();
    engine.ensure_factions(&default_factions()).unwrap();
    let app = app(&engine);
    let key = register(&app, "joiner").await;

    let (status, _, body) = call(
        &app,
        post("/api/factions/join", json!({ "apiKey": key, "factionSlug": "devs" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // Header credentials work here as on the other agent routes.
    let other = register(&app, "header-joiner").await;
    let mut req = post("/api/factions/join", json!({ "factionSlug": "degens" }));
    req.headers_mut().insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {other}")).unwrap(),
    );
    let (status, _, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, _, _) =
        call(&app, post("/api/factions/join", json!({ "factionSlug": "devs" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, detail) = call(&app, get_req("/api/factions/devs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["agents"][0]["name"], json!("joiner"));

    let (status, _, _) = call(&app, get_req("/api/factions/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, list) = call(&app, get_req("/api/factions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["factions"].as_array().unwrap().len(), 4);

    let (status, _, ranked) = call(&app, get_req("/api/factions/leaderboard?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ranked.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn admin_routes_require_the_secret() {
    let (engine, _) = temp_engine();
    engine.ensure_factions(&default_factions()).unwrap();
    let app = app(&engine);
    let key = register(&app, "admin-target").await;
    call(
        &app,
        post("/api/pixel", json!({ "x": 1, "y": 1, "color": "#E50000", "apiKey": key })),
    )
    .await;

    for uri in ["/api/admin/clear", "/api/admin/territory"] {
        let (status, _, _) = call(&app, post(uri, json!({ "adminKey": "wrong" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
    }

    let (status, _, report) =
        call(&app, post("/api/admin/territory", json!({ "adminKey": ADMIN }))).await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["totalColored"], json!(1));

    let (status, _, zone) = call(
        &app,
        post(
            "/api/admin/conflicts",
            json!({
                "adminKey": ADMIN, "x": 10, "y": 10,
                "factionASlug": "devs", "factionBSlug": "degens", "intensity": 30
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{zone}");
    assert_eq!(zone["created"], json!(true));

    let (status, _, cleared) =
        call(&app, post("/api/admin/clear", json!({ "adminKey": ADMIN }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["pixels"], json!(1));
    assert!(engine.get_all().unwrap().is_empty());
}

#[tokio::test]
async fn admin_config_changes_dimensions() {
    let (engine, _) = temp_engine();
    let app = app(&engine);
    let (status, _, cfg) = call(
        &app,
        post(
            "/api/admin/config",
            json!({ "adminKey": ADMIN, "key": "canvas_width", "value": 64 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{cfg}");
    assert_eq!(cfg["width"], json!(64));

    let (_, _, dims) = call(&app, get_req("/api/canvas/dimensions")).await;
    assert_eq!(dims, json!({ "width": 64, "height": 500 }));

    let (status, _, body) = call(
        &app,
        post(
            "/api/admin/config",
            json!({ "adminKey": ADMIN, "key": "canvas_widht", "value": 10 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("unknown_config_key"));
}

#[tokio::test]
async fn leaderboard_is_served_from_cache() {
    let (engine, _) = temp_engine();
    let app = app(&engine);
    register(&app, "first").await;

    let (status, headers, page) = call(&app, get_req("/api/leaderboard?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(X_CACHE).unwrap(), "MISS");
    assert_eq!(page["items"].as_array().unwrap().len(), 1);

    register(&app, "second").await;
    let (_, headers, page) = call(&app, get_req("/api/leaderboard?limit=5")).await;
    assert_eq!(headers.get(X_CACHE).unwrap(), "HIT");
    assert_eq!(page["items"].as_array().unwrap().len(), 1);

    let (_, headers, _) = call(&app, get_req("/api/leaderboard?limit=5&sort=name")).await;
    assert_eq!(headers.get(X_CACHE).unwrap(), "MISS");
}

#[tokio::test]
async fn history_endpoints_and_health() {
    let (engine, clock) = temp_engine();
    let app = app(&engine);
    let key = register(&app, "historian").await;
    for i in 0..3 {
        clock.advance(1);
        call(
            &app,
            post("/api/pixel", json!({ "x": i, "y": 2, "color": 3, "apiKey": key })),
        )
        .await;
    }

    let (_, _, since) = call(&app, get_req(&format!("/api/canvas/since?since={}", T0 + 1))).await;
    let xs: Vec<i64> = since
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["x"].as_i64().unwrap())
        .collect();
    assert_eq!(xs, vec![1, 2]);

    let (_, _, recent) = call(&app, get_req("/api/canvas/activity?limit=1")).await;
    assert_eq!(recent[0]["x"], json!(2));

    let (_, _, palette) = call(&app, get_req("/api/canvas/palette")).await;
    assert_eq!(palette.as_array().unwrap().len(), 16);

    let (status, _, health) = call(&app, get_req("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], json!("healthy"));
    assert_eq!(health["stats"]["totalAgents"], json!(1));
}

#[tokio::test]
async fn timed_out_placement_still_commits_whole() {
    let (engine, _) = temp_engine();
    let key = engine.register("patient").unwrap().api_key;
    let app = build_router(AppState::new(engine.clone(), Duration::from_millis(50)));

    // Hold the write lock so the placement waits past the request budget.
    let blocker = engine.open().unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let (status, headers, body) = call(
        &app,
        post("/api/pixel", json!({ "x": 7, "y": 7, "color": 4, "apiKey": key })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], json!("timeout"));
    assert!(headers.get(header::RETRY_AFTER).is_none());

    blocker.execute_batch("COMMIT").unwrap();

    let mut history = Vec::new();
    for _ in 0..100 {
        history = engine.get_latest_activity(None).unwrap();
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(history.len(), 1);
    assert_eq!(engine.get_all().unwrap().len(), 1);
    let status = engine.get_status(&key).unwrap();
    assert_eq!(status.pool.remaining, 9);
    assert_eq!(status.pixels_placed, 1);
}

#[tokio::test]
async fn refresher_writes_snapshots_until_cancelled() {
    let (engine, _) = temp_engine();
    engine.ensure_factions(&default_factions()).unwrap();
    let key = engine.register("territorial").unwrap().api_key;
    engine
        .place_pixel(&key, 0, 0, Color::Hex("#FFB6C1".to_string()))
        .unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let handle =
        spawn_territory_refresher(engine.clone(), Duration::from_millis(20), cancel.clone());

    let mut counted = 0;
    for _ in 0..100 {
        counted = engine
            .get_faction_stats()
            .unwrap()
            .iter()
            .find(|s| s.slug == "vibe-coders")
            .map_or(0, |s| s.pixel_count);
        if counted > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(counted, 1);

    cancel.store(true, Ordering::Relaxed);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("refresher stops once cancelled")
        .unwrap();
}

#[tokio::test]
async fn serve_listener_seeds_and_shuts_down() {
    let (engine, _) = temp_engine();
    let cfg = ServerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        db: Some(engine.db_path().to_path_buf()),
        admin_key: None,
        factions: None,
        territory_interval_secs: 1,
        request_timeout_ms: 1_000,
        verbose: false,
    };
    let listener = tokio::net::TcpListener::bind(cfg.addr).await.unwrap();
    let bound = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve_listener(listener, cfg, async {
        let _ = rx.await;
    }));

    let mut seeded = 0;
    for _ in 0..100 {
        seeded = engine.list_factions().unwrap().len();
        if seeded == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(seeded, 4);

    tx.send(()).unwrap();
    let addr = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops on shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(addr, bound);
}

#[test]
fn api_key_precedence() {
    let mut headers = HeaderMap::new();
    assert_eq!(extract_api_key(&headers, Some("body")), Some("body".to_string()));
    assert_eq!(extract_api_key(&headers, Some("")), None);

    headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
    assert_eq!(extract_api_key(&headers, Some("body")), Some("tok".to_string()));

    headers.insert(X_API_KEY, HeaderValue::from_static("hdr"));
    assert_eq!(extract_api_key(&headers, Some("body")), Some("hdr".to_string()));
}

#[test]
fn unknown_sort_falls_back_to_pixels() {
    assert_eq!(parse_sort(Some("name")), LeaderboardSort::Name);
    assert_eq!(parse_sort(Some("bogus")), LeaderboardSort::Pixels);
    assert_eq!(parse_sort(None), LeaderboardSort::Pixels);
}

#[test]
fn faction_seeds_parse_from_yaml() {
    let seeds = config::parse_faction_seeds(
        r##"
- slug: reds
  name: Red Legion
  color: "#E50000"
  home: { x: 0, y: 0, size: 50 }
  expansionDir: { dx: 1, dy: 1 }
- slug: blues
  name: Blue Tide
  color: "#0000EA"
  secondaryColor: "#0083C7"
  home: { x: 450, y: 450, size: 50 }
  expansionDir: { dx: -1, dy: -1 }
"##,
    )
    .unwrap();
    assert_eq!(seeds.len(), 2);
    assert_eq!(seeds[1].secondary_color.as_deref(), Some("#0083C7"));
    assert!(config::parse_faction_seeds("- slug: [").is_err());
}
