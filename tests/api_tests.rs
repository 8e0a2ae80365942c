use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use gpio_edge::{AppConfig, AppState, GpioManager, Level, MockGpioBackend, api_scope};
use serde_json::Value;

fn sample_config() -> AppConfig {
    serde_json::from_str(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 30
            },
            "lines": {
                "50": {
                    "name": "BUTTON 1"
                },
                "51": {
                    "name": "DOOR SENSOR",
                    "edge": "both"
                }
            },
            "broadcast_capacity": 16
        }
        "#,
    )
    .expect("valid sample config")
}

fn sample_state() -> (Arc<MockGpioBackend>, AppState<MockGpioBackend>) {
    let cfg = Arc::new(sample_config());
    let backend = Arc::new(MockGpioBackend::default());
    let manager = Arc::new(GpioManager::new(cfg, backend.clone()));
    (backend, AppState { manager })
}

async fn wait_armed(state: &AppState<MockGpioBackend>, line: u32) {
    for _ in 0..500 {
        let armed = state
            .manager
            .monitor()
            .line_status(line)
            .is_some_and(|status| status.observed && status.armed);
        if armed {
            return;
        }
        actix_rt::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("line {line} never armed");
}

#[actix_rt::test]
async fn list_lines_returns_all() {
    let (_backend, state) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/lines").to_request();
    let response: HashMap<String, Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response.len(), 2);

    let sensor = &response["51"];
    assert_eq!(sensor["info"]["name"], "DOOR SENSOR");
    assert_eq!(sensor["info"]["edge"], "both");
    // nothing exported yet
    assert!(sensor["direction"].is_null());
    assert!(sensor["status"].is_null());
}

#[actix_rt::test]
async fn line_not_found_returns_404() {
    let (_backend, state) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/line/999").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/999/export")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (_backend, state) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::post().uri("/api/v1/line/50").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::put()
        .uri("/api/v1/line/50/edge-detect")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn export_direction_and_value_happy_path() {
    let (backend, state) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/export")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/direction")
        .set_payload("out")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get()
        .uri("/api/v1/line/50/direction")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, r#""out""#);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(backend.level(50), Some(Level::High));

    let req = test::TestRequest::get()
        .uri("/api/v1/line/50/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");
}

#[actix_rt::test]
async fn reject_bad_payloads() {
    let (_backend, state) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/export")
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/value")
        .set_payload("2")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/direction")
        .set_payload("sideways")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/edge-detect")
        .set_payload(r#"{"edge":"none"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn unexported_line_reports_gpio_error() {
    let (_backend, state) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/line/50/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);

    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("line 50"));
}

#[actix_rt::test]
async fn edge_detect_added_then_already_added() {
    let (_backend, state) = sample_state();
    state.manager.init();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    // init already watches the configured edge of line 51
    let req = test::TestRequest::post()
        .uri("/api/v1/line/51/edge-detect")
        .set_payload(r#"{"edge":"rising"}"#)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["outcome"], "already-added");

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/edge-detect")
        .set_payload(r#"{"edge":"falling"}"#)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["outcome"], "added");

    let req = test::TestRequest::get().uri("/api/v1/line/50").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["direction"], "in");
    assert_eq!(body["edge"], "falling");
    assert_eq!(body["status"]["observed"], true);
    assert_eq!(body["status"]["callbacks"], 1);

    let req = test::TestRequest::delete()
        .uri("/api/v1/line/50/edge-detect")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/line/50").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["edge"], "none");
    assert_eq!(body["status"]["observed"], false);
}

#[actix_rt::test]
async fn wait_on_watched_line_conflicts() {
    let (_backend, state) = sample_state();
    state.manager.init();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/51/wait")
        .set_payload(r#"{"edge":"both","timeout_ms":50}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_rt::test]
async fn wait_times_out_without_edges() {
    let (_backend, state) = sample_state();
    state.manager.init();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/50/wait")
        .set_payload(r#"{"edge":"rising","timeout_ms":50}"#)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["outcome"], "timed-out");
}

#[actix_rt::test]
async fn event_flag_latches_until_read() {
    let (backend, state) = sample_state();
    state.manager.init();
    wait_armed(&state, 51).await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(api_scope::<MockGpioBackend>("/api/v1")),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/line/51/event")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "false");

    backend.drive(51, Level::High).unwrap();

    let mut detected = false;
    for _ in 0..500 {
        let req = test::TestRequest::get()
            .uri("/api/v1/line/51/event")
            .to_request();
        if test::call_and_read_body(&app, req).await == "true" {
            detected = true;
            break;
        }
        actix_rt::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(detected);

    let req = test::TestRequest::get()
        .uri("/api/v1/line/51/event")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "false");
}

#[actix_rt::test]
async fn edges_reach_event_subscribers() {
    let (backend, state) = sample_state();
    state.manager.init();
    let mut events = state.manager.subscribe_events();
    wait_armed(&state, 51).await;

    backend.drive(51, Level::High).unwrap();

    let event = actix_rt::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("open channel");
    assert_eq!(event.line, 51);
    assert_eq!(event.level, Level::High);
}
