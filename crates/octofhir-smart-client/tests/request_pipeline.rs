//! Request pipeline against a mock FHIR server: token refresh, 401/403
//! policy, Location follow-up, reference resolution and paging.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use octofhir_smart_client::error::{NOT_LAUNCHED_HINT, SESSION_EXPIRED_HINT};
use octofhir_smart_client::{
    Client, ClientState, FhirOptions, FhirRequest, MemoryStorage, ReqwestTransport, ResponseBody,
    SmartError, Storage, TokenResponse,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn session(server: &MockServer, expires_at: i64) -> ClientState {
    let mut state = ClientState::new(server.uri());
    state.client_id = Some("my-app".into());
    state.token_uri = Some(format!("{}/auth/token", server.uri()));
    state.key = Some("session".into());
    state.expires_at = Some(expires_at);
    state.token_response = TokenResponse {
        access_token: Some("old-at".into()),
        refresh_token: Some("rt".into()),
        scope: Some("patient/*.read offline_access".into()),
        patient: Some("123".into()),
        ..Default::default()
    };
    state
}

fn client(state: ClientState, storage: Arc<MemoryStorage>) -> Client {
    let timeout = Duration::from_secs(5);
    let transport = ReqwestTransport::new(timeout).expect("transport");
    Client::new(state, Arc::new(transport), storage).expect("client")
}

fn in_memory_client(state: ClientState) -> Client {
    client(state, Arc::new(MemoryStorage::new()))
}

async fn mount_token_endpoint(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .and(body_string("grant_type=refresh_token&refresh_token=rt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "new-at", "expires_in": 3600}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn patient(id: &str) -> Value {
    json!({"resourceType": "Patient", "id": id})
}

// =============================================================================
// Token lifecycle
// =============================================================================

#[tokio::test]
async fn concurrent_requests_share_one_refresh() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/Patient/123"))
        .and(header("authorization", "Bearer new-at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("123")))
        .expect(5)
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() - 60));
    let request = || client.request("Patient/123", FhirOptions::default());
    let requests = (0..5).map(|_| request());
    let results = futures_util::future::join_all(requests).await;

    for result in results {
        let response = result.expect("request");
        assert_eq!(response.json().expect("json")["id"], "123");
    }
}

#[tokio::test]
async fn valid_token_is_not_refreshed() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 0).await;

    let client = in_memory_client(session(&server, now() + 3600));
    for _ in 0..10 {
        let state = client.refresh_if_needed().await.expect("state");
        assert_eq!(state.access_token(), Some("old-at"));
    }
}

#[tokio::test]
async fn refresh_is_persisted_and_not_repeated() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    let storage = Arc::new(MemoryStorage::new());
    let client = client(session(&server, now() - 60), storage.clone());
    for _ in 0..3 {
        client.refresh_if_needed().await.expect("refresh");
    }

    let stored = storage.get("session").await.expect("get").expect("stored");
    assert_eq!(stored["tokenResponse"]["access_token"], "new-at");
    assert_eq!(stored["tokenResponse"]["refresh_token"], "rt");
}

#[tokio::test]
async fn refresh_without_offline_scope_makes_no_request() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 0).await;

    let mut state = session(&server, now() - 60);
    state.token_response.scope = Some("patient/*.read launch".into());
    let client = in_memory_client(state);

    let error = client.refresh().await.expect_err("refresh must fail");
    assert!(matches!(error, SmartError::Configuration { .. }));
    assert!(error.to_string().contains("offline_access"));
}

// =============================================================================
// 401 / 403
// =============================================================================

#[tokio::test]
async fn unauthorized_refreshes_once_and_retries() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer old-at"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer new-at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("123")))
        .expect(1)
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request("Patient/123", FhirOptions::default())
        .await
        .expect("retried request");
    assert_eq!(response.json().expect("json")["id"], "123");
}

#[tokio::test]
async fn unauthorized_after_failed_refresh_clears_session() {
    let server = MockServer::start().await;
    let invalid_grant = json!({"error": "invalid_grant"});
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(invalid_grant))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let client = client(session(&server, now() + 3600), storage.clone());

    let error = client
        .request("Patient/123", FhirOptions::default())
        .await
        .expect_err("session must end");
    match &error {
        SmartError::AuthExpired { error, hint } => {
            assert_eq!(error.status, 401);
            assert_eq!(*hint, SESSION_EXPIRED_HINT);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(client.state().await.access_token().is_none());
    let stored = storage.get("session").await.expect("get").expect("stored");
    assert_eq!(stored["tokenResponse"], json!({}));
}

#[tokio::test]
async fn unauthorized_with_refresh_disabled_clears_session() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 0).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() - 60));
    let error = client
        .request(
            "Patient/123",
            FhirOptions::default().use_refresh_token(false),
        )
        .await
        .expect_err("session must end");

    assert!(error.is_auth_expired());
    assert!(client.state().await.access_token().is_none());
}

#[tokio::test]
async fn unauthorized_before_launch_hints_at_launch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = in_memory_client(ClientState::new(server.uri()));
    let error = client
        .request("Patient/123", FhirOptions::default())
        .await
        .expect_err("must fail");
    match error {
        SmartError::AuthExpired { hint, .. } => assert_eq!(hint, NOT_LAUNCHED_HINT),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn forbidden_keeps_session() {
    let server = MockServer::start().await;
    let outcome = json!({"resourceType": "OperationOutcome"});
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_json(outcome))
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() + 3600));
    let error = client
        .request("Patient/999", FhirOptions::default())
        .await
        .expect_err("must fail");

    assert!(error.is_permission_denied());
    assert!(error.to_string().contains("OperationOutcome"));
    assert_eq!(client.state().await.access_token(), Some("old-at"));
}

// =============================================================================
// HTTP conventions
// =============================================================================

#[tokio::test]
async fn created_without_body_follows_location() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Patient"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("location", "Patient/123"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Patient/123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("123")))
        .expect(1)
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .create(&json!({"resourceType": "Patient"}), FhirOptions::default())
        .await
        .expect("create");

    assert_eq!(response.json().expect("json"), &patient("123"));
}

#[tokio::test]
async fn update_follows_location_relative_to_server_base() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/r4/Patient/123"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("location", "Patient/123/_history/1"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/r4/Patient/123/_history/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("123")))
        .expect(1)
        .mount(&server)
        .await;

    let mut state = session(&server, now() + 3600);
    state.server_url = format!("{}/r4", server.uri());
    let client = in_memory_client(state);
    let response = client
        .update(&patient("123"), FhirOptions::default())
        .await
        .expect("update");

    assert_eq!(response.json().expect("json"), &patient("123"));
}

#[tokio::test]
async fn created_with_empty_text_body_follows_location() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Patient"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("content-type", "text/plain")
                .insert_header("location", "Patient/9"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Patient/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("9")))
        .expect(1)
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .create(&json!({"resourceType": "Patient"}), FhirOptions::default())
        .await
        .expect("create");

    assert_eq!(response.json().expect("json"), &patient("9"));
}

#[tokio::test]
async fn include_response_keeps_http_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "W/\"3\"")
                .set_body_json(patient("1")),
        )
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request(
            FhirRequest::new("Patient/1").include_response(true),
            FhirOptions::default(),
        )
        .await
        .expect("request");

    let http = response.response.expect("response kept");
    assert_eq!(http.status.as_u16(), 200);
    assert_eq!(http.header("etag"), Some("W/\"3\""));
}

#[tokio::test]
async fn invalid_patch_is_rejected_locally() {
    let server = MockServer::start().await;
    let client = in_memory_client(session(&server, now() + 3600));

    let error = client
        .patch(
            "Patient/1",
            &json!([{"op": "explode", "path": "/active"}]),
            FhirOptions::default(),
        )
        .await
        .expect_err("invalid patch");

    assert!(matches!(error, SmartError::Validation { .. }));
    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

#[tokio::test]
async fn valid_patch_is_sent_as_json_patch() {
    let server = MockServer::start().await;
    let json_patch = "application/json-patch+json; charset=UTF-8";
    Mock::given(method("PATCH"))
        .and(path("/Patient/1"))
        .and(header("content-type", json_patch))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("1")))
        .expect(1)
        .mount(&server)
        .await;

    let client = in_memory_client(session(&server, now() + 3600));
    client
        .patch(
            "Patient/1",
            &json!([{"op": "replace", "path": "/active", "value": false}]),
            FhirOptions::default(),
        )
        .await
        .expect("patch");
}

#[tokio::test]
async fn cancelled_signal_prevents_sending() {
    let server = MockServer::start().await;
    let client = in_memory_client(session(&server, now() + 3600));
    let signal = CancellationToken::new();
    signal.cancel();

    let error = client
        .request("Patient/1", FhirOptions::default().signal(signal))
        .await
        .expect_err("cancelled");

    assert!(matches!(error, SmartError::Cancelled));
    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

// =============================================================================
// References
// =============================================================================

async fn mount_observation(server: &MockServer, encounter_status: u16) {
    Mock::given(method("GET"))
        .and(path("/Observation/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Observation",
            "id": "1",
            "subject": {"reference": "Patient/123"},
            "encounter": {"reference": "Encounter/9"}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Patient/123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("123")))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Encounter/9"))
        .respond_with(ResponseTemplate::new(encounter_status))
        .mount(server)
        .await;
}

#[tokio::test]
async fn missing_reference_is_left_unresolved() {
    let server = MockServer::start().await;
    mount_observation(&server, 404).await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request(
            "Observation/1",
            FhirOptions::default().resolve(["subject", "encounter"]),
        )
        .await
        .expect("404 references are absorbed");

    assert_json_eq!(
        response.into_json().expect("json"),
        json!({
            "resourceType": "Observation",
            "id": "1",
            "subject": {"resourceType": "Patient", "id": "123"},
            "encounter": {"reference": "Encounter/9"}
        })
    );
}

#[tokio::test]
async fn failing_reference_aborts_request() {
    let server = MockServer::start().await;
    mount_observation(&server, 500).await;

    let client = in_memory_client(session(&server, now() + 3600));
    let error = client
        .request(
            "Observation/1",
            FhirOptions::default().resolve(["subject", "encounter"]),
        )
        .await
        .expect_err("500 aborts");

    assert_eq!(error.status(), Some(500));
}

#[tokio::test]
async fn non_graph_mode_returns_references_apart() {
    let server = MockServer::start().await;
    mount_observation(&server, 404).await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request(
            "Observation/1",
            FhirOptions::default()
                .resolve(["subject", "encounter"])
                .graph(false),
        )
        .await
        .expect("request");

    assert_eq!(
        response.json().expect("json")["subject"],
        json!({"reference": "Patient/123"})
    );
    assert_eq!(response.references.len(), 1);
    assert_eq!(response.references["Patient/123"], patient("123"));
}

// =============================================================================
// Paging
// =============================================================================

async fn mount_page_chain(server: &MockServer) {
    let entry = |id: String| {
        json!({"resource": {
            "resourceType": "Observation",
            "id": id,
            "subject": {"reference": "Patient/123"}
        }})
    };
    let page = |n: u32, next: Option<String>| {
        let mut links = vec![json!({"relation": "self", "url": format!("page{n}")})];
        if let Some(next) = next {
            links.push(json!({"relation": "next", "url": next}));
        }
        json!({
            "resourceType": "Bundle",
            "id": format!("page{n}"),
            "link": links,
            "entry": [entry(format!("{n}a")), entry(format!("{n}b"))]
        })
    };
    let first = page(1, Some(format!("{}/page2", server.uri())));
    let second = page(2, Some(format!("{}/page3", server.uri())));

    Mock::given(method("GET"))
        .and(path("/Observation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(first))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(second))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(3, None)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Patient/123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient("123")))
        .mount(server)
        .await;
}

async fn page_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path().starts_with("/page"))
        .count()
}

#[tokio::test]
async fn page_limit_counts_the_first_page() {
    let server = MockServer::start().await;
    mount_page_chain(&server).await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request("Observation", FhirOptions::default().page_limit(2))
        .await
        .expect("request");

    let pages = response.json().expect("json").as_array().expect("array");
    let ids: Vec<&str> = pages.iter().filter_map(|p| p["id"].as_str()).collect();
    assert_eq!(ids, vec!["page1", "page2"]);
    assert_eq!(page_requests(&server).await, 1);
}

#[tokio::test]
async fn single_page_returns_the_bundle() {
    let server = MockServer::start().await;
    mount_page_chain(&server).await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request("Observation", FhirOptions::default())
        .await
        .expect("request");

    assert_eq!(response.json().expect("json")["id"], "page1");
    assert_eq!(page_requests(&server).await, 0);
}

#[tokio::test]
async fn flat_unlimited_paging_resolves_each_reference_once() {
    let server = MockServer::start().await;
    mount_page_chain(&server).await;

    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request(
            "Observation",
            FhirOptions::default()
                .page_limit(0)
                .flat(true)
                .resolve(["subject"]),
        )
        .await
        .expect("request");

    let resources = response.json().expect("json").as_array().expect("array");
    let ids: Vec<&str> = resources.iter().filter_map(|r| r["id"].as_str()).collect();
    assert_eq!(ids, vec!["1a", "1b", "2a", "2b", "3a", "3b"]);
    assert!(resources.iter().all(|r| r["subject"]["id"] == "123"));

    let patient_fetches = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/Patient/123")
        .count();
    assert_eq!(patient_fetches, 1);
}

#[tokio::test]
async fn on_page_receives_pages_instead_of_result() {
    let server = MockServer::start().await;
    mount_page_chain(&server).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request(
            "Observation",
            FhirOptions::default()
                .page_limit(3)
                .on_page(move |page, _references| {
                    sink.lock()
                        .expect("lock")
                        .push(page["id"].as_str().unwrap_or_default().to_string());
                    Ok(())
                }),
        )
        .await
        .expect("request");

    assert_eq!(response.body, ResponseBody::Empty);
    assert_eq!(*seen.lock().expect("lock"), vec!["page1", "page2", "page3"]);
}

#[tokio::test]
async fn pages_stream_is_lazy() {
    use futures_util::StreamExt;

    let server = MockServer::start().await;
    mount_page_chain(&server).await;

    let client = in_memory_client(session(&server, now() + 3600));
    let options = FhirOptions::default().page_limit(0);
    let mut pages = Box::pin(client.pages("Observation", options));

    let first = pages.next().await.expect("first page").expect("ok");
    assert_eq!(first.bundle["id"], "page1");
    assert_eq!(page_requests(&server).await, 0);

    let rest: Vec<_> = pages.collect().await;
    assert_eq!(rest.len(), 2);
    assert_eq!(page_requests(&server).await, 2);
}

#[tokio::test]
async fn cancelling_between_pages_stops_the_walk() {
    let server = MockServer::start().await;
    mount_page_chain(&server).await;

    let signal = CancellationToken::new();
    let trigger = signal.clone();
    let client = in_memory_client(session(&server, now() + 3600));
    let response = client
        .request(
            "Observation",
            FhirOptions::default()
                .page_limit(0)
                .signal(signal)
                .on_page(move |_page, _references| {
                    trigger.cancel();
                    Ok(())
                }),
        )
        .await
        .expect("request");

    assert_eq!(response.body, ResponseBody::Empty);
    assert_eq!(page_requests(&server).await, 0);
}

#[tokio::test]
async fn cancelling_during_resolution_stops_deeper_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Observation/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Observation",
            "id": "1",
            "encounter": {"reference": "Encounter/9"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Encounter/9"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "resourceType": "Encounter",
                    "id": "9",
                    "serviceProvider": {"reference": "Organization/1"}
                }))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Organization/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
        .expect(0)
        .mount(&server)
        .await;

    let signal = CancellationToken::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let client = in_memory_client(session(&server, now() + 3600));
    let error = client
        .request(
            "Observation/1",
            FhirOptions::default()
                .resolve(["encounter", "encounter.serviceProvider"])
                .signal(signal),
        )
        .await
        .expect_err("cancelled");

    assert!(matches!(error, SmartError::Cancelled));
}
