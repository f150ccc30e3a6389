use std::fs;

use octofhir_smart_client::config::load_config;

#[tokio::test]
async fn open_client_from_config() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("open.toml");
    let toml = r#"
server_url = "https://fhir.example.com/r4"
client_id = "open"
username = "u"
password = "p"
"#;
    fs::write(&path, toml).expect("write toml");

    let client = load_config(path.to_str())
        .expect("config")
        .open_client()
        .expect("client");
    assert_eq!(client.server_url().as_str(), "https://fhir.example.com/r4");
    let state = client.state().await;
    assert_eq!(state.username.as_deref(), Some("u"));
    assert!(state.access_token().is_none());
}
