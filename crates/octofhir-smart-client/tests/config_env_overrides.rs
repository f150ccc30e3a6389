//! Mutates process environment variables; kept in its own test binary.

use std::{env, fs};

use octofhir_smart_client::PkceMode;
use octofhir_smart_client::config::load_config;

#[test]
fn config_file_and_env_overrides() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("smart-client.toml");

    let toml_content = r#"
server_url = "https://fhir.example.com/r4"
client_id = "from-file"
scope = "launch/patient patient/*.read offline_access"
redirect_uri = "https://app.example.com/callback"
pkce_mode = "auto"
request_timeout_secs = 10
"#;
    fs::write(&path, toml_content).expect("write toml");

    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.client_id, "from-file");
    assert_eq!(cfg.pkce_mode, PkceMode::Auto);
    assert_eq!(cfg.request_timeout_secs, 10);

    // Env overrides win over the file
    unsafe {
        env::set_var("OCTOFHIR_SMART__CLIENT_ID", "from-env");
        env::set_var("OCTOFHIR_SMART__REQUEST_TIMEOUT_SECS", "3");
        env::set_var("OCTOFHIR_SMART__REFRESH_TOKEN_WITH_CLIENT_ID", "true");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    unsafe {
        env::remove_var("OCTOFHIR_SMART__CLIENT_ID");
        env::remove_var("OCTOFHIR_SMART__REQUEST_TIMEOUT_SECS");
        env::remove_var("OCTOFHIR_SMART__REFRESH_TOKEN_WITH_CLIENT_ID");
    }
    assert_eq!(cfg_env.client_id, "from-env");
    assert_eq!(cfg_env.request_timeout_secs, 3);
    assert!(cfg_env.refresh_token_with_client_id);
    assert_eq!(cfg_env.server_url, "https://fhir.example.com/r4");

    // Invalid URL is rejected
    fs::write(&path, "server_url = \"nope\"\nclient_id = \"x\"\n").expect("write toml");
    assert!(load_config(path.to_str()).is_err());
}
