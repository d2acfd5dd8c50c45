use crate::common::{
    cleanup_db, server_with, temp_db_path, tenant_auth, test_config, TENANT_KEY,
};
use messaging_mux::config::{Config, PairingCodeSeed};
use rocket::http::{ContentType, Header, Status};
use rocket::local::asynchronous::Client as AsyncClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn telegram_config(db_path: &str, api_base: &str) -> Config {
    let mut config = test_config(db_path);
    config.telegram.bot_token = Some("tt".to_string());
    config.telegram.api_base = api_base.to_string();
    config.code_seeds = vec![PairingCodeSeed {
        code: "PAIR-1".to_string(),
        channel: "telegram".to_string(),
        route_key: "telegram:default:chat:-100123".to_string(),
        scope: "chat".to_string(),
        expires_at_ms: None,
    }];
    config
}

async fn async_client(config: Config) -> AsyncClient {
    AsyncClient::tracked(messaging_mux::rocket_with_config(config))
        .await
        .expect("valid rocket instance")
}

async fn claim_code(client: &AsyncClient, code: &str) {
    let res = client
        .post("/v1/pairings/claim")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(format!(r#"{{"code":"{code}"}}"#))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
}

// --- Validation and auth (no provider needed) ---

#[test]
fn send_requires_auth() {
    let client = server_with(test_config(&temp_db_path()));
    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .body(r#"{"channel":"telegram","sessionKey":"s"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn send_validates_in_order() {
    let client = server_with(test_config(&temp_db_path()));
    let cases = [
        (r#"{}"#, "channel required"),
        (r#"{"channel":"carrier-pigeon","sessionKey":"s"}"#, "unsupported channel"),
        (r#"{"channel":"telegram"}"#, "sessionKey required"),
        (
            r#"{"channel":"telegram","sessionKey":"s"}"#,
            "text, mediaUrl, or raw required",
        ),
    ];
    for (body, expected) in cases {
        let res = client
            .post("/v1/mux/outbound/send")
            .header(ContentType::JSON)
            .header(tenant_auth())
            .body(body)
            .dispatch();
        assert_eq!(res.status(), Status::BadRequest, "body: {body}");
        let json: serde_json::Value = res.into_json().unwrap();
        assert_eq!(json["error"], expected, "body: {body}");
    }
}

#[test]
fn unbound_session_is_403_route_not_bound() {
    let client = server_with(test_config(&temp_db_path()));
    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(r#"{"channel":"telegram","sessionKey":"tg:group:-1","text":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["code"], "ROUTE_NOT_BOUND");
}

#[test]
fn whatsapp_without_runtime_is_502() {
    let db_path = temp_db_path();
    let mut config = test_config(&db_path);
    config.code_seeds = vec![PairingCodeSeed {
        code: "WA-1".to_string(),
        channel: "whatsapp".to_string(),
        route_key: "whatsapp:default:chat:555@s.whatsapp.net".to_string(),
        scope: "chat".to_string(),
        expires_at_ms: None,
    }];
    let client = server_with(config);
    let res = client
        .post("/v1/pairings/claim")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(r#"{"code":"WA-1"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(r#"{"channel":"whatsapp","sessionKey":"wa:dm:555@s.whatsapp.net","text":"hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadGateway);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("not configured"));
}

// --- S1: Telegram outbound routes via session ---

#[tokio::test]
async fn telegram_send_merges_chat_id_from_route() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bottt/sendMessage"))
        .and(body_partial_json(json!({"chat_id": "-100123", "text": "hi"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"message_id": 77, "chat": {"id": -100123}}
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let db_path = temp_db_path();
    let client = async_client(telegram_config(&db_path, &provider.uri())).await;
    claim_code(&client, "PAIR-1").await;

    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(
            r#"{"channel":"telegram","sessionKey":"tg:group:-100123","raw":{"telegram":{"method":"sendMessage","body":{"text":"hi"}}}}"#,
        )
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["messageId"], "77");
    assert_eq!(body["chatId"], "-100123");
    assert_eq!(body["providerMessageIds"][0], "77");

    drop(client);
    cleanup_db(&db_path);
}

#[tokio::test]
async fn telegram_send_without_raw_is_400() {
    let provider = MockServer::start().await;
    let db_path = temp_db_path();
    let client = async_client(telegram_config(&db_path, &provider.uri())).await;
    claim_code(&client, "PAIR-1").await;

    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(r#"{"channel":"telegram","sessionKey":"tg:group:-100123","text":"hi"}"#)
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["error"], "raw.telegram required");

    // Unsupported method is also a 400 before any provider call.
    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(
            r#"{"channel":"telegram","sessionKey":"tg:group:-100123","raw":{"telegram":{"method":"sendDice","body":{}}}}"#,
        )
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);

    cleanup_db(&db_path);
}

#[tokio::test]
async fn telegram_provider_failure_is_502_with_details() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bottt/sendMessage"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: chat not found"
        })))
        .mount(&provider)
        .await;

    let db_path = temp_db_path();
    let client = async_client(telegram_config(&db_path, &provider.uri())).await;
    claim_code(&client, "PAIR-1").await;

    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(
            r#"{"channel":"telegram","sessionKey":"tg:group:-100123","raw":{"telegram":{"method":"sendMessage","body":{"text":"hi"}}}}"#,
        )
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadGateway);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("chat not found"));
    assert_eq!(body["details"]["error_code"], 400);

    drop(client);
    cleanup_db(&db_path);
}

// --- S2: idempotency replay ---

#[tokio::test]
async fn idempotent_replay_is_byte_identical_and_mismatch_conflicts() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bottt/sendMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"message_id": 41}
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let db_path = temp_db_path();
    let client = async_client(telegram_config(&db_path, &provider.uri())).await;
    claim_code(&client, "PAIR-1").await;

    let send_body = r#"{"channel":"telegram","sessionKey":"tg:group:-100123","raw":{"telegram":{"method":"sendMessage","body":{"text":"hi"}}}}"#;

    let first = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .header(Header::new("Idempotency-Key", "k1"))
        .body(send_body)
        .dispatch()
        .await;
    assert_eq!(first.status(), Status::Ok);
    let first_text = first.into_string().await.unwrap();

    // Replay: same status and body, no second provider call (expect(1) above).
    let second = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .header(Header::new("Idempotency-Key", "k1"))
        .body(send_body)
        .dispatch()
        .await;
    assert_eq!(second.status(), Status::Ok);
    assert_eq!(second.into_string().await.unwrap(), first_text);

    // Same key, different fingerprint: 409.
    let third = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .header(Header::new("Idempotency-Key", "k1"))
        .body(
            r#"{"channel":"telegram","sessionKey":"tg:group:-100123","raw":{"telegram":{"method":"sendMessage","body":{"text":"bye"}}}}"#,
        )
        .dispatch()
        .await;
    assert_eq!(third.status(), Status::Conflict);

    cleanup_db(&db_path);
}

// --- Typing ---

#[tokio::test]
async fn typing_shortcut_maps_to_send_chat_action() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bottt/sendChatAction"))
        .and(body_partial_json(json!({"chat_id": "-100123", "action": "typing"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": true})))
        .expect(1)
        .mount(&provider)
        .await;

    let db_path = temp_db_path();
    let client = async_client(telegram_config(&db_path, &provider.uri())).await;
    claim_code(&client, "PAIR-1").await;

    let res = client
        .post("/v1/mux/outbound/typing")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(r#"{"channel":"telegram","sessionKey":"tg:group:-100123"}"#)
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["ok"], true);

    drop(client);
    cleanup_db(&db_path);
}

// --- Discord guild verification ---

#[tokio::test]
async fn discord_send_outside_bound_guild_is_403() {
    let provider = MockServer::start().await;
    // Channel 456 is in the bound guild; 999 is elsewhere.
    Mock::given(method("GET"))
        .and(path("/channels/456"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "456", "guild_id": "123"})),
        )
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/channels/999"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "999", "guild_id": "777"})),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/channels/456/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
        .expect(1)
        .mount(&provider)
        .await;

    let db_path = temp_db_path();
    let mut config = test_config(&db_path);
    config.discord.bot_token = Some("dt".to_string());
    config.discord.api_base = provider.uri();
    config.code_seeds = vec![PairingCodeSeed {
        code: "GUILD-1".to_string(),
        channel: "discord".to_string(),
        route_key: "discord:default:guild:123:channel:456".to_string(),
        scope: "guild".to_string(),
        expires_at_ms: None,
    }];
    let client = async_client(config).await;
    claim_code(&client, "GUILD-1").await;

    let session = "dc:guild:123:channel:456";

    // Out-of-guild `to` is refused before any send.
    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(format!(
            r#"{{"channel":"discord","sessionKey":"{session}","to":"999","text":"hi"}}"#
        ))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Forbidden);

    // The bound channel works.
    let res = client
        .post("/v1/mux/outbound/send")
        .header(ContentType::JSON)
        .header(tenant_auth())
        .body(format!(
            r#"{{"channel":"discord","sessionKey":"{session}","text":"hi"}}"#
        ))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["messageId"], "m1");
    assert_eq!(body["channelId"], "456");

    cleanup_db(&db_path);
}

#[test]
fn typing_endpoint_validates() {
    let client = server_with(test_config(&temp_db_path()));
    let res = client
        .post("/v1/mux/outbound/typing")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", format!("Bearer {TENANT_KEY}")))
        .body(r#"{"channel":"telegram"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}
