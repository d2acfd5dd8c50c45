use crate::common::cleanup_db;
use messaging_mux::config::Config;
use messaging_mux::db::{self, Db};
use messaging_mux::forward::InboundForwarder;
use messaging_mux::models::Tenant;
use messaging_mux::pairing;
use messaging_mux::providers::discord::{DiscordClient, DiscordPoller};
use messaging_mux::relay_log::RelayLog;
use messaging_mux::route_key::Channel;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn temp_db_path() -> String {
    format!("/tmp/mux_dc_test_{}.db", uuid::Uuid::new_v4())
}

fn poller(db_path: &str, api_base: &str) -> DiscordPoller {
    DiscordPoller {
        db: Db::new(db_path),
        client: DiscordClient::new(api_base, "dt"),
        forwarder: InboundForwarder::new(),
        log: Arc::new(RelayLog::sink()),
        account_id: "default".to_string(),
        media_max_bytes: 5 * 1024 * 1024,
        messages: Config::default().messages,
        poll_interval_ms: 2000,
    }
}

fn seed_tenant(db: &Db, inbound_url: &str) -> Tenant {
    db.upsert_tenant(
        "acme",
        "Acme",
        &db::hash_secret("acme-key"),
        Some(inbound_url),
        None,
    )
    .unwrap()
}

fn user_message(id: &str, content: &str) -> serde_json::Value {
    json!({
        "id": id,
        "content": content,
        "author": {"id": "42", "username": "ada", "bot": false},
        "timestamp": "2026-01-01T00:00:00Z",
        "attachments": []
    })
}

async fn mount_dm_channel(provider: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/users/@me/channels"))
        .and(body_partial_json(json!({"recipient_id": "42"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "chan1"})))
        .mount(provider)
        .await;
}

// --- S5: pending DM binding activates on token, then forwards ---

#[tokio::test]
async fn dm_token_activates_pending_binding_then_forwards() {
    let provider = MockServer::start().await;
    let tenant_app = MockServer::start().await;

    let db_path = temp_db_path();
    let p = poller(&db_path, &provider.uri());
    let tenant = seed_tenant(&p.db, &format!("{}/inbound", tenant_app.uri()));
    let inbound_token = tenant.inbound_token.clone().unwrap();

    let issued = match pairing::issue_token(
        &p.db,
        &Config::default(),
        &tenant,
        Channel::Discord,
        None,
        Some("discord:default:dm:user:42"),
        None,
    ) {
        Ok(issued) => issued,
        Err(_) => panic!("token issue failed"),
    };
    let pending = p
        .db
        .find_open_binding_by_route("discord", "discord:default:dm:user:42")
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, "pending");

    mount_dm_channel(&provider).await;

    // Second pass reads after the token message.
    Mock::given(method("GET"))
        .and(path("/channels/chan1/messages"))
        .and(query_param("after", "100"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([user_message("101", "hello")])),
        )
        .mount(&provider)
        .await;
    // First pass: the DM contains the pairing token.
    Mock::given(method("GET"))
        .and(path("/channels/chan1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([user_message("100", &issued.token)])),
        )
        .mount(&provider)
        .await;
    // Success notice back into the DM.
    Mock::given(method("POST"))
        .and(path("/channels/chan1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "n1"})))
        .expect(1)
        .mount(&provider)
        .await;

    p.run_pass().await.unwrap();

    let binding = p
        .db
        .find_active_binding_by_route("discord", "discord:default:dm:user:42")
        .unwrap()
        .expect("binding activated");
    assert_eq!(binding.binding_id, pending.binding_id);
    assert_eq!(
        p.db.get_offset("discord", &binding.binding_id).unwrap().as_deref(),
        Some("100")
    );

    Mock::given(method("POST"))
        .and(path("/inbound"))
        .and(header("Authorization", format!("Bearer {inbound_token}")))
        .and(body_partial_json(json!({
            "channel": "discord",
            "chatType": "direct",
            "body": "hello",
            "sessionKey": "dc:dm:42",
            "from": "42"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&tenant_app)
        .await;

    p.run_pass().await.unwrap();
    assert_eq!(
        p.db.get_offset("discord", &binding.binding_id).unwrap().as_deref(),
        Some("101")
    );

    cleanup_db(&db_path);
}

// --- Bot authors are acked without forwarding ---

#[tokio::test]
async fn bot_messages_advance_offset_without_forward() {
    let provider = MockServer::start().await;

    let db_path = temp_db_path();
    let p = poller(&db_path, &provider.uri());
    seed_tenant(&p.db, "http://127.0.0.1:9/unused");
    p.db.insert_binding("bind_1", "acme", "discord", "dm", "discord:default:dm:user:42", "active")
        .unwrap();

    mount_dm_channel(&provider).await;
    Mock::given(method("GET"))
        .and(path("/channels/chan1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "7", "content": "beep", "author": {"id": "99", "username": "bot", "bot": true}},
            {"id": "8", "content": "no author"}
        ])))
        .mount(&provider)
        .await;

    p.run_pass().await.unwrap();
    assert_eq!(p.db.get_offset("discord", "bind_1").unwrap().as_deref(), Some("8"));
    cleanup_db(&db_path);
}

// --- Ack safety per binding ---

#[tokio::test]
async fn failed_forward_keeps_offset_and_retries_next_pass() {
    let provider = MockServer::start().await;
    let tenant_app = MockServer::start().await;

    let db_path = temp_db_path();
    let p = poller(&db_path, &provider.uri());
    seed_tenant(&p.db, &format!("{}/inbound", tenant_app.uri()));
    p.db.insert_binding("bind_1", "acme", "discord", "dm", "discord:default:dm:user:42", "active")
        .unwrap();

    mount_dm_channel(&provider).await;
    Mock::given(method("GET"))
        .and(path("/channels/chan1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([user_message("50", "hi")])))
        .mount(&provider)
        .await;

    Mock::given(method("POST"))
        .and(path("/inbound"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&tenant_app)
        .await;
    Mock::given(method("POST"))
        .and(path("/inbound"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&tenant_app)
        .await;

    // run_pass itself succeeds; the binding's failure is contained.
    p.run_pass().await.unwrap();
    assert!(p.db.get_offset("discord", "bind_1").unwrap().is_none());

    p.run_pass().await.unwrap();
    assert_eq!(p.db.get_offset("discord", "bind_1").unwrap().as_deref(), Some("50"));

    cleanup_db(&db_path);
}

// --- Snowflake ordering within a page ---

#[tokio::test]
async fn page_is_processed_in_snowflake_order() {
    let provider = MockServer::start().await;
    let tenant_app = MockServer::start().await;

    let db_path = temp_db_path();
    let p = poller(&db_path, &provider.uri());
    seed_tenant(&p.db, &format!("{}/inbound", tenant_app.uri()));
    p.db.insert_binding("bind_1", "acme", "discord", "dm", "discord:default:dm:user:42", "active")
        .unwrap();

    mount_dm_channel(&provider).await;
    // Discord returns newest-first; the poller must flip to ascending.
    Mock::given(method("GET"))
        .and(path("/channels/chan1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            user_message("30", "third"),
            user_message("10", "first"),
            user_message("20", "second")
        ])))
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/inbound"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&tenant_app)
        .await;

    p.run_pass().await.unwrap();
    // Offset lands on the highest snowflake.
    assert_eq!(p.db.get_offset("discord", "bind_1").unwrap().as_deref(), Some("30"));
    cleanup_db(&db_path);
}
