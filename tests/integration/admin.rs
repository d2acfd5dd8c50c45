use crate::common::{admin_auth, server, server_with, temp_db_path, test_config};
use rocket::http::{ContentType, Header, Status};

#[test]
fn bootstrap_requires_admin_token() {
    let client = server();
    let res = client
        .post("/v1/admin/tenants/bootstrap")
        .header(ContentType::JSON)
        .body(r#"{"tenantId":"t1","apiKey":"k1","inboundUrl":"http://127.0.0.1:9/in"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post("/v1/admin/tenants/bootstrap")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", "Bearer wrong"))
        .body(r#"{"tenantId":"t1","apiKey":"k1","inboundUrl":"http://127.0.0.1:9/in"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn bootstrap_is_404_when_admin_disabled() {
    let db_path = temp_db_path();
    let mut config = test_config(&db_path);
    config.admin_token = None;
    let client = server_with(config);
    let res = client
        .post("/v1/admin/tenants/bootstrap")
        .header(ContentType::JSON)
        .header(admin_auth())
        .body(r#"{"tenantId":"t1","apiKey":"k1","inboundUrl":"http://127.0.0.1:9/in"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn bootstrap_upserts_tenant_and_returns_inbound_token() {
    let client = server();
    let res = client
        .post("/v1/admin/tenants/bootstrap")
        .header(ContentType::JSON)
        .header(admin_auth())
        .body(r#"{"tenantId":"globex","name":"Globex","apiKey":"globex-key","inboundUrl":"http://127.0.0.1:9/in","inboundTimeoutMs":5000}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["tenantId"], "globex");
    assert_eq!(body["inboundTimeoutMs"], 5000);
    let token = body["inboundToken"].as_str().unwrap().to_string();
    assert!(token.starts_with("mit_"));

    // Re-bootstrap with a rotated key keeps the inbound token stable.
    let res = client
        .post("/v1/admin/tenants/bootstrap")
        .header(ContentType::JSON)
        .header(admin_auth())
        .body(r#"{"tenantId":"globex","apiKey":"globex-key-2","inboundUrl":"http://127.0.0.1:9/in2"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["inboundToken"], token);
    assert_eq!(body["inboundUrl"], "http://127.0.0.1:9/in2");

    // The old key no longer authenticates.
    let res = client
        .get("/v1/pairings")
        .header(Header::new("Authorization", "Bearer globex-key"))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let res = client
        .get("/v1/pairings")
        .header(Header::new("Authorization", "Bearer globex-key-2"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn bootstrap_rejects_duplicate_api_key() {
    let client = server();
    // TENANT_KEY belongs to the seeded "acme" tenant.
    let res = client
        .post("/v1/admin/tenants/bootstrap")
        .header(ContentType::JSON)
        .header(admin_auth())
        .body(r#"{"tenantId":"thief","apiKey":"acme-key","inboundUrl":"http://127.0.0.1:9/in"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn bootstrap_validates_fields() {
    let client = server();
    for body in [
        r#"{"apiKey":"k","inboundUrl":"http://x/in"}"#,
        r#"{"tenantId":"t","inboundUrl":"http://x/in"}"#,
        r#"{"tenantId":"t","apiKey":"k"}"#,
        r#"{"tenantId":"t","apiKey":"k","inboundUrl":"http://x/in","inboundTimeoutMs":0}"#,
    ] {
        let res = client
            .post("/v1/admin/tenants/bootstrap")
            .header(ContentType::JSON)
            .header(admin_auth())
            .body(body)
            .dispatch();
        assert_eq!(res.status(), Status::BadRequest, "body: {body}");
    }
}
