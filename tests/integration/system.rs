use crate::common::server;
use rocket::http::Status;

#[test]
fn health_is_open() {
    let client = server();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["ok"], true);
}

#[test]
fn unknown_route_is_json_404() {
    let client = server();
    let res = client.get("/v1/nope").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["ok"], false);
}
