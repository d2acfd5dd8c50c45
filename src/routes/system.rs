use rocket::get;
use rocket::http::Status;
use rocket::serde::json::Json;

#[get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

#[rocket::catch(400)]
pub fn bad_request() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": false, "error": "bad request"}))
}

#[rocket::catch(401)]
pub fn unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": false, "error": "unauthorized"}))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": false, "error": "not found"}))
}

#[rocket::catch(500)]
pub fn internal_error() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": false, "error": "internal error"}))
}

// Rocket emits 422 for JSON bodies that parse but don't fit the DTO; the API
// contract calls that a plain validation failure.
#[rocket::catch(422)]
pub fn unprocessable() -> (Status, Json<serde_json::Value>) {
    (
        Status::BadRequest,
        Json(serde_json::json!({"ok": false, "error": "invalid request body"})),
    )
}
