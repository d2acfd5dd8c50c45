// Route module decomposition — each surface area in its own file.
// Shared request guards and catchers live here; route functions in submodules.

mod admin;
mod outbound;
mod pairings;
mod system;
mod tenant;

pub use admin::bootstrap_tenant;
pub use outbound::{outbound_send, outbound_typing};
pub use pairings::{claim_pairing, issue_pairing_token, list_pairings, unbind_pairing};
pub use system::{bad_request, health, internal_error, not_found, unauthorized, unprocessable};
pub use tenant::{get_inbound_target, set_inbound_target};

use crate::config::Config;
use crate::db::{self, Db};
use crate::models::Tenant;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

fn bearer_token<'r>(req: &'r Request<'_>) -> Option<&'r str> {
    req.headers()
        .get_one("Authorization")
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticated tenant: `Authorization: Bearer <apiKey>` hashed and matched
/// against an active tenant row. The raw key is hashed immediately and never
/// stored or logged.
pub struct TenantAuth(pub Tenant);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for TenantAuth {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(database) = req.rocket().state::<Db>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let Some(token) = bearer_token(req) else {
            return Outcome::Error((Status::Unauthorized, ()));
        };
        match database.find_tenant_by_key_hash(&db::hash_secret(token)) {
            Ok(Some(tenant)) => Outcome::Success(TenantAuth(tenant)),
            Ok(None) => Outcome::Error((Status::Unauthorized, ())),
            Err(_) => Outcome::Error((Status::InternalServerError, ())),
        }
    }
}

/// Admin bearer. With no `ADMIN_TOKEN` configured the admin surface does not
/// exist: requests 404 rather than reveal the endpoint.
pub struct AdminAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminAuth {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(config) = req.rocket().state::<Config>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let Some(expected) = config.admin_token.as_deref() else {
            return Outcome::Error((Status::NotFound, ()));
        };
        match bearer_token(req) {
            Some(token) if token == expected => Outcome::Success(AdminAuth),
            _ => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

/// Optional `Idempotency-Key` header. Always succeeds.
pub struct IdempotencyKey(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for IdempotencyKey {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let key = req
            .headers()
            .get_one("Idempotency-Key")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        Outcome::Success(IdempotencyKey(key))
    }
}
