//! HTTP surface for the engine.
//!
//! `POST /api/v1/check` runs the full decision for the calling request's
//! headers (the reverse proxy forwards the protected request's origin
//! headers and path); the remaining endpoints are operator controls and
//! status reads.

use std::net::IpAddr;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::core::Gatekeeper;
use crate::models::{AttackStatus, RateLimitCategory, RequestMeta, ViolationType};
use crate::utils::current_millis;

pub struct ApiState {
    pub gatekeeper: Arc<Gatekeeper>,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/check").route(web::post().to(check)))
            .service(web::resource("/attack-status").route(web::get().to(attack_status)))
            .service(
                web::resource("/whitelist")
                    .route(web::post().to(whitelist_add)),
            )
            .service(
                web::resource("/whitelist/{ip}").route(web::delete().to(whitelist_remove)),
            )
            .service(web::resource("/violations").route(web::post().to(record_violation)))
            .service(web::resource("/penalties/{ip}").route(web::delete().to(penalty_reset))),
    );
}

/// Build the engine's view of the protected request from the check call.
fn request_meta(req: &HttpRequest) -> RequestMeta {
    RequestMeta {
        peer_addr: req.peer_addr().map(|addr| addr.ip()),
        real_ip: header_value(req, "x-real-ip"),
        forwarded_for: header_value(req, "x-forwarded-for"),
        user_id: header_value(req, "x-user-id"),
        path: header_value(req, "x-original-uri").unwrap_or_else(|| req.path().to_string()),
        accept: header_value(req, "accept"),
        accept_language: header_value(req, "accept-language"),
        cache_control: header_value(req, "cache-control"),
        user_agent: header_value(req, "user-agent"),
    }
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub category: RateLimitCategory,
}

#[derive(Serialize)]
struct AttackStatusResponse {
    #[serde(flatten)]
    status: AttackStatus,
    emergency: bool,
    blocked_ips: Vec<IpAddr>,
    as_of_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WhitelistRequest {
    pub ip: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ViolationRequest {
    pub ip: IpAddr,
    pub violation_type: ViolationType,
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn check(
    state: web::Data<ApiState>,
    req: HttpRequest,
    query: web::Query<CheckQuery>,
) -> impl Responder {
    let meta = request_meta(&req);
    let result = state.gatekeeper.check_limit(&meta, query.category).await;

    match result.status_code {
        200 => HttpResponse::Ok().json(result),
        403 => HttpResponse::Forbidden().json(result),
        429 => {
            let retry_after_secs = result.retry_after_ms.div_ceil(1000).max(1);
            HttpResponse::TooManyRequests()
                .insert_header(("Retry-After", retry_after_secs.to_string()))
                .json(result)
        }
        _ => HttpResponse::ServiceUnavailable().json(result),
    }
}

async fn attack_status(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(AttackStatusResponse {
        status: state.gatekeeper.attack_status(),
        emergency: state.gatekeeper.is_emergency_mode(),
        blocked_ips: state.gatekeeper.blocked_ips(),
        as_of_ms: current_millis(),
    })
}

async fn whitelist_add(
    state: web::Data<ApiState>,
    body: web::Json<WhitelistRequest>,
) -> impl Responder {
    state.gatekeeper.add_to_whitelist(body.ip);
    HttpResponse::NoContent().finish()
}

async fn whitelist_remove(
    state: web::Data<ApiState>,
    path: web::Path<IpAddr>,
) -> impl Responder {
    if state.gatekeeper.remove_from_whitelist(path.into_inner()) {
        HttpResponse::NoContent().finish()
    } else {
        HttpResponse::NotFound().finish()
    }
}

async fn record_violation(
    state: web::Data<ApiState>,
    body: web::Json<ViolationRequest>,
) -> impl Responder {
    let level = state
        .gatekeeper
        .record_violation(body.ip, body.violation_type);
    HttpResponse::Ok().json(serde_json::json!({ "penalty_level": level }))
}

async fn penalty_reset(state: web::Data<ApiState>, path: web::Path<IpAddr>) -> impl Responder {
    if state.gatekeeper.reset_penalty(path.into_inner()) {
        HttpResponse::NoContent().finish()
    } else {
        HttpResponse::NotFound().finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use crate::models::{CategoryLimit, Config, DetectionSettings};

    fn test_state() -> web::Data<ApiState> {
        let mut config = Config::default();
        config.rate_limit.auth = CategoryLimit {
            limit: 2,
            window_ms: 60_000,
        };
        config.detection = DetectionSettings {
            emergency_volume_threshold: 10_000_000,
            ..DetectionSettings::default()
        };
        web::Data::new(ApiState {
            gatekeeper: Arc::new(Gatekeeper::new(&config).unwrap()),
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app =
            test::init_service(App::new().app_data(test_state()).configure(config)).await;
        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_check_rejects_past_the_limit() {
        let app =
            test::init_service(App::new().app_data(test_state()).configure(config)).await;

        for _ in 0..2 {
            let req = test::TestRequest::post()
                .uri("/api/v1/check?category=auth")
                .insert_header(("x-real-ip", "203.0.113.5"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success());
        }

        let req = test::TestRequest::post()
            .uri("/api/v1/check?category=auth")
            .insert_header(("x-real-ip", "203.0.113.5"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 429);
        assert!(resp.headers().contains_key("retry-after"));
    }

    #[actix_web::test]
    async fn test_blacklisted_ip_gets_403() {
        let state = test_state();
        let ip: IpAddr = "203.0.113.6".parse().unwrap();
        state.gatekeeper.record_violation(ip, ViolationType::RateLimit);
        state.gatekeeper.record_violation(ip, ViolationType::RateLimit);

        let app = test::init_service(App::new().app_data(state).configure(config)).await;
        let req = test::TestRequest::post()
            .uri("/api/v1/check?category=general")
            .insert_header(("x-real-ip", "203.0.113.6"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 403);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["reason"], "IP_BLACKLISTED");
    }

    #[actix_web::test]
    async fn test_whitelist_roundtrip() {
        let state = test_state();
        let app =
            test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/whitelist")
            .set_json(WhitelistRequest {
                ip: "198.51.100.9".parse().unwrap(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 204);

        let req = test::TestRequest::delete()
            .uri("/api/v1/whitelist/198.51.100.9")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 204);

        // Removing again is a 404.
        let req = test::TestRequest::delete()
            .uri("/api/v1/whitelist/198.51.100.9")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[actix_web::test]
    async fn test_attack_status_starts_idle() {
        let app =
            test::init_service(App::new().app_data(test_state()).configure(config)).await;
        let req = test::TestRequest::get()
            .uri("/api/v1/attack-status")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["state"], "IDLE");
        assert_eq!(body["emergency"], false);
    }
}
