//! # Health Check
//!
//! Liveness probe for load balancers and orchestrators. It deliberately
//! checks nothing: a process that can answer HTTP is alive, whether or not
//! any model has been loaded yet.

use actix_web::HttpResponse;
use serde_json::json;

/// `GET /healthz`
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_healthz_reports_ok() {
        let app =
            test::init_service(App::new().route("/healthz", web::get().to(health_check))).await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({ "status": "ok" }));
    }
}
