use actix_web::{web, HttpResponse};
use sales_event_schema::SaleEvent;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{encode_error, BridgeError};
use crate::{metrics, AppState, PurchaseResponse};

/// `POST /purchase`
///
/// The body is decoded with the shared schema so malformed input is rejected here, before it
/// reaches the log. The append runs under `publish_timeout`.
pub async fn purchase(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, BridgeError> {
    let result = publish(&state, &body).await;
    match &result {
        Ok(_) => metrics::record_purchase("processed"),
        Err(e) => {
            warn!(error = %e, "Purchase rejected");
            metrics::record_purchase(e.outcome());
        }
    }
    result
}

async fn publish(state: &AppState, body: &[u8]) -> Result<HttpResponse, BridgeError> {
    let event = SaleEvent::decode(body)?;
    let payload = event.encode().map_err(encode_error)?;

    let started = Instant::now();
    match tokio::time::timeout(state.publish_timeout, state.log.append(payload)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(BridgeError::PublishTimeout(
                state.publish_timeout.as_millis() as u64,
            ))
        }
    }
    metrics::observe_publish(started.elapsed());

    info!(
        "Sale accepted: category={}, product={}, price={:.2}, quantity={}",
        event.category_name(),
        event.product_id(),
        event.price(),
        event.quantity()
    );

    Ok(HttpResponse::Ok().json(PurchaseResponse {
        status: "processed".to_string(),
        success: true,
    }))
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/purchase", web::post().to(purchase))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::serve_metrics));
}
