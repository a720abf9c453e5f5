//! Public HTTP surface: lambda dispatch on `/a/`, `/l/`, `/q/` and the
//! admin JSON-RPC endpoint on `/u/`.

pub mod auth;
pub mod dispatch;
pub mod rpc;

use axum::http::header::{HeaderName, HeaderValue};
use axum::routing::{any, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::state::AppState;

/// Build the full router. `dev` relaxes CORS on the admin endpoint;
/// production responses carry conservative security headers instead.
pub fn router(state: &AppState) -> Router<AppState> {
    // the dispatch routes are deliberately open: policy decides per lambda
    let open_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let dispatch = Router::new()
        .route("/a/:uid", any(dispatch::by_uid))
        .route("/a/:uid/*rest", any(dispatch::by_uid))
        .route("/l/:alias", any(dispatch::by_alias))
        .route("/l/:alias/*rest", any(dispatch::by_alias))
        .route("/q/:queue", any(dispatch::enqueue))
        .layer(open_cors.clone());

    let admin = Router::new().route("/u/", post(rpc::handle));
    let admin = if state.dev {
        admin.layer(open_cors)
    } else {
        admin
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("x-frame-options"),
                HeaderValue::from_static("SAMEORIGIN"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("x-content-type-options"),
                HeaderValue::from_static("nosniff"),
            ))
    };

    dispatch
        .merge(admin)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
