pub mod controllers;
pub mod error;
pub mod machines;
pub mod networks;
pub mod settings;

use axum::Router;

use crate::app_state::AppState;

/// 所有 API 路由（统一入口）
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/networks", networks::routes())
        .nest("/controllers", controllers::routes())
        .nest("/machines", machines::routes())
        .nest("/settings", settings::routes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        api_routes().with_state(AppState::for_tests())
    }

    #[tokio::test]
    async fn test_unknown_controller_is_404() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/controllers/rack-9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dhcp_on_unknown_vlan_is_404() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/networks/vlans/1/dhcp")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"dhcp_on": true, "primary_rack": "rack-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_power_unknown_machine_is_404() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/machines/m-404/power")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"action": "on"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_vid_is_400() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/networks/vlans")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"fabric_id": 1, "vid": 5000}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_settings() {
        let response = app()
            .oneshot(Request::builder().uri("/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
