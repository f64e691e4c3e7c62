//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::State,
    response::{IntoResponse, Json},
};

pub async fn handle_health() -> &'static str {
    "ok"
}

/// Current interval groups and their members.
pub async fn handle_schedule(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.snapshot().await)
}

#[cfg(test)]
mod tests {
    use crate::config::ServerConfig;
    use crate::scheduler::Scheduler;
    use crate::testutil::{spawn_server, temp_store, test_monitor, test_runner};
    use crate::web::Server;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_and_schedule() {
        let (_tmp, store) = temp_store();
        let mut monitor = test_monitor("http://127.0.0.1:1/", 300);
        store.add_monitor(&mut monitor).unwrap();

        let runner = Arc::new(test_runner(store.clone(), 3));
        let scheduler = Scheduler::new(store, runner, Default::default());
        scheduler.start().await.unwrap();

        let server = Server::new(ServerConfig::default(), scheduler.clone());
        let addr = spawn_server(server.routes()).await;

        let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "ok");

        let groups: serde_json::Value = reqwest::get(format!("http://{}/api/schedule", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(groups[0]["interval_seconds"], 300);
        assert_eq!(groups[0]["monitor_ids"][0], monitor.id);

        scheduler.stop().await;
    }
}
