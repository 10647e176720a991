//! HTTP router.
//!
//! The public REST surface over the machine service: machine CRUD and
//! lifecycle actions, guest exec and file operations, and health/system
//! introspection. Handlers stay thin; every decision lives in the service.

mod files;
mod machines;
mod system;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Configuration;
use crate::machine::service::MachineService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MachineService>,
    pub config: Arc<Configuration>,
}

/// Build the HTTP router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/system", get(system::system_info))
        .route("/machines", get(machines::list_machines))
        .route("/machines", post(machines::create_machine))
        .nest("/machines/:machine_id", machine_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Routes for individual machine operations.
fn machine_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(machines::get_machine))
        .route("/", delete(machines::delete_machine))
        .route("/start", post(machines::start_machine))
        .route("/stop", post(machines::stop_machine))
        .route("/restart", post(machines::restart_machine))
        .route("/pause", post(machines::pause_machine))
        .route("/resume", post(machines::resume_machine))
        .route("/snapshot", post(machines::snapshot_machine))
        .route("/exec", post(machines::exec_in_machine))
        .route("/logs", get(machines::machine_logs))
        .route("/files", post(files::upload_file))
        .route("/files", get(files::download_file))
        .route("/files", delete(files::delete_file))
        .route("/files/stat", get(files::stat_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::database::Database;
    use crate::error::Result as DaemonResult;
    use crate::machine::registry::RuntimeRegistry;
    use crate::machine::service::{DriverFactory, MachineService};
    use crate::machine::Machine;
    use crate::runtime::{ExecOutput, InstanceInfo, RuntimeDriver};

    /// Always-healthy stand-in runtime for HTTP-level tests.
    struct StubDriver;

    #[async_trait]
    impl RuntimeDriver for StubDriver {
        async fn start(&self) -> DaemonResult<()> {
            Ok(())
        }

        async fn pause(&self) -> DaemonResult<()> {
            Ok(())
        }

        async fn resume(&self) -> DaemonResult<()> {
            Ok(())
        }

        async fn shutdown(&self, _timeout: Duration) -> DaemonResult<()> {
            Ok(())
        }

        async fn stop(&self) -> DaemonResult<()> {
            Ok(())
        }

        async fn info(&self) -> DaemonResult<InstanceInfo> {
            Ok(InstanceInfo {
                id: "stub-container".into(),
                status: "running".into(),
                pid: Some(7),
            })
        }

        async fn exec(&self, cmd: &[String], _timeout: Duration) -> DaemonResult<ExecOutput> {
            if cmd.join(" ") == "sh -c exit 42" {
                return Ok(ExecOutput {
                    exit_code: 42,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            Ok(ExecOutput {
                exit_code: 0,
                stdout: "hello from container\n".into(),
                stderr: String::new(),
            })
        }

        fn pid(&self) -> Option<i64> {
            Some(7)
        }

        async fn is_running(&self) -> bool {
            true
        }

        async fn wait_exit(&self) -> Option<i64> {
            // Keep the exit monitor parked for the duration of a test
            tokio::time::sleep(Duration::from_secs(3600)).await;
            None
        }

        async fn upload_file(
            &self,
            _path: &str,
            _content: &[u8],
            _timeout: Duration,
        ) -> DaemonResult<()> {
            Ok(())
        }

        async fn download_file(&self, _path: &str, _timeout: Duration) -> DaemonResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn stat_file(
            &self,
            _path: &str,
            _timeout: Duration,
        ) -> DaemonResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn delete_file(&self, _path: &str, _timeout: Duration) -> DaemonResult<()> {
            Ok(())
        }

        async fn logs(&self, _tail: usize) -> DaemonResult<Vec<String>> {
            Ok(vec!["booted".into()])
        }
    }

    struct StubFactory;

    impl DriverFactory for StubFactory {
        fn create(&self, _machine: &Machine) -> DaemonResult<Arc<dyn RuntimeDriver>> {
            Ok(Arc::new(StubDriver))
        }
    }

    fn app() -> Router {
        let config = Arc::new(Configuration::default());
        let service = Arc::new(MachineService::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(RuntimeRegistry::new()),
            None,
            Arc::clone(&config),
            Arc::new(StubFactory),
        ));
        build_router(AppState { service, config })
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn docker_spec() -> serde_json::Value {
        serde_json::json!({
            "name": "test-docker-machine",
            "runtime_type": "docker",
            "vcpu_count": 1,
            "mem_size_mib": 64,
            "kernel_image_path": "",
            "image": "alpine:3.19",
            "cmd": ["sleep", "300"],
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = request(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_then_start_docker_machine() {
        let app = app();

        let (status, created) = request(&app, "POST", "/machines", Some(docker_spec())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["runtime_type"], "docker");
        assert_eq!(created["image"], "alpine:3.19");

        let id = created["id"].as_str().unwrap();
        let (status, started) =
            request(&app, "POST", &format!("/machines/{}/start", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["status"], "running");
        assert_eq!(started["container_id"], "stub-container");
    }

    #[tokio::test]
    async fn test_exec_round_trips_exit_codes() {
        let app = app();

        let (_, created) = request(&app, "POST", "/machines", Some(docker_spec())).await;
        let id = created["id"].as_str().unwrap();
        request(&app, "POST", &format!("/machines/{}/start", id), None).await;

        let (status, output) = request(
            &app,
            "POST",
            &format!("/machines/{}/exec", id),
            Some(serde_json::json!({"cmd": ["echo", "hello from container"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(output["exit_code"], 0);
        assert_eq!(output["stdout"], "hello from container\n");
        assert_eq!(output["stderr"], "");

        let (status, output) = request(
            &app,
            "POST",
            &format!("/machines/{}/exec", id),
            Some(serde_json::json!({"cmd": ["sh", "-c", "exit 42"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(output["exit_code"], 42);
    }

    #[tokio::test]
    async fn test_unknown_machine_is_404_with_tag() {
        let app = app();
        let (status, body) = request(&app, "GET", "/machines/non-existent-id", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert!(body["message"].as_str().unwrap().contains("non-existent-id"));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_400_with_tag() {
        let app = app();
        let (status, body) = request(
            &app,
            "POST",
            "/machines",
            Some(serde_json::json!({
                "name": "",
                "runtime_type": "docker",
                "image": "alpine:3.19",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn test_create_delete_get_yields_404() {
        let app = app();

        let (_, created) = request(&app, "POST", "/machines", Some(docker_spec())).await;
        let id = created["id"].as_str().unwrap();

        let (status, _) = request(&app, "DELETE", &format!("/machines/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = request(&app, "GET", &format!("/machines/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_list_filter_validation() {
        let app = app();
        let (status, body) = request(&app, "GET", "/machines?status=sideways", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");

        let (status, body) = request(&app, "GET", "/machines?status=running", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_logs_route() {
        let app = app();

        let (_, created) = request(&app, "POST", "/machines", Some(docker_spec())).await;
        let id = created["id"].as_str().unwrap();
        request(&app, "POST", &format!("/machines/{}/start", id), None).await;

        let (status, body) =
            request(&app, "GET", &format!("/machines/{}/logs?tail=5", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lines"][0], "booted");
    }
}
