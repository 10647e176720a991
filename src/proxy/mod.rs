//! Reverse proxy from public endpoints to guest services.
//!
//! Two routing modes run simultaneously on the control listener:
//!
//! - path mode: `/proxy/{machine_id}/{rest...}?port=N&...`
//! - host mode: `{machine_id}.{suffix}:{port}/{rest...}?...`
//!
//! Both resolve to the same upstream URL for a given machine, method, path
//! and query (minus the meta `port` parameter). Host-mode traffic for
//! exposed ports additionally arrives on dynamically managed per-port
//! listeners (see [`watcher`]).

pub mod watcher;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tracing::{debug, warn};
use url::Url;

use crate::config::Configuration;
use crate::error::DaemonError;
use crate::machine::service::MachineService;
use crate::machine::{Machine, MachineStatus, RuntimeType};

/// Shared proxy state.
#[derive(Clone)]
pub struct ProxyState {
    pub service: Arc<MachineService>,
    pub config: Arc<Configuration>,
    pub client: reqwest::Client,
}

impl ProxyState {
    pub fn new(service: Arc<MachineService>, config: Arc<Configuration>) -> Self {
        // Redirects are the client's business, not the proxy's
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            service,
            config,
            client,
        }
    }
}

/// Build the proxy router serving both routing modes.
pub fn build_proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/proxy/:machine_id", any(path_mode))
        .route("/proxy/:machine_id/*rest", any(path_mode_rest))
        .fallback(host_mode)
        .with_state(state)
}

/// Split a query string into pairs, dropping the meta `port` parameter.
fn forwarded_query(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    url::form_urlencoded::parse(raw.as_bytes())
        .filter(|(key, _)| key != "port")
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Choose and validate the guest port for a request.
fn resolve_port(machine: &Machine, requested: Option<u16>) -> Result<u16, DaemonError> {
    let port = match requested {
        Some(port) => port,
        None => {
            // A single exposed port is unambiguous
            if machine.exposed_ports.len() == 1 {
                machine.exposed_ports[0]
            } else {
                return Err(DaemonError::Validation(format!(
                    "machine {} needs an explicit port (exposes {} ports)",
                    machine.id,
                    machine.exposed_ports.len()
                )));
            }
        }
    };

    if port == 0 {
        return Err(DaemonError::Validation("invalid port 0".into()));
    }
    if !machine.exposed_ports.is_empty() && !machine.exposed_ports.contains(&port) {
        return Err(DaemonError::Validation(format!(
            "port {} is not exposed by machine {}",
            port, machine.id
        )));
    }

    Ok(port)
}

/// Resolve the upstream URL for a machine, rest path and query. The same
/// function serves both routing modes, which is what makes them agree.
pub fn resolve_upstream(
    machine: &Machine,
    requested_port: Option<u16>,
    rest: &str,
    query: &[(String, String)],
) -> Result<Url, DaemonError> {
    if machine.status != MachineStatus::Running {
        return Err(DaemonError::Validation(format!(
            "machine {} is {}, not running",
            machine.id, machine.status
        )));
    }

    let port = resolve_port(machine, requested_port)?;

    let (host, upstream_port) = match machine.runtime_type {
        RuntimeType::Docker => {
            // Containers publish onto loopback; the guest port must map to
            // a declared host port
            let host_port = machine.host_port_for(port).ok_or_else(|| {
                DaemonError::Validation(format!(
                    "port {} has no host mapping on machine {}",
                    port, machine.id
                ))
            })?;
            ("127.0.0.1".to_string(), host_port)
        }
        RuntimeType::Firecracker | RuntimeType::CloudHypervisor => {
            let guest_ip = machine
                .network
                .as_ref()
                .map(|n| n.guest_ip.clone())
                .ok_or_else(|| {
                    DaemonError::Validation(format!(
                        "machine {} has no guest IP",
                        machine.id
                    ))
                })?;
            (guest_ip, port)
        }
    };

    let rest = rest.trim_start_matches('/');
    let mut url = Url::parse(&format!("http://{}:{}/{}", host, upstream_port, rest))
        .map_err(|e| DaemonError::Validation(format!("malformed upstream path: {}", e)))?;

    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter());
    }

    Ok(url)
}

/// Parse `{machine_id}.{suffix}` out of a Host header value. Returns the
/// machine id and the port carried in the header, if any.
pub fn parse_host_header(host: &str, suffix: &str) -> Option<(String, Option<u16>)> {
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, port.parse::<u16>().ok()),
        None => (host, None),
    };

    let machine_id = name.strip_suffix(suffix)?.strip_suffix('.')?;
    if machine_id.is_empty() || machine_id.contains('.') {
        return None;
    }
    Some((machine_id.to_string(), port))
}

async fn path_mode(
    State(state): State<ProxyState>,
    Path(machine_id): Path<String>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    proxy_request(state, machine_id, String::new(), raw_query, method, headers, body).await
}

async fn path_mode_rest(
    State(state): State<ProxyState>,
    Path((machine_id, rest)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    proxy_request(state, machine_id, rest, raw_query, method, headers, body).await
}

/// Host-mode entry: the machine is addressed by the Host header.
async fn host_mode(
    State(state): State<ProxyState>,
    uri: Uri,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Some((machine_id, host_port)) = parse_host_header(host, &state.config.proxy.host_suffix)
    else {
        return DaemonError::BadRequest(format!(
            "host {:?} does not match *.{}",
            host, state.config.proxy.host_suffix
        ))
        .into_response();
    };

    // Host mode reads the port from the URL authority, defaulting to 80
    let port = host_port.unwrap_or(80);
    let rest = uri.path().to_string();
    let raw_query = uri.query().map(String::from);

    let machine = match state.service.get(&machine_id).await {
        Ok(machine) => machine,
        Err(e) => return e.into_response(),
    };

    let query = forwarded_query(raw_query.as_deref());
    let upstream = match resolve_upstream(&machine, Some(port), &rest, &query) {
        Ok(upstream) => upstream,
        Err(e) => return e.into_response(),
    };

    forward(&state, upstream, method, headers, body).await
}

async fn proxy_request(
    state: ProxyState,
    machine_id: String,
    rest: String,
    raw_query: Option<String>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let machine = match state.service.get(&machine_id).await {
        Ok(machine) => machine,
        Err(e) => return e.into_response(),
    };

    let requested_port = raw_query.as_deref().and_then(|raw| {
        url::form_urlencoded::parse(raw.as_bytes())
            .find(|(key, _)| key == "port")
            .and_then(|(_, value)| value.parse::<u16>().ok())
    });

    // `port=abc` must be a 400, not a silent default
    if let Some(raw) = raw_query.as_deref() {
        let has_port_param = url::form_urlencoded::parse(raw.as_bytes())
            .any(|(key, _)| key == "port");
        if has_port_param && requested_port.is_none() {
            return DaemonError::Validation("invalid port parameter".into()).into_response();
        }
    }

    let query = forwarded_query(raw_query.as_deref());
    let upstream = match resolve_upstream(&machine, requested_port, &rest, &query) {
        Ok(upstream) => upstream,
        Err(e) => return e.into_response(),
    };

    forward(&state, upstream, method, headers, body).await
}

/// Forward the request upstream and stream the response back unchanged.
async fn forward(
    state: &ProxyState,
    upstream: Url,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    debug!(upstream = %upstream, %method, "Proxying request");

    let mut request = state.client.request(method.clone(), upstream.clone());

    // The upstream gets its own host and framing headers
    for (name, value) in headers.iter() {
        if name == "host" || name == "content-length" {
            continue;
        }
        request = request.header(name, value);
    }

    if method != Method::GET && method != Method::HEAD {
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                request = request.body(bytes);
            }
            Err(e) => {
                return DaemonError::BadRequest(format!("unreadable request body: {}", e))
                    .into_response();
            }
        }
    }

    let upstream_response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(upstream = %upstream, error = %e, "Upstream request failed");
            let error = if e.is_timeout() {
                DaemonError::Timeout(format!("upstream {}", upstream))
            } else {
                DaemonError::Runtime(format!("upstream request failed: {}", e))
            };
            return error.into_response();
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response_builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers().iter() {
        response_builder = response_builder.header(name, value);
    }

    let stream = upstream_response.bytes_stream();
    response_builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            DaemonError::Internal(format!("failed to assemble response: {}", e)).into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::NetworkAttachment;
    use chrono::Utc;

    fn machine(runtime_type: RuntimeType, status: MachineStatus) -> Machine {
        Machine {
            id: "m1".into(),
            name: "m1".into(),
            status,
            runtime_type,
            vcpu_count: 1,
            mem_size_mib: 64,
            kernel_image_path: String::new(),
            rootfs_path: String::new(),
            network: None,
            exposed_ports: vec![],
            image: String::new(),
            container_id: None,
            socket_path: None,
            pid: None,
            config_json: serde_json::Value::Null,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn docker_machine() -> Machine {
        let mut m = machine(RuntimeType::Docker, MachineStatus::Running);
        m.config_json = serde_json::json!({
            "ports": [{"hostPort": 41234, "containerPort": 80}]
        });
        m
    }

    fn firecracker_machine() -> Machine {
        let mut m = machine(RuntimeType::Firecracker, MachineStatus::Running);
        m.network = Some(NetworkAttachment {
            tap: "hftap0".into(),
            tap_ip: "172.16.0.1".into(),
            guest_ip: "172.16.0.2".into(),
            guest_mac: "aa:fc:ac:10:00:02".into(),
        });
        m.exposed_ports = vec![8080];
        m
    }

    #[test]
    fn test_docker_upstream_uses_host_port_mapping() {
        let query = vec![("foo".to_string(), "bar".to_string())];
        let url = resolve_upstream(&docker_machine(), Some(80), "hello", &query).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:41234/hello?foo=bar");
    }

    #[test]
    fn test_firecracker_upstream_uses_guest_ip() {
        let query = vec![("foo".to_string(), "bar".to_string())];
        let url = resolve_upstream(&firecracker_machine(), Some(8080), "hello", &query).unwrap();
        assert_eq!(url.as_str(), "http://172.16.0.2:8080/hello?foo=bar");
    }

    #[test]
    fn test_unexposed_port_rejected() {
        let err = resolve_upstream(&firecracker_machine(), Some(9090), "hello", &[]).unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
        assert_eq!(err.tag(), "validation");
    }

    #[test]
    fn test_single_exposed_port_is_default() {
        let url = resolve_upstream(&firecracker_machine(), None, "x", &[]).unwrap();
        assert_eq!(url.port(), Some(8080));

        // With several exposed ports, omission is ambiguous
        let mut multi = firecracker_machine();
        multi.exposed_ports = vec![8080, 9090];
        assert!(resolve_upstream(&multi, None, "x", &[]).is_err());
    }

    #[test]
    fn test_not_running_rejected() {
        let stopped = machine(RuntimeType::Docker, MachineStatus::Stopped);
        assert!(resolve_upstream(&stopped, Some(80), "", &[]).is_err());
    }

    #[test]
    fn test_missing_guest_ip_rejected() {
        let mut m = machine(RuntimeType::Firecracker, MachineStatus::Running);
        m.exposed_ports = vec![8080];
        let err = resolve_upstream(&m, Some(8080), "x", &[]).unwrap_err();
        assert!(err.to_string().contains("guest IP"));
    }

    #[test]
    fn test_unmapped_container_port_rejected() {
        let err = resolve_upstream(&docker_machine(), Some(81), "x", &[]).unwrap_err();
        assert!(err.to_string().contains("host mapping"));
    }

    #[test]
    fn test_host_and_path_mode_agree() {
        // The same machine, path and query resolve identically whichever
        // mode produced the call
        let m = firecracker_machine();
        let query = vec![("foo".to_string(), "bar".to_string())];

        let from_path_mode = resolve_upstream(&m, Some(8080), "hello", &query).unwrap();
        let from_host_mode = resolve_upstream(&m, Some(8080), "/hello", &query).unwrap();
        assert_eq!(from_path_mode, from_host_mode);
    }

    #[test]
    fn test_forwarded_query_strips_port() {
        let pairs = forwarded_query(Some("port=8080&foo=bar&baz=1"));
        assert_eq!(
            pairs,
            vec![
                ("foo".to_string(), "bar".to_string()),
                ("baz".to_string(), "1".to_string())
            ]
        );
        assert!(forwarded_query(None).is_empty());
    }

    #[test]
    fn test_parse_host_header() {
        assert_eq!(
            parse_host_header("m1.palmframe.com:8080", "palmframe.com"),
            Some(("m1".to_string(), Some(8080)))
        );
        assert_eq!(
            parse_host_header("m1.palmframe.com", "palmframe.com"),
            Some(("m1".to_string(), None))
        );
        assert_eq!(parse_host_header("palmframe.com", "palmframe.com"), None);
        assert_eq!(parse_host_header("m1.other.com", "palmframe.com"), None);
        assert_eq!(
            parse_host_header("a.b.palmframe.com", "palmframe.com"),
            None
        );
    }
}
