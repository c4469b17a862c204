use std::io::Read;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{info, warn};

use crate::plan::calculator;
use crate::plan::model::{
    ApiError, CalculateRequest, CalculateResponse, Parameters, Preferences, PreferencesSaved,
    format_clock_time, validate_parameters, validate_request,
};

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

/// The calculation service. Owns the HTTP loop thread and the in-memory
/// preferences, which reset whenever the process restarts.
pub struct ApiServer {
    pub preferences: Arc<Mutex<Preferences>>,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let local_addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow::anyhow!("API server has no IP listen address"))?;
        let preferences = Arc::new(Mutex::new(Preferences::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let preferences_for_thread = Arc::clone(&preferences);
        let stop_for_thread = Arc::clone(&stop);
        let http_join =
            thread::spawn(move || run_server_loop(server, preferences_for_thread, stop_for_thread));
        info!(%local_addr, "calculation API listening");

        Ok(Self {
            preferences,
            local_addr,
            stop,
            http_join: Some(http_join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocks until the HTTP loop exits, which for a served process means
    /// until the process is killed.
    pub fn wait(mut self) {
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(server: Server, preferences: Arc<Mutex<Preferences>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &preferences),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

fn handle_request(mut request: tiny_http::Request, preferences: &Arc<Mutex<Preferences>>) {
    let Some(remote_addr) = request.remote_addr() else {
        let _ = send_text(request, StatusCode(400), "missing remote address");
        return;
    };
    if !is_local_network_ip(remote_addr.ip()) {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return;
    }

    let url = request.url().to_string();
    let (path, query) = split_path_query(&url);
    let method = request.method().clone();
    info!(%method, path, "api request");

    match (path, method) {
        ("/api/v1/calculate", Method::Post) => {
            let mut body = String::new();
            if request.as_reader().read_to_string(&mut body).is_err() {
                let _ = send_text(request, StatusCode(400), "unreadable request body");
                return;
            }
            match serde_json::from_str::<CalculateRequest>(&body) {
                Ok(calc_request) => respond_with_calculation(request, &calc_request),
                Err(err) => {
                    let _ = send_json(
                        request,
                        StatusCode(422),
                        &ApiError {
                            detail: format!("invalid request body: {err}"),
                        },
                    );
                }
            }
        }
        ("/api/v1/calculate/quick", Method::Get) => {
            let Some(wake_time) = query_param(query, "wake_time").filter(|v| !v.is_empty())
            else {
                let _ = send_json(
                    request,
                    StatusCode(422),
                    &ApiError {
                        detail: "wake_time query parameter is required".to_string(),
                    },
                );
                return;
            };
            let defaults = snapshot(preferences);
            let calc_request = CalculateRequest {
                wake_time: percent_decode(wake_time),
                sleep_latency_min: defaults.sleep_latency_min,
                cycle_length_min: defaults.cycle_length_min,
                min_cycles: defaults.min_cycles,
                max_cycles: defaults.max_cycles,
            };
            respond_with_calculation(request, &calc_request);
        }
        ("/api/v1/preferences", Method::Get) => {
            let current = snapshot(preferences);
            let _ = send_json(request, StatusCode(200), &current);
        }
        ("/api/v1/preferences", Method::Post) => {
            let mut body = String::new();
            if request.as_reader().read_to_string(&mut body).is_err() {
                let _ = send_text(request, StatusCode(400), "unreadable request body");
                return;
            }
            match serde_json::from_str::<Preferences>(&body) {
                Ok(incoming) => match validate_parameters(
                    incoming.sleep_latency_min,
                    incoming.cycle_length_min,
                    incoming.min_cycles,
                    incoming.max_cycles,
                ) {
                    Ok(()) => {
                        store(preferences, incoming.clone());
                        let _ = send_json(
                            request,
                            StatusCode(200),
                            &PreferencesSaved {
                                message: "Preferences saved successfully".to_string(),
                                preferences: incoming,
                            },
                        );
                    }
                    Err(err) => {
                        let _ = send_json(
                            request,
                            StatusCode(422),
                            &ApiError {
                                detail: err.to_string(),
                            },
                        );
                    }
                },
                Err(err) => {
                    let _ = send_json(
                        request,
                        StatusCode(422),
                        &ApiError {
                            detail: format!("invalid request body: {err}"),
                        },
                    );
                }
            }
        }
        ("/api/v1/preferences", Method::Delete) => {
            let defaults = Preferences::default();
            store(preferences, defaults.clone());
            let _ = send_json(
                request,
                StatusCode(200),
                &PreferencesSaved {
                    message: "Preferences reset to defaults".to_string(),
                    preferences: defaults,
                },
            );
        }
        ("/", Method::Get) | ("/health", Method::Get) => {
            #[derive(Serialize)]
            struct HealthResponse {
                status: &'static str,
                version: &'static str,
            }
            let _ = send_json(
                request,
                StatusCode(200),
                &HealthResponse {
                    status: "healthy",
                    version: API_VERSION,
                },
            );
        }
        (
            "/api/v1/calculate" | "/api/v1/calculate/quick" | "/api/v1/preferences" | "/"
            | "/health",
            _,
        ) => {
            let _ = send_text(request, StatusCode(405), "method not allowed");
        }
        _ => {
            let _ = send_text(request, StatusCode(404), "not found");
        }
    }
}

fn respond_with_calculation(request: tiny_http::Request, calc_request: &CalculateRequest) {
    match validate_request(calc_request) {
        Ok(wake) => {
            let options = calculator::calculate(
                wake,
                calc_request.sleep_latency_min,
                calc_request.cycle_length_min,
                calc_request.min_cycles,
                calc_request.max_cycles,
            );
            let payload = CalculateResponse {
                wake_time: format_clock_time(wake),
                options,
                parameters: Parameters {
                    sleep_latency_min: calc_request.sleep_latency_min,
                    cycle_length_min: calc_request.cycle_length_min,
                },
            };
            let _ = send_json(request, StatusCode(200), &payload);
        }
        Err(err) => {
            warn!(reason = %err, "rejected calculation request");
            let _ = send_json(
                request,
                StatusCode(422),
                &ApiError {
                    detail: err.to_string(),
                },
            );
        }
    }
}

fn snapshot(preferences: &Arc<Mutex<Preferences>>) -> Preferences {
    preferences
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default()
}

fn store(preferences: &Arc<Mutex<Preferences>>, value: Preferences) {
    if let Ok(mut guard) = preferences.lock() {
        *guard = value;
    }
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = header("Content-Type", "application/json; charset=utf-8")?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = header("Content-Type", "text/plain; charset=utf-8")?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn header(field: &str, value: &str) -> Result<Header> {
    Header::from_bytes(field.as_bytes(), value.as_bytes())
        .map_err(|()| anyhow::anyhow!("failed to build {field} header"))
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k == key {
            return Some(v);
        }
    }
    None
}

/// Decodes `%XX` sequences in a query value. Malformed sequences pass
/// through untouched and land in the validator's error message.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            decoded.push(hi * 16 + lo);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::client::ApiClient;
    use crate::plan::model::DEFAULT_SLEEP_LATENCY_MIN;

    fn start_test_server() -> ApiServer {
        ApiServer::start(ApiServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
        })
        .expect("start server")
    }

    fn client_for(server: &ApiServer) -> ApiClient {
        ApiClient::new(format!("http://{}", server.local_addr())).expect("client")
    }

    #[test]
    fn local_network_ip_filter_accepts_private_and_loopback() {
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(
            192, 168, 1, 44
        ))));
        assert!(is_local_network_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_local_network_ip(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn query_param_extracts_value() {
        let query = "wake_time=07:30&foo=bar";
        assert_eq!(query_param(query, "wake_time"), Some("07:30"));
        assert_eq!(query_param(query, "foo"), Some("bar"));
        assert_eq!(query_param(query, "missing"), None);
    }

    #[test]
    fn percent_decode_handles_any_encoded_byte() {
        assert_eq!(percent_decode("07%3A30"), "07:30");
        assert_eq!(percent_decode("07%3a30"), "07:30");
        assert_eq!(percent_decode("%30%37:30"), "07:30");
        assert_eq!(percent_decode("07:30"), "07:30");
        // Truncated and non-hex sequences pass through untouched.
        assert_eq!(percent_decode("bad%2"), "bad%2");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }

    #[test]
    fn split_path_query_separates_components() {
        assert_eq!(
            split_path_query("/api/v1/calculate/quick?wake_time=07:30"),
            ("/api/v1/calculate/quick", "wake_time=07:30")
        );
        assert_eq!(split_path_query("/health"), ("/health", ""));
    }

    #[test]
    fn calculate_endpoint_returns_reference_options() {
        let server = start_test_server();
        let client = client_for(&server);

        let response = client
            .calculate(&CalculateRequest {
                wake_time: "07:30".to_string(),
                sleep_latency_min: 15,
                cycle_length_min: 90,
                min_cycles: 4,
                max_cycles: 6,
            })
            .expect("calculation succeeds");

        assert_eq!(response.wake_time, "07:30");
        assert_eq!(response.options.len(), 3);
        assert_eq!(response.options[0].cycles, 6);
        assert_eq!(response.options[0].bedtime, "22:45");
        assert_eq!(response.options[1].bedtime, "00:15");
        assert_eq!(response.options[2].bedtime, "01:45");
        assert_eq!(
            response
                .options
                .iter()
                .filter(|option| option.recommended)
                .count(),
            1
        );
        assert_eq!(response.parameters.sleep_latency_min, 15);
    }

    #[test]
    fn invalid_request_surfaces_the_field_in_detail() {
        let server = start_test_server();
        let client = client_for(&server);

        let err = client
            .calculate(&CalculateRequest {
                wake_time: "07:30".to_string(),
                sleep_latency_min: 61,
                cycle_length_min: 90,
                min_cycles: 4,
                max_cycles: 6,
            })
            .expect_err("validation failure");
        assert!(err.to_string().contains("sleep_latency_min"), "{err}");
    }

    #[test]
    fn quick_endpoint_uses_the_stored_preferences() {
        let server = start_test_server();
        let client = client_for(&server);

        client
            .set_preferences(&Preferences {
                sleep_latency_min: 0,
                cycle_length_min: 100,
                min_cycles: 5,
                max_cycles: 5,
            })
            .expect("save");

        let url = format!(
            "http://{}/api/v1/calculate/quick?wake_time=07%3A30",
            server.local_addr()
        );
        let response = reqwest::blocking::get(url)
            .expect("quick request")
            .json::<CalculateResponse>()
            .expect("decode response");

        assert_eq!(response.wake_time, "07:30");
        assert_eq!(response.options.len(), 1);
        assert_eq!(response.options[0].cycles, 5);
        // 5 * 100 - 0 = 500 min of sleep; 07:30 minus 8h20m is 23:10.
        assert_eq!(response.options[0].total_sleep_minutes, 500);
        assert_eq!(response.options[0].bedtime, "23:10");
        assert_eq!(response.parameters.cycle_length_min, 100);
    }

    #[test]
    fn preferences_roundtrip_and_reset() {
        let server = start_test_server();
        let client = client_for(&server);

        assert_eq!(
            client.get_preferences().expect("defaults"),
            Preferences::default()
        );

        let custom = Preferences {
            sleep_latency_min: 20,
            cycle_length_min: 85,
            min_cycles: 5,
            max_cycles: 6,
        };
        let saved = client.set_preferences(&custom).expect("save");
        assert_eq!(saved.preferences, custom);
        assert_eq!(client.get_preferences().expect("stored"), custom);

        let reset = client.reset_preferences().expect("reset");
        assert_eq!(
            reset.preferences.sleep_latency_min,
            DEFAULT_SLEEP_LATENCY_MIN
        );
        assert_eq!(
            client.get_preferences().expect("defaults again"),
            Preferences::default()
        );
    }

    #[test]
    fn rejected_preferences_do_not_replace_the_stored_ones() {
        let server = start_test_server();
        let client = client_for(&server);

        let err = client
            .set_preferences(&Preferences {
                sleep_latency_min: 15,
                cycle_length_min: 90,
                min_cycles: 8,
                max_cycles: 4,
            })
            .expect_err("min over max");
        assert!(err.to_string().contains("min_cycles"), "{err}");
        assert_eq!(
            client.get_preferences().expect("unchanged"),
            Preferences::default()
        );
    }
}
