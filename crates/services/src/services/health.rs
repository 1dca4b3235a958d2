use std::{sync::Arc, time::Duration};

use reqwest::{Client, redirect};
use serde::Serialize;
use url::Url;

use super::container_runtime::ContainerRuntime;

/// Exit code of the container probe script when the image has no HTTP client.
const NO_HTTP_CLIENT_EXIT: i32 = 127;
const NO_HTTP_CLIENT_MESSAGE: &str = "no HTTP client in container (needs curl, wget or bash)";

/// Classified outcome of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub message: String,
}

impl ProbeResult {
    fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }

    fn from_status(code: u16) -> Self {
        if (200..400).contains(&code) {
            Self::healthy(format!("HTTP {code}"))
        } else {
            Self::unhealthy(format!("HTTP {code}"))
        }
    }
}

/// Issues one GET per probe, directly or from inside a container.
///
/// Probes never fail: transport errors and timeouts become unhealthy results.
/// Messages avoid timings so repeated identical outcomes compare equal.
#[derive(Clone)]
pub struct HealthProber {
    client: Client,
    timeout: Duration,
    runtime: Arc<dyn ContainerRuntime>,
}

impl HealthProber {
    pub fn new(timeout: Duration, runtime: Arc<dyn ContainerRuntime>) -> Self {
        // Redirects count as healthy as-is, so never follow them.
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build probe client, using defaults: {}", e);
                Client::new()
            });
        Self {
            client,
            timeout,
            runtime,
        }
    }

    pub async fn probe(&self, url: &str, via_container: Option<&str>) -> ProbeResult {
        let result = match via_container {
            Some(container) => self.probe_in_container(url, container).await,
            None => self.probe_direct(url).await,
        };
        tracing::debug!(
            url,
            container = ?via_container,
            healthy = result.healthy,
            "{}",
            result.message
        );
        result
    }

    async fn probe_direct(&self, url: &str) -> ProbeResult {
        match tokio::time::timeout(self.timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) => ProbeResult::from_status(response.status().as_u16()),
            Ok(Err(e)) if e.is_timeout() => self.timed_out(),
            Ok(Err(e)) if e.is_connect() => ProbeResult::unhealthy("connection refused"),
            Ok(Err(e)) if e.is_builder() => ProbeResult::unhealthy(format!("invalid URL: {url}")),
            Ok(Err(e)) => ProbeResult::unhealthy(format!("request failed: {}", root_cause(&e))),
            Err(_) => self.timed_out(),
        }
    }

    async fn probe_in_container(&self, url: &str, container: &str) -> ProbeResult {
        let Some(script) = container_probe_script(url, self.timeout.as_secs().max(1)) else {
            return ProbeResult::unhealthy(format!("invalid URL: {url}"));
        };
        let args = vec![
            "exec".to_string(),
            container.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script,
        ];

        // Slack over the client's own limit for the exec round trip.
        let budget = self.timeout + Duration::from_secs(2);
        let output = match tokio::time::timeout(budget, self.runtime.invoke(&args)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ProbeResult::unhealthy(format!("container probe failed: {e}")),
            Err(_) => return self.timed_out(),
        };

        match output.stdout.trim().parse::<u16>() {
            Ok(0) | Err(_) if output.code == Some(28) => self.timed_out(),
            Ok(0) => ProbeResult::unhealthy("connection refused"),
            Ok(code) => ProbeResult::from_status(code),
            Err(_) if output.code == Some(NO_HTTP_CLIENT_EXIT) => {
                ProbeResult::unhealthy(NO_HTTP_CLIENT_MESSAGE)
            }
            Err(_) => {
                let detail = utils::text::summarize_line(&output.stderr, 120);
                if detail.is_empty() {
                    ProbeResult::unhealthy(format!("container probe exited with {:?}", output.code))
                } else {
                    ProbeResult::unhealthy(format!("container probe failed: {detail}"))
                }
            }
        }
    }

    fn timed_out(&self) -> ProbeResult {
        ProbeResult::unhealthy(format!("timed out after {}s", self.timeout.as_secs()))
    }
}

/// Shell script that prints the probe's HTTP status code from inside a
/// container, or `000` when nothing answered.
///
/// Images differ in what they ship, so the first available client wins:
/// curl, then wget, then bash's `/dev/tcp` for plain `http` URLs. With none
/// of them the script exits 127.
fn container_probe_script(url: &str, timeout_secs: u64) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let quoted = shlex::try_quote(url).ok()?;

    let mut script = format!(
        "if command -v curl >/dev/null 2>&1; then \
         curl -s -o /dev/null -w '%{{http_code}}' --max-time {timeout_secs} {quoted}; \
         elif command -v wget >/dev/null 2>&1; then \
         code=$(wget -q -S -O /dev/null -T {timeout_secs} {quoted} 2>&1 \
         | awk '/HTTP\\//{{c=$2}} END{{print c}}'); \
         echo \"${{code:-000}}\"; "
    );

    if parsed.scheme() == "http"
        && let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default())
    {
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        let request = format!(
            "exec 3<>/dev/tcp/{host}/{port}; \
             printf 'GET %s HTTP/1.0\\r\\nHost: %s\\r\\nConnection: close\\r\\n\\r\\n' \
             {path} {host_arg} >&3; \
             head -n1 <&3",
            host = host,
            port = port,
            path = shlex::try_quote(&path).ok()?,
            host_arg = shlex::try_quote(host).ok()?,
        );
        script.push_str(&format!(
            "elif command -v bash >/dev/null 2>&1; then \
             code=$(timeout {timeout_secs} bash -c {} 2>/dev/null | awk '{{print $2}}'); \
             echo \"${{code:-000}}\"; ",
            shlex::try_quote(&request).ok()?
        ));
    }

    script.push_str(&format!(
        "else echo '{NO_HTTP_CLIENT_MESSAGE}' >&2; exit {NO_HTTP_CLIENT_EXIT}; fi"
    ));
    Some(script)
}

fn root_cause(error: &(dyn std::error::Error + 'static)) -> String {
    let mut source = error;
    while let Some(next) = source.source() {
        source = next;
    }
    source.to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::{Router, http::StatusCode, routing::get};

    use super::*;
    use crate::services::container_runtime::{CliRuntime, ContainerError, RuntimeOutput};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn prober() -> HealthProber {
        HealthProber::new(Duration::from_secs(1), Arc::new(CliRuntime::new("docker")))
    }

    #[tokio::test]
    async fn success_and_redirect_are_healthy() {
        let base = serve(
            Router::new()
                .route("/ok", get(|| async { "ok" }))
                .route(
                    "/moved",
                    get(|| async { (StatusCode::FOUND, [("location", "/elsewhere")]) }),
                ),
        )
        .await;

        let ok = prober().probe(&format!("{base}/ok"), None).await;
        assert_eq!(ok, ProbeResult::healthy("HTTP 200"));

        let moved = prober().probe(&format!("{base}/moved"), None).await;
        assert!(moved.healthy);
        assert_eq!(moved.message, "HTTP 302");
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;

        let result = prober().probe(&format!("{base}/health"), None).await;
        assert!(!result.healthy);
        assert_eq!(result.message, "HTTP 503");
    }

    #[tokio::test]
    async fn closed_port_is_unhealthy_not_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = prober().probe(&format!("http://{addr}/"), None).await;
        assert!(!result.healthy);
        assert!(!result.message.is_empty());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;

        let result = prober().probe(&format!("{base}/slow"), None).await;
        assert_eq!(result, ProbeResult::unhealthy("timed out after 1s"));
    }

    struct ScriptedRuntime {
        reply: RuntimeOutput,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        fn program(&self) -> &str {
            "fake"
        }

        async fn invoke(&self, args: &[String]) -> Result<RuntimeOutput, ContainerError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(self.reply.clone())
        }
    }

    fn scripted(stdout: &str, code: i32) -> Arc<ScriptedRuntime> {
        Arc::new(ScriptedRuntime {
            reply: RuntimeOutput {
                success: code == 0,
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
            calls: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn container_probe_runs_curl_inside_container() {
        let runtime = scripted("204", 0);
        let prober = HealthProber::new(Duration::from_secs(3), runtime.clone());

        let result = prober
            .probe("http://localhost:3000/health", Some("wtenv-1234abcd"))
            .await;
        assert_eq!(result, ProbeResult::healthy("HTTP 204"));

        let calls = runtime.calls.lock().unwrap();
        assert_eq!(calls[0][..4], ["exec", "wtenv-1234abcd", "sh", "-c"]);
        assert!(calls[0][4].contains("--max-time 3"));
        assert!(calls[0][4].contains("http://localhost:3000/health"));
    }

    #[tokio::test]
    async fn container_probe_classifies_failures() {
        let prober = HealthProber::new(Duration::from_secs(2), scripted("000", 7));
        let refused = prober.probe("http://localhost:3000", Some("c")).await;
        assert_eq!(refused, ProbeResult::unhealthy("connection refused"));

        let prober = HealthProber::new(Duration::from_secs(2), scripted("000", 28));
        let slow = prober.probe("http://localhost:3000", Some("c")).await;
        assert_eq!(slow, ProbeResult::unhealthy("timed out after 2s"));

        let prober = HealthProber::new(Duration::from_secs(2), scripted("500", 0));
        let broken = prober.probe("http://localhost:3000", Some("c")).await;
        assert_eq!(broken, ProbeResult::unhealthy("HTTP 500"));
    }

    #[tokio::test]
    async fn container_without_http_client_is_reported() {
        let prober = HealthProber::new(Duration::from_secs(2), scripted("", 127));
        let result = prober.probe("http://localhost:3000/health", Some("c")).await;
        assert_eq!(result, ProbeResult::unhealthy(NO_HTTP_CLIENT_MESSAGE));
    }

    #[test]
    fn probe_script_falls_back_to_wget_then_bash() {
        let script = container_probe_script("http://localhost:3000/health?deep=1", 4).unwrap();
        let curl = script.find("curl -s").unwrap();
        let wget = script.find("wget -q -S").unwrap();
        let bash = script.find("/dev/tcp/localhost/3000").unwrap();
        assert!(curl < wget && wget < bash);
        assert!(script.contains("-T 4"));
        assert!(script.contains("/health?deep=1"));
        assert!(script.ends_with("exit 127; fi"));

        // No raw-socket fallback for TLS.
        let tls = container_probe_script("https://localhost:8443/", 4).unwrap();
        assert!(!tls.contains("/dev/tcp"));
        assert!(tls.contains("wget"));

        assert!(container_probe_script("not a url", 4).is_none());
    }
}
