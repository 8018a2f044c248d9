//! Transport construction for the five upstream kinds. A tagged enum, not
//! a trait object hierarchy — `connect()` matches on the variant and
//! returns a boxed running service either way, so callers never need to
//! know which transport backs a given client.

use std::collections::HashMap;
use std::time::Duration;

use rmcp::{
    service::RunningService,
    transport::{
        sse_client::SseClientConfig,
        streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use tracing::info;

use crate::config::IsolationConfig;
use crate::error::{McpError, McpResult};

pub type McpClient = RunningService<RoleClient, ()>;

/// Upstream transport configuration, one variant per kind in §3's
/// descriptor. `Stdio` and `StdioContainer` share everything but whether
/// the command is wrapped to run inside a container.
#[derive(Debug, Clone)]
pub enum Transport {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<String>,
    },
    StdioContainer {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<String>,
        isolation: IsolationConfig,
    },
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl Transport {
    /// Wraps `command`/`args` into an equivalent `docker run` invocation so
    /// the existing stdio/`TokioChildProcess` path (which only needs a
    /// `tokio::process::Command`) can carry isolated servers too, without a
    /// separate container-runtime client in the connect path.
    fn containerized_command(
        command: &str,
        args: &[String],
        isolation: &IsolationConfig,
    ) -> (String, Vec<String>) {
        let mut docker_args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
        ];
        if let Some(network) = &isolation.network_mode {
            docker_args.push("--network".to_string());
            docker_args.push(network.clone());
        }
        if let Some(memory) = &isolation.memory_limit {
            docker_args.push("--memory".to_string());
            docker_args.push(memory.clone());
        }
        if let Some(cpus) = &isolation.cpu_limit {
            docker_args.push("--cpus".to_string());
            docker_args.push(cpus.clone());
        }
        docker_args.push(isolation.image.clone());
        docker_args.push(command.to_string());
        docker_args.extend(args.iter().cloned());
        ("docker".to_string(), docker_args)
    }

    pub async fn connect(&self, server_name: &str) -> McpResult<McpClient> {
        match self {
            Transport::Stdio {
                command,
                args,
                env,
                working_dir,
            } => Self::connect_stdio(server_name, command, args, env, working_dir.as_deref()).await,
            Transport::StdioContainer {
                command,
                args,
                env,
                working_dir,
                isolation,
            } => {
                let (docker_cmd, docker_args) =
                    Self::containerized_command(command, args, isolation);
                Self::connect_stdio(
                    server_name,
                    &docker_cmd,
                    &docker_args,
                    env,
                    working_dir.as_deref(),
                )
                .await
            }
            Transport::Http { url, headers } | Transport::StreamableHttp { url, headers } => {
                Self::connect_streamable_http(server_name, url, headers).await
            }
            Transport::Sse { url, headers } => Self::connect_sse(server_name, url, headers).await,
        }
    }

    async fn connect_stdio(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
    ) -> McpResult<McpClient> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.configure(|c| {
            c.args(args).envs(env.iter()).stderr(std::process::Stdio::inherit());
            if let Some(dir) = working_dir {
                c.current_dir(dir);
            }
        });
        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| McpError::Transport(format!("create stdio transport: {e}")))?;
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::Transport(format!("initialize stdio client: {e}")))?;
        info!(server = server_name, "connected via stdio");
        Ok(client)
    }

    async fn connect_streamable_http(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> McpResult<McpClient> {
        let mut cfg = StreamableHttpClientTransportConfig::with_uri(url);
        if let Some(auth) = headers.get("Authorization") {
            cfg.auth_header = Some(auth.clone());
        }
        let transport = StreamableHttpClientTransport::from_config(cfg);
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::Transport(format!("initialize streamable client: {e}")))?;
        info!(server = server_name, url, "connected via streamable-http");
        Ok(client)
    }

    async fn connect_sse(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> McpResult<McpClient> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if !headers.is_empty() {
            let mut header_map = reqwest::header::HeaderMap::new();
            for (k, v) in headers {
                if let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                    reqwest::header::HeaderValue::from_str(v),
                ) {
                    header_map.insert(name, value);
                }
            }
            builder = builder.default_headers(header_map);
        }
        let http_client = builder
            .build()
            .map_err(|e| McpError::Transport(format!("build HTTP client: {e}")))?;

        let cfg = SseClientConfig {
            sse_endpoint: url.to_string().into(),
            ..Default::default()
        };
        let transport = SseClientTransport::start_with_client(http_client, cfg)
            .await
            .map_err(|e| McpError::Transport(format!("create SSE transport: {e}")))?;
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::Transport(format!("initialize SSE client: {e}")))?;
        info!(server = server_name, url, "connected via sse");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containerized_command_wraps_docker_run() {
        let isolation = IsolationConfig {
            image: "python:3.12-slim".into(),
            network_mode: Some("none".into()),
            memory_limit: Some("256m".into()),
            cpu_limit: None,
        };
        let (cmd, args) = Transport::containerized_command(
            "python",
            &["server.py".to_string()],
            &isolation,
        );
        assert_eq!(cmd, "docker");
        assert!(args.contains(&"run".to_string()));
        assert!(args.contains(&"python:3.12-slim".to_string()));
        assert!(args.contains(&"server.py".to_string()));
        assert!(args.windows(2).any(|w| w == ["--network", "none"]));
    }
}
