use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::qtunnel::{
    config::{self, Config},
    logging,
    tls::{ClientTlsOptions, ServerTlsOptions},
    tunnel::{
        client::{Client, ClientOptions, ConnectProxyService, ForwardService, SessionService},
        connect::ConnectOptions,
        server::{Server, ServerOptions},
        transport::quic::QuicTransport,
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct LogOverrides {
    pub level: Option<String>,
    pub format: Option<String>,
    pub output: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerMode {
    pub listen_quic: String,
    pub listen_tcp: String,
    pub tls: ServerTlsOptions,
}

#[derive(Debug, Clone)]
pub struct ClientMode {
    pub server: String,
    pub upstream: String,
    pub tls: ClientTlsOptions,
}

#[derive(Debug, Clone)]
pub struct ConnectProxyMode {
    pub server: String,
    pub tls: ClientTlsOptions,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerMode),
    Client(ClientMode),
    ConnectProxy(ConnectProxyMode),
}

pub async fn run(
    config_path: Option<PathBuf>,
    log_overrides: LogOverrides,
    mode: Mode,
) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("config: resolve working directory")?;
    let resolved = config::resolve_config_path(config_path, &cwd)?;
    let mut cfg = match &resolved {
        Some(r) => config::load_config(&r.path)
            .with_context(|| format!("load config: {}", r.path.display()))?,
        None => Config::default(),
    };
    apply_log_overrides(&mut cfg, log_overrides);

    let _logrt = logging::init(&cfg.logging)?;

    match &resolved {
        Some(r) => tracing::info!(config = %r.path.display(), source = %r.source, "qtunnel: starting"),
        None => tracing::info!("qtunnel: starting with built-in defaults"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    match mode {
        Mode::Server(m) => {
            let transport = QuicTransport::server(m.tls, cfg.transport.clone());
            transport.validate().context("tls: server configuration")?;
            let server = Server::bind(
                &ServerOptions {
                    tunnel_addr: m.listen_quic,
                    plain_addr: m.listen_tcp,
                },
                &transport,
            )
            .await?;
            tasks.spawn(server.serve(shutdown_rx));
        }
        Mode::Client(m) => {
            let service = ForwardService::new(m.upstream, cfg.client.dial_timeout)?;
            tracing::info!(upstream = %service.upstream, "tunnel: forwarding streams");
            let client = build_client(&cfg, m.server, m.tls, Arc::new(service))?;
            tasks.spawn(async move { client.run(shutdown_rx).await });
        }
        Mode::ConnectProxy(m) => {
            let service = ConnectProxyService {
                opts: ConnectOptions {
                    dial_timeout: cfg.client.dial_timeout,
                },
            };
            let client = build_client(&cfg, m.server, m.tls, Arc::new(service))?;
            tasks.spawn(async move { client.run(shutdown_rx).await });
        }
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(DRAIN_TIMEOUT), "shutdown: tasks did not stop; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn build_client(
    cfg: &Config,
    server: String,
    tls: ClientTlsOptions,
    service: Arc<dyn SessionService>,
) -> anyhow::Result<Client> {
    let transport = QuicTransport::client(tls, cfg.transport.clone());
    transport.validate().context("tls: client configuration")?;
    Client::new(
        ClientOptions {
            server_addr: server,
            cooldown: cfg.client.cooldown,
            backoff: cfg.client.backoff,
        },
        Arc::new(transport),
        service,
    )
}

fn apply_log_overrides(cfg: &mut Config, o: LogOverrides) {
    let pick = |flag: Option<String>, current: &mut String| {
        if let Some(v) = flag.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            *current = v;
        }
    };
    pick(o.level, &mut cfg.logging.level);
    pick(o.format, &mut cfg.logging.format);
    pick(o.output, &mut cfg.logging.output);
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_logging() {
        let mut cfg = Config::default();
        apply_log_overrides(
            &mut cfg,
            LogOverrides {
                level: Some("debug".into()),
                format: Some("  ".into()),
                output: None,
            },
        );
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "text");
        assert_eq!(cfg.logging.output, "stderr");
    }

    #[test]
    fn client_without_trust_roots_fails_fast() {
        let cfg = Config::default();
        let service = Arc::new(ForwardService::new("127.0.0.1:80", Duration::from_secs(1)).unwrap());
        let err = build_client(&cfg, "127.0.0.1:9999".into(), ClientTlsOptions::default(), service)
            .err()
            .expect("missing CA must be rejected");
        assert!(format!("{err:#}").contains("CA file"), "{err:#}");
    }
}
