mod qtunnel;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use qtunnel::{
    LogOverrides, Mode,
    app::{ClientMode, ConnectProxyMode, ServerMode},
    tls::{ClientTlsOptions, ServerTlsOptions},
};

#[derive(Debug, Parser)]
#[command(
    name = "qtunnel",
    version,
    about = "Reverse TCP / HTTP CONNECT tunnel over QUIC"
)]
struct Cli {
    /// Config file (.toml/.yaml/.yml). If omitted, uses QTUNNEL_CONFIG, then
    /// qtunnel.toml > qtunnel.yaml > qtunnel.yml from the working directory,
    /// then built-in defaults.
    #[arg(long, global = true, env = "QTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// trace | debug | info | warn | error (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "QTUNNEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// text | json
    #[arg(long, global = true, env = "QTUNNEL_LOG_FORMAT")]
    log_format: Option<String>,

    /// stderr | stdout | discard | <file path>
    #[arg(long, global = true, env = "QTUNNEL_LOG_OUTPUT")]
    log_output: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept tunnel clients over QUIC and expose them on a plain TCP port.
    Server(ServerArgs),
    /// Connect to a server and forward every pushed stream to one upstream.
    Client(ClientArgs),
    /// Connect to a server and serve HTTP CONNECT over pushed streams.
    ConnectProxy(ConnectProxyArgs),
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// QUIC address tunnel clients connect to.
    #[arg(long, env = "QTUNNEL_LISTEN_QUIC", default_value = "0.0.0.0:8888")]
    listen_quic: String,

    /// TCP address plain callers connect to.
    #[arg(long, env = "QTUNNEL_LISTEN_TCP", default_value = "0.0.0.0:8443")]
    listen_tcp: String,

    /// Server certificate chain (PEM). Omit with --cert-key for a generated
    /// self-signed certificate.
    #[arg(long, env = "QTUNNEL_CERT_FILE", default_value = "")]
    cert_file: String,

    #[arg(long, env = "QTUNNEL_CERT_KEY", default_value = "")]
    cert_key: String,

    /// CA used to verify client certificates; enables mutual TLS.
    #[arg(long, alias = "ca-file", env = "QTUNNEL_CLIENT_CA_FILE", default_value = "")]
    client_ca_file: String,
}

#[derive(Debug, Args)]
struct ClientTlsArgs {
    /// CA used to verify the server certificate.
    #[arg(long, env = "QTUNNEL_CA_FILE", default_value = "")]
    ca_file: String,

    /// Client certificate (PEM) for mutual TLS.
    #[arg(long, env = "QTUNNEL_CERT_FILE", default_value = "")]
    cert_file: String,

    #[arg(long, env = "QTUNNEL_CERT_KEY", default_value = "")]
    cert_key: String,

    /// Skip server certificate verification (development only).
    #[arg(long, env = "QTUNNEL_INSECURE_SKIP_VERIFY")]
    insecure_skip_verify: bool,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Rendezvous server address.
    #[arg(long, env = "QTUNNEL_SERVER", default_value = "127.0.0.1:9999")]
    server: String,

    /// Local service every stream is forwarded to (host:port).
    #[arg(long, env = "QTUNNEL_UPSTREAM", default_value = "")]
    upstream: String,

    /// TLS server name expected in the server certificate.
    #[arg(long, env = "QTUNNEL_SERVER_NAME", default_value = "quic-tunnel-server")]
    server_name: String,

    #[command(flatten)]
    tls: ClientTlsArgs,
}

#[derive(Debug, Args)]
struct ConnectProxyArgs {
    /// Rendezvous server address.
    #[arg(long, env = "QTUNNEL_SERVER", default_value = "127.0.0.1:9999")]
    server: String,

    #[arg(long, env = "QTUNNEL_SERVER_NAME", default_value = "localhost")]
    server_name: String,

    #[command(flatten)]
    tls: ClientTlsArgs,
}

impl ClientTlsArgs {
    fn into_options(self, server_name: String) -> ClientTlsOptions {
        ClientTlsOptions {
            ca_file: self.ca_file,
            cert_file: self.cert_file,
            key_file: self.cert_key,
            server_name,
            insecure_skip_verify: self.insecure_skip_verify,
        }
    }
}

impl Command {
    fn into_mode(self) -> anyhow::Result<Mode> {
        Ok(match self {
            Command::Server(a) => Mode::Server(ServerMode {
                listen_quic: a.listen_quic,
                listen_tcp: a.listen_tcp,
                tls: ServerTlsOptions {
                    cert_file: a.cert_file,
                    key_file: a.cert_key,
                    client_ca_file: a.client_ca_file,
                },
            }),
            Command::Client(a) => {
                if a.upstream.trim().is_empty() {
                    anyhow::bail!("must specify upstream host");
                }
                Mode::Client(ClientMode {
                    server: a.server,
                    upstream: a.upstream,
                    tls: a.tls.into_options(a.server_name),
                })
            }
            Command::ConnectProxy(a) => Mode::ConnectProxy(ConnectProxyMode {
                server: a.server,
                tls: a.tls.into_options(a.server_name),
            }),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = cli.command.into_mode()?;
    qtunnel::run(
        cli.config,
        LogOverrides {
            level: cli.log_level,
            format: cli.log_format,
            output: cli.log_output,
        },
        mode,
    )
    .await
}
