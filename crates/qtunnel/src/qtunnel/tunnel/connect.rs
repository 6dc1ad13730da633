//! HTTP CONNECT bridge.
//!
//! Runs an HTTP/1.1 server over any [`Listener`]. A CONNECT request is
//! answered with a bare `HTTP/1.1 200 OK\r\n\r\n`, after which the raw connection is taken back from
//! hyper and spliced onto the dialed upstream. Bytes hyper already read past
//! the request head are replayed to the upstream before relaying starts.

use std::{convert::Infallible, io, time::Duration};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::qtunnel::{
    net,
    relay::{RelayStats, relay},
    tunnel::listener::{Connection, Listener},
};

pub const METHOD_NOT_ALLOWED_BODY: &str = "this proxy only supports CONNECT passthrough";

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Upper bound for dialing the CONNECT target.
    pub dial_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Serve CONNECT requests on `ln` until its accept fails, returning that error.
pub async fn serve<L: Listener>(ln: &L, opts: ConnectOptions) -> anyhow::Error {
    loop {
        let conn = match ln.accept().await {
            Ok(c) => c,
            Err(err) => return err,
        };
        tokio::spawn(serve_conn(conn, opts));
    }
}

async fn serve_conn<C: Connection>(conn: C, opts: ConnectOptions) {
    let peer = conn.remote_addr();
    let io = TokioIo::new(conn);
    let svc = service_fn(move |req| handle::<C>(req, opts));

    // The success reply must be exactly the status line and a blank line.
    if let Err(err) = http1::Builder::new()
        .auto_date_header(false)
        .serve_connection(io, svc)
        .with_upgrades()
        .await
    {
        tracing::debug!(peer = ?peer, err = %err, "connect: http connection ended with error");
    }
}

async fn handle<C: Connection>(
    req: Request<Incoming>,
    opts: ConnectOptions,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    tracing::info!(
        host = %req.uri(),
        method = %req.method(),
        user_agent = %user_agent,
        "connect: request"
    );

    if req.method() != Method::CONNECT {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED_BODY));
    }

    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(text(StatusCode::BAD_REQUEST, "CONNECT target must be host:port"));
    };

    let upstream = match net::dial_tcp(&target, opts.dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(target = %target, err = %err, "connect: upstream dial failed");
            return Ok(text(StatusCode::BAD_REQUEST, format!("{err:#}")));
        }
    };

    tokio::spawn(async move {
        let mut upstream = upstream;
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(u) => u,
            Err(err) => {
                tracing::warn!(target = %target, err = %err, "connect: hijack failed");
                let _ = upstream.shutdown().await;
                return;
            }
        };
        let parts = match upgraded.downcast::<TokioIo<C>>() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(target = %target, "connect: hijack not supported by connection");
                let _ = upstream.shutdown().await;
                return;
            }
        };

        match splice(parts.io.into_inner(), parts.read_buf, upstream).await {
            Ok(stats) => tracing::debug!(
                target = %target,
                up = stats.a_to_b,
                down = stats.b_to_a,
                "connect: tunnel closed"
            ),
            Err(err) => tracing::debug!(target = %target, err = %err, "connect: replay failed"),
        }
    });

    Ok(Response::new(Full::new(Bytes::new())))
}

/// Write the bytes the HTTP layer had read ahead, then relay `raw` and
/// `upstream`. The buffered bytes always precede anything read from `raw`.
pub async fn splice<R, U>(raw: R, buffered: Bytes, mut upstream: U) -> io::Result<RelayStats>
where
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let early = buffered.len() as u64;
    if early > 0 {
        if let Err(err) = upstream.write_all(&buffered).await {
            let _ = upstream.shutdown().await;
            return Err(err);
        }
    }
    let mut stats = relay(raw, upstream).await;
    stats.a_to_b += early;
    Ok(stats)
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
