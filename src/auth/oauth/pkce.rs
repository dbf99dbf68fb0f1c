//! Authorization-code flow with PKCE (RFC 7636) and a loopback redirect.
//!
//! The callback listener is bound before the authorization URL is built,
//! since the chosen port is part of the redirect URI. The verifier doubles as
//! the `state` value and is checked on the callback.

use std::ops::RangeInclusive;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use super::{OAuthEndpoints, TokenOutcome, token_request};
use crate::auth::credentials::TokenResponse;
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::HttpClient;

pub const CALLBACK_PORTS: RangeInclusive<u16> = 8080..=8089;
pub const CALLBACK_PATH: &str = "/oauth2callback";
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Verifier and S256 challenge.
#[derive(Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("challenge", &self.challenge)
            .finish_non_exhaustive()
    }
}

impl PkcePair {
    /// 32 random bytes, base64url without padding.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }

    pub fn state(&self) -> &str {
        &self.verifier
    }
}

/// A bound callback listener plus the URL the user must visit.
pub struct PendingAuthorization {
    listener: TcpListener,
    pub port: u16,
    pub redirect_uri: String,
    pub url: String,
    pkce: PkcePair,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("port", &self.port)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl PendingAuthorization {
    pub fn state(&self) -> &str {
        self.pkce.state()
    }
}

pub struct PkceFlow<'a> {
    http: &'a HttpClient,
    endpoints: &'a OAuthEndpoints,
    ports: RangeInclusive<u16>,
}

impl<'a> PkceFlow<'a> {
    pub fn new(http: &'a HttpClient, endpoints: &'a OAuthEndpoints) -> Self {
        Self {
            http,
            endpoints,
            ports: CALLBACK_PORTS,
        }
    }

    /// Candidate callback ports. Port 0 lets the OS choose.
    pub fn with_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Bind the callback listener and build the authorization URL.
    pub async fn prepare(&self) -> Result<PendingAuthorization, LlmError> {
        let Some(auth_url) = &self.endpoints.auth_url else {
            return Err(LlmError::ConfigurationError(
                "authorization-code flow requires an auth_url".to_string(),
            ));
        };
        let (listener, port) = bind_callback_listener(self.ports.clone()).await?;
        let redirect_uri = format!("http://localhost:{port}{CALLBACK_PATH}");
        let pkce = PkcePair::generate();
        let url = authorization_url(auth_url, self.endpoints, &redirect_uri, &pkce)?;
        tracing::debug!(target: "infergate::auth", port, "callback listener bound");
        Ok(PendingAuthorization {
            listener,
            port,
            redirect_uri,
            url,
            pkce,
        })
    }

    /// Wait for the browser redirect, verify state, and exchange the code.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        pending: PendingAuthorization,
        timeout: Duration,
    ) -> Result<TokenResponse, LlmError> {
        let waiting = wait_for_callback(&pending.listener, pending.state());
        let code = match tokio::time::timeout(timeout, ctx.run(waiting)).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(LlmError::TimeoutError(
                    "timed out waiting for the OAuth callback".to_string(),
                ));
            }
        };
        drop(pending.listener);

        let fields = [
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("code_verifier", pending.pkce.verifier.as_str()),
            ("redirect_uri", pending.redirect_uri.as_str()),
        ];
        match token_request(self.http, ctx, self.endpoints, &fields).await? {
            TokenOutcome::Granted(token) => {
                tracing::info!(target: "infergate::auth", "authorization code exchanged");
                Ok(token)
            }
            TokenOutcome::Rejected(err) => Err(err.into_error()),
        }
    }
}

/// Bind the first free loopback port in `ports`.
pub async fn bind_callback_listener(
    ports: RangeInclusive<u16>,
) -> Result<(TcpListener, u16), LlmError> {
    let mut last_err = None;
    for port in ports.clone() {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                return Ok((listener, bound));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(LlmError::IoError(format!(
        "no free callback port in {}..={}: {}",
        ports.start(),
        ports.end(),
        last_err.map_or_else(|| "empty range".to_string(), |e| e.to_string())
    )))
}

pub fn authorization_url(
    auth_url: &str,
    endpoints: &OAuthEndpoints,
    redirect_uri: &str,
    pkce: &PkcePair,
) -> Result<String, LlmError> {
    let mut url = reqwest::Url::parse(auth_url)
        .map_err(|e| LlmError::ConfigurationError(format!("auth_url '{auth_url}': {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", &endpoints.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &endpoints.scope_string())
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", pkce.state())
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    Ok(url.into())
}

/// Best-effort launch of the system browser.
pub fn open_browser(url: &str) -> Result<(), LlmError> {
    let mut cmd = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else {
        std::process::Command::new("xdg-open")
    };
    cmd.arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|e| LlmError::IoError(format!("could not open browser: {e}")))
}

const SUCCESS_PAGE: &str =
    "<html><body><h1>Authentication complete</h1><p>You can close this window.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h1>Authentication failed</h1></body></html>";

/// How long one browser connection may take to send its request head.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept connections until one carries the authorization code. Each
/// connection is served on its own task and dropped after `CONNECTION_TIMEOUT`.
async fn wait_for_callback(listener: &TcpListener, expected_state: &str) -> Result<String, LlmError> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let expected = expected_state.to_owned();
                connections.spawn(async move {
                    let served = tokio::time::timeout(CONNECTION_TIMEOUT, handle_callback(stream, &expected)).await;
                    (peer, served)
                });
            }
            Some(joined) = connections.join_next() => match joined {
                Ok((_, Ok(outcome))) => {
                    if let Some(code) = outcome? {
                        return Ok(code);
                    }
                }
                Ok((peer, Err(_))) => {
                    tracing::debug!(target: "infergate::auth", %peer, "callback connection sent nothing; dropped");
                }
                Err(e) => {
                    tracing::debug!(target: "infergate::auth", error = %e, "callback handler aborted");
                }
            },
        }
    }
}

/// Request line of an HTTP request; headers are read and discarded.
async fn read_request_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut request_line = String::new();
    let mut reader = BufReader::new(stream);
    reader.read_line(&mut request_line).await?;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(request_line)
}

async fn handle_callback(
    mut stream: TcpStream,
    expected_state: &str,
) -> Result<Option<String>, LlmError> {
    let request_line = match read_request_line(&mut stream).await {
        Ok(line) => line,
        Err(e) => {
            tracing::debug!(target: "infergate::auth", error = %e, "unreadable callback connection");
            return Ok(None);
        }
    };

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let outcome = parse_callback(target, expected_state);
    let (status, page) = match &outcome {
        Ok(Some(_)) => ("200 OK", SUCCESS_PAGE),
        Ok(None) => ("404 Not Found", FAILURE_PAGE),
        Err(_) => ("400 Bad Request", FAILURE_PAGE),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{page}",
        page.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
    outcome
}

/// `Ok(None)` for requests that are not the callback, such as `/favicon.ico`.
fn parse_callback(target: &str, expected_state: &str) -> Result<Option<String>, LlmError> {
    let url = reqwest::Url::parse(&format!("http://localhost{target}"))
        .map_err(|e| LlmError::AuthenticationError(format!("malformed callback: {e}")))?;
    if url.path() != CALLBACK_PATH {
        return Ok(None);
    }
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    if let Some(error) = param("error") {
        return Err(LlmError::AuthenticationError(format!(
            "authorization failed: {error}"
        )));
    }
    if param("state").as_deref() != Some(expected_state) {
        return Err(LlmError::AuthenticationError(
            "OAuth state mismatch, possible CSRF; aborting".to_string(),
        ));
    }
    param("code")
        .filter(|c| !c.is_empty())
        .map(Some)
        .ok_or_else(|| LlmError::AuthenticationError("callback carried no code".to_string()))
}
