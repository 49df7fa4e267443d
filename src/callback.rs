//! One-shot loopback HTTP listener for OAuth redirects.
//!
//! Binds `127.0.0.1:{port}`, serves exactly one authorization redirect on
//! a provider-specific path, and publishes the extracted result into a
//! capacity-1 channel. Racing redirects lose: the channel is size one and
//! sends are non-blocking, so only the first result is ever delivered.
//!
//! For SSH-tunnel sessions the waiter can also accept a manually pasted
//! redirect URL. The paste prompt is armed only after a grace period, and
//! the callback channel is checked first on every iteration, so a
//! redirect that lands while the user stares at the prompt still wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{AuthError, Result};

/// Prompt callback used for manual paste and interactive questions.
/// Takes the question text, returns the user's answer.
pub type PromptFn = Arc<dyn Fn(&str) -> std::io::Result<String> + Send + Sync>;

/// Parameters extracted from a single OAuth redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackResult {
    /// The authorization code, when the provider granted one.
    pub code: Option<String>,
    /// The state parameter echoed back for CSRF verification.
    pub state: Option<String>,
    /// The provider's error code, when authorization was denied.
    pub error: Option<String>,
}

impl CallbackResult {
    /// Parse a raw query string (`code=...&state=...&error=...`).
    pub fn from_query(query: &str) -> Self {
        let mut result = Self::default();
        for pair in query.split('&') {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next().unwrap_or_default();
            let value = kv.next().unwrap_or_default();
            match key {
                "code" => result.code = Some(url_decode(value)),
                "state" => result.state = Some(url_decode(value)),
                "error" => result.error = Some(url_decode(value)),
                _ => {}
            }
        }
        result
    }

    /// Parse a pasted redirect URL through the same extractor the
    /// listener uses.
    pub fn from_redirect_url(url: &str) -> Result<Self> {
        let query = url
            .split('?')
            .nth(1)
            .ok_or_else(|| AuthError::InvalidInput("redirect URL has no query string".into()))?;
        Ok(Self::from_query(query))
    }

    /// Resolve into `(code, state)`, mapping an explicit provider error
    /// or an empty redirect into the matching typed failure.
    pub fn into_code_and_state(self) -> Result<(String, Option<String>)> {
        if let Some(error) = self.error {
            return Err(AuthError::AuthorizationDenied(error));
        }
        match self.code {
            Some(code) if !code.is_empty() => Ok((code, self.state)),
            _ => Err(AuthError::MissingCode),
        }
    }
}

/// Ephemeral loopback server holding the single-slot result channel.
pub struct CallbackServer {
    port: u16,
    path: String,
    rx: mpsc::Receiver<CallbackResult>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the listener. Port 0 asks the OS for an ephemeral port (used
    /// by tests); the bound port is available via [`Self::port`].
    pub async fn bind(port: u16, path: &str) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| AuthError::PortUnavailable { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| AuthError::PortUnavailable { port, source })?
            .port();

        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let path = path.to_string();
        let serve_path = path.clone();
        let task = tokio::spawn(async move {
            serve(listener, serve_path, tx, shutdown_rx).await;
        });

        Ok(Self {
            port,
            path,
            rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The redirect URI this listener answers on.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.path)
    }

    /// Wait for the first of: callback arrival, pasted redirect URL, or
    /// the deadline. `prompt` (when given) is armed only after `grace`.
    pub async fn wait(
        &mut self,
        timeout: Duration,
        grace: Duration,
        prompt: Option<PromptFn>,
    ) -> Result<CallbackResult> {
        let deadline = Instant::now() + timeout;
        let grace_sleep = tokio::time::sleep(grace);
        tokio::pin!(grace_sleep);
        let mut prompt = prompt;
        let mut paste_task: Option<JoinHandle<std::io::Result<String>>> = None;

        loop {
            // A callback that already arrived always wins.
            if let Ok(result) = self.rx.try_recv() {
                return Ok(result);
            }

            if let Some(mut task) = paste_task.take() {
                tokio::select! {
                    biased;
                    received = self.rx.recv() => {
                        task.abort();
                        return received.ok_or(AuthError::Timeout);
                    }
                    joined = &mut task => {
                        // A redirect that raced the prompt wins over
                        // whatever was typed.
                        if let Ok(result) = self.rx.try_recv() {
                            return Ok(result);
                        }
                        let pasted = joined
                            .map_err(|err| {
                                AuthError::InvalidInput(format!("paste prompt failed: {err}"))
                            })?
                            .map_err(AuthError::Io)?;
                        return CallbackResult::from_redirect_url(pasted.trim());
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        task.abort();
                        return Err(AuthError::Timeout);
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    received = self.rx.recv() => {
                        return received.ok_or(AuthError::Timeout);
                    }
                    _ = &mut grace_sleep, if prompt.is_some() => {
                        if let Some(ask) = prompt.take() {
                            paste_task = Some(tokio::task::spawn_blocking(move || {
                                ask("Paste the full redirect URL from your browser")
                            }));
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(AuthError::Timeout);
                    }
                }
            }
        }
    }

    /// Graceful, idempotent shutdown with a bounded deadline.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(3), task).await;
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Accept loop ─────────────────────────────────────────────────────

async fn serve(
    listener: TcpListener,
    path: String,
    tx: mpsc::Sender<CallbackResult>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => handle_connection(stream, &path, &tx).await,
                    Err(err) => tracing::debug!("callback accept failed: {err}"),
                }
            }
            _ = &mut shutdown_rx => break,
        }
    }
}

/// Serve one HTTP connection. Only a GET on the expected path publishes
/// a result; probes (favicon, HEAD) get a 404 and do not touch the slot.
async fn handle_connection(mut stream: TcpStream, path: &str, tx: &mpsc::Sender<CallbackResult>) {
    let mut buf = vec![0u8; 8192];
    let n = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(err) => {
            tracing::debug!("callback read failed: {err}");
            return;
        }
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let first_line = request.lines().next().unwrap_or_default();
    let mut words = first_line.split_whitespace();
    let method = words.next().unwrap_or_default();
    let target = words.next().unwrap_or_default();

    let mut target_parts = target.splitn(2, '?');
    let request_path = target_parts.next().unwrap_or_default();
    let query = target_parts.next().unwrap_or_default();

    if method != "GET" || request_path != path {
        respond(&mut stream, "404 Not Found", NOT_FOUND_HTML).await;
        return;
    }

    let result = CallbackResult::from_query(query);
    let succeeded = result.error.is_none() && result.code.is_some();
    // Capacity-1 channel: the first redirect wins, later ones are dropped.
    let _ = tx.try_send(result);

    let body = if succeeded {
        SUCCESS_HTML
    } else {
        FAILURE_HTML
    };
    respond(&mut stream, "200 OK", body).await;
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// Minimal percent-decoding for URL query values.
pub(crate) fn url_decode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b == b'+' {
            result.push(' ');
        } else if b == b'%' {
            let h1 = bytes.next().unwrap_or(b'0');
            let h2 = bytes.next().unwrap_or(b'0');
            let hex = [h1, h2];
            if let Ok(decoded) = u8::from_str_radix(std::str::from_utf8(&hex).unwrap_or("00"), 16) {
                result.push(decoded as char);
            }
        } else {
            result.push(b as char);
        }
    }
    result
}

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Authentication complete</title></head>
<body style="font-family:system-ui;text-align:center;padding:60px">
<h2>Authentication successful!</h2>
<p>You can close this tab and return to your terminal.</p>
</body></html>"#;

const FAILURE_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Authentication failed</title></head>
<body style="font-family:system-ui;text-align:center;padding:60px">
<h2>Authentication failed</h2>
<p>The authorization response was incomplete. Return to your terminal and try again.</p>
</body></html>"#;

const NOT_FOUND_HTML: &str = r#"<!DOCTYPE html>
<html><body>Not found.</body></html>"#;

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn send_get(port: u16, target: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).await;
        response
    }

    #[test]
    fn from_query_extracts_code_state_error() {
        let result = CallbackResult::from_query("code=abc&state=xyz");
        assert_eq!(result.code.as_deref(), Some("abc"));
        assert_eq!(result.state.as_deref(), Some("xyz"));
        assert!(result.error.is_none());

        let denied = CallbackResult::from_query("error=access_denied");
        assert_eq!(denied.error.as_deref(), Some("access_denied"));
    }

    #[test]
    fn from_redirect_url_parses_pasted_callback() {
        let result =
            CallbackResult::from_redirect_url("http://localhost:1/oauth-callback?code=X&state=Y")
                .unwrap();
        assert_eq!(result.code.as_deref(), Some("X"));
        assert_eq!(result.state.as_deref(), Some("Y"));
    }

    #[test]
    fn from_redirect_url_rejects_query_less_input() {
        assert!(CallbackResult::from_redirect_url("http://localhost:1/oauth-callback").is_err());
    }

    #[test]
    fn into_code_and_state_maps_failures() {
        let empty = CallbackResult::default();
        assert!(matches!(
            empty.into_code_and_state(),
            Err(AuthError::MissingCode)
        ));

        let denied = CallbackResult {
            error: Some("access_denied".into()),
            ..Default::default()
        };
        assert!(matches!(
            denied.into_code_and_state(),
            Err(AuthError::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn url_decode_handles_percent_encoding() {
        assert_eq!(url_decode("hello%20world"), "hello world");
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("no%2Fslash"), "no/slash");
    }

    #[tokio::test]
    async fn delivers_first_of_two_racing_redirects() {
        let mut server = CallbackServer::bind(0, "/oauth-callback").await.unwrap();
        let port = server.port();

        let first = tokio::spawn(send_get(port, "/oauth-callback?code=c1&state=s"));
        let second = tokio::spawn(send_get(port, "/oauth-callback?code=c2&state=s"));
        first.await.unwrap();
        second.await.unwrap();

        let result = server
            .wait(Duration::from_secs(2), Duration::from_secs(60), None)
            .await
            .unwrap();
        let code = result.code.unwrap();
        assert!(code == "c1" || code == "c2");

        // The losing redirect was dropped, not queued.
        let followup = server
            .wait(Duration::from_millis(100), Duration::from_secs(60), None)
            .await;
        assert!(matches!(followup, Err(AuthError::Timeout)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn times_out_when_nothing_arrives() {
        let mut server = CallbackServer::bind(0, "/oauth-callback").await.unwrap();
        let result = server
            .wait(Duration::from_millis(80), Duration::from_secs(60), None)
            .await;
        assert!(matches!(result, Err(AuthError::Timeout)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn probes_on_other_paths_do_not_consume_the_slot() {
        let mut server = CallbackServer::bind(0, "/auth/callback").await.unwrap();
        let port = server.port();

        let response = send_get(port, "/favicon.ico").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        send_get(port, "/auth/callback?code=real&state=s").await;
        let result = server
            .wait(Duration::from_secs(2), Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(result.code.as_deref(), Some("real"));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn pasted_redirect_url_resolves_after_grace() {
        let mut server = CallbackServer::bind(0, "/oauth-callback").await.unwrap();
        let prompt: PromptFn =
            Arc::new(|_| Ok("http://localhost:1/oauth-callback?code=X&state=Y".to_string()));

        let result = server
            .wait(Duration::from_secs(5), Duration::from_millis(10), Some(prompt))
            .await
            .unwrap();
        assert_eq!(result.code.as_deref(), Some("X"));
        assert_eq!(result.state.as_deref(), Some("Y"));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut server = CallbackServer::bind(0, "/oauth-callback").await.unwrap();
        server.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn error_redirect_is_delivered() {
        let mut server = CallbackServer::bind(0, "/oauth2callback").await.unwrap();
        let port = server.port();
        send_get(port, "/oauth2callback?error=access_denied").await;

        let result = server
            .wait(Duration::from_secs(2), Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(result.error.as_deref(), Some("access_denied"));
        assert!(matches!(
            result.into_code_and_state(),
            Err(AuthError::AuthorizationDenied(_))
        ));
        server.shutdown().await;
    }
}
