//! Local HTTP callback server for OAuth authentication.
//!
//! Provides a temporary loopback server to receive the authorization redirect,
//! display a result page to the user, and hand the redirect URL to the broker.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use url::Url;

use crate::error::AuthError;

/// Default redirect URI for the loopback flow.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:28491/callback";

/// Result from the callback server.
#[derive(Debug, PartialEq, Eq)]
pub enum CallbackResult {
    /// Successfully received callback with the full URL.
    Success(String),
    /// Server was cancelled.
    Cancelled,
    /// No callback arrived before the deadline.
    TimedOut,
    /// Error occurred.
    Error(String),
}

/// Loopback listener bound to the host and port of a redirect URI.
pub struct CallbackServer {
    listener: TcpListener,
    base: String,
    path: String,
}

impl CallbackServer {
    /// Bind to the redirect URI's port. Port 0 picks a free port.
    pub fn bind(redirect_uri: &Url) -> Result<Self, AuthError> {
        if redirect_uri.scheme() != "http" {
            return Err(AuthError::InvalidArgument(format!(
                "loopback redirect URI must use http: {}",
                redirect_uri
            )));
        }

        let host = redirect_uri.host_str().unwrap_or_default();
        let bind_host = match host {
            "localhost" | "127.0.0.1" => "127.0.0.1",
            "[::1]" | "::1" => "[::1]",
            _ => {
                return Err(AuthError::InvalidArgument(format!(
                    "redirect URI is not a loopback address: {}",
                    redirect_uri
                )))
            }
        };

        let port = redirect_uri.port_or_known_default().unwrap_or(80);
        let addr = format!("{}:{}", bind_host, port);

        let listener = TcpListener::bind(&addr).map_err(|e| {
            error!("Failed to bind callback server to {}: {}", addr, e);
            AuthError::BrokerFailure(format!("Failed to start callback server: {}", e))
        })?;

        // Set non-blocking so we can check for cancellation
        listener
            .set_nonblocking(true)
            .map_err(|e| AuthError::BrokerFailure(format!("Server configuration error: {}", e)))?;

        let local_port = listener
            .local_addr()
            .map_err(|e| AuthError::BrokerFailure(e.to_string()))?
            .port();

        info!("OAuth callback server listening on {}:{}", bind_host, local_port);

        Ok(Self {
            listener,
            base: format!("http://{}:{}", host, local_port),
            path: redirect_uri.path().to_string(),
        })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_addr().ok().map(|a| a.port())
    }

    /// Wait for a single OAuth callback.
    ///
    /// Returns the full callback URL (including query parameters) when received.
    /// A message on `cancel_rx`, or the sender being dropped, cancels the wait.
    pub fn wait(self, cancel_rx: mpsc::Receiver<()>, timeout: Duration) -> CallbackResult {
        let deadline = Instant::now() + timeout;

        loop {
            // Check for cancellation
            match cancel_rx.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                    info!("Callback server cancelled");
                    return CallbackResult::Cancelled;
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }

            if Instant::now() >= deadline {
                info!("Callback server timed out");
                return CallbackResult::TimedOut;
            }

            // Try to accept a connection
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!("Connection from {}", peer_addr);
                    if let Some(url) = self.handle_connection(stream) {
                        info!("OAuth callback received");
                        return CallbackResult::Success(url);
                    }
                    // Not a valid callback request, continue listening
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // No connection yet, sleep briefly and retry
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    return CallbackResult::Error(format!("Connection error: {}", e));
                }
            }
        }
    }

    /// Handle an incoming HTTP connection.
    ///
    /// Returns Some(url) if this was a callback carrying a code or an error.
    fn handle_connection(&self, mut stream: TcpStream) -> Option<String> {
        // Accepted sockets inherit non-blocking mode on some platforms
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

        let mut buffer = [0; 8192];
        let bytes_read = match stream.read(&mut buffer) {
            Ok(n) => n,
            Err(e) => {
                debug!("Failed to read request: {}", e);
                return None;
            }
        };

        let request = String::from_utf8_lossy(&buffer[..bytes_read]);
        let request_line = request.lines().next()?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() < 2 {
            send_response(&mut stream, 400, "Bad Request");
            return None;
        }

        let (method, target) = (parts[0], parts[1]);

        if method != "GET" {
            send_response(&mut stream, 405, "Method Not Allowed");
            return None;
        }

        let path = target.split('?').next().unwrap_or_default();
        if path != self.path {
            send_response(&mut stream, 404, "Not Found");
            return None;
        }

        let url = format!("{}{}", self.base, target);
        let query: Vec<(String, String)> = Url::parse(&url)
            .map(|u| u.query_pairs().into_owned().collect())
            .unwrap_or_default();
        let param = |name: &str| query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

        // Error callbacks are still handed to the caller
        if let Some(error) = param("error") {
            let message = param("error_description").unwrap_or(error);
            send_page(&mut stream, "Authentication Failed", message);
            return Some(url);
        }

        if param("code").is_none() {
            send_response(&mut stream, 400, "Missing authorization code");
            return None;
        }

        send_page(
            &mut stream,
            "Authentication Successful",
            "You have been signed in. You can close this tab now.",
        );
        Some(url)
    }
}

fn send_page(stream: &mut TcpStream, title: &str, message: &str) {
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; text-align: center; padding-top: 4rem; }}
        p {{ color: #6B7280; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    <p>{message}</p>
</body>
</html>"#,
        title = html_escape(title),
        message = html_escape(message),
    );

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        html.len(),
        html
    );

    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn send_response(stream: &mut TcpStream, status: u16, message: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        message,
        message.len(),
        message
    );

    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn get(port: u16, target: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_extracts_redirect() {
        let server = CallbackServer::bind(&Url::parse("http://localhost:0/callback").unwrap()).unwrap();
        let port = server.local_port().unwrap();
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let handle = thread::spawn(move || server.wait(cancel_rx, Duration::from_secs(10)));

        let not_found = get(port, "/favicon.ico");
        assert!(not_found.starts_with("HTTP/1.1 404"));

        let page = get(port, "/callback?code=XYZ&state=abc");
        assert!(page.contains("Authentication Successful"));

        assert_eq!(
            handle.join().unwrap(),
            CallbackResult::Success(format!("http://localhost:{}/callback?code=XYZ&state=abc", port))
        );
    }

    #[test]
    fn test_error_callback_is_returned() {
        let server = CallbackServer::bind(&Url::parse("http://127.0.0.1:0/cb").unwrap()).unwrap();
        let port = server.local_port().unwrap();
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let handle = thread::spawn(move || server.wait(cancel_rx, Duration::from_secs(10)));
        let page = get(port, "/cb?error=access_denied&error_description=%3Cb%3Edenied%3C%2Fb%3E");
        assert!(page.contains("&lt;b&gt;denied&lt;/b&gt;"));

        match handle.join().unwrap() {
            CallbackResult::Success(url) => assert!(url.contains("error=access_denied")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_and_timeout() {
        let redirect = Url::parse("http://localhost:0/callback").unwrap();

        let server = CallbackServer::bind(&redirect).unwrap();
        let (cancel_tx, cancel_rx) = mpsc::channel();
        drop(cancel_tx);
        assert_eq!(server.wait(cancel_rx, Duration::from_secs(10)), CallbackResult::Cancelled);

        let server = CallbackServer::bind(&redirect).unwrap();
        let (_cancel_tx, cancel_rx) = mpsc::channel();
        assert_eq!(server.wait(cancel_rx, Duration::from_millis(100)), CallbackResult::TimedOut);
    }

    #[test]
    fn test_rejects_non_loopback() {
        let result = CallbackServer::bind(&Url::parse("http://example.com/callback").unwrap());
        assert!(matches!(result, Err(AuthError::InvalidArgument(_))));

        let result = CallbackServer::bind(&Url::parse("https://localhost/callback").unwrap());
        assert!(matches!(result, Err(AuthError::InvalidArgument(_))));
    }
}
