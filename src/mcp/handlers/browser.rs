//! Browser automation master tool.
//!
//! One MCP tool (`browser`) with an `action` discriminator. The actual
//! Chrome DevTools Protocol client lives behind the [`CdpTransport`]
//! seam: this module owns the action surface, argument validation, the
//! connection state machine and per-call timeouts, and translates
//! transport failures into classified errors. `CDP_DEBUG=1` enables
//! verbose command tracing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

/// Default per-call timeout for CDP commands.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Screenshot / PDF rendering gets a longer window.
const LONG_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for the `wait` action.
const MAX_WAIT_MS: u64 = 30_000;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// The seam to the external CDP client. Implementations speak to a
/// debugger WebSocket; the default [`UnavailableTransport`] reports the
/// collaborator as absent.
pub trait CdpTransport: Send + Sync {
    /// Launch a browser process and attach to its debug port.
    fn launch(&self, port: u16, headless: bool) -> TransportFuture<'_, Value>;
    /// Attach to an already-running browser.
    fn connect(&self, port: u16) -> TransportFuture<'_, Value>;
    /// Issue one CDP command.
    fn command(&self, method: &str, params: Value) -> TransportFuture<'_, Value>;
    /// Tear the connection down.
    fn disconnect(&self) -> TransportFuture<'_, ()>;
}

/// Stand-in used when no CDP client is wired up.
pub struct UnavailableTransport;

impl CdpTransport for UnavailableTransport {
    fn launch(&self, _port: u16, _headless: bool) -> TransportFuture<'_, Value> {
        Box::pin(async { Err("chromium transport unavailable: no CDP client configured".into()) })
    }

    fn connect(&self, _port: u16) -> TransportFuture<'_, Value> {
        Box::pin(async { Err("chromium transport unavailable: no CDP client configured".into()) })
    }

    fn command(&self, _method: &str, _params: Value) -> TransportFuture<'_, Value> {
        Box::pin(async { Err("chromium transport unavailable: no CDP client configured".into()) })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Active debugger attachment.
#[derive(Debug, Clone)]
struct Session {
    port: u16,
}

/// The `browser` master tool.
pub struct BrowserTools {
    transport: Arc<dyn CdpTransport>,
    session: Mutex<Option<Session>>,
    default_port: u16,
    debug: bool,
}

fn long_action(action: &str) -> bool {
    matches!(action, "screenshot" | "pdf")
}

impl BrowserTools {
    pub fn new(transport: Arc<dyn CdpTransport>, default_port: u16) -> Self {
        Self {
            transport,
            session: Mutex::new(None),
            default_port,
            debug: std::env::var("CDP_DEBUG").is_ok_and(|v| v == "1"),
        }
    }

    /// MCP descriptor for the master tool.
    pub fn descriptor(&self) -> Value {
        json!({
            "name": "browser",
            "description": "Browser automation tool. Actions: launch, connect, navigate, \
                screenshot, evaluate, click, type, wait, get_html, get_url, get_title, \
                cookies, set_cookie, pdf, close, list_actions",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "description": "Action to perform",
                        "enum": [
                            "launch", "connect", "navigate", "screenshot", "evaluate",
                            "click", "type", "wait", "get_html", "get_url", "get_title",
                            "cookies", "set_cookie", "pdf", "close", "list_actions"
                        ]
                    },
                    "url": {"type": "string", "description": "URL (for navigate)"},
                    "expression": {"type": "string", "description": "JavaScript (for evaluate)"},
                    "selector": {"type": "string", "description": "CSS selector (for click/type)"},
                    "text": {"type": "string", "description": "Text to type (for type)"},
                    "port": {"type": "integer", "description": "Debug port (for launch/connect)"},
                    "headless": {"type": "boolean", "description": "Headless mode (for launch)"},
                    "ms": {"type": "integer", "description": "Milliseconds to wait (for wait)"},
                    "name": {"type": "string", "description": "Cookie name (for set_cookie)"},
                    "value": {"type": "string", "description": "Cookie value (for set_cookie)"},
                    "domain": {"type": "string", "description": "Cookie domain (for set_cookie)"}
                },
                "required": ["action"]
            }
        })
    }

    /// Dispatch one action.
    pub async fn execute(&self, action: &str, args: &Value) -> Result<Value, String> {
        if self.debug {
            debug!(action, ?args, "browser action");
        }

        match action {
            "launch" => self.launch(args).await,
            "connect" => self.connect(args).await,
            "navigate" => {
                let url = require_str(args, "url")?;
                self.command(action, "Page.navigate", json!({"url": url})).await
            }
            "screenshot" => {
                let format = args.get("format").and_then(|v| v.as_str()).unwrap_or("png");
                self.command(action, "Page.captureScreenshot", json!({"format": format}))
                    .await
            }
            "evaluate" => {
                let expression = require_str(args, "expression")?;
                self.command(
                    action,
                    "Runtime.evaluate",
                    json!({"expression": expression, "returnByValue": true}),
                )
                .await
            }
            "click" => {
                let selector = require_str(args, "selector")?;
                let expr = format!(
                    "document.querySelector({}).click()",
                    js_string(&selector)
                );
                self.command(action, "Runtime.evaluate", json!({"expression": expr}))
                    .await
            }
            "type" => {
                let selector = require_str(args, "selector")?;
                let text = require_str(args, "text")?;
                let expr = format!(
                    "document.querySelector({}).value = {}",
                    js_string(&selector),
                    js_string(&text)
                );
                self.command(action, "Runtime.evaluate", json!({"expression": expr}))
                    .await
            }
            "wait" => {
                let ms = args
                    .get("ms")
                    .and_then(|v| v.as_u64())
                    .ok_or("ms is required for wait")?;
                let ms = ms.min(MAX_WAIT_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"success": true, "action": "wait", "waited_ms": ms}))
            }
            "get_html" => {
                self.command(
                    action,
                    "Runtime.evaluate",
                    json!({"expression": "document.documentElement.outerHTML", "returnByValue": true}),
                )
                .await
            }
            "get_url" => {
                self.command(
                    action,
                    "Runtime.evaluate",
                    json!({"expression": "window.location.href", "returnByValue": true}),
                )
                .await
            }
            "get_title" => {
                self.command(
                    action,
                    "Runtime.evaluate",
                    json!({"expression": "document.title", "returnByValue": true}),
                )
                .await
            }
            "cookies" => self.command(action, "Network.getCookies", json!({})).await,
            "set_cookie" => {
                let name = require_str(args, "name")?;
                let value = require_str(args, "value")?;
                let domain = require_str(args, "domain")?;
                self.command(
                    action,
                    "Network.setCookie",
                    json!({"name": name, "value": value, "domain": domain}),
                )
                .await
            }
            "pdf" => self.command(action, "Page.printToPDF", json!({})).await,
            "close" => self.close().await,
            "list_actions" => Ok(list_actions()),
            other => Err(format!("unknown action: {other}")),
        }
    }

    async fn launch(&self, args: &Value) -> Result<Value, String> {
        let port = args
            .get("port")
            .and_then(|v| v.as_u64())
            .map(|p| p as u16)
            .unwrap_or(self.default_port);
        let headless = args
            .get("headless")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let result = tokio::time::timeout(CALL_TIMEOUT, self.transport.launch(port, headless))
            .await
            .map_err(|_| format!("browser launch timed out after {CALL_TIMEOUT:?}"))??;

        *self.session.lock().await = Some(Session { port });
        Ok(json!({"success": true, "action": "launch", "port": port, "detail": result}))
    }

    async fn connect(&self, args: &Value) -> Result<Value, String> {
        let port = args
            .get("port")
            .and_then(|v| v.as_u64())
            .map(|p| p as u16)
            .unwrap_or(self.default_port);

        let result = tokio::time::timeout(CALL_TIMEOUT, self.transport.connect(port))
            .await
            .map_err(|_| format!("browser connect timed out after {CALL_TIMEOUT:?}"))??;

        *self.session.lock().await = Some(Session { port });
        Ok(json!({"success": true, "action": "connect", "port": port, "detail": result}))
    }

    /// Issue a CDP command through the transport with the per-call
    /// timeout, requiring an active session.
    async fn command(&self, action: &str, method: &str, params: Value) -> Result<Value, String> {
        if self.session.lock().await.is_none() {
            return Err("browser not connected: use launch or connect first".into());
        }

        let timeout = if long_action(action) {
            LONG_CALL_TIMEOUT
        } else {
            CALL_TIMEOUT
        };

        if self.debug {
            debug!(method, %params, "cdp command");
        }

        let result = tokio::time::timeout(timeout, self.transport.command(method, params))
            .await
            .map_err(|_| format!("browser {action} timed out after {timeout:?}"))??;

        Ok(json!({"success": true, "action": action, "result": result}))
    }

    async fn close(&self) -> Result<Value, String> {
        let had_session = self.session.lock().await.take().is_some();
        if had_session {
            self.transport.disconnect().await?;
        }
        Ok(json!({"success": true, "action": "close", "was_connected": had_session}))
    }

    /// Lifecycle hook used by the supervisor at shutdown.
    pub async fn disconnect(&self) {
        if self.session.lock().await.take().is_some() {
            if let Err(e) = self.transport.disconnect().await {
                tracing::warn!(error = %e, "browser disconnect failed");
            }
        }
    }
}

fn require_str(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("{key} is required"))
}

/// Serialize a string as a JavaScript string literal.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn list_actions() -> Value {
    json!({
        "actions": [
            {"name": "launch", "description": "Launch a browser with a debug port", "requires": []},
            {"name": "connect", "description": "Attach to a running browser", "requires": []},
            {"name": "navigate", "description": "Navigate the page to a URL", "requires": ["url"]},
            {"name": "screenshot", "description": "Capture the page as an image", "requires": []},
            {"name": "evaluate", "description": "Evaluate JavaScript in the page", "requires": ["expression"]},
            {"name": "click", "description": "Click the first element matching a selector", "requires": ["selector"]},
            {"name": "type", "description": "Set the value of a matching input", "requires": ["selector", "text"]},
            {"name": "wait", "description": "Sleep for up to 30s", "requires": ["ms"]},
            {"name": "get_html", "description": "Read the page HTML", "requires": []},
            {"name": "get_url", "description": "Read the current URL", "requires": []},
            {"name": "get_title", "description": "Read the page title", "requires": []},
            {"name": "cookies", "description": "List cookies", "requires": []},
            {"name": "set_cookie", "description": "Set a cookie", "requires": ["name", "value", "domain"]},
            {"name": "pdf", "description": "Render the page to PDF", "requires": []},
            {"name": "close", "description": "Disconnect and forget the session", "requires": []},
            {"name": "list_actions", "description": "List all available actions", "requires": []}
        ]
    })
}
