//! Built-in, code-backed master tools.
//!
//! Each built-in tool exposes a single MCP entry name with an `action`
//! discriminator in its arguments; dispatch into subroutines happens
//! here, not in the JSON-RPC layer. Two tools are registered by name:
//! - `browser`   -- browser automation over a CDP transport seam
//! - `brainloop` -- analysis/meta toolbox (tool CRUD, audit, codebase reading)
//!
//! Contract with the dispatcher: honour the MCP tool-descriptor shape,
//! return a serializable value or a classified error string, and release
//! resources through [`BuiltinHost::disconnect`] at shutdown.

pub mod browser;
pub mod toolbox;

use std::sync::Arc;

use serde_json::Value;

use browser::BrowserTools;
use toolbox::ToolboxTools;

/// The host for all built-in tools.
pub struct BuiltinHost {
    browser: BrowserTools,
    toolbox: ToolboxTools,
}

impl BuiltinHost {
    pub fn new(browser: BrowserTools, toolbox: ToolboxTools) -> Arc<Self> {
        Arc::new(Self { browser, toolbox })
    }

    /// Whether `name` is one of the built-in master tools.
    pub fn is_builtin(name: &str) -> bool {
        matches!(name, "browser" | "brainloop")
    }

    /// MCP descriptors for the built-in tools, listed ahead of the
    /// SQL-backed catalog.
    pub fn descriptors(&self) -> Vec<Value> {
        vec![self.browser.descriptor(), self.toolbox.descriptor()]
    }

    /// Dispatch a `tools/call` aimed at a built-in tool.
    pub async fn execute(&self, name: &str, args: &Value) -> Result<Value, String> {
        let action = args
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "action parameter is required".to_string())?;

        match name {
            "browser" => self.browser.execute(action, args).await,
            "brainloop" => self.toolbox.execute(action, args).await,
            other => Err(format!("unknown built-in tool: {other}")),
        }
    }

    /// Lifecycle hook: release external resources (the CDP session).
    pub async fn disconnect(&self) {
        self.browser.disconnect().await;
    }
}
