// Browser sandbox seam and action-loop detection
//
// The browser driver is an external collaborator with a minimal capability
// set. Actions are kept as raw JSON (the provider evolves their shape) with
// typed accessors for the fields the loop needs.

use async_trait::async_trait;
use serde_json::Value;

use leadforge_core::Result;

/// Minimal capability set the computer-use loop needs from a browser sandbox
#[async_trait]
pub trait BrowserEnvironment: Send + Sync {
    async fn initialize(&self, display_width: u32, display_height: u32) -> Result<()>;

    async fn execute(&self, action: &Value) -> Result<()>;

    /// Raw base64 JPEG of the current viewport
    async fn capture_screenshot(&self) -> Result<String>;

    async fn current_url(&self) -> Result<String>;

    async fn cleanup(&self) -> Result<()>;
}

/// Post-action settle time in milliseconds
pub fn post_action_wait_ms(action_type: &str) -> u64 {
    match action_type {
        "click" | "type" | "keypress" | "drag" | "drag_and_drop" => 1500,
        "navigate" => 2000,
        "scroll" => 800,
        "screenshot" => 0,
        _ => 1000,
    }
}

/// Canonical signature of an action: type + the geometric or key parameters
/// that make a repeat meaningful. Diverse keypresses must not collide.
pub fn action_signature(action: &Value) -> String {
    let action_type = action.get("type").and_then(Value::as_str).unwrap_or("unknown");
    let get = |key: &str| -> String {
        match action.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    };

    match action_type {
        "keypress" => {
            let keys = match action.get("keys").and_then(Value::as_array) {
                Some(keys) if !keys.is_empty() => keys
                    .iter()
                    .map(|k| k.as_str().map(str::to_string).unwrap_or_else(|| k.to_string()))
                    .collect::<Vec<_>>()
                    .join(","),
                _ => get("key"),
            };
            format!("keypress:{}", clip(&keys, 80))
        }
        "click" => format!("click:{}:{}:{}", get("x"), get("y"), get("button")),
        "double_click" => format!("dblclick:{}:{}:{}", get("x"), get("y"), get("button")),
        "drag" | "drag_and_drop" => {
            let (sx, sy, tx, ty) = drag_endpoints(action);
            format!("drag:{sx}:{sy}:{tx}:{ty}")
        }
        "hover" | "move" => format!("hover:{}:{}", get("x"), get("y")),
        "scroll" => {
            let sx = first_of(action, &["scroll_x", "delta_x"]);
            let sy = first_of(action, &["scroll_y", "delta_y"]);
            format!("scroll:{}:{}:{sx}:{sy}", get("x"), get("y"))
        }
        "type" => format!("type:{}", clip(&get("text"), 80)),
        "wait" => format!("wait:{}", get("duration_ms")),
        "navigate" => format!("navigate:{}", clip(&get("url"), 120)),
        other => format!("{other}:{}", clip(&action.to_string(), 120)),
    }
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn first_of(action: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(value) = action.get(*key) {
            if !value.is_null() {
                return match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
        }
    }
    "0".to_string()
}

fn drag_endpoints(action: &Value) -> (String, String, String, String) {
    if let Some(path) = action.get("path").and_then(Value::as_array) {
        if path.len() >= 2 {
            let p0 = &path[0];
            let p1 = &path[path.len() - 1];
            let get = |p: &Value, k: &str| {
                p.get(k)
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default()
            };
            return (get(p0, "x"), get(p0, "y"), get(p1, "x"), get(p1, "y"));
        }
    }
    let pick = |keys: &[&str]| first_of(action, keys);
    (
        pick(&["source_x", "start_x", "x"]),
        pick(&["source_y", "start_y", "y"]),
        pick(&["target_x", "end_x", "to_x", "x2"]),
        pick(&["target_y", "end_y", "to_y", "y2"]),
    )
}

// ============================================================================
// Loop detection
// ============================================================================

/// Tracks recent action signatures and fires when the last N are identical.
/// Navigation-like actions use a strict threshold; scroll/keypress/wait are
/// often legitimately repetitive and get a loose one.
pub struct LoopDetector {
    recent: Vec<String>,
    capacity: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(15)
    }
}

impl LoopDetector {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn threshold_for(action_type: &str) -> usize {
        match action_type {
            "keypress" | "scroll" | "wait" => 10,
            _ => 3,
        }
    }

    /// Record an executed action; returns true when a loop is detected
    pub fn record(&mut self, action: &Value) -> bool {
        let signature = action_signature(action);
        self.recent.push(signature.clone());
        if self.recent.len() > self.capacity {
            self.recent.remove(0);
        }

        let action_type = action.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let threshold = Self::threshold_for(action_type);
        if self.recent.len() < threshold {
            return false;
        }
        self.recent[self.recent.len() - threshold..]
            .iter()
            .all(|s| s == &signature)
    }
}
