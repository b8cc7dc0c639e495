//! Time tools: current wall-clock time, locally or in a named zone.

use async_trait::async_trait;
use chrono::{FixedOffset, Local, Utc};
use chrono_tz::Tz;
use colloquy_core::context::CallContext;
use colloquy_core::error::ToolError;
use colloquy_core::tool::Tool;
use tracing::debug;

/// Optional call-context key with the caller's IANA time zone.
pub const TIMEZONE_KEY: &str = "timezone";

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Current time formatted in `zone`.
///
/// Accepts IANA names ("Asia/Kolkata"), "UTC"/"Z", and fixed offsets
/// ("+05:30", "UTC-03:00").
fn now_in(zone: &str) -> Result<String, String> {
    let zone = zone.trim();
    if zone.eq_ignore_ascii_case("utc") || zone.eq_ignore_ascii_case("z") {
        return Ok(Utc::now().format(FORMAT).to_string());
    }

    if let Ok(tz) = zone.parse::<Tz>() {
        return Ok(Utc::now().with_timezone(&tz).format(FORMAT).to_string());
    }

    let offset = zone
        .strip_prefix("UTC")
        .or_else(|| zone.strip_prefix("GMT"))
        .unwrap_or(zone);
    parse_offset(offset)
        .map(|o| Utc::now().with_timezone(&o).format(FORMAT).to_string())
        .ok_or_else(|| format!("Unknown time zone '{zone}'"))
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub struct CurrentLocalTimeTool;

#[async_trait]
impl Tool for CurrentLocalTimeTool {
    fn name(&self) -> &str {
        "getCurrentLocalTime"
    }

    fn description(&self) -> &str {
        "Returns the current time in the user's time zone"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn invoke(
        &self,
        _arguments: serde_json::Value,
        context: &CallContext,
    ) -> Result<String, ToolError> {
        match context.get_str(TIMEZONE_KEY) {
            Some(zone) => {
                debug!(zone = %zone, "Current time in caller's zone");
                now_in(zone).map_err(|reason| ToolError::ExecutionFailed {
                    tool_name: self.name().to_string(),
                    reason,
                })
            }
            None => Ok(Local::now().format(FORMAT).to_string()),
        }
    }
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "getCurrentTime"
    }

    fn description(&self) -> &str {
        "Returns the current time in the specified time zone"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "time_zone": {
                    "type": "string",
                    "description": "IANA time zone name, e.g. Asia/Kolkata, or an offset like +05:30"
                }
            },
            "required": ["time_zone"]
        })
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        _context: &CallContext,
    ) -> Result<String, ToolError> {
        let zone = arguments["time_zone"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments {
                tool_name: self.name().to_string(),
                reason: "Missing 'time_zone' argument".into(),
            })?;

        now_in(zone).map_err(|reason| ToolError::InvalidArguments {
            tool_name: self.name().to_string(),
            reason,
        })
    }
}
