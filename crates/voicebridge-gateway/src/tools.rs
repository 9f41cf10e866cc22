//! Functions the model may invoke mid-call, with the phrase spoken while
//! each one runs.
//!
//! The registry resolves the model's function-call directives by name; the
//! manifest is what gets declared to the LLM collaborator.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use voicebridge_core::{BridgeResult, Tool, ToolRegistry, ToolSpec};

/// Look up open demo slots for a given day.
struct CheckAvailability;

#[async_trait]
impl Tool for CheckAvailability {
    async fn invoke(&self, args: serde_json::Value) -> BridgeResult<String> {
        let date = args["date"].as_str().unwrap_or("this week");
        info!("checking availability for {date}");
        // Stand-in calendar until the booking backend is wired up.
        Ok(serde_json::json!({
            "date": date,
            "slots": ["10:00", "14:30", "16:00"],
        })
        .to_string())
    }
}

/// Book the follow-up demo and send the invite.
struct ScheduleDemo;

#[async_trait]
impl Tool for ScheduleDemo {
    async fn invoke(&self, args: serde_json::Value) -> BridgeResult<String> {
        let email = args["email"].as_str().unwrap_or("unknown");
        let date = args["date"].as_str().unwrap_or("unspecified");
        let time = args["time"].as_str().unwrap_or("unspecified");
        info!("scheduling demo for {email} on {date} at {time}");
        Ok(serde_json::json!({
            "status": "confirmed",
            "email": email,
            "date": date,
            "time": time,
        })
        .to_string())
    }
}

/// Function declarations handed to the LLM collaborator.
pub fn manifest() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "check_availability".to_string(),
            description: "Look up open demo slots on a given date.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "date": {
                        "type": "string",
                        "description": "The day the prospect asked about, e.g. 2026-08-12",
                    },
                },
                "required": ["date"],
            }),
            say: "Let me check the calendar for you.".to_string(),
        },
        ToolSpec {
            name: "schedule_demo".to_string(),
            description: "Book a follow-up demo once an email, date and time are agreed."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "email": { "type": "string", "description": "Prospect's email address" },
                    "date": { "type": "string", "description": "Agreed date" },
                    "time": { "type": "string", "description": "Agreed time" },
                },
                "required": ["email", "date", "time"],
            }),
            say: "One moment while I get that on the calendar.".to_string(),
        },
    ]
}

/// Name → implementation lookup for the conversation driver.
pub fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.insert("check_availability".to_string(), Arc::new(CheckAvailability));
    registry.insert("schedule_demo".to_string(), Arc::new(ScheduleDemo));
    registry
}
