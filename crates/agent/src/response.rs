use helmsman_core::domain::tool::ToolResult;
use helmsman_core::errors::AgentError;
use serde::Serialize;

/// One executed step of a tool chain.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub result: ToolResult,
}

/// The single reply posted back to the thread.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentResponse {
    pub text: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub outcomes: Vec<ToolOutcome>,
}

impl AgentResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), success: true, error_code: None, suggestion: None, outcomes: Vec::new() }
    }

    /// User-safe rendering of a pipeline error.
    pub fn from_error(error: &AgentError) -> Self {
        Self {
            text: error.user_message(),
            success: false,
            error_code: Some(error.code()),
            suggestion: Some(error.suggestion().to_string()),
            outcomes: Vec::new(),
        }
    }

    /// One outcome is mirrored as-is; several are listed with a status marker each.
    pub fn from_outcomes(outcomes: Vec<ToolOutcome>) -> Self {
        let success = outcomes.iter().all(|outcome| outcome.result.success);
        let failed_tool = outcomes
            .iter()
            .find(|outcome| !outcome.result.success)
            .map(|outcome| outcome.tool_name.clone());

        let text = match outcomes.as_slice() {
            [] => "There was nothing to do for that request.".to_string(),
            [only] => only.result.summary_text(),
            many => many
                .iter()
                .map(|outcome| {
                    let marker = if outcome.result.success { "✅" } else { "❌" };
                    format!("{marker} *{}*: {}", outcome.tool_name, outcome.result.summary_text())
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };

        Self {
            text,
            success,
            error_code: (!success).then_some("TOOL_ERROR"),
            suggestion: failed_tool.map(|tool| tool_suggestion(&tool)),
            outcomes,
        }
    }

    /// Reply text with the suggestion appended on its own line.
    pub fn render(&self) -> String {
        match &self.suggestion {
            Some(suggestion) => format!("{}\n_{}_", self.text, suggestion),
            None => self.text.clone(),
        }
    }
}

pub(crate) fn tool_suggestion(tool_name: &str) -> String {
    format!("Check the details you gave for `{tool_name}` and try again.")
}

#[cfg(test)]
mod tests {
    use helmsman_core::domain::tool::ToolResult;
    use helmsman_core::errors::AgentError;
    use serde_json::json;

    use super::{AgentResponse, ToolOutcome};

    fn outcome(tool: &str, result: ToolResult) -> ToolOutcome {
        ToolOutcome { tool_name: tool.to_string(), result }
    }

    #[test]
    fn single_outcome_is_mirrored() {
        let response = AgentResponse::from_outcomes(vec![outcome(
            "ci_status",
            ToolResult::ok(json!({"state": "green"})).with_display_text("main is green"),
        )]);
        assert_eq!(response.text, "main is green");
        assert!(response.success);
        assert_eq!(response.render(), "main is green");
    }

    #[test]
    fn multiple_outcomes_carry_markers_and_suggestion() {
        let response = AgentResponse::from_outcomes(vec![
            outcome("ci_status", ToolResult::ok(json!("green"))),
            outcome("jira_issue", ToolResult::failure("issue PROJ-9 not found")),
        ]);
        assert_eq!(response.text, "✅ *ci_status*: green\n❌ *jira_issue*: issue PROJ-9 not found");
        assert!(!response.success);
        assert_eq!(response.error_code, Some("TOOL_ERROR"));
        assert!(response.render().contains("`jira_issue`"));
    }

    #[test]
    fn internal_errors_collapse_to_safe_text() {
        let response = AgentResponse::from_error(&AgentError::Internal("token=abc".into()));
        assert_eq!(response.error_code, Some("INTERNAL_ERROR"));
        assert!(!response.render().contains("token=abc"));
    }
}
