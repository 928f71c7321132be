//! Tool directive
//!
//! Renders declared tools and the `<tool_call>` calling convention into a
//! block for the system turn.

use crate::types::request::{ToolChoice, ToolDeclaration};

/// Opening tag of a tool call emission
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
/// Closing tag of a tool call emission
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Tools offered to the engine for one request
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPlan {
    /// Tools listed in the prompt
    pub tools: Vec<ToolDeclaration>,
    /// Every tool the request declared. Calls are validated against these.
    pub declared: Vec<ToolDeclaration>,
    /// Function the engine is told to call
    pub forced: Option<String>,
}

/// Resolves declared tools and the caller's choice into what the prompt offers.
///
/// Returns `None` when nothing is offered: no tools, or `tool_choice` none.
pub fn plan_tools(tools: &[ToolDeclaration], choice: Option<&ToolChoice>) -> Option<ToolPlan> {
    if tools.is_empty() {
        return None;
    }

    match choice.cloned().unwrap_or_default() {
        ToolChoice::None => {
            tracing::debug!("tool_choice is none, {} declared tool(s) not offered", tools.len());
            None
        }
        ToolChoice::Auto => Some(ToolPlan {
            tools: tools.to_vec(),
            declared: tools.to_vec(),
            forced: None,
        }),
        ToolChoice::Required => {
            tracing::info!("tool_choice required is not supported by the engine, using auto");
            Some(ToolPlan {
                tools: tools.to_vec(),
                declared: tools.to_vec(),
                forced: None,
            })
        }
        ToolChoice::Function(name) => match tools.iter().find(|t| t.name == name) {
            Some(tool) => Some(ToolPlan {
                tools: vec![tool.clone()],
                declared: tools.to_vec(),
                forced: Some(name),
            }),
            None => {
                tracing::warn!("tool_choice names undeclared function {}, using auto", name);
                Some(ToolPlan {
                    tools: tools.to_vec(),
                    declared: tools.to_vec(),
                    forced: None,
                })
            }
        },
    }
}

/// Builds the tool block appended to the system turn.
pub fn tool_directive(plan: &ToolPlan) -> String {
    let mut out = String::from(
        "# Tools\n\n\
         You may call one or more functions to assist with the user query.\n\n\
         You are provided with function signatures within <tools></tools> XML tags:\n<tools>\n",
    );

    for tool in &plan.tools {
        let signature = serde_json::json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        });
        out.push_str(&signature.to_string());
        out.push('\n');
    }
    out.push_str("</tools>\n\n");

    out.push_str(
        "For each function call, return a json object with function name and arguments \
         within <tool_call></tool_call> XML tags:\n",
    );
    out.push_str(TOOL_CALL_OPEN);
    out.push_str("\n{\"name\": <function-name>, \"arguments\": <args-json-object>}\n");
    out.push_str(TOOL_CALL_CLOSE);

    if let Some(name) = &plan.forced {
        out.push_str(&format!(
            "\n\nYou must call the function `{}` to answer this request.",
            name
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared() -> Vec<ToolDeclaration> {
        vec![
            ToolDeclaration::new(
                "get_rate",
                "Current policy rate",
                json!({"type": "object", "properties": {"bank": {"type": "string"}}}),
            ),
            ToolDeclaration::new("convert", "Currency conversion", json!({"type": "object"})),
        ]
    }

    #[test]
    fn test_no_plan_without_tools_or_with_none() {
        assert!(plan_tools(&[], Some(&ToolChoice::Auto)).is_none());
        assert!(plan_tools(&declared(), Some(&ToolChoice::None)).is_none());
    }

    #[test]
    fn test_required_maps_to_auto() {
        let plan = plan_tools(&declared(), Some(&ToolChoice::Required)).unwrap();
        assert_eq!(plan.tools.len(), 2);
        assert!(plan.forced.is_none());
        assert_eq!(plan, plan_tools(&declared(), None).unwrap());
    }

    #[test]
    fn test_named_choice_narrows() {
        let plan =
            plan_tools(&declared(), Some(&ToolChoice::Function("convert".into()))).unwrap();
        assert_eq!(plan.tools.len(), 1);
        assert_eq!(plan.tools[0].name, "convert");
        assert_eq!(plan.declared, declared());

        let block = tool_directive(&plan);
        assert!(block.contains("\"name\":\"convert\""));
        assert!(!block.contains("get_rate"));
        assert!(block.contains("You must call the function `convert`"));
    }

    #[test]
    fn test_named_choice_for_unknown_tool_falls_back() {
        let plan = plan_tools(&declared(), Some(&ToolChoice::Function("nope".into()))).unwrap();
        assert_eq!(plan.tools.len(), 2);
        assert!(plan.forced.is_none());
    }

    #[test]
    fn test_directive_lists_tools_and_convention() {
        let block = tool_directive(&plan_tools(&declared(), None).unwrap());
        assert!(block.contains("get_rate"));
        assert!(block.contains("Current policy rate"));
        assert!(block.contains("\"bank\""));
        assert!(block.contains("<tool_call>\n{\"name\": <function-name>"));
        assert!(block.ends_with("</tool_call>"));
    }
}
