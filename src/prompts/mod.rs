//! System prompt templates.

/// Marker line the tool catalog section starts with.  Context assembly
/// checks for it so re-entry never appends the catalog twice.
pub const TOOL_CATALOG_MARKER: &str = "--- Available Tools ---";

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous agent working inside an isolated sandbox with a full \
Linux environment at /workspace, a web browser, and internet access.

Work iteratively: inspect, act through your tools, observe the results, \
and continue until the task is done. Invoke tools with the standard \
function-call format:

<function_calls>
<invoke name=\"tool_name\">
<parameter name=\"param\">value</parameter>
</invoke>
</function_calls>

Rules:
- Use tools for every action on the environment; never claim to have run \
something you did not run.
- Read tool results carefully before deciding the next step; a failed \
tool call is information, not a dead end.
- When you need something only the user can provide, stop and use 'ask'.
- When the task is finished, stop with 'complete' and summarize what you \
did. For logins, captchas, or payments, hand over with \
'web-browser-takeover'.";

/// The default system prompt.  A custom agent prompt replaces this
/// entirely so the model never sees tools it does not have.
pub fn default_system_prompt() -> &'static str {
    DEFAULT_SYSTEM_PROMPT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_teaches_the_call_format() {
        let prompt = default_system_prompt();
        assert!(prompt.contains("<function_calls>"));
        assert!(prompt.contains("complete"));
        assert!(!prompt.contains(TOOL_CATALOG_MARKER));
    }
}
