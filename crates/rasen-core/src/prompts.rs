//! Prompt template resolution and rendering.
//!
//! Templates are resolved from the state directory first
//! (`<state_dir>/prompts/<role>.md`), falling back to the defaults bundled
//! into the binary. Rendering is plain `{variable}` substitution — the
//! templates are markdown meant to be edited by humans, so anything fancier
//! would get in the way.

use crate::models::AgentRole;
use std::path::Path;

const INITIALIZER_TEMPLATE: &str = include_str!("../data/prompts/initializer.md");
const CODER_TEMPLATE: &str = include_str!("../data/prompts/coder.md");
const REVIEWER_TEMPLATE: &str = include_str!("../data/prompts/reviewer.md");
const QA_TEMPLATE: &str = include_str!("../data/prompts/qa.md");

fn bundled_template(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Initializer => INITIALIZER_TEMPLATE,
        AgentRole::Coder => CODER_TEMPLATE,
        AgentRole::Reviewer => REVIEWER_TEMPLATE,
        AgentRole::Qa => QA_TEMPLATE,
    }
}

/// Loads the template for a role, preferring a state-dir override.
pub fn resolve_template(state_dir: &Path, role: AgentRole) -> String {
    let override_path = state_dir.join("prompts").join(format!("{}.md", role.name()));
    match std::fs::read_to_string(&override_path) {
        Ok(content) => content,
        Err(_) => bundled_template(role).to_string(),
    }
}

/// Renders a template with `{key}` substitution.
pub fn render(template: &str, variables: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in variables {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

/// Resolves and renders the prompt for a role in one step.
pub fn create_agent_prompt(
    state_dir: &Path,
    role: AgentRole,
    variables: &[(&str, &str)],
) -> String {
    render(&resolve_template(state_dir, role), variables)
}
