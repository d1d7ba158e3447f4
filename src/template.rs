//! Context blocks injected into the agent's next turn.
//!
//! Each mode renders its instructions from an embedded minijinja template;
//! the modes build a serializable context and pick the template here.

use minijinja::Environment;
use serde::Serialize;

const SESSION_TEMPLATE: &str = include_str!("templates/session.md.jinja");
const RALPH_TEMPLATE: &str = include_str!("templates/ralph.md.jinja");
const PIPELINE_TEMPLATE: &str = include_str!("templates/pipeline.md.jinja");
const AUTOPILOT_TEMPLATE: &str = include_str!("templates/autopilot.md.jinja");
const SWARM_TEMPLATE: &str = include_str!("templates/swarm.md.jinja");
const TEAM_TEMPLATE: &str = include_str!("templates/team.md.jinja");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTemplate {
    Session,
    Ralph,
    Pipeline,
    Autopilot,
    Swarm,
    Team,
}

impl ContextTemplate {
    fn name(self) -> &'static str {
        match self {
            ContextTemplate::Session => "session.md",
            ContextTemplate::Ralph => "ralph.md",
            ContextTemplate::Pipeline => "pipeline.md",
            ContextTemplate::Autopilot => "autopilot.md",
            ContextTemplate::Swarm => "swarm.md",
            ContextTemplate::Team => "team.md",
        }
    }

    fn source(self) -> &'static str {
        match self {
            ContextTemplate::Session => SESSION_TEMPLATE,
            ContextTemplate::Ralph => RALPH_TEMPLATE,
            ContextTemplate::Pipeline => PIPELINE_TEMPLATE,
            ContextTemplate::Autopilot => AUTOPILOT_TEMPLATE,
            ContextTemplate::Swarm => SWARM_TEMPLATE,
            ContextTemplate::Team => TEAM_TEMPLATE,
        }
    }
}

/// Render a context block, trimming trailing whitespace.
pub fn render(template: ContextTemplate, ctx: &impl Serialize) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template(template.name(), template.source())?;

    let rendered = env.get_template(template.name())?.render(ctx)?;
    Ok(rendered.trim_end().to_string())
}
