//! Model Selector: resolves the active [`ModelSelection`] from a
//! profile catalog plus the precedence chain of spec.md §4.10 —
//! `cli override > env override > persisted preference > profile
//! default` — with an environment-set provider/model acting as a lock
//! that forbids a persisted preference from silently overriding it.

use std::collections::HashMap;

use crate::error::SelectorError;

/// One step of a [`Rulebook`]: a titled phase with an ordered list of
/// steps. Rendered into plain text and concatenated into the system
/// prompt — not a templating engine, just a fixed phases/steps tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RulebookPhase {
    pub title: String,
    pub steps: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rulebook {
    pub phases: Vec<RulebookPhase>,
}

impl Rulebook {
    pub fn render(&self) -> String {
        self.phases
            .iter()
            .map(|phase| {
                let steps = phase
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(index, step)| format!("  {}. {step}", index + 1))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("## {}\n{steps}", phase.title)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// The persisted shape of a model profile, keyed by profile name in the
/// catalog passed to [`resolve`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileBundle {
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt_template: String,
    pub rulebook: Option<Rulebook>,
}

/// The resolved, immutable-for-the-session selection a new [`crate::agent::Agent`]
/// is built from.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSelection {
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: String,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
}

/// Resolves which profile is active, in precedence order `cli > env >
/// persisted > default`. An env-set profile name locks out a differing
/// persisted preference (`SelectorError::EnvLocked`) rather than letting
/// it silently win — a user who pins a profile via the environment
/// expects that pin to hold even if an older preference was saved.
pub fn resolve_profile_name(
    cli_override: Option<&str>,
    env_override: Option<&str>,
    persisted: Option<&str>,
    default_profile: &str,
) -> Result<String, SelectorError> {
    if let Some(cli) = cli_override {
        return Ok(cli.to_string());
    }

    if let Some(env) = env_override {
        if let Some(persisted) = persisted {
            if persisted != env {
                return Err(SelectorError::EnvLocked(persisted.to_string()));
            }
        }
        return Ok(env.to_string());
    }

    if let Some(persisted) = persisted {
        return Ok(persisted.to_string());
    }

    Ok(default_profile.to_string())
}

/// Resolves the full [`ModelSelection`] for the active profile: picks
/// the profile name per [`resolve_profile_name`], looks up its bundle,
/// and renders its rulebook (if any) into the system prompt.
pub fn resolve(
    cli_override: Option<&str>,
    env_override: Option<&str>,
    persisted: Option<&str>,
    default_profile: &str,
    profiles: &HashMap<String, ProfileBundle>,
) -> Result<ModelSelection, SelectorError> {
    let profile_name = resolve_profile_name(cli_override, env_override, persisted, default_profile)?;

    let bundle = profiles
        .get(&profile_name)
        .ok_or_else(|| SelectorError::UnknownProfile(profile_name.clone()))?;

    let system_prompt = match &bundle.rulebook {
        Some(rulebook) if !rulebook.phases.is_empty() => {
            format!("{}\n\n{}", bundle.system_prompt_template, rulebook.render())
        }
        _ => bundle.system_prompt_template.clone(),
    };

    Ok(ModelSelection {
        provider: bundle.provider.clone(),
        model: bundle.model.clone(),
        temperature: bundle.temperature,
        max_tokens: bundle.max_tokens,
        system_prompt,
        reasoning_effort: None,
        verbosity: None,
    })
}

/// Reads the brand-prefixed `*_PROFILE` environment variable (spec.md
/// §6), case-insensitive on the prefix.
pub fn env_profile_override(prefix: &str) -> Option<String> {
    std::env::var(format!("{}_PROFILE", prefix.to_ascii_uppercase())).ok()
}
