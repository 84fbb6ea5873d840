//! The closed persona set and its static profile table.
//!
//! Personas are a tagged enum rather than open-ended objects: every persona
//! maps to a fixed prompt template and focus description looked up from a
//! compile-time table. The precedence order used for conflict
//! auto-resolution is deliberately NOT part of the table — it is
//! configuration input (see `PrecedenceTable`), so deployments can rank
//! personas differently without touching code.

use crate::run::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named agent role with a fixed prompt template.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    Architect,
    SeniorEngineer,
    Tester,
    Reviewer,
}

/// Static capability record for one persona.
#[derive(Debug, Clone, Copy)]
pub struct PersonaProfile {
    pub name: &'static str,
    /// What this persona is asked to optimize for.
    pub focus: &'static str,
    /// Prompt preamble; the engine appends the phase briefing and context.
    pub preamble: &'static str,
}

impl Persona {
    /// All personas, in a stable order.
    pub const ALL: [Persona; 4] = [
        Persona::Architect,
        Persona::SeniorEngineer,
        Persona::Tester,
        Persona::Reviewer,
    ];

    pub fn as_str(&self) -> &'static str {
        self.profile().name
    }

    /// Look up the persona's static profile.
    pub fn profile(&self) -> PersonaProfile {
        match self {
            Self::Architect => PersonaProfile {
                name: "architect",
                focus: "system boundaries, interfaces, long-term structure",
                preamble: "You are the architect. Shape the overall structure: \
                           module boundaries, data flow, and the interfaces other \
                           work will depend on.",
            },
            Self::SeniorEngineer => PersonaProfile {
                name: "senior_engineer",
                focus: "implementation strategy, risk, delivery order",
                preamble: "You are the senior engineer. Turn the goal into a \
                           concrete implementation strategy: what to build first, \
                           where the risk is, and what can be deferred.",
            },
            Self::Tester => PersonaProfile {
                name: "tester",
                focus: "failure modes, edge cases, verification strategy",
                preamble: "You are the tester. Enumerate failure modes and edge \
                           cases, and state how each part of the work will be \
                           verified.",
            },
            Self::Reviewer => PersonaProfile {
                name: "reviewer",
                focus: "consistency, maintainability, standards",
                preamble: "You are the reviewer. Judge the work for consistency \
                           with existing conventions, maintainability, and \
                           clarity.",
            },
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "architect" => Ok(Self::Architect),
            "senior_engineer" => Ok(Self::SeniorEngineer),
            "tester" => Ok(Self::Tester),
            "reviewer" => Ok(Self::Reviewer),
            _ => Err(format!("Invalid persona: {}", s)),
        }
    }
}

/// Per-phase briefing appended to every persona's prompt.
fn phase_briefing(phase: Phase) -> &'static str {
    match phase {
        Phase::Analysis => {
            "Analyze the feature request. Identify requirements, constraints, \
             affected areas, and open questions."
        }
        Phase::Design => {
            "Produce a design for the feature: components, data model, \
             interfaces, and the trade-offs you weighed."
        }
        Phase::Finalization => {
            "Consolidate the design into a final, buildable plan. Resolve \
             remaining ambiguity; be precise about interfaces and ordering."
        }
        Phase::Implementation => {
            "Describe the exact changes to make: files, functions, tests, and \
             the order to land them in."
        }
    }
}

/// Render the full prompt for one persona in one phase.
///
/// Positions must be machine-readable so disagreements between personas can
/// be detected without another model call; the tag contract here is what the
/// conflict detector parses.
pub fn render_prompt(persona: Persona, phase: Phase, feature: &str, context: &str) -> String {
    let profile = persona.profile();
    format!(
        "{preamble}\n\
         Focus: {focus}.\n\n\
         ## Task\n{briefing}\n\n\
         ## Feature\n{feature}\n\n\
         ## Accumulated context\n{context}\n\n\
         ## Output contract\n\
         For every decision you take a stance on, emit exactly one tag:\n\
         <position topic=\"kebab-case-topic\" kind=\"disagreement|implementation_choice|priority|tradeoff\" weight=\"low|medium|high\">your stance</position>\n\
         Free-form reasoning may surround the tags.",
        preamble = profile.preamble,
        focus = profile.focus,
        briefing = phase_briefing(phase),
        feature = feature,
        context = if context.is_empty() { "(none)" } else { context },
    )
}

/// Configured persona ranking used to auto-resolve low/medium conflicts.
///
/// Earlier entries outrank later ones. Personas absent from the table have
/// no rank: their conflicts always escalate to a human.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PrecedenceTable {
    order: Vec<Persona>,
}

impl PrecedenceTable {
    pub fn new(order: Vec<Persona>) -> Self {
        Self { order }
    }

    /// Rank of a persona, 0 being highest. `None` if unranked.
    pub fn rank(&self, persona: Persona) -> Option<usize> {
        self.order.iter().position(|p| *p == persona)
    }

    /// The higher-precedence persona of a set, or `None` when any involved
    /// persona is unranked (no rule applies, so no auto-resolution).
    pub fn winner(&self, personas: &[Persona]) -> Option<Persona> {
        let mut best: Option<(usize, Persona)> = None;
        for &p in personas {
            let rank = self.rank(p)?;
            best = match best {
                Some((r, _)) if r <= rank => best,
                _ => Some((rank, p)),
            };
        }
        best.map(|(_, p)| p)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
