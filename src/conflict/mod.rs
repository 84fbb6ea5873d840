//! Conflict detection and arbitration between agent outputs.
//!
//! Agents state their decisions as machine-readable `<position>` tags (the
//! contract in their prompt), so disagreement detection is a deterministic
//! parse-and-compare over the round's output set — no extra model call, and
//! no dependence on the order the outputs arrived in.
//!
//! Resolution policy: low/medium conflicts between ranked personas are
//! auto-resolved by the configured precedence table, recording the winning
//! stance verbatim. High-severity conflicts, unranked personas, and anything
//! that cannot be classified escalate to a human through the feedback loop.
//! A closed question is never re-opened within the same run.

use crate::agent::AgentOutput;
use crate::errors::ConflictError;
use crate::persona::{Persona, PrecedenceTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The fixed conflict taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Disagreement,
    ImplementationChoice,
    Priority,
    Tradeoff,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disagreement => "disagreement",
            Self::ImplementationChoice => "implementation_choice",
            Self::Priority => "priority",
            Self::Tradeoff => "tradeoff",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disagreement" => Ok(Self::Disagreement),
            "implementation_choice" => Ok(Self::ImplementationChoice),
            "priority" => Ok(Self::Priority),
            "tradeoff" => Ok(Self::Tradeoff),
            _ => Err(format!("Invalid conflict kind: {}", s)),
        }
    }
}

/// Severity of a conflict, ordered least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

impl ConflictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// High-severity conflicts always require a human.
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::High)
    }
}

impl fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// How a conflict was (or will be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    AutoResolved,
    EscalatedToHuman,
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoResolved => write!(f, "auto_resolved"),
            Self::EscalatedToHuman => write!(f, "escalated_to_human"),
        }
    }
}

/// One stance one persona took on one topic, parsed from its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub persona: Persona,
    pub topic: String,
    pub kind: Option<ConflictKind>,
    pub weight: Option<ConflictSeverity>,
    pub stance: String,
}

/// A detected disagreement between two or more agent outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub id: String,
    /// The topic under dispute; the dedup key for no-re-litigation.
    pub question: String,
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    /// Involved personas, sorted.
    pub personas: Vec<Persona>,
    /// Each involved persona's stance, verbatim.
    pub stances: BTreeMap<Persona, String>,
    pub resolution: Option<String>,
    pub action: ResolutionAction,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn close(&mut self, resolution: &str) {
        self.resolution = Some(resolution.to_string());
        self.closed_at = Some(Utc::now());
    }
}

/// A closed conflict, remembered so the same question is never re-litigated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedConflict {
    pub question: String,
    pub resolution: String,
    pub action: ResolutionAction,
    pub closed_at: DateTime<Utc>,
}

/// Append-only record of every conflict closed during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArbitrationHistory {
    closed: Vec<ClosedConflict>,
}

impl ArbitrationHistory {
    pub fn is_closed(&self, question: &str) -> bool {
        self.closed.iter().any(|c| c.question == question)
    }

    /// Record a closed conflict. Ignores records that are still open.
    pub fn record(&mut self, record: &ConflictRecord) {
        let Some(closed_at) = record.closed_at else {
            return;
        };
        self.closed.push(ClosedConflict {
            question: record.question.clone(),
            resolution: record.resolution.clone().unwrap_or_default(),
            action: record.action,
            closed_at,
        });
    }

    pub fn entries(&self) -> &[ClosedConflict] {
        &self.closed
    }
}

/// Pull one attribute value out of a tag header like `topic="x"`.
fn attr<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{}=\"", name);
    let start = header.find(&marker)? + marker.len();
    let rest = &header[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Parse every `<position ...>...</position>` tag from one agent's output.
/// Malformed attribute values parse to `None` and are handled by the
/// classifier (taxonomy fallback), not dropped.
pub fn extract_positions(persona: Persona, content: &str) -> Vec<Position> {
    const OPEN: &str = "<position";
    const CLOSE: &str = "</position>";

    let mut positions = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(header_end) = after_open.find('>') else {
            break;
        };
        let header = &after_open[..header_end];
        let body_start = header_end + 1;
        let Some(body_end) = after_open[body_start..].find(CLOSE) else {
            break;
        };
        let stance = after_open[body_start..body_start + body_end].trim();

        if let Some(topic) = attr(header, "topic") {
            positions.push(Position {
                persona,
                topic: topic.to_string(),
                kind: attr(header, "kind").and_then(|k| k.parse().ok()),
                weight: attr(header, "weight").and_then(|w| w.parse().ok()),
                stance: stance.to_string(),
            });
        }
        rest = &after_open[body_start + body_end + CLOSE.len()..];
    }
    positions
}

/// Normalize a stance for comparison: agreement phrased differently is still
/// agreement.
fn normalize(stance: &str) -> String {
    stance.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Classify a group of differing positions into (kind, severity).
///
/// Fails when the positions do not agree on a kind (or omit it); callers
/// must fall back to severity high and escalate.
fn classify(positions: &[&Position]) -> Result<(ConflictKind, ConflictSeverity), ConflictError> {
    let mut kinds = positions.iter().map(|p| p.kind);
    let first = kinds.next().flatten().ok_or_else(|| ConflictError::Taxonomy {
        question: positions[0].topic.clone(),
    })?;
    for kind in kinds {
        if kind != Some(first) {
            return Err(ConflictError::Taxonomy {
                question: positions[0].topic.clone(),
            });
        }
    }

    let severity = positions
        .iter()
        .filter_map(|p| p.weight)
        .max()
        .unwrap_or(ConflictSeverity::Medium);
    Ok((first, severity))
}

/// Detect conflicts across a round's successful outputs.
///
/// Order-independent: outputs are grouped by topic and sorted by persona, so
/// permuting the input never changes the resulting records. Topics already
/// closed in the arbitration history are skipped entirely.
pub fn detect_conflicts(
    outputs: &[&AgentOutput],
    history: &ArbitrationHistory,
) -> Vec<ConflictRecord> {
    let mut by_topic: BTreeMap<String, Vec<Position>> = BTreeMap::new();
    for output in outputs {
        for position in extract_positions(output.persona, &output.content) {
            by_topic.entry(position.topic.clone()).or_default().push(position);
        }
    }

    let mut records = Vec::new();
    for (topic, mut positions) in by_topic {
        if history.is_closed(&topic) {
            continue;
        }
        positions.sort_by_key(|p| p.persona);

        let distinct: std::collections::BTreeSet<String> =
            positions.iter().map(|p| normalize(&p.stance)).collect();
        if distinct.len() < 2 {
            continue;
        }

        let refs: Vec<&Position> = positions.iter().collect();
        let (kind, severity) = match classify(&refs) {
            Ok(classified) => classified,
            // Unclassifiable disagreements force human review.
            Err(ConflictError::Taxonomy { .. }) => {
                (ConflictKind::Disagreement, ConflictSeverity::High)
            }
        };

        let mut stances = BTreeMap::new();
        for position in &positions {
            stances.insert(position.persona, position.stance.clone());
        }
        let personas: Vec<Persona> = stances.keys().copied().collect();

        records.push(ConflictRecord {
            id: uuid::Uuid::new_v4().to_string(),
            question: topic,
            kind,
            severity,
            personas,
            stances,
            resolution: None,
            action: ResolutionAction::EscalatedToHuman,
            opened_at: Utc::now(),
            closed_at: None,
        });
    }
    records
}

/// Applies the precedence policy to freshly detected conflicts.
pub struct Resolver {
    precedence: PrecedenceTable,
}

impl Resolver {
    pub fn new(precedence: PrecedenceTable) -> Self {
        Self { precedence }
    }

    /// Auto-resolve what the policy allows; everything else stays open and
    /// escalated. Returns how many records were auto-resolved.
    pub fn resolve(&self, records: &mut [ConflictRecord]) -> usize {
        let mut resolved = 0;
        for record in records.iter_mut() {
            if record.severity.requires_human() {
                continue;
            }
            let Some(winner) = self.precedence.winner(&record.personas) else {
                continue;
            };
            // The winner's stance, verbatim, becomes the resolution.
            let Some(stance) = record.stances.get(&winner).cloned() else {
                continue;
            };
            record.action = ResolutionAction::AutoResolved;
            record.close(&stance);
            resolved += 1;
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Phase;
    use crate::store::ArtifactKey;

    fn output(persona: Persona, content: &str) -> AgentOutput {
        AgentOutput {
            persona,
            content: content.to_string(),
            artifact: ArtifactKey::new("r1", Phase::Design, persona, 1),
            produced_at: Utc::now(),
        }
    }

    fn tag(topic: &str, kind: &str, weight: &str, stance: &str) -> String {
        format!(
            "<position topic=\"{}\" kind=\"{}\" weight=\"{}\">{}</position>",
            topic, kind, weight, stance
        )
    }

    // =========================================
    // Position extraction tests
    // =========================================

    #[test]
    fn test_extract_single_position() {
        let content = format!(
            "Some reasoning.\n{}\nMore prose.",
            tag("storage-engine", "implementation_choice", "medium", "use sqlite")
        );
        let positions = extract_positions(Persona::Architect, &content);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].topic, "storage-engine");
        assert_eq!(positions[0].kind, Some(ConflictKind::ImplementationChoice));
        assert_eq!(positions[0].weight, Some(ConflictSeverity::Medium));
        assert_eq!(positions[0].stance, "use sqlite");
    }

    #[test]
    fn test_extract_multiple_positions() {
        let content = format!(
            "{}\n{}",
            tag("storage-engine", "implementation_choice", "low", "sqlite"),
            tag("api-shape", "disagreement", "high", "rest only")
        );
        let positions = extract_positions(Persona::Tester, &content);
        assert_eq!(positions.len(), 2);
    }

    #[test]
    fn test_extract_tolerates_missing_attributes() {
        let content = "<position topic=\"caching\">write-through</position>";
        let positions = extract_positions(Persona::Reviewer, content);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].kind, None);
        assert_eq!(positions[0].weight, None);
    }

    #[test]
    fn test_extract_ignores_tagless_output() {
        let positions = extract_positions(Persona::Architect, "plain prose, no tags");
        assert!(positions.is_empty());
    }

    // =========================================
    // Detection tests
    // =========================================

    #[test]
    fn test_agreeing_stances_produce_no_conflict() {
        let outputs = [
            output(
                Persona::Architect,
                &tag("storage-engine", "implementation_choice", "low", "Use SQLite"),
            ),
            output(
                Persona::Tester,
                &tag("storage-engine", "implementation_choice", "low", "use   sqlite"),
            ),
        ];
        let refs: Vec<&AgentOutput> = outputs.iter().collect();
        let records = detect_conflicts(&refs, &ArbitrationHistory::default());
        assert!(records.is_empty());
    }

    #[test]
    fn test_differing_stances_produce_one_record_per_topic() {
        let outputs = [
            output(
                Persona::Architect,
                &tag("storage-engine", "implementation_choice", "medium", "sqlite"),
            ),
            output(
                Persona::SeniorEngineer,
                &tag("storage-engine", "implementation_choice", "low", "postgres"),
            ),
        ];
        let refs: Vec<&AgentOutput> = outputs.iter().collect();
        let records = detect_conflicts(&refs, &ArbitrationHistory::default());

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.question, "storage-engine");
        assert_eq!(record.kind, ConflictKind::ImplementationChoice);
        // Severity is the max declared weight.
        assert_eq!(record.severity, ConflictSeverity::Medium);
        assert_eq!(
            record.personas,
            vec![Persona::Architect, Persona::SeniorEngineer]
        );
        assert!(record.is_open());
    }

    #[test]
    fn test_detection_is_order_independent() {
        let a = output(
            Persona::Architect,
            &tag("api-shape", "disagreement", "high", "rest"),
        );
        let b = output(
            Persona::Tester,
            &tag("api-shape", "disagreement", "low", "graphql"),
        );
        let c = output(
            Persona::Reviewer,
            &tag("caching", "tradeoff", "low", "none needed"),
        );

        let forward: Vec<&AgentOutput> = vec![&a, &b, &c];
        let backward: Vec<&AgentOutput> = vec![&c, &b, &a];
        let history = ArbitrationHistory::default();

        let strip = |mut records: Vec<ConflictRecord>| {
            for r in records.iter_mut() {
                r.id = String::new();
                r.opened_at = DateTime::<Utc>::MIN_UTC;
            }
            records
        };
        assert_eq!(
            strip(detect_conflicts(&forward, &history)),
            strip(detect_conflicts(&backward, &history))
        );
    }

    #[test]
    fn test_unclassifiable_conflict_defaults_to_high() {
        // Kinds disagree between the two positions.
        let outputs = [
            output(Persona::Architect, &tag("api-shape", "priority", "low", "rest")),
            output(
                Persona::Tester,
                &tag("api-shape", "tradeoff", "low", "graphql"),
            ),
        ];
        let refs: Vec<&AgentOutput> = outputs.iter().collect();
        let records = detect_conflicts(&refs, &ArbitrationHistory::default());

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, ConflictSeverity::High);
        assert_eq!(records[0].kind, ConflictKind::Disagreement);
    }

    #[test]
    fn test_missing_kind_defaults_to_high() {
        let outputs = [
            output(Persona::Architect, "<position topic=\"x\">a</position>"),
            output(Persona::Tester, "<position topic=\"x\">b</position>"),
        ];
        let refs: Vec<&AgentOutput> = outputs.iter().collect();
        let records = detect_conflicts(&refs, &ArbitrationHistory::default());
        assert_eq!(records[0].severity, ConflictSeverity::High);
    }

    #[test]
    fn test_closed_question_is_never_relitigated() {
        let outputs = [
            output(
                Persona::Architect,
                &tag("storage-engine", "implementation_choice", "low", "sqlite"),
            ),
            output(
                Persona::Tester,
                &tag("storage-engine", "implementation_choice", "low", "postgres"),
            ),
        ];
        let refs: Vec<&AgentOutput> = outputs.iter().collect();

        let mut history = ArbitrationHistory::default();
        let mut first = detect_conflicts(&refs, &history);
        assert_eq!(first.len(), 1);

        first[0].action = ResolutionAction::AutoResolved;
        first[0].close("sqlite");
        history.record(&first[0]);

        let second = detect_conflicts(&refs, &history);
        assert!(second.is_empty());
    }

    #[test]
    fn test_history_ignores_open_records() {
        let record = ConflictRecord {
            id: "c1".into(),
            question: "q".into(),
            kind: ConflictKind::Disagreement,
            severity: ConflictSeverity::Low,
            personas: vec![Persona::Architect],
            stances: BTreeMap::new(),
            resolution: None,
            action: ResolutionAction::EscalatedToHuman,
            opened_at: Utc::now(),
            closed_at: None,
        };
        let mut history = ArbitrationHistory::default();
        history.record(&record);
        assert!(!history.is_closed("q"));
    }

    // =========================================
    // Resolution tests
    // =========================================

    fn detected(severity: &str) -> Vec<ConflictRecord> {
        let outputs = [
            output(
                Persona::Architect,
                &tag("storage-engine", "implementation_choice", severity, "use sqlite"),
            ),
            output(
                Persona::Tester,
                &tag("storage-engine", "implementation_choice", severity, "use postgres"),
            ),
        ];
        let refs: Vec<&AgentOutput> = outputs.iter().collect();
        detect_conflicts(&refs, &ArbitrationHistory::default())
    }

    fn full_precedence() -> PrecedenceTable {
        PrecedenceTable::new(vec![
            Persona::Architect,
            Persona::SeniorEngineer,
            Persona::Tester,
            Persona::Reviewer,
        ])
    }

    #[test]
    fn test_low_severity_auto_resolves_to_precedence_winner() {
        let mut records = detected("low");
        let resolved = Resolver::new(full_precedence()).resolve(&mut records);

        assert_eq!(resolved, 1);
        let record = &records[0];
        assert_eq!(record.action, ResolutionAction::AutoResolved);
        assert!(!record.is_open());
        // Winner's stance recorded verbatim.
        assert_eq!(record.resolution.as_deref(), Some("use sqlite"));
    }

    #[test]
    fn test_high_severity_always_escalates() {
        let mut records = detected("high");
        let resolved = Resolver::new(full_precedence()).resolve(&mut records);

        assert_eq!(resolved, 0);
        assert_eq!(records[0].action, ResolutionAction::EscalatedToHuman);
        assert!(records[0].is_open());
    }

    #[test]
    fn test_no_precedence_rule_escalates() {
        let mut records = detected("low");
        // Tester is unranked: no rule applies to this pair.
        let resolved =
            Resolver::new(PrecedenceTable::new(vec![Persona::Architect])).resolve(&mut records);

        assert_eq!(resolved, 0);
        assert!(records[0].is_open());
    }

    // =========================================
    // Serde tests
    // =========================================

    #[test]
    fn test_record_serde_roundtrip() {
        let mut records = detected("medium");
        Resolver::new(full_precedence()).resolve(&mut records);

        let json = serde_json::to_string(&records).unwrap();
        let parsed: Vec<ConflictRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_enum_wire_format() {
        assert_eq!(
            serde_json::to_string(&ConflictKind::ImplementationChoice).unwrap(),
            "\"implementation_choice\""
        );
        assert_eq!(serde_json::to_string(&ConflictSeverity::High).unwrap(), "\"high\"");
        assert_eq!(
            serde_json::to_string(&ResolutionAction::EscalatedToHuman).unwrap(),
            "\"escalated_to_human\""
        );
    }
}
