//! Domain types and pure logic for the decision ledger: record identity,
//! schema validation, the fold that turns an append-only record sequence into
//! current state, and the curation selection heuristics. No I/O lives here.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("invalid decision id: {0}")]
    InvalidId(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("ledger store error: {0}")]
    StoreIo(String),
    #[error("corrupt ledger record at line {line}: {detail}")]
    StoreCorrupt { line: usize, detail: String },
    #[error("index error: {0}")]
    Index(String),
}

pub const ID_PREFIX: &str = "DEC";
const ID_SUFFIX_LEN: usize = 8;

/// Content-derived decision identifier of the form `DEC-xxxxxxxx`.
///
/// The suffix is the leading 8 hex chars of a SHA-256 over the creation
/// inputs, so identical inputs always produce the identical id and repeated
/// creation is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DecisionId(String);

impl DecisionId {
    #[must_use]
    pub fn generate(primary: &str, secondary: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(primary.as_bytes());
        hasher.update([0_u8]);
        hasher.update(secondary.as_bytes());
        let digest = hasher.finalize();
        let digest_hex = format!("{digest:x}");
        Self(format!("{ID_PREFIX}-{}", &digest_hex[..ID_SUFFIX_LEN]))
    }

    /// Structural form check only; says nothing about existence in any ledger.
    #[must_use]
    pub fn is_valid(value: &str) -> bool {
        value
            .strip_prefix(ID_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(is_id_suffix)
    }

    /// Canonicalize user-typed shorthand: case-insensitive prefix, bare
    /// 8-hex suffix without the prefix.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidId`] when the input cannot be recognized.
    pub fn normalize(input: &str) -> Result<Self, LedgerError> {
        let trimmed = input.trim();
        let bytes = trimmed.as_bytes();
        let suffix = if bytes.len() > ID_PREFIX.len() + 1
            && bytes[..ID_PREFIX.len()].eq_ignore_ascii_case(ID_PREFIX.as_bytes())
            && bytes[ID_PREFIX.len()] == b'-'
        {
            // The prefix bytes are ASCII, so this boundary is a char boundary.
            trimmed[ID_PREFIX.len() + 1..].to_ascii_lowercase()
        } else {
            trimmed.to_ascii_lowercase()
        };

        if !is_id_suffix(&suffix) {
            return Err(LedgerError::InvalidId(format!(
                "{input}: expected {ID_PREFIX}-{0} ({1} hex chars)",
                "x".repeat(ID_SUFFIX_LEN),
                ID_SUFFIX_LEN
            )));
        }

        Ok(Self(format!("{ID_PREFIX}-{suffix}")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_id_suffix(value: &str) -> bool {
    value.len() == ID_SUFFIX_LEN
        && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Product,
    Process,
    Constraint,
    Learning,
}

impl DecisionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Process => "process",
            Self::Constraint => "constraint",
            Self::Learning => "learning",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "product" => Some(Self::Product),
            "process" => Some(Self::Process),
            "constraint" => Some(Self::Constraint),
            "learning" => Some(Self::Learning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Active,
    Superseded,
}

impl DecisionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Human,
    Agent,
}

impl ActorRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "human" => Some(Self::Human),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecidedBy {
    pub role: ActorRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl DecidedBy {
    #[must_use]
    pub fn human() -> Self {
        Self { role: ActorRole::Human, identifier: None }
    }
}

/// One recorded engineering decision in its folded (current) state.
///
/// `id`, `created_at`, and `kind` are fixed by the creation record; everything
/// else may be overridden by later update records. Collection fields serialize
/// sparsely so the ledger encoding stays forward-compatible.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Decision {
    pub id: DecisionId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "type")]
    pub kind: DecisionType,
    pub problem: String,
    pub choice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub decided_by: DecidedBy,
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summarizes: Vec<DecisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curated_into: Option<DecisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<DecisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<DecisionId>,
}

/// Creation input for an ordinary decision; identity and timestamps are
/// assigned by [`Decision::from_draft`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecisionDraft {
    #[serde(rename = "type")]
    pub kind: DecisionType,
    pub problem: String,
    pub choice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<DecidedBy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<DecisionId>,
}

/// Agent-provided input for a summary decision.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SummaryInput {
    pub summarizes: Vec<DecisionId>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SummaryInput {
    /// Deterministic id for the summary this input describes; repeated
    /// identical inputs always map to the same id.
    #[must_use]
    pub fn summary_id(&self) -> DecisionId {
        let joined =
            self.summarizes.iter().map(DecisionId::as_str).collect::<Vec<_>>().join(",");
        DecisionId::generate(&self.summary, &joined)
    }
}

impl Decision {
    #[must_use]
    pub fn from_draft(id: DecisionId, draft: DecisionDraft, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            created_at,
            kind: draft.kind,
            problem: draft.problem,
            choice: draft.choice,
            rationale: draft.rationale,
            decided_by: draft.decided_by.unwrap_or_else(DecidedBy::human),
            status: DecisionStatus::Active,
            files: draft.files,
            symbols: draft.symbols,
            refs: draft.refs,
            summarizes: Vec::new(),
            curated_into: None,
            supersedes: draft.supersedes,
            superseded_by: None,
        }
    }

    /// Build a summary decision from curation input. Summaries are learnings.
    #[must_use]
    pub fn from_summary(input: &SummaryInput, created_at: OffsetDateTime) -> Self {
        let problem = input
            .title
            .clone()
            .unwrap_or_else(|| format!("Summary of {} decisions", input.summarizes.len()));

        Self {
            id: input.summary_id(),
            created_at,
            kind: DecisionType::Learning,
            problem,
            choice: input.summary.clone(),
            rationale: None,
            decided_by: DecidedBy {
                role: ActorRole::Agent,
                identifier: Some("curate".to_string()),
            },
            status: DecisionStatus::Active,
            files: Vec::new(),
            symbols: Vec::new(),
            refs: Vec::new(),
            summarizes: input.summarizes.clone(),
            curated_into: None,
            supersedes: None,
            superseded_by: None,
        }
    }

    /// Validate one folded decision against schema invariants.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if !DecisionId::is_valid(self.id.as_str()) {
            return Err(LedgerError::Validation(format!("id has invalid form: {}", self.id)));
        }
        if self.problem.trim().is_empty() {
            return Err(LedgerError::Validation("problem MUST be non-empty".to_string()));
        }
        if self.choice.trim().is_empty() {
            return Err(LedgerError::Validation("choice MUST be non-empty".to_string()));
        }
        if !self.summarizes.is_empty() && self.kind != DecisionType::Learning {
            return Err(LedgerError::Validation(
                "summarizes is only valid on learning (summary) decisions".to_string(),
            ));
        }

        let linked = self
            .summarizes
            .iter()
            .chain(&self.curated_into)
            .chain(&self.supersedes)
            .chain(&self.superseded_by);
        for id in linked {
            if !DecisionId::is_valid(id.as_str()) {
                return Err(LedgerError::Validation(format!("linked id has invalid form: {id}")));
            }
        }

        Ok(())
    }

    /// True when this decision summarizes others (a curation summary).
    #[must_use]
    pub fn is_summary(&self) -> bool {
        !self.summarizes.is_empty()
    }
}

/// Partial update carried by a non-creation ledger record: the target `id`
/// plus only the changed fields. `id`, `created_at`, and `kind` cannot be
/// patched.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecisionPatch {
    pub id: DecisionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<DecidedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DecisionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizes: Option<Vec<DecisionId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curated_into: Option<DecisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<DecisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<DecisionId>,
}

impl DecisionPatch {
    #[must_use]
    pub fn for_id(id: DecisionId) -> Self {
        Self {
            id,
            problem: None,
            choice: None,
            rationale: None,
            decided_by: None,
            status: None,
            files: None,
            symbols: None,
            refs: None,
            summarizes: None,
            curated_into: None,
            supersedes: None,
            superseded_by: None,
        }
    }
}

/// One ledger line: a full creation record or a partial update. Untagged so
/// the on-disk encoding stays a plain JSON object either way; a full object
/// parses as `Creation`, an `{id, ...changed}` object as `Update`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum DecisionRecord {
    Creation(Decision),
    Update(DecisionPatch),
}

impl DecisionRecord {
    #[must_use]
    pub fn id(&self) -> &DecisionId {
        match self {
            Self::Creation(decision) => &decision.id,
            Self::Update(patch) => &patch.id,
        }
    }
}

/// The one override rule: a patch's present fields replace prior values,
/// absent fields leave them untouched. Status and links are replaced
/// wholesale, never merged.
pub fn apply_patch(decision: &mut Decision, patch: &DecisionPatch) {
    if let Some(problem) = &patch.problem {
        decision.problem = problem.clone();
    }
    if let Some(choice) = &patch.choice {
        decision.choice = choice.clone();
    }
    if let Some(rationale) = &patch.rationale {
        decision.rationale = Some(rationale.clone());
    }
    if let Some(decided_by) = &patch.decided_by {
        decision.decided_by = decided_by.clone();
    }
    if let Some(status) = patch.status {
        decision.status = status;
    }
    if let Some(files) = &patch.files {
        decision.files = files.clone();
    }
    if let Some(symbols) = &patch.symbols {
        decision.symbols = symbols.clone();
    }
    if let Some(refs) = &patch.refs {
        decision.refs = refs.clone();
    }
    if let Some(summarizes) = &patch.summarizes {
        decision.summarizes = summarizes.clone();
    }
    if let Some(curated_into) = &patch.curated_into {
        decision.curated_into = Some(curated_into.clone());
    }
    if let Some(supersedes) = &patch.supersedes {
        decision.supersedes = Some(supersedes.clone());
    }
    if let Some(superseded_by) = &patch.superseded_by {
        decision.superseded_by = Some(superseded_by.clone());
    }
}

/// Fold an ordered record sequence into current state, one decision per id,
/// output in first-seen (log) order.
///
/// A repeat creation for a known id overrides like a full patch but keeps the
/// first creation's `created_at` and `kind`. An update whose id was never
/// created is skipped: it cannot produce a schema-complete decision.
#[must_use]
pub fn reduce(records: &[DecisionRecord]) -> Vec<Decision> {
    let mut order: Vec<DecisionId> = Vec::new();
    let mut state: BTreeMap<DecisionId, Decision> = BTreeMap::new();

    for record in records {
        match record {
            DecisionRecord::Creation(decision) => {
                if let Some(existing) = state.get_mut(&decision.id) {
                    let created_at = existing.created_at;
                    let kind = existing.kind;
                    *existing = decision.clone();
                    existing.created_at = created_at;
                    existing.kind = kind;
                } else {
                    order.push(decision.id.clone());
                    state.insert(decision.id.clone(), decision.clone());
                }
            }
            DecisionRecord::Update(patch) => {
                if let Some(existing) = state.get_mut(&patch.id) {
                    apply_patch(existing, patch);
                }
            }
        }
    }

    order.into_iter().filter_map(|id| state.remove(&id)).collect()
}

/// Current state for a record sequence sharing one id.
#[must_use]
pub fn latest_state(records: &[DecisionRecord]) -> Option<Decision> {
    reduce(records).into_iter().next()
}

/// Glob matching where `*` matches any run of characters (including `/` and
/// the empty string). This is the one pattern language shared by file queries
/// and curation filtering.
#[must_use]
pub fn glob_match(pattern: &str, path: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == path;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    let Some(mut remaining) = path.strip_prefix(first) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };

    for segment in middle {
        if segment.is_empty() {
            continue;
        }
        let Some(found) = remaining.find(segment) else {
            return false;
        };
        remaining = &remaining[found + segment.len()..];
    }

    remaining.ends_with(last)
}

/// Normalize free text into sorted, deduplicated search terms.
#[must_use]
pub fn tokenize(value: &str) -> Vec<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if normalized.len() >= 2 {
            terms.insert(normalized);
        }
    }
    terms.into_iter().collect()
}

/// All search terms for one decision's problem/choice/rationale text.
#[must_use]
pub fn decision_terms(decision: &Decision) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for input in [
        decision.problem.as_str(),
        decision.choice.as_str(),
        decision.rationale.as_deref().unwrap_or(""),
    ] {
        for term in tokenize(input) {
            terms.insert(term);
        }
    }
    terms
}

#[derive(Debug, Clone, Default)]
pub struct CurationOptions {
    pub older_than: Option<OffsetDateTime>,
    pub kind: Option<DecisionType>,
    pub file_pattern: Option<String>,
    pub exclude_curated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CurationCandidate {
    pub decision: Decision,
    pub age_days: i64,
    pub related_count: usize,
}

/// Grouping key for decisions without file references.
pub const UNGROUPED_KEY: &str = "(no files)";

/// Select aging decisions eligible for summarization from the active corpus,
/// preserving the corpus (log) order.
///
/// Summaries never become candidates; `related_count` counts, across the whole
/// corpus, the other decisions touching each of the candidate's files.
#[must_use]
pub fn curation_candidates(
    active: &[Decision],
    options: &CurationOptions,
    now: OffsetDateTime,
) -> Vec<CurationCandidate> {
    let mut file_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for decision in active {
        for file in &decision.files {
            *file_counts.entry(file.as_str()).or_insert(0) += 1;
        }
    }

    active
        .iter()
        .filter(|decision| !decision.is_summary())
        .filter(|decision| !(options.exclude_curated && decision.curated_into.is_some()))
        .filter(|decision| {
            options.older_than.is_none_or(|cutoff| decision.created_at <= cutoff)
        })
        .filter(|decision| options.kind.is_none_or(|kind| decision.kind == kind))
        .filter(|decision| {
            // Decisions without file references pass a file-pattern filter.
            match options.file_pattern.as_deref() {
                Some(pattern) if !decision.files.is_empty() => {
                    decision.files.iter().any(|file| glob_match(pattern, file))
                }
                _ => true,
            }
        })
        .map(|decision| {
            let age_days = (now - decision.created_at).whole_days().max(0);
            let related_count = decision
                .files
                .iter()
                .map(|file| file_counts.get(file.as_str()).copied().unwrap_or(1) - 1)
                .sum();
            CurationCandidate { decision: decision.clone(), age_days, related_count }
        })
        .collect()
}

/// Group candidates by the first two path segments of their files. Groups
/// overlap: a multi-file decision appears under every matching key, and
/// file-less decisions fall into [`UNGROUPED_KEY`].
#[must_use]
pub fn group_by_file_pattern(
    candidates: &[CurationCandidate],
) -> BTreeMap<String, Vec<CurationCandidate>> {
    let mut groups: BTreeMap<String, Vec<CurationCandidate>> = BTreeMap::new();

    for candidate in candidates {
        if candidate.decision.files.is_empty() {
            groups.entry(UNGROUPED_KEY.to_string()).or_default().push(candidate.clone());
            continue;
        }

        let mut keys = BTreeSet::new();
        for file in &candidate.decision.files {
            keys.insert(group_key(file));
        }
        for key in keys {
            groups.entry(key).or_default().push(candidate.clone());
        }
    }

    groups
}

fn group_key(file: &str) -> String {
    let mut segments = file.split('/');
    let first = segments.next().unwrap_or(file);
    match segments.next() {
        Some(second) => format!("{first}/{second}"),
        None => first.to_string(),
    }
}

/// Render candidates for agent consumption, preserving input order. Callers
/// wanting age order must sort before rendering.
#[must_use]
pub fn format_for_agent(candidates: &[CurationCandidate]) -> String {
    let mut lines = Vec::new();
    lines.push(format!("# Decisions to Summarize ({})", candidates.len()));
    lines.push(String::new());

    for candidate in candidates {
        let decision = &candidate.decision;
        lines.push(format!(
            "## {} [{}] ({} days old)",
            decision.id,
            decision.kind.as_str(),
            candidate.age_days
        ));
        lines.push(format!("**Problem:** {}", decision.problem));
        lines.push(format!("**Choice:** {}", decision.choice));
        if let Some(rationale) = &decision.rationale {
            lines.push(format!("**Rationale:** {rationale}"));
        }
        if !decision.files.is_empty() {
            lines.push(format!("**Files:** {}", decision.files.join(", ")));
        }
        lines.push(String::new());
    }

    lines.push("---".to_string());
    lines.push("Summarize these decisions into a concise playbook.".to_string());
    lines.push("Group by theme. Preserve key constraints and learnings.".to_string());
    lines.join("\n")
}
