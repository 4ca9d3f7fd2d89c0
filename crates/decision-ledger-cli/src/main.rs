use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use decision_ledger_core::{
    curation_candidates, format_for_agent, group_by_file_pattern, ActorRole, CurationOptions,
    DecidedBy, Decision, DecisionDraft, DecisionId, DecisionStatus, DecisionType, SummaryInput,
};
use decision_ledger_store::{
    index_path, ledger_dir, ledger_path, DecisionIndex, QueryFilter, LEDGER_FILE,
};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dl")]
#[command(about = "Decision ledger: record engineering decisions next to the code")]
struct Cli {
    /// Repository root; defaults to the enclosing git repository.
    #[arg(long)]
    repo_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the ledger directory inside the enclosing git repository.
    Init,
    /// Record a decision.
    Decide(DecideArgs),
    /// Show one decision by id.
    Why { id: String },
    /// Full-text search, or a filtered listing when no query is given.
    Search(SearchArgs),
    /// Decisions and constraints relevant to files, symbols, or a reference.
    Context(ContextArgs),
    /// All active constraint decisions.
    Constraints,
    /// Replace an existing decision with a new one.
    Supersede(SupersedeArgs),
    /// List aging decisions eligible for summarization.
    Curate(CurateArgs),
    /// Record an agent-written summary, optionally backlinking its sources.
    Summarize(SummarizeArgs),
    /// Check that referenced files still exist on disk.
    Validate,
}

#[derive(Debug, Args)]
struct DecideArgs {
    #[arg(long = "type", value_enum)]
    kind: TypeArg,
    #[arg(long)]
    problem: String,
    #[arg(long)]
    choice: String,
    #[arg(long)]
    rationale: Option<String>,
    #[arg(long = "file")]
    files: Vec<String>,
    #[arg(long = "symbol")]
    symbols: Vec<String>,
    #[arg(long = "ref")]
    refs: Vec<String>,
    /// Record the decision as made by the named agent instead of a human.
    #[arg(long)]
    agent: Option<String>,
    #[arg(long)]
    supersedes: Option<String>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: Option<String>,
    #[arg(long = "type", value_enum)]
    kind: Option<TypeArg>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ContextArgs {
    /// File globs or symbol names.
    targets: Vec<String>,
    /// Look up by external reference instead (issue key, PR, URL).
    #[arg(long = "ref")]
    reference: Option<String>,
}

#[derive(Debug, Args)]
struct SupersedeArgs {
    /// Decision being replaced.
    id: String,
    #[command(flatten)]
    replacement: DecideArgs,
}

#[derive(Debug, Args)]
struct CurateArgs {
    #[arg(long)]
    older_than_days: Option<i64>,
    #[arg(long = "type", value_enum)]
    kind: Option<TypeArg>,
    #[arg(long)]
    file_pattern: Option<String>,
    #[arg(long, default_value_t = false)]
    exclude_curated: bool,
    /// Group candidates by their leading file path segments.
    #[arg(long, default_value_t = false)]
    group: bool,
    /// Render a summarization prompt for an agent.
    #[arg(long, default_value_t = false)]
    agent_format: bool,
}

#[derive(Debug, Args)]
struct SummarizeArgs {
    #[arg(long = "summarizes", required = true)]
    summarizes: Vec<String>,
    #[arg(long)]
    summary: String,
    #[arg(long)]
    title: Option<String>,
    /// Also backlink each summarized decision to the new summary.
    #[arg(long, default_value_t = false)]
    mark: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TypeArg {
    Product,
    Process,
    Constraint,
    Learning,
}

impl From<TypeArg> for DecisionType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Product => Self::Product,
            TypeArg::Process => Self::Process,
            TypeArg::Constraint => Self::Constraint,
            TypeArg::Learning => Self::Learning,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Superseded,
}

impl From<StatusArg> for DecisionStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Active => Self::Active,
            StatusArg::Superseded => Self::Superseded,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn find_git_root(start: &Path) -> Option<PathBuf> {
    start.ancestors().find(|dir| dir.join(".git").exists()).map(Path::to_path_buf)
}

fn find_ledger_root(start: &Path) -> Option<PathBuf> {
    start.ancestors().find(|dir| ledger_dir(dir).exists()).map(Path::to_path_buf)
}

/// Explicit root wins; otherwise walk up for an existing ledger, then for the
/// enclosing git repository.
fn resolve_repo_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(root) = explicit {
        return Ok(root.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    find_ledger_root(&cwd)
        .or_else(|| find_git_root(&cwd))
        .ok_or_else(|| anyhow!("not inside a repository; run `dl init` from a git repository"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo_root = resolve_repo_root(cli.repo_root.as_deref());

    match cli.command {
        Command::Init => run_init(cli.repo_root.as_deref()),
        Command::Decide(args) => run_decide(&args, &repo_root?),
        Command::Why { id } => run_why(&id, &repo_root?),
        Command::Search(args) => run_search(&args, &repo_root?),
        Command::Context(args) => run_context(&args, &repo_root?),
        Command::Constraints => run_constraints(&repo_root?),
        Command::Supersede(args) => run_supersede(&args, &repo_root?),
        Command::Curate(args) => run_curate(&args, &repo_root?),
        Command::Summarize(args) => run_summarize(&args, &repo_root?),
        Command::Validate => run_validate(&repo_root?),
    }
}

fn run_init(explicit: Option<&Path>) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let repo_root = match explicit {
        Some(root) => root.to_path_buf(),
        None => find_git_root(&cwd)
            .ok_or_else(|| anyhow!("dl init requires an enclosing git repository"))?,
    };
    if !repo_root.join(".git").exists() {
        return Err(anyhow!("{} is not a git repository", repo_root.display()));
    }

    let dir = ledger_dir(&repo_root);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let ledger = ledger_path(&repo_root);
    let already_initialized = ledger.exists();
    if !already_initialized {
        fs::write(&ledger, "")
            .with_context(|| format!("failed to create {}", ledger.display()))?;
    }

    // The ledger is versioned with source; the index is local-only.
    let gitignore = dir.join(".gitignore");
    fs::write(&gitignore, "index.sqlite\nindex.sqlite-wal\nindex.sqlite-shm\n")
        .with_context(|| format!("failed to write {}", gitignore.display()))?;

    emit_json(serde_json::json!({
        "initialized": true,
        "already_initialized": already_initialized,
        "ledger": ledger,
        "index": index_path(&repo_root),
    }))
}

fn build_decision(args: &DecideArgs, index: &DecisionIndex) -> Result<Decision> {
    let supersedes = match &args.supersedes {
        Some(raw) => {
            let id = DecisionId::normalize(raw)?;
            if index.query_by_id(&id)?.is_none() {
                return Err(anyhow!("cannot supersede unknown decision {id}"));
            }
            Some(id)
        }
        None => None,
    };

    let decided_by = match &args.agent {
        Some(name) => DecidedBy { role: ActorRole::Agent, identifier: Some(name.clone()) },
        None => DecidedBy::human(),
    };

    let draft = DecisionDraft {
        kind: args.kind.into(),
        problem: args.problem.clone(),
        choice: args.choice.clone(),
        rationale: args.rationale.clone(),
        decided_by: Some(decided_by),
        files: args.files.clone(),
        symbols: args.symbols.clone(),
        refs: args.refs.clone(),
        supersedes,
    };

    let id = DecisionId::generate(&draft.problem, &draft.choice);
    Ok(Decision::from_draft(id, draft, OffsetDateTime::now_utc()))
}

fn run_decide(args: &DecideArgs, repo_root: &Path) -> Result<()> {
    let mut index = DecisionIndex::open(repo_root)?;
    let decision = build_decision(args, &index)?;

    // Identical problem/choice inputs map to the same id; recording twice is
    // a no-op that returns the original.
    if let Some(existing) = index.query_by_id(&decision.id)? {
        return emit_json(serde_json::json!({
            "created": false,
            "decision": existing,
        }));
    }

    index.record_decision(&decision)?;
    emit_json(serde_json::json!({
        "created": true,
        "decision": decision,
    }))
}

fn run_why(raw_id: &str, repo_root: &Path) -> Result<()> {
    let id = DecisionId::normalize(raw_id)?;
    let index = DecisionIndex::open(repo_root)?;
    let decision =
        index.query_by_id(&id)?.ok_or_else(|| anyhow!("no decision found for {id}"))?;
    emit_json(serde_json::json!({ "decision": decision }))
}

fn query_filter(
    kind: Option<TypeArg>,
    status: Option<StatusArg>,
    limit: Option<usize>,
) -> QueryFilter {
    QueryFilter { status: status.map(Into::into), kind: kind.map(Into::into), limit }
}

fn run_search(args: &SearchArgs, repo_root: &Path) -> Result<()> {
    let index = DecisionIndex::open(repo_root)?;
    let filter = query_filter(args.kind, args.status, args.limit);

    let decisions = match args.query.as_deref() {
        Some(query) => index.search_full_text(query, &filter)?,
        None => index.query_all(&filter)?,
    };

    emit_json(serde_json::json!({
        "count": decisions.len(),
        "decisions": decisions,
    }))
}

fn run_context(args: &ContextArgs, repo_root: &Path) -> Result<()> {
    let index = DecisionIndex::open(repo_root)?;

    if let Some(reference) = &args.reference {
        let decisions = index.query_by_ref(reference)?;
        return emit_json(serde_json::json!({
            "reference": reference,
            "count": decisions.len(),
            "decisions": decisions,
        }));
    }

    if args.targets.is_empty() {
        return Err(anyhow!("dl context requires at least one target or --ref"));
    }

    let bundle = index.decisions_for_context(&args.targets)?;
    emit_json(serde_json::json!({
        "targets": args.targets,
        "decisions": bundle.decisions,
        "constraints": bundle.constraints,
    }))
}

fn run_constraints(repo_root: &Path) -> Result<()> {
    let index = DecisionIndex::open(repo_root)?;
    let constraints = index.active_constraints()?;
    emit_json(serde_json::json!({
        "count": constraints.len(),
        "constraints": constraints,
    }))
}

fn run_supersede(args: &SupersedeArgs, repo_root: &Path) -> Result<()> {
    if args.replacement.supersedes.is_some() {
        return Err(anyhow!("dl supersede takes the replaced id as its argument"));
    }

    let mut index = DecisionIndex::open(repo_root)?;
    let old_id = DecisionId::normalize(&args.id)?;
    if index.query_by_id(&old_id)?.is_none() {
        return Err(anyhow!("cannot supersede unknown decision {old_id}"));
    }

    let mut replacement = build_decision(&args.replacement, &index)?;
    replacement.supersedes = Some(old_id.clone());
    index.record_decision(&replacement)?;

    emit_json(serde_json::json!({
        "superseded": old_id.as_str(),
        "decision": replacement,
    }))
}

fn run_curate(args: &CurateArgs, repo_root: &Path) -> Result<()> {
    let index = DecisionIndex::open(repo_root)?;
    let active = index.query_all(&QueryFilter {
        status: Some(DecisionStatus::Active),
        kind: None,
        limit: None,
    })?;

    let now = OffsetDateTime::now_utc();
    let options = CurationOptions {
        older_than: args.older_than_days.map(|days| now - Duration::days(days)),
        kind: args.kind.map(Into::into),
        file_pattern: args.file_pattern.clone(),
        exclude_curated: args.exclude_curated,
    };
    let candidates = curation_candidates(&active, &options, now);

    if args.agent_format {
        return emit_json(serde_json::json!({
            "count": candidates.len(),
            "prompt": format_for_agent(&candidates),
        }));
    }

    if args.group {
        let groups = group_by_file_pattern(&candidates);
        return emit_json(serde_json::json!({
            "count": candidates.len(),
            "groups": groups,
        }));
    }

    emit_json(serde_json::json!({
        "count": candidates.len(),
        "candidates": candidates,
    }))
}

fn run_summarize(args: &SummarizeArgs, repo_root: &Path) -> Result<()> {
    let mut summarizes = Vec::new();
    for raw in &args.summarizes {
        summarizes.push(DecisionId::normalize(raw)?);
    }

    let mut index = DecisionIndex::open(repo_root)?;
    let input = SummaryInput {
        summarizes: summarizes.clone(),
        summary: args.summary.clone(),
        title: args.title.clone(),
    };
    let summary = index.create_summary(&input)?;

    let marked = if args.mark { index.mark_curated(&summarizes, &summary.id)? } else { 0 };

    emit_json(serde_json::json!({
        "summary": summary,
        "marked": marked,
    }))
}

fn run_validate(repo_root: &Path) -> Result<()> {
    let index = DecisionIndex::open(repo_root)?;
    let active = index.query_all(&QueryFilter {
        status: Some(DecisionStatus::Active),
        kind: None,
        limit: None,
    })?;

    let mut missing = Vec::new();
    for decision in &active {
        for file in &decision.files {
            // Glob references cannot be checked against a single path.
            if file.contains('*') {
                continue;
            }
            if !repo_root.join(file).exists() {
                missing.push(serde_json::json!({
                    "decision_id": decision.id.as_str(),
                    "file": file,
                }));
            }
        }
    }

    let missing_count = missing.len();
    emit_json(serde_json::json!({
        "checked": active.len(),
        "missing": missing,
        "ok": missing_count == 0,
    }))?;

    if missing_count > 0 {
        return Err(anyhow!("{missing_count} file reference(s) no longer exist in {LEDGER_FILE}"));
    }
    Ok(())
}
