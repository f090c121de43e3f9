use anyhow::{bail, Context, Result};
use scry_storage::{AgentRecord, ScryStore, SessionFilter, SessionRecord, SessionStatus};
use scry_transcript::{backfill, ingest_session};
use std::io::Write;
use std::path::Path;

pub fn ingest_one(store: &ScryStore, path: &Path, out: &mut dyn Write) -> Result<()> {
    let outcome = ingest_session(store, path);
    writeln!(out, "{}", serde_json::to_string(&outcome)?)?;
    if !outcome.success {
        bail!(
            "ingest of {} failed: {}",
            path.display(),
            outcome.error.unwrap_or_default()
        );
    }
    Ok(())
}

pub fn ingest_all(store: &ScryStore, dir: &Path, out: &mut dyn Write) -> Result<()> {
    let report = backfill(store, dir)
        .with_context(|| format!("Failed to backfill {}", dir.display()))?;
    writeln!(
        out,
        "Ingested {}/{} transcripts ({} failed)",
        report.ingested, report.total, report.failed
    )?;
    Ok(())
}

pub fn list_sessions(
    store: &ScryStore,
    project: Option<String>,
    status: Option<&str>,
    limit: usize,
    json: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let status = status
        .map(str::parse::<SessionStatus>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let filter = SessionFilter {
        project,
        status,
        limit: Some(limit),
    };
    let sessions = store.list_sessions(&filter)?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&sessions)?)?;
        return Ok(());
    }
    if sessions.is_empty() {
        writeln!(out, "No sessions found")?;
        return Ok(());
    }
    for session in &sessions {
        writeln!(out, "{}", session_line(session))?;
    }
    Ok(())
}

pub fn search(
    store: &ScryStore,
    query: &str,
    limit: usize,
    json: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let sessions = store.search_sessions(query, limit)?;
    let agents = store.search_agents(query, limit)?;
    if json {
        let body = serde_json::json!({ "sessions": sessions, "agents": agents });
        writeln!(out, "{}", serde_json::to_string_pretty(&body)?)?;
        return Ok(());
    }
    writeln!(out, "Sessions ({}):", sessions.len())?;
    for session in &sessions {
        writeln!(out, "  {}", session_line(session))?;
    }
    writeln!(out, "Agents ({}):", agents.len())?;
    for agent in &agents {
        writeln!(out, "  {}", agent_line(agent))?;
    }
    Ok(())
}

pub fn show(store: &ScryStore, session_id: &str, out: &mut dyn Write) -> Result<()> {
    let Some(session) = store.session(session_id)? else {
        bail!("Session {session_id} not found");
    };
    let body = serde_json::json!({
        "session": session,
        "agents": store.agents_for_session(session_id)?,
        "tool_calls": store.tool_calls_for_session(session_id)?,
        "compactions": store.compactions_for_session(session_id)?,
    });
    writeln!(out, "{}", serde_json::to_string_pretty(&body)?)?;
    Ok(())
}

fn session_line(session: &SessionRecord) -> String {
    let started = session
        .started_at
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let prompt = session
        .first_prompt
        .as_deref()
        .map(|text| scry_core::truncate_chars(text.lines().next().unwrap_or(""), 60))
        .unwrap_or_default();
    format!(
        "{}  {}  {:<9}  {:<16}  in={} out={} tools={} agents={}  {}",
        session.id,
        started,
        session.status.as_str(),
        session.project.as_deref().unwrap_or("-"),
        session.tokens_in,
        session.tokens_out,
        session.tool_call_count,
        session.agent_count,
        prompt
    )
}

fn agent_line(agent: &AgentRecord) -> String {
    format!(
        "{} [{}] {} ({})  {}",
        agent.id,
        agent.agent_type.as_deref().unwrap_or("agent"),
        agent.session_id,
        agent.status,
        agent.task_description.as_deref().unwrap_or("")
    )
}
