//! Persistence layer.
//!
//! Saves and loads the risk state (bankroll, usage counters, settled
//! history) to/from a JSON file between runs.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::types::RiskState;

/// Default state file path.
pub const DEFAULT_STATE_FILE: &str = "surebet_state.json";

/// Save risk state to a JSON file.
///
/// Writes to a sibling temp file first so a crash mid-write never leaves
/// a truncated state behind.
pub fn save_state(state: &RiskState, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(state)
        .context("Failed to serialise risk state")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json)
        .with_context(|| format!("Failed to write state to {tmp}"))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move state into {path}"))?;

    debug!(
        path,
        bankroll = format!("${:.2}", state.current_bankroll),
        "State saved"
    );
    Ok(())
}

/// Load risk state from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_state(path: Option<&str>) -> Result<Option<RiskState>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state from {path}"))?;

    let state: RiskState = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse state from {path}"))?;

    info!(
        path,
        bankroll = format!("${:.2}", state.current_bankroll),
        executions = state.executions,
        settled = state.history.len(),
        "State loaded from disk"
    );

    Ok(Some(state))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
