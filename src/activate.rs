//! Playback activation: best-effort, first-success-wins.
//!
//! Given a page already navigated to the target, tries an ordered list of
//! caller-supplied selectors, then a heuristic scan for anything labelled
//! "play", then a synthetic gesture to satisfy autoplay requirements.
//! Nothing here is fatal; a miss degrades to silent capture and the outcome
//! is recorded for observability only.

use std::time::Duration;

use crate::browser::PageOps;

/// Bounded wait per caller-supplied selector.
pub const SELECTOR_WAIT: Duration = Duration::from_secs(3);
/// Settle interval after a successful click, letting playback spin up.
pub const CLICK_SETTLE: Duration = Duration::from_millis(500);

/// Clicks the first interactive element whose text or accessible label
/// contains "play" (case-insensitive).
const HEURISTIC_SCRIPT: &str = r#"(() => {
  const els = Array.from(document.querySelectorAll('button, a, [role="button"], [onclick]'));
  const hit = els.find(el =>
    ((el.textContent || '') + ' ' + (el.getAttribute('aria-label') || ''))
      .toLowerCase().includes('play'));
  if (!hit) return false;
  hit.click();
  return true;
})()"#;

/// Last-resort synthetic gesture: a body click plus an AudioContext resume,
/// solely to satisfy the surface's autoplay-gesture requirements.
const GESTURE_SCRIPT: &str = r#"(() => {
  if (document.body) document.body.click();
  try {
    const Ctx = window.AudioContext || window.webkitAudioContext;
    if (Ctx) { const ctx = new Ctx(); if (ctx.resume) ctx.resume(); }
  } catch (e) {}
  return true;
})()"#;

/// How playback activation concluded. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// One of the caller-supplied selectors matched and was clicked.
    Selector(String),
    /// The "play"-label heuristic found and clicked an element.
    Heuristic,
    /// Only the synthetic gesture went through; playback unconfirmed.
    Gesture,
    /// Every strategy failed; capture proceeds silently.
    Miss,
}

impl ActivationOutcome {
    pub fn describe(&self) -> String {
        match self {
            ActivationOutcome::Selector(sel) => format!("selector {sel:?}"),
            ActivationOutcome::Heuristic => "heuristic play-label match".into(),
            ActivationOutcome::Gesture => "synthetic gesture only".into(),
            ActivationOutcome::Miss => "no strategy succeeded".into(),
        }
    }
}

/// Splits a comma/semicolon-delimited selector list, dropping empties.
pub fn parse_selector_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs the activation cascade. Total time is bounded by the per-selector
/// waits plus the settle interval; every step is best-effort.
pub async fn activate_playback<P: PageOps>(page: &P, selector_list: &str) -> ActivationOutcome {
    for selector in parse_selector_list(selector_list) {
        if !page.wait_for_selector(&selector, SELECTOR_WAIT).await {
            tracing::debug!(target: "activate", %selector, "selector never appeared");
            continue;
        }
        if page.click(&selector).await {
            tracing::info!(target: "activate", %selector, "clicked playback selector");
            tokio::time::sleep(CLICK_SETTLE).await;
            return ActivationOutcome::Selector(selector);
        }
        tracing::debug!(target: "activate", %selector, "click failed, trying next");
    }

    match page.evaluate(HEURISTIC_SCRIPT).await {
        Ok(value) if value.as_bool() == Some(true) => {
            tracing::info!(target: "activate", "heuristic play-label click succeeded");
            tokio::time::sleep(CLICK_SETTLE).await;
            return ActivationOutcome::Heuristic;
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(target: "activate", "heuristic pass failed: {e}"),
    }

    match page.evaluate(GESTURE_SCRIPT).await {
        Ok(_) => {
            tracing::info!(target: "activate", "fell back to synthetic gesture");
            ActivationOutcome::Gesture
        }
        Err(e) => {
            tracing::warn!(target: "activate", "synthetic gesture failed: {e}");
            ActivationOutcome::Miss
        }
    }
}
