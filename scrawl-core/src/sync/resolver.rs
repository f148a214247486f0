//! Conflict resolution between a local and a remote document version.
//!
//! Resolution runs a ladder of heuristics, first match wins: identical
//! content, one empty side, containment, common-affix merge, then a
//! near-simultaneous timestamp tie-break. Anything the ladder cannot decide
//! falls back to the configured automatic strategy or is escalated to an
//! injected [`ResolutionRequester`]. The common-affix merge is best-effort:
//! long, unrelated middles will interleave, so the external requester stays
//! the authoritative path for anything non-trivial.
//!
//! Failure semantics: resolution never loses the user's uncommitted edit.
//! Every failure path (requester error, timeout, missing requester) degrades
//! to keeping the local version.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::SyncError;
use super::queue::SyncOperation;
use crate::config::{ConflictStrategy, SyncConfig};
use crate::models::Document;

/// Minimum common prefix/suffix length (in characters) for an affix merge.
const MIN_AFFIX_LEN: usize = 10;
/// Window within which two edits count as near-simultaneous.
const SIMULTANEOUS_WINDOW_MS: i64 = 1_000;
/// Separator inserted between diverged middles in an affix merge.
const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// A detected divergence between local and remote versions of a document.
#[derive(Debug, Clone)]
pub struct ConflictCase {
    pub document_id: String,
    pub local: Document,
    pub remote: Document,
    pub operation: SyncOperation,
}

/// What the resolver decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// The versions turned out to be identical.
    NoConflict,
    UseLocal,
    UseRemote,
    /// A merged document was synthesized.
    Merge,
}

impl std::fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionAction::NoConflict => write!(f, "no_conflict"),
            ResolutionAction::UseLocal => write!(f, "use_local"),
            ResolutionAction::UseRemote => write!(f, "use_remote"),
            ResolutionAction::Merge => write!(f, "merge"),
        }
    }
}

/// Outcome of resolving a [`ConflictCase`].
///
/// `data` always carries the remote's version token so a re-submission is
/// conditional on the revision the conflict was resolved against.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub action: ResolutionAction,
    pub data: Document,
    pub reason: String,
}

/// Answer supplied by an external decision-maker.
#[derive(Debug, Clone)]
pub enum RequestedResolution {
    UseLocal,
    UseRemote,
    /// Merge with caller-supplied data.
    Merge(Document),
}

/// External decision-maker for conflicts the ladder cannot resolve.
///
/// Production implementations present both versions to the user; tests
/// return canned answers.
#[async_trait]
pub trait ResolutionRequester: Send + Sync {
    async fn request(&self, case: &ConflictCase) -> Result<RequestedResolution, SyncError>;
}

/// Resolves conflicts between local and remote document versions.
pub struct ConflictResolver {
    config: SyncConfig,
    requester: Option<Arc<dyn ResolutionRequester>>,
    /// Per-document serialization of outstanding resolution requests: a
    /// second conflict for the same document queues behind the first.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConflictResolver {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            requester: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_requester(config: SyncConfig, requester: Arc<dyn ResolutionRequester>) -> Self {
        Self {
            config,
            requester: Some(requester),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a conflict. Infallible: every failure degrades to keeping
    /// the local version.
    pub async fn resolve(&self, case: &ConflictCase) -> Resolution {
        if let Some(resolution) = auto_resolve(case) {
            debug!(document_id = %case.document_id, action = %resolution.action,
                reason = %resolution.reason, "conflict auto-resolved");
            return resolution;
        }

        if self.config.auto_resolve {
            let resolution = fallback_strategy(case, self.config.conflict_strategy);
            debug!(document_id = %case.document_id, action = %resolution.action,
                reason = %resolution.reason, "conflict resolved by fallback strategy");
            return resolution;
        }

        self.escalate(case).await
    }

    /// Asks the external requester, bounded by the prompt timeout.
    async fn escalate(&self, case: &ConflictCase) -> Resolution {
        let Some(requester) = self.requester.clone() else {
            return use_local(
                case,
                "no resolution requester configured; keeping local version",
            );
        };

        // At most one outstanding request per document.
        let gate = {
            let mut map = self.in_flight.lock().await;
            map.entry(case.document_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let serialized = gate.lock().await;

        let resolution = match tokio::time::timeout(
            self.config.user_prompt_timeout(),
            requester.request(case),
        )
        .await
        {
            Ok(Ok(RequestedResolution::UseLocal)) => Resolution {
                action: ResolutionAction::UseLocal,
                data: with_remote_token(case.local.clone(), &case.remote),
                reason: "user chose local version".into(),
            },
            Ok(Ok(RequestedResolution::UseRemote)) => Resolution {
                action: ResolutionAction::UseRemote,
                data: case.remote.clone(),
                reason: "user chose remote version".into(),
            },
            Ok(Ok(RequestedResolution::Merge(data))) => Resolution {
                action: ResolutionAction::Merge,
                data: with_remote_token(data, &case.remote),
                reason: "user supplied merged version".into(),
            },
            Ok(Err(e)) => {
                warn!(document_id = %case.document_id, error = %e,
                    "resolution request failed, keeping local version");
                use_local(case, "resolution request failed; keeping local version")
            }
            Err(_) => {
                warn!(document_id = %case.document_id,
                    "resolution request timed out, keeping local version");
                use_local(case, "resolution request timed out; keeping local version")
            }
        };

        drop(serialized);
        drop(gate);
        // Queued waiters still hold clones of the gate; only the last one
        // out removes the map entry.
        let mut map = self.in_flight.lock().await;
        if let Some(entry) = map.get(&case.document_id) {
            if Arc::strong_count(entry) == 1 {
                map.remove(&case.document_id);
            }
        }
        resolution
    }
}

/// Runs the deterministic part of the ladder (steps 1-5). Returns `None`
/// when the case must fall through to the configured fallback or the
/// external requester.
fn auto_resolve(case: &ConflictCase) -> Option<Resolution> {
    let local = &case.local;
    let remote = &case.remote;

    // 1. Equality: identical once trimmed.
    if local.content.trim() == remote.content.trim() && local.title.trim() == remote.title.trim()
    {
        return Some(Resolution {
            action: ResolutionAction::NoConflict,
            data: with_remote_token(local.clone(), remote),
            reason: "local and remote are identical".into(),
        });
    }

    // 2. Emptiness: exactly one side has neither title nor content.
    match (local.is_empty(), remote.is_empty()) {
        (true, false) => {
            return Some(Resolution {
                action: ResolutionAction::UseRemote,
                data: remote.clone(),
                reason: "local version is empty".into(),
            });
        }
        (false, true) => {
            return Some(Resolution {
                action: ResolutionAction::UseLocal,
                data: with_remote_token(local.clone(), remote),
                reason: "remote version is empty".into(),
            });
        }
        _ => {}
    }

    // 3. Containment: one content is a substring of the other; keep the
    // superset, letting the title fall back across sides.
    if local.content.contains(&remote.content) {
        let mut data = local.clone();
        if data.title.trim().is_empty() {
            data.title = remote.title.clone();
        }
        return Some(Resolution {
            action: ResolutionAction::UseLocal,
            data: with_remote_token(data, remote),
            reason: "remote content is contained in local".into(),
        });
    }
    if remote.content.contains(&local.content) {
        let mut data = remote.clone();
        if data.title.trim().is_empty() {
            data.title = local.title.clone();
        }
        return Some(Resolution {
            action: ResolutionAction::UseRemote,
            data,
            reason: "local content is contained in remote".into(),
        });
    }

    // 4. Common-affix merge.
    if let Some(content) = affix_merge(&local.content, &remote.content) {
        let mut data = local.clone();
        data.content = content;
        if data.title.trim().is_empty() {
            data.title = remote.title.clone();
        }
        data.updated_at = Utc::now();
        return Some(Resolution {
            action: ResolutionAction::Merge,
            data: with_remote_token(data, remote),
            reason: "merged diverged middles around common affix".into(),
        });
    }

    // 5. Near-simultaneous edits: prefer the longer content.
    let gap = (local.updated_at - remote.updated_at).num_milliseconds().abs();
    if gap < SIMULTANEOUS_WINDOW_MS {
        return Some(if remote.content.len() > local.content.len() {
            Resolution {
                action: ResolutionAction::UseRemote,
                data: remote.clone(),
                reason: "near-simultaneous edits; remote content is longer".into(),
            }
        } else {
            Resolution {
                action: ResolutionAction::UseLocal,
                data: with_remote_token(local.clone(), remote),
                reason: "near-simultaneous edits; local content is longer".into(),
            }
        });
    }

    None
}

/// Step 6, automatic flavor: the configured fallback strategy.
fn fallback_strategy(case: &ConflictCase, strategy: ConflictStrategy) -> Resolution {
    match strategy {
        ConflictStrategy::LastWriteWins => {
            if case.remote.updated_at > case.local.updated_at {
                Resolution {
                    action: ResolutionAction::UseRemote,
                    data: case.remote.clone(),
                    reason: "last-write-wins: remote is newer".into(),
                }
            } else {
                use_local(case, "last-write-wins: local is newer")
            }
        }
        ConflictStrategy::PreferLocal => use_local(case, "configured to prefer local"),
        ConflictStrategy::PreferServer => Resolution {
            action: ResolutionAction::UseRemote,
            data: case.remote.clone(),
            reason: "configured to prefer server".into(),
        },
    }
}

fn use_local(case: &ConflictCase, reason: &str) -> Resolution {
    Resolution {
        action: ResolutionAction::UseLocal,
        data: with_remote_token(case.local.clone(), &case.remote),
        reason: reason.into(),
    }
}

/// Re-submissions must be conditional on the revision we resolved against.
fn with_remote_token(mut doc: Document, remote: &Document) -> Document {
    doc.version_token = remote.version_token.clone();
    doc
}

/// Synthesizes `prefix + local middle + separator + remote middle + suffix`
/// when the common prefix or suffix is long enough to anchor a merge.
fn affix_merge(local: &str, remote: &str) -> Option<String> {
    let l: Vec<char> = local.chars().collect();
    let r: Vec<char> = remote.chars().collect();
    let max = l.len().min(r.len());

    let mut prefix = 0;
    while prefix < max && l[prefix] == r[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < max - prefix && l[l.len() - 1 - suffix] == r[r.len() - 1 - suffix] {
        suffix += 1;
    }

    if prefix < MIN_AFFIX_LEN && suffix < MIN_AFFIX_LEN {
        return None;
    }

    let local_mid: String = l[prefix..l.len() - suffix].iter().collect();
    let remote_mid: String = r[prefix..r.len() - suffix].iter().collect();
    let head: String = l[..prefix].iter().collect();
    let tail: String = l[l.len() - suffix..].iter().collect();

    let body = if local_mid.is_empty() {
        remote_mid
    } else if remote_mid.is_empty() {
        local_mid
    } else {
        format!("{local_mid}{MERGE_SEPARATOR}{remote_mid}")
    };
    Some(format!("{head}{body}{tail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn case(local: Document, remote: Document) -> ConflictCase {
        ConflictCase {
            document_id: local.id.clone(),
            local,
            remote,
            operation: SyncOperation::Update,
        }
    }

    fn doc(title: &str, content: &str) -> Document {
        Document::new(title, content)
    }

    #[test]
    fn test_identical_versions_are_no_conflict() {
        let local = doc("Note", "Hello");
        let mut remote = local.clone();
        remote.content = " Hello ".into(); // trimmed-equal
        remote.version_token = Some("v2".into());

        let resolution = auto_resolve(&case(local, remote)).unwrap();
        assert_eq!(resolution.action, ResolutionAction::NoConflict);
        assert_eq!(resolution.data.content, "Hello");
        assert_eq!(resolution.data.version_token.as_deref(), Some("v2"));
    }

    #[test]
    fn test_empty_local_picks_remote() {
        let resolution = auto_resolve(&case(doc("", ""), doc("Note", "World"))).unwrap();
        assert_eq!(resolution.action, ResolutionAction::UseRemote);
        assert_eq!(resolution.data.content, "World");
    }

    #[test]
    fn test_empty_remote_picks_local() {
        let resolution = auto_resolve(&case(doc("Note", "kept"), doc("", ""))).unwrap();
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
        assert_eq!(resolution.data.content, "kept");
    }

    #[test]
    fn test_containment_local_superset() {
        let resolution =
            auto_resolve(&case(doc("Note", "Hello World"), doc("Note2", "Hello"))).unwrap();
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
        assert_eq!(resolution.data.content, "Hello World");
    }

    #[test]
    fn test_containment_remote_superset_with_title_fallback() {
        let resolution =
            auto_resolve(&case(doc("My Title", "Hello"), doc("", "Hello World"))).unwrap();
        assert_eq!(resolution.action, ResolutionAction::UseRemote);
        assert_eq!(resolution.data.content, "Hello World");
        // Remote had no title; local's falls through.
        assert_eq!(resolution.data.title, "My Title");
    }

    #[test]
    fn test_affix_merge_keeps_both_middles() {
        let local = doc("Note", "# Shopping list\n\n- milk\n\nend of list");
        let remote = doc("Note", "# Shopping list\n\n- eggs\n\nend of list");

        let resolution = auto_resolve(&case(local, remote)).unwrap();
        assert_eq!(resolution.action, ResolutionAction::Merge);
        assert!(resolution.data.content.contains("- milk"));
        assert!(resolution.data.content.contains("- eggs"));
        assert!(resolution.data.content.starts_with("# Shopping list"));
        assert!(resolution.data.content.ends_with("end of list"));
    }

    #[test]
    fn test_affix_too_short_falls_through() {
        let mut local = doc("Note", "abc completely different text here");
        let mut remote = doc("Note", "abd other words entirely unrelated");
        // Push timestamps apart so step 5 does not catch the case either.
        local.updated_at = Utc::now();
        remote.updated_at = local.updated_at - Duration::seconds(90);

        assert!(auto_resolve(&case(local, remote)).is_none());
    }

    #[test]
    fn test_near_simultaneous_prefers_longer_content() {
        let mut local = doc("Note", "short xyz");
        let mut remote = doc("Note", "a much longer body of text qqq");
        remote.updated_at = local.updated_at + Duration::milliseconds(300);
        local.version_token = Some("v1".into());

        let resolution = auto_resolve(&case(local, remote)).unwrap();
        assert_eq!(resolution.action, ResolutionAction::UseRemote);
    }

    #[test]
    fn test_auto_resolution_is_deterministic() {
        let mut local = doc("Note", "alpha beta gamma delta epsilon");
        let mut remote = doc("Note", "alpha beta gamma delta zeta!!!");
        remote.updated_at = local.updated_at + Duration::milliseconds(10);
        local.version_token = Some("v1".into());
        remote.version_token = Some("v2".into());

        let c = case(local, remote);
        let first = auto_resolve(&c).unwrap();
        let second = auto_resolve(&c).unwrap();
        assert_eq!(first.action, second.action);
        assert_eq!(first.data.content, second.data.content);
    }

    #[test]
    fn test_fallback_last_write_wins() {
        let mut local = doc("Note", "completely unrelated local wording");
        let mut remote = doc("Note", "different remote paragraph entirely");
        remote.updated_at = local.updated_at + Duration::seconds(90);

        let resolution = fallback_strategy(
            &case(local.clone(), remote.clone()),
            ConflictStrategy::LastWriteWins,
        );
        assert_eq!(resolution.action, ResolutionAction::UseRemote);

        local.updated_at = remote.updated_at + Duration::seconds(90);
        let resolution =
            fallback_strategy(&case(local, remote), ConflictStrategy::LastWriteWins);
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
    }

    #[test]
    fn test_fallback_prefer_sides() {
        let local = doc("Note", "unrelated local wording here");
        let mut remote = doc("Note", "some other server paragraph");
        remote.updated_at = local.updated_at + chrono::Duration::seconds(90);
        remote.version_token = Some("v9".into());
        let c = case(local, remote);

        let resolution = fallback_strategy(&c, ConflictStrategy::PreferLocal);
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
        // Re-submission is conditional on the remote revision.
        assert_eq!(resolution.data.version_token.as_deref(), Some("v9"));

        let resolution = fallback_strategy(&c, ConflictStrategy::PreferServer);
        assert_eq!(resolution.action, ResolutionAction::UseRemote);
    }

    struct CannedRequester(RequestedResolution);

    #[async_trait]
    impl ResolutionRequester for CannedRequester {
        async fn request(&self, _case: &ConflictCase) -> Result<RequestedResolution, SyncError> {
            Ok(self.0.clone())
        }
    }

    struct SilentRequester;

    #[async_trait]
    impl ResolutionRequester for SilentRequester {
        async fn request(&self, _case: &ConflictCase) -> Result<RequestedResolution, SyncError> {
            // Never answers; the resolver's timeout must kick in.
            futures::future::pending().await
        }
    }

    fn escalating_case() -> ConflictCase {
        let mut local = doc("Note", "unrelated local wording here");
        let mut remote = doc("Note", "some other server paragraph");
        remote.updated_at = local.updated_at + chrono::Duration::seconds(90);
        local.version_token = Some("v1".into());
        remote.version_token = Some("v2".into());
        case(local, remote)
    }

    #[tokio::test]
    async fn test_escalation_uses_requester_answer() {
        let config = SyncConfig {
            auto_resolve: false,
            ..SyncConfig::default()
        };
        let resolver = ConflictResolver::with_requester(
            config,
            Arc::new(CannedRequester(RequestedResolution::UseRemote)),
        );

        let resolution = resolver.resolve(&escalating_case()).await;
        assert_eq!(resolution.action, ResolutionAction::UseRemote);
    }

    #[tokio::test]
    async fn test_escalation_timeout_falls_back_to_local() {
        let config = SyncConfig {
            auto_resolve: false,
            user_prompt_timeout_ms: 50,
            ..SyncConfig::default()
        };
        let resolver = ConflictResolver::with_requester(config, Arc::new(SilentRequester));

        let case = escalating_case();
        let resolution = resolver.resolve(&case).await;
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
        assert_eq!(resolution.data.content, case.local.content);
        assert!(resolution.reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_gate_map_is_emptied_after_resolution() {
        let config = SyncConfig {
            auto_resolve: false,
            ..SyncConfig::default()
        };
        let resolver = ConflictResolver::with_requester(
            config,
            Arc::new(CannedRequester(RequestedResolution::UseLocal)),
        );

        // Long-running processes resolve many documents; the per-document
        // gates must not accumulate.
        resolver.resolve(&escalating_case()).await;
        resolver.resolve(&escalating_case()).await;
        assert!(resolver.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_requester_keeps_local() {
        let config = SyncConfig {
            auto_resolve: false,
            ..SyncConfig::default()
        };
        let resolver = ConflictResolver::new(config);

        let resolution = resolver.resolve(&escalating_case()).await;
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
    }

    #[tokio::test]
    async fn test_auto_resolve_skips_requester() {
        // auto_resolve on: the fallback strategy answers, not the requester.
        let config = SyncConfig {
            auto_resolve: true,
            conflict_strategy: ConflictStrategy::PreferServer,
            ..SyncConfig::default()
        };
        let resolver = ConflictResolver::with_requester(config, Arc::new(SilentRequester));

        let resolution = resolver.resolve(&escalating_case()).await;
        assert_eq!(resolution.action, ResolutionAction::UseRemote);
    }
}
