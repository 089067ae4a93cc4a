//! Post-receive hook input: `<old-sha> <new-sha> <ref>` lines on stdin.

use std::io::BufRead;

use tracing::{debug, info, warn};

/// SHA git reports as the new value when a ref is deleted
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// One ref update reported to the post-receive hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old_sha: String,
    pub new_sha: String,
    pub ref_name: String,
}

impl RefUpdate {
    /// Parse a hook line; anything but exactly three fields is rejected
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let (old_sha, new_sha, ref_name) = (fields.next()?, fields.next()?, fields.next()?);
        if fields.next().is_some() {
            return None;
        }
        Some(RefUpdate {
            old_sha: old_sha.to_string(),
            new_sha: new_sha.to_string(),
            ref_name: ref_name.to_string(),
        })
    }

    /// Whether the update deletes the ref
    pub fn is_deletion(&self) -> bool {
        !self.new_sha.is_empty() && self.new_sha.bytes().all(|b| b == b'0')
    }
}

/// Why a push does not deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No update targets the deploy branch
    NoMatchingRef,
    /// The deploy branch was deleted
    BranchDeleted,
    /// The pushed tree has no Dockerfile
    NoBuildDescriptor,
}

/// Outcome of scanning the hook input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployDecision {
    Skip(SkipReason),
    Deploy(RefUpdate),
}

/// Scans hook input and decides whether the deploy branch was updated.
///
/// Every line is read to end of stream. When several lines target the
/// deploy branch the last one wins.
#[derive(Debug)]
pub struct HookListener {
    deploy_ref: String,
    candidate: Option<RefUpdate>,
    skipped_lines: usize,
}

impl HookListener {
    pub fn new(deploy_ref: impl Into<String>) -> Self {
        HookListener {
            deploy_ref: deploy_ref.into(),
            candidate: None,
            skipped_lines: 0,
        }
    }

    /// Feed a single input line
    pub fn feed(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some(update) = RefUpdate::parse(line) else {
            warn!(line, "invalid input line");
            self.skipped_lines += 1;
            return;
        };

        info!(
            old = %update.old_sha,
            new = %update.new_sha,
            r#ref = %update.ref_name,
            "received update"
        );
        if update.ref_name == self.deploy_ref {
            self.candidate = Some(update);
        }
    }

    /// Number of malformed lines seen so far
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Finish scanning and produce the decision
    pub fn decide(self) -> DeployDecision {
        match self.candidate {
            None => {
                debug!(deploy_ref = %self.deploy_ref, "no update for the deploy branch");
                DeployDecision::Skip(SkipReason::NoMatchingRef)
            }
            Some(update) if update.is_deletion() => DeployDecision::Skip(SkipReason::BranchDeleted),
            Some(update) => DeployDecision::Deploy(update),
        }
    }

    /// Read `input` to end of stream and decide. Lines that are not valid
    /// UTF-8 are decoded lossily, so they can never match the deploy ref.
    pub fn read_from<R: BufRead>(mut self, mut input: R) -> std::io::Result<DeployDecision> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            self.feed(line.trim_end_matches(['\n', '\r']));
        }

        if self.skipped_lines() > 0 {
            warn!(skipped = self.skipped_lines(), "ignored malformed input lines");
        }
        Ok(self.decide())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa0";
    const NEW: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb1";

    fn decide(input: &str) -> DeployDecision {
        HookListener::new("refs/heads/main")
            .read_from(input.as_bytes())
            .unwrap()
    }

    #[test]
    fn test_main_update_deploys_new_sha() {
        let decision = decide(&format!("{} {} refs/heads/main\n", OLD, NEW));
        match decision {
            DeployDecision::Deploy(update) => {
                assert_eq!(update.new_sha, NEW);
                assert_eq!(update.old_sha, OLD);
            }
            other => panic!("expected deploy, got {:?}", other),
        }
    }

    #[test]
    fn test_other_branch_skips() {
        assert_eq!(
            decide(&format!("{} {} refs/heads/feature\n", OLD, NEW)),
            DeployDecision::Skip(SkipReason::NoMatchingRef)
        );
        assert_eq!(decide(""), DeployDecision::Skip(SkipReason::NoMatchingRef));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let input = format!(
            "{} refs/heads/main\n{} {} refs/heads/main extra\n{} {} refs/heads/main\n",
            OLD, OLD, NEW, OLD, NEW
        );
        let mut listener = HookListener::new("refs/heads/main");
        for line in input.lines() {
            listener.feed(line);
        }
        assert_eq!(listener.skipped_lines(), 2);
        assert!(matches!(listener.decide(), DeployDecision::Deploy(u) if u.new_sha == NEW));
    }

    #[test]
    fn test_last_matching_update_wins() {
        let newer = "cccccccccccccccccccccccccccccccccccccc22";
        let input = format!(
            "{} {} refs/heads/main\n{} {} refs/tags/v1\n{} {} refs/heads/main\n",
            OLD, NEW, OLD, OLD, NEW, newer
        );
        assert!(matches!(decide(&input), DeployDecision::Deploy(u) if u.new_sha == newer));
    }

    #[test]
    fn test_branch_deletion_does_not_deploy() {
        assert_eq!(
            decide(&format!("{} {} refs/heads/main\n", OLD, ZERO_OID)),
            DeployDecision::Skip(SkipReason::BranchDeleted)
        );
    }

    #[test]
    fn test_custom_deploy_branch() {
        let decision = HookListener::new("refs/heads/release")
            .read_from(format!("{} {} refs/heads/release\n", OLD, NEW).as_bytes())
            .unwrap();
        assert!(matches!(decision, DeployDecision::Deploy(_)));
    }

    #[test]
    fn test_non_utf8_ref_does_not_block_deploy() {
        let mut input = format!("{} {} refs/heads/caf", OLD, NEW).into_bytes();
        input.extend_from_slice(b"\xe9\n");
        input.extend_from_slice(format!("{} {} refs/heads/main\n", OLD, NEW).as_bytes());

        let decision = HookListener::new("refs/heads/main")
            .read_from(&input[..])
            .unwrap();
        assert!(matches!(decision, DeployDecision::Deploy(u) if u.ref_name == "refs/heads/main"));
    }

    #[test]
    fn test_non_utf8_deploy_ref_lookalike_is_not_deployed() {
        let mut input = format!("{} {} refs/heads/mai", OLD, NEW).into_bytes();
        input.extend_from_slice(b"\xffn\n");

        let decision = HookListener::new("refs/heads/main")
            .read_from(&input[..])
            .unwrap();
        assert_eq!(decision, DeployDecision::Skip(SkipReason::NoMatchingRef));
    }

    #[test]
    fn test_parse_splits_on_any_whitespace() {
        let update = RefUpdate::parse(&format!("{}\t{}  refs/heads/main", OLD, NEW)).unwrap();
        assert_eq!(update.ref_name, "refs/heads/main");
        assert!(!update.is_deletion());
        assert!(RefUpdate::parse("").is_none());
    }
}
