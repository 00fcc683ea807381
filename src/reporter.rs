//! Describing a working copy to the server before an update-style edit.
//!
//! A report starts with `set_path("")`, names paths parent-first, and ends
//! with exactly one `finish_report` or `abort_report`. Callers hand the
//! session a [`ReporterBaton`]; the session runs it against a
//! [`ReportBuilder`] and only transmits a report that finished cleanly.

use std::collections::BTreeMap;

use crate::path::{cmp_preorder, is_ancestor, validate_rel_dir_path};
use crate::{Depth, SvnError};

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Client-to-server report commands used by operations like `update`/`switch`.
pub enum ReportCommand {
    /// Adds or updates a path in the report.
    SetPath {
        /// Repository-relative path.
        path: String,
        /// Revision to report for this path.
        rev: u64,
        /// Whether this path should start empty.
        start_empty: bool,
        /// Optional lock token to include.
        lock_token: Option<String>,
        /// Requested depth.
        depth: Depth,
    },
    /// Deletes a path in the report.
    DeletePath {
        /// Repository-relative path.
        path: String,
    },
    /// Links a path to a URL in the report.
    LinkPath {
        /// Repository-relative path.
        path: String,
        /// URL to link to.
        url: String,
        /// Revision to report for this link.
        rev: u64,
        /// Whether this path should start empty.
        start_empty: bool,
        /// Optional lock token to include.
        lock_token: Option<String>,
        /// Requested depth.
        depth: Depth,
    },
    /// Terminates the report successfully.
    FinishReport,
    /// Aborts the report.
    AbortReport,
}

impl ReportCommand {
    fn path(&self) -> Option<&str> {
        match self {
            Self::SetPath { path, .. }
            | Self::DeletePath { path }
            | Self::LinkPath { path, .. } => Some(path),
            Self::FinishReport | Self::AbortReport => None,
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// A sequence of [`ReportCommand`] values.
pub struct Report {
    /// Commands in the report. Reports must end with `finish-report` or
    /// `abort-report`.
    pub commands: Vec<ReportCommand>,
}

impl Report {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Appends a command to the report.
    pub fn push(&mut self, cmd: ReportCommand) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    /// Appends a `finish-report` terminator.
    pub fn finish(&mut self) -> &mut Self {
        self.commands.push(ReportCommand::FinishReport);
        self
    }

    /// Path claims of the report, without the terminator.
    pub fn claims(&self) -> impl Iterator<Item = &ReportCommand> {
        self.commands.iter().filter(|cmd| cmd.path().is_some())
    }

    /// Plays the commands against `reporter` in order.
    pub fn replay(&self, reporter: &mut dyn Reporter) -> Result<(), SvnError> {
        for cmd in &self.commands {
            match cmd {
                ReportCommand::SetPath {
                    path,
                    rev,
                    start_empty,
                    lock_token,
                    depth,
                } => reporter.set_path(path, lock_token.as_deref(), *rev, *depth, *start_empty)?,
                ReportCommand::DeletePath { path } => reporter.delete_path(path)?,
                ReportCommand::LinkPath {
                    path,
                    url,
                    rev,
                    start_empty,
                    lock_token,
                    depth,
                } => reporter.link_path(
                    url,
                    path,
                    lock_token.as_deref(),
                    *rev,
                    *depth,
                    *start_empty,
                )?,
                ReportCommand::FinishReport => reporter.finish_report()?,
                ReportCommand::AbortReport => reporter.abort_report()?,
            }
        }
        Ok(())
    }
}

/// Receiver of working copy claims.
pub trait Reporter {
    /// Declares that the client has `path` at `rev`.
    ///
    /// `start_empty` means the client has none of the children yet.
    fn set_path(
        &mut self,
        path: &str,
        lock_token: Option<&str>,
        rev: u64,
        depth: Depth,
        start_empty: bool,
    ) -> Result<(), SvnError>;

    /// Declares that the client does not have `path`.
    fn delete_path(&mut self, path: &str) -> Result<(), SvnError>;

    /// Declares that the client has `url` at `rev` in place of `path`.
    fn link_path(
        &mut self,
        url: &str,
        path: &str,
        lock_token: Option<&str>,
        rev: u64,
        depth: Depth,
        start_empty: bool,
    ) -> Result<(), SvnError>;

    /// Ends the report; the server may now compute the edit.
    fn finish_report(&mut self) -> Result<(), SvnError>;

    /// Ends the report and cancels the operation.
    fn abort_report(&mut self) -> Result<(), SvnError>;
}

/// Something that can describe a working copy to a [`Reporter`].
pub trait ReporterBaton {
    /// Makes the claims and finishes (or aborts) the report.
    fn report(&mut self, reporter: &mut dyn Reporter) -> Result<(), SvnError>;
}

impl<F> ReporterBaton for F
where
    F: FnMut(&mut dyn Reporter) -> Result<(), SvnError>,
{
    fn report(&mut self, reporter: &mut dyn Reporter) -> Result<(), SvnError> {
        self(reporter)
    }
}

impl ReporterBaton for Report {
    fn report(&mut self, reporter: &mut dyn Reporter) -> Result<(), SvnError> {
        self.replay(reporter)
    }
}

fn violation(msg: impl Into<String>) -> SvnError {
    SvnError::ProtocolViolation(msg.into())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Terminal {
    Finished,
    Aborted,
}

/// A [`Reporter`] that checks the report protocol and collects a [`Report`].
#[derive(Debug, Default)]
pub struct ReportBuilder {
    report: Report,
    reported: Vec<String>,
    chain: Vec<String>,
    terminal: Option<Terminal>,
}

impl ReportBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&mut self, path: &str) -> Result<String, SvnError> {
        if self.terminal.is_some() {
            return Err(violation("report already terminated"));
        }
        let canonical = validate_rel_dir_path(path)?;
        if canonical != path {
            return Err(SvnError::InvalidPath(format!("non-canonical path: {path}")));
        }
        if self.reported.is_empty() && !path.is_empty() {
            return Err(violation(format!(
                "report must start with the root, got '{path}'"
            )));
        }
        if let Some(later) = self.reported.iter().find(|q| is_ancestor(path, q)) {
            return Err(violation(format!(
                "'{path}' reported after '{later}'"
            )));
        }
        while let Some(top) = self.chain.last() {
            if is_ancestor(top, path) {
                break;
            }
            self.chain.pop();
        }
        if let Some(closed) = self
            .reported
            .iter()
            .find(|q| is_ancestor(q, path) && !self.chain.contains(q))
        {
            return Err(violation(format!(
                "'{path}' reported after leaving '{closed}'"
            )));
        }
        self.reported.push(canonical.clone());
        self.chain.push(canonical.clone());
        Ok(canonical)
    }

    fn terminate(&mut self, terminal: Terminal) -> Result<(), SvnError> {
        if self.terminal.is_some() {
            return Err(violation("report already terminated"));
        }
        if terminal == Terminal::Finished && self.reported.is_empty() {
            return Err(violation("finish_report without set_path(\"\")"));
        }
        self.terminal = Some(terminal);
        Ok(())
    }

    /// Returns the finished report.
    ///
    /// Fails with [`SvnError::Cancelled`] when the baton aborted the report
    /// and with [`SvnError::ProtocolViolation`] when it never terminated it.
    pub fn finish(self) -> Result<Report, SvnError> {
        match self.terminal {
            Some(Terminal::Finished) => Ok(self.report),
            Some(Terminal::Aborted) => Err(SvnError::Cancelled),
            None => Err(violation("report was neither finished nor aborted")),
        }
    }
}

impl Reporter for ReportBuilder {
    fn set_path(
        &mut self,
        path: &str,
        lock_token: Option<&str>,
        rev: u64,
        depth: Depth,
        start_empty: bool,
    ) -> Result<(), SvnError> {
        let path = self.claim(path)?;
        self.report.push(ReportCommand::SetPath {
            path,
            rev,
            start_empty,
            lock_token: lock_token.map(str::to_string),
            depth,
        });
        Ok(())
    }

    fn delete_path(&mut self, path: &str) -> Result<(), SvnError> {
        if path.is_empty() {
            return Err(violation("cannot delete the report root"));
        }
        let path = self.claim(path)?;
        self.report.push(ReportCommand::DeletePath { path });
        Ok(())
    }

    fn link_path(
        &mut self,
        url: &str,
        path: &str,
        lock_token: Option<&str>,
        rev: u64,
        depth: Depth,
        start_empty: bool,
    ) -> Result<(), SvnError> {
        if url.trim().is_empty() {
            return Err(SvnError::InvalidUrl("empty link_path url".into()));
        }
        let path = self.claim(path)?;
        self.report.push(ReportCommand::LinkPath {
            path,
            url: url.to_string(),
            rev,
            start_empty,
            lock_token: lock_token.map(str::to_string),
            depth,
        });
        Ok(())
    }

    fn finish_report(&mut self) -> Result<(), SvnError> {
        self.terminate(Terminal::Finished)?;
        self.report.finish();
        Ok(())
    }

    fn abort_report(&mut self) -> Result<(), SvnError> {
        self.terminate(Terminal::Aborted)?;
        self.report.push(ReportCommand::AbortReport);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Claim {
    Set {
        rev: u64,
        depth: Depth,
        start_empty: bool,
    },
    Delete,
    Link {
        url: String,
        rev: u64,
        depth: Depth,
    },
}

/// Working copy claims collected in any order and reported parent-first.
///
/// # Examples
///
/// ```
/// use svn_ra::{Depth, ReportBuilder, ReporterBaton, WorkingCopyState};
///
/// let mut wc = WorkingCopyState::new(7, Depth::Infinity);
/// wc.set("trunk/b", 5).delete("trunk/a").lock("trunk/b", "opaquelocktoken:1");
///
/// let mut builder = ReportBuilder::new();
/// wc.report(&mut builder).unwrap();
/// assert_eq!(builder.finish().unwrap().claims().count(), 3);
/// ```
#[derive(Clone, Debug)]
pub struct WorkingCopyState {
    root_rev: u64,
    root_depth: Depth,
    start_empty: bool,
    claims: BTreeMap<String, Claim>,
    locks: BTreeMap<String, String>,
}

impl WorkingCopyState {
    /// A working copy whose root is at `rev` with the given depth.
    pub fn new(rev: u64, depth: Depth) -> Self {
        Self {
            root_rev: rev,
            root_depth: depth,
            start_empty: false,
            claims: BTreeMap::new(),
            locks: BTreeMap::new(),
        }
    }

    /// A working copy that has nothing yet, as for a checkout.
    pub fn empty(rev: u64, depth: Depth) -> Self {
        Self {
            start_empty: true,
            ..Self::new(rev, depth)
        }
    }

    /// Records that `path` is at `rev`.
    pub fn set(&mut self, path: impl Into<String>, rev: u64) -> &mut Self {
        self.set_with(path, rev, Depth::Infinity, false)
    }

    /// Records that `path` is at `rev` with an explicit depth.
    pub fn set_with(
        &mut self,
        path: impl Into<String>,
        rev: u64,
        depth: Depth,
        start_empty: bool,
    ) -> &mut Self {
        self.claims.insert(
            path.into(),
            Claim::Set {
                rev,
                depth,
                start_empty,
            },
        );
        self
    }

    /// Records that `path` is missing.
    pub fn delete(&mut self, path: impl Into<String>) -> &mut Self {
        self.claims.insert(path.into(), Claim::Delete);
        self
    }

    /// Records that `path` is switched to `url` at `rev`.
    pub fn link(&mut self, path: impl Into<String>, url: impl Into<String>, rev: u64) -> &mut Self {
        self.claims.insert(
            path.into(),
            Claim::Link {
                url: url.into(),
                rev,
                depth: Depth::Infinity,
            },
        );
        self
    }

    /// Records a lock token held for `path`.
    pub fn lock(&mut self, path: impl Into<String>, token: impl Into<String>) -> &mut Self {
        self.locks.insert(path.into(), token.into());
        self
    }

    fn rev_of(&self, path: &str) -> u64 {
        self.claims
            .iter()
            .filter(|(claimed, _)| is_ancestor(claimed, path))
            .max_by(|a, b| cmp_preorder(a.0, b.0))
            .and_then(|(_, claim)| match claim {
                Claim::Set { rev, .. } | Claim::Link { rev, .. } => Some(*rev),
                Claim::Delete => None,
            })
            .unwrap_or(self.root_rev)
    }

    fn emit(&self, reporter: &mut dyn Reporter) -> Result<(), SvnError> {
        let mut claims: BTreeMap<String, Option<&Claim>> = BTreeMap::new();
        for (path, claim) in &self.claims {
            claims.insert(validate_rel_dir_path(path)?, Some(claim));
        }
        for path in self.locks.keys() {
            claims.entry(validate_rel_dir_path(path)?).or_insert(None);
        }
        let mut ordered: Vec<(String, Option<&Claim>)> = claims.into_iter().collect();
        ordered.sort_by(|a, b| cmp_preorder(&a.0, &b.0));

        let root_lock = self.locks.get("").map(String::as_str);
        match ordered.first() {
            Some((path, Some(Claim::Set { rev, depth, start_empty }))) if path.is_empty() => {
                reporter.set_path("", root_lock, *rev, *depth, *start_empty)?
            }
            _ => reporter.set_path(
                "",
                root_lock,
                self.root_rev,
                self.root_depth,
                self.start_empty,
            )?,
        }

        for (path, claim) in ordered.iter().filter(|(path, _)| !path.is_empty()) {
            let lock = self.locks.get(path.as_str()).map(String::as_str);
            match claim {
                Some(Claim::Set {
                    rev,
                    depth,
                    start_empty,
                }) => reporter.set_path(path, lock, *rev, *depth, *start_empty)?,
                Some(Claim::Delete) => reporter.delete_path(path)?,
                Some(Claim::Link { url, rev, depth }) => {
                    reporter.link_path(url, path, lock, *rev, *depth, false)?
                }
                None => reporter.set_path(path, lock, self.rev_of(path), Depth::Infinity, false)?,
            }
        }
        Ok(())
    }
}

impl ReporterBaton for WorkingCopyState {
    fn report(&mut self, reporter: &mut dyn Reporter) -> Result<(), SvnError> {
        match self.emit(reporter) {
            Ok(()) => reporter.finish_report(),
            Err(err) => {
                let _ = reporter.abort_report();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use proptest::prelude::*;

    use super::*;

    fn set(builder: &mut ReportBuilder, path: &str) -> Result<(), SvnError> {
        builder.set_path(path, None, 1, Depth::Infinity, false)
    }

    #[test]
    fn builder_accepts_preorder_report() {
        let mut builder = ReportBuilder::new();
        set(&mut builder, "").unwrap();
        set(&mut builder, "a").unwrap();
        builder.delete_path("a/x").unwrap();
        set(&mut builder, "b").unwrap();
        builder
            .link_path("svn://h/r/branches/x", "b/c", Some("tok"), 4, Depth::Files, true)
            .unwrap();
        builder.finish_report().unwrap();
        let report = builder.finish().unwrap();
        assert_eq!(report.commands.len(), 6);
        assert_eq!(report.commands.last(), Some(&ReportCommand::FinishReport));
        assert_eq!(report.claims().count(), 5);
    }

    #[test]
    fn builder_requires_root_first() {
        let mut builder = ReportBuilder::new();
        let err = set(&mut builder, "a").unwrap_err();
        assert!(matches!(err, SvnError::ProtocolViolation(_)));
        assert!(builder.finish_report().is_err());
    }

    #[test]
    fn builder_rejects_parent_after_child_and_duplicates() {
        let mut builder = ReportBuilder::new();
        set(&mut builder, "").unwrap();
        set(&mut builder, "a/b").unwrap();
        assert!(matches!(
            set(&mut builder, "a").unwrap_err(),
            SvnError::ProtocolViolation(_)
        ));
        assert!(set(&mut builder, "a/b").is_err());
    }

    #[test]
    fn builder_rejects_returning_into_a_left_subtree() {
        let mut builder = ReportBuilder::new();
        set(&mut builder, "").unwrap();
        set(&mut builder, "a").unwrap();
        set(&mut builder, "a/x").unwrap();
        set(&mut builder, "b").unwrap();
        assert!(set(&mut builder, "a/y").is_err());
    }

    #[test]
    fn builder_allows_unsorted_siblings() {
        let mut builder = ReportBuilder::new();
        set(&mut builder, "").unwrap();
        set(&mut builder, "z").unwrap();
        set(&mut builder, "a").unwrap();
        builder.finish_report().unwrap();
        assert!(builder.finish().is_ok());
    }

    #[test]
    fn builder_terminates_exactly_once() {
        let mut builder = ReportBuilder::new();
        set(&mut builder, "").unwrap();
        builder.finish_report().unwrap();
        assert!(builder.finish_report().is_err());
        assert!(builder.abort_report().is_err());
        assert!(set(&mut builder, "a").is_err());

        let unfinished = ReportBuilder::new();
        assert!(matches!(
            unfinished.finish().unwrap_err(),
            SvnError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn aborted_report_is_cancelled() {
        let mut builder = ReportBuilder::new();
        set(&mut builder, "").unwrap();
        builder.abort_report().unwrap();
        assert!(matches!(builder.finish().unwrap_err(), SvnError::Cancelled));
    }

    #[test]
    fn closures_and_reports_are_batons() {
        let mut baton = |r: &mut dyn Reporter| {
            r.set_path("", None, 3, Depth::Infinity, true)?;
            r.finish_report()
        };
        let mut builder = ReportBuilder::new();
        baton.report(&mut builder).unwrap();
        let mut report = builder.finish().unwrap();

        let mut replayed = ReportBuilder::new();
        report.report(&mut replayed).unwrap();
        assert_eq!(replayed.finish().unwrap(), report);
    }

    #[test]
    fn working_copy_state_inherits_revisions_for_locks() {
        let mut wc = WorkingCopyState::new(9, Depth::Infinity);
        wc.set("a", 4).lock("a/f", "tok").lock("b", "tok2");
        let mut builder = ReportBuilder::new();
        wc.report(&mut builder).unwrap();
        let report = builder.finish().unwrap();
        assert_eq!(
            report.commands,
            vec![
                ReportCommand::SetPath {
                    path: String::new(),
                    rev: 9,
                    start_empty: false,
                    lock_token: None,
                    depth: Depth::Infinity
                },
                ReportCommand::SetPath {
                    path: "a".into(),
                    rev: 4,
                    start_empty: false,
                    lock_token: None,
                    depth: Depth::Infinity
                },
                ReportCommand::SetPath {
                    path: "a/f".into(),
                    rev: 4,
                    start_empty: false,
                    lock_token: Some("tok".into()),
                    depth: Depth::Infinity
                },
                ReportCommand::SetPath {
                    path: "b".into(),
                    rev: 9,
                    start_empty: false,
                    lock_token: Some("tok2".into()),
                    depth: Depth::Infinity
                },
                ReportCommand::FinishReport,
            ]
        );
    }

    #[test]
    fn working_copy_state_aborts_on_bad_paths() {
        let mut wc = WorkingCopyState::new(1, Depth::Infinity);
        wc.set("../escape", 1);
        let mut builder = ReportBuilder::new();
        assert!(wc.report(&mut builder).is_err());
        assert!(matches!(builder.finish().unwrap_err(), SvnError::Cancelled));
    }

    proptest! {
        #[test]
        fn working_copy_state_always_reports_preorder(
            paths in proptest::collection::btree_set("[ab-]{1,2}(/[ab-]{1,2}){0,2}", 0..12),
            order in any::<u64>(),
        ) {
            let mut paths: Vec<String> = paths.into_iter().collect();
            // Scramble insertion order deterministically.
            let len = paths.len().max(1);
            paths.rotate_left((order as usize) % len);

            let mut wc = WorkingCopyState::new(10, Depth::Infinity);
            for (i, path) in paths.iter().enumerate() {
                if i % 3 == 2 {
                    wc.lock(path.clone(), "t");
                } else {
                    wc.set(path.clone(), i as u64);
                }
            }
            let mut builder = ReportBuilder::new();
            wc.report(&mut builder).unwrap();
            let report = builder.finish().unwrap();
            let emitted: Vec<&str> = report.claims().filter_map(ReportCommand::path).collect();
            let mut sorted = emitted.clone();
            sorted.sort_by(|a, b| cmp_preorder(a, b));
            prop_assert_eq!(emitted, sorted);
        }
    }
}
