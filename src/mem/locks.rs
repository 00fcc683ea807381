//! Locks held on files of a [`super::MemRepository`].
//!
//! Locks live beside the revisions, not inside them: taking or releasing
//! one never creates a revision. Commits that touch a locked file must
//! present its token and come from its owner.

use std::collections::BTreeMap;

use super::tree::Tree;
use super::{generate_uuid, server_error};
use crate::{ChangedPath, Depth, Lock, LockOptions, NodeKind, SvnError, UnlockOptions};

const ERR_NOT_FOUND: u64 = 160013;
const ERR_NOT_FILE: u64 = 160017;
const ERR_NO_USER: u64 = 160034;
const ERR_PATH_ALREADY_LOCKED: u64 = 160035;
const ERR_BAD_LOCK_TOKEN: u64 = 160037;
const ERR_NO_LOCK_TOKEN: u64 = 160038;
const ERR_LOCK_OWNER_MISMATCH: u64 = 160039;
const ERR_NO_SUCH_LOCK: u64 = 160040;
const ERR_OUT_OF_DATE: u64 = 160042;

/// What a commit brings to the lock check.
#[derive(Debug, Default)]
pub(crate) struct LockClaim {
    pub(crate) user: Option<String>,
    /// Token per absolute repository path.
    pub(crate) tokens: BTreeMap<String, String>,
    pub(crate) keep: bool,
}

/// Remainder of `path` below `prefix`: `""` for `prefix` itself, `None`
/// when `path` is elsewhere. Both are absolute.
pub(crate) fn relative<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if prefix == "/" {
        return path.strip_prefix('/');
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: BTreeMap<String, Lock>,
}

impl LockTable {
    pub(crate) fn get(&self, path: &str) -> Option<&Lock> {
        self.locks.get(path)
    }

    pub(crate) fn all(&self) -> Vec<Lock> {
        self.locks.values().cloned().collect()
    }

    /// Locks on `path` and below it. Only files carry locks, so
    /// [`Depth::Files`] and [`Depth::Immediates`] select the same ones.
    pub(crate) fn below(&self, path: &str, depth: Depth) -> Vec<Lock> {
        self.locks
            .values()
            .filter(|lock| match relative(path, &lock.path) {
                None => false,
                Some("") => true,
                Some(rest) => match depth {
                    Depth::Empty => false,
                    Depth::Files | Depth::Immediates => !rest.contains('/'),
                    Depth::Infinity => true,
                },
            })
            .cloned()
            .collect()
    }

    pub(crate) fn acquire(
        &mut self,
        head: &Tree,
        path: &str,
        owner: Option<&str>,
        options: &LockOptions,
        created: String,
    ) -> Result<Lock, SvnError> {
        let node = match head.lookup(path.trim_start_matches('/')) {
            Some(id) => head.node(id),
            None => {
                return Err(server_error(
                    ERR_NOT_FOUND,
                    format!("Path '{path}' doesn't exist in HEAD revision"),
                ));
            }
        };
        if node.kind != NodeKind::File {
            return Err(server_error(ERR_NOT_FILE, format!("'{path}' is not a file")));
        }
        let owner = owner.ok_or_else(|| {
            server_error(
                ERR_NO_USER,
                format!("Cannot lock path '{path}', no authenticated username available"),
            )
        })?;
        if let Some(rev) = options.current_rev
            && node.created_rev > rev
        {
            return Err(server_error(
                ERR_OUT_OF_DATE,
                format!("Path '{path}' is out of date (changed in r{})", node.created_rev),
            ));
        }
        if let Some(held) = self.locks.get(path)
            && !options.steal_lock
        {
            return Err(server_error(
                ERR_PATH_ALREADY_LOCKED,
                format!("Path '{path}' is already locked by user '{}'", held.owner),
            ));
        }
        let lock = Lock {
            path: path.to_string(),
            token: format!("opaquelocktoken:{}", generate_uuid()),
            owner: owner.to_string(),
            comment: options.comment.clone(),
            created,
            expires: None,
        };
        self.locks.insert(path.to_string(), lock.clone());
        Ok(lock)
    }

    pub(crate) fn release(
        &mut self,
        path: &str,
        user: Option<&str>,
        options: &UnlockOptions,
    ) -> Result<(), SvnError> {
        let Some(lock) = self.locks.get(path) else {
            return Err(server_error(ERR_NO_SUCH_LOCK, format!("No lock on path '{path}'")));
        };
        if !options.break_lock {
            match options.token.as_deref() {
                None => {
                    return Err(server_error(
                        ERR_NO_LOCK_TOKEN,
                        format!("No lock token provided for '{path}'"),
                    ));
                }
                Some(token) if token != lock.token => {
                    return Err(server_error(
                        ERR_BAD_LOCK_TOKEN,
                        format!("Lock token '{token}' does not match the lock on '{path}'"),
                    ));
                }
                Some(_) => {}
            }
            check_owner(lock, user)?;
        }
        self.locks.remove(path);
        Ok(())
    }

    /// Fails unless `claim` may change every locked path in `changes`.
    /// Deletions and replacements reach locks below the changed path too.
    pub(crate) fn check_commit(
        &self,
        changes: &[ChangedPath],
        claim: &LockClaim,
    ) -> Result<(), SvnError> {
        for change in changes {
            let recursive = matches!(change.action.as_str(), "D" | "R");
            for lock in self.locks.values() {
                match relative(&change.path, &lock.path) {
                    Some("") => {}
                    Some(_) if recursive => {}
                    _ => continue,
                }
                if claim.tokens.get(&lock.path) != Some(&lock.token) {
                    return Err(server_error(
                        ERR_NO_LOCK_TOKEN,
                        format!(
                            "Cannot verify lock on path '{}'; no matching lock-token available",
                            lock.path
                        ),
                    ));
                }
                check_owner(lock, claim.user.as_deref())?;
            }
        }
        Ok(())
    }

    /// Drops locks whose files are gone and, unless the claim keeps them,
    /// the locks it presented.
    pub(crate) fn settle_commit(&mut self, changes: &[ChangedPath], claim: &LockClaim) {
        for change in changes.iter().filter(|c| matches!(c.action.as_str(), "D" | "R")) {
            self.locks
                .retain(|path, _| relative(&change.path, path).is_none());
        }
        if !claim.keep {
            for (path, token) in &claim.tokens {
                if self.locks.get(path).is_some_and(|lock| &lock.token == token) {
                    self.locks.remove(path);
                }
            }
        }
    }
}

fn check_owner(lock: &Lock, user: Option<&str>) -> Result<(), SvnError> {
    match user {
        Some(user) if user == lock.owner => Ok(()),
        Some(user) => Err(server_error(
            ERR_LOCK_OWNER_MISMATCH,
            format!(
                "User '{user}' is trying to use a lock owned by '{}' on '{}'",
                lock.owner, lock.path
            ),
        )),
        None => Err(server_error(
            ERR_NO_USER,
            format!("Cannot use the lock on '{}' without a username", lock.path),
        )),
    }
}
