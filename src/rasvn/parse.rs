use crate::path::join;
use crate::{
    ChangedPath, CommitInfo, DirEntry, DirListing, FileRevision, Location, Lock, LogEntry,
    NodeKind, PropChange, PropertyList, RepositoryInfo, ServerError, ServerErrorItem, SvnError,
};

use super::SvnItem;

pub(crate) fn parse_proplist(item: &SvnItem) -> Result<PropertyList, SvnError> {
    let entries = item
        .as_list()
        .ok_or_else(|| SvnError::Protocol("proplist not a list".into()))?;
    let mut props = PropertyList::new();
    for entry in entries {
        let Some(items) = entry.as_list() else {
            continue;
        };
        if items.len() < 2 {
            continue;
        }
        let Some(name) = items[0].as_string() else {
            continue;
        };
        let Some(value) = items[1].as_bytes_string() else {
            continue;
        };
        props.insert(name, value);
    }
    Ok(props)
}

pub(crate) fn parse_repos_info(params: &[SvnItem]) -> Result<RepositoryInfo, SvnError> {
    if params.is_empty() {
        return Err(SvnError::Protocol("repos-info params empty".into()));
    }
    let uuid = params[0]
        .as_string()
        .ok_or_else(|| SvnError::Protocol("repos-info uuid not a string".into()))?;
    let root_url = match params.get(1) {
        Some(item) => item
            .as_string()
            .ok_or_else(|| SvnError::Protocol("repos-info root url not a string".into()))?,
        None => String::new(),
    };
    let capabilities: Vec<String> = match params.get(2) {
        Some(item) => item
            .as_list()
            .ok_or_else(|| SvnError::Protocol("repos-info caps not a list".into()))?
            .into_iter()
            .filter_map(|c| c.as_word())
            .collect(),
        None => Vec::new(),
    };
    Ok(RepositoryInfo {
        uuid,
        root_url: root_url.trim_end_matches('/').to_string(),
        capabilities,
    })
}

pub(crate) fn parse_server_error(items: &[SvnItem]) -> ServerError {
    let mut chain = Vec::new();
    for item in items {
        let SvnItem::List(parts) = item else {
            continue;
        };
        if parts.len() < 4 {
            continue;
        }

        chain.push(ServerErrorItem {
            code: parts[0].as_u64().unwrap_or(0),
            message: lossy_string(&parts[1]).filter(|m| !m.is_empty()),
            file: lossy_string(&parts[2]).filter(|s| !s.is_empty()),
            line: parts[3].as_u64(),
        });
    }

    ServerError {
        context: None,
        chain,
    }
}

fn lossy_string(item: &SvnItem) -> Option<String> {
    match item {
        SvnItem::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        SvnItem::Word(word) => Some(word.clone()),
        _ => None,
    }
}

/// `( new-rev ( date? ) ( author? ) ( post-commit-err? ) )`
pub(crate) fn parse_commit_info(item: &SvnItem) -> Result<CommitInfo, SvnError> {
    let items = item
        .as_list()
        .ok_or_else(|| SvnError::Protocol("commit-info not a list".into()))?;
    let new_rev = items
        .first()
        .and_then(SvnItem::as_u64)
        .ok_or_else(|| SvnError::Protocol("commit-info new-rev not a number".into()))?;

    Ok(CommitInfo {
        new_rev,
        date: items.get(1).and_then(opt_tuple_string),
        author: items.get(2).and_then(opt_tuple_string),
        post_commit_err: items.get(3).and_then(opt_tuple_string),
    })
}

pub(crate) struct GetFileResponseParams {
    pub(crate) checksum: Option<String>,
    pub(crate) rev: u64,
    pub(crate) props: PropertyList,
}

/// `( ( checksum? ) rev props ... )`
pub(crate) fn parse_get_file_response_params(
    params: &[SvnItem],
) -> Result<GetFileResponseParams, SvnError> {
    if params.len() < 3 {
        return Err(SvnError::Protocol("get-file response too short".into()));
    }
    let rev = params[1]
        .as_u64()
        .ok_or_else(|| SvnError::Protocol("get-file rev not a number".into()))?;

    Ok(GetFileResponseParams {
        checksum: opt_tuple_string(&params[0]),
        rev,
        props: parse_proplist(&params[2])?,
    })
}

/// `( rev props ( entry* ) )`; every entry is
/// `( name kind size has-props created-rev ( date? ) ( author? ) )`.
pub(crate) fn parse_get_dir_listing(
    dir_path: &str,
    params: &[SvnItem],
) -> Result<DirListing, SvnError> {
    if params.len() < 3 {
        return Err(SvnError::Protocol("get-dir response too short".into()));
    }

    let rev = params[0]
        .as_u64()
        .ok_or_else(|| SvnError::Protocol("get-dir rev not a number".into()))?;
    let props = parse_proplist(&params[1])?;
    let entries_list = params[2]
        .as_list()
        .ok_or_else(|| SvnError::Protocol("get-dir entries not a list".into()))?;

    let mut entries = Vec::with_capacity(entries_list.len());
    for entry in entries_list {
        let items = entry
            .as_list()
            .ok_or_else(|| SvnError::Protocol("get-dir entry not a list".into()))?;
        let name = items
            .first()
            .and_then(SvnItem::as_string)
            .ok_or_else(|| SvnError::Protocol("get-dir entry name missing".into()))?;
        let path = join(dir_path, &name);
        entries.push(dirent_fields(name, path, &items[1..])?);
    }

    Ok(DirListing {
        rev,
        props,
        entries,
    })
}

/// `( ( dirent? ) )` where the dirent is
/// `( kind size has-props created-rev ( date? ) ( author? ) )`.
pub(crate) fn parse_stat_params(
    path: &str,
    params: &[SvnItem],
) -> Result<Option<DirEntry>, SvnError> {
    let Some(tuple) = params.first().and_then(SvnItem::as_list) else {
        return Err(SvnError::Protocol("stat response not a tuple".into()));
    };
    let Some(dirent) = tuple.first() else {
        return Ok(None);
    };
    let items = dirent
        .as_list()
        .ok_or_else(|| SvnError::Protocol("stat dirent not a list".into()))?;
    let name = crate::path::basename(path).to_string();
    dirent_fields(name, path.to_string(), &items).map(Some)
}

fn dirent_fields(name: String, path: String, items: &[SvnItem]) -> Result<DirEntry, SvnError> {
    let kind = items
        .first()
        .and_then(SvnItem::as_word)
        .and_then(|word| NodeKind::from_word(&word))
        .ok_or_else(|| SvnError::Protocol(format!("invalid node kind for '{path}'")))?;

    Ok(DirEntry {
        name,
        path,
        kind,
        size: items.get(1).and_then(SvnItem::as_u64).unwrap_or(0),
        has_props: items.get(2).and_then(SvnItem::as_bool).unwrap_or(false),
        created_rev: items.get(3).and_then(SvnItem::as_u64).unwrap_or(0),
        created_date: items.get(4).and_then(opt_tuple_string),
        last_author: items.get(5).and_then(opt_tuple_string),
    })
}

/// `( ( change* ) rev ( author? ) ( date? ) ( message? ) has-children
/// invalid-revnum revprop-count ( revprops ) ... )`
///
/// Each change is `( path action ( copy-path copy-rev )? ( kind text-mods
/// prop-mods )? )`. Changed paths stay repository-absolute.
pub(crate) fn parse_log_entry(items: Vec<SvnItem>) -> Result<LogEntry, SvnError> {
    if items.len() < 2 {
        return Err(SvnError::Protocol("log entry too short".into()));
    }
    let changes = items[0]
        .as_list()
        .ok_or_else(|| SvnError::Protocol("log entry changes not a list".into()))?;
    let rev = items[1]
        .as_u64()
        .ok_or_else(|| SvnError::Protocol("log entry rev not a number".into()))?;

    let mut author = items.get(2).and_then(opt_tuple_string);
    let mut date = items.get(3).and_then(opt_tuple_string);
    let mut message = items.get(4).and_then(opt_tuple_string);

    if let Some(revprops) = items.get(8) {
        let revprops = parse_proplist(revprops)?;
        let text = |name: &str| {
            revprops
                .get(name)
                .map(|v| String::from_utf8_lossy(v).into_owned())
        };
        author = author.or_else(|| text("svn:author"));
        date = date.or_else(|| text("svn:date"));
        message = message.or_else(|| text("svn:log"));
    }

    let mut changed_paths = Vec::with_capacity(changes.len());
    for change in changes {
        let Some(change_items) = change.as_list() else {
            continue;
        };
        if change_items.len() < 2 {
            continue;
        }
        let Some(path) = change_items[0].as_string() else {
            continue;
        };
        let Some(action) = change_items[1].as_word() else {
            continue;
        };

        let (copy_from_path, copy_from_rev) = change_items
            .get(2)
            .and_then(SvnItem::as_list)
            .and_then(|items| {
                let path = items.first()?.as_string()?;
                let rev = items.get(1)?.as_u64()?;
                Some((Some(absolute(&path)), Some(rev)))
            })
            .unwrap_or((None, None));

        let node_kind = change_items
            .get(3)
            .and_then(SvnItem::as_list)
            .and_then(|items| {
                let kind = items.first()?;
                kind.as_word().or_else(|| kind.as_string())
            })
            .and_then(|word| NodeKind::from_word(&word));

        changed_paths.push(ChangedPath {
            action,
            path: absolute(&path),
            copy_from_path,
            copy_from_rev,
            node_kind,
        });
    }

    Ok(LogEntry {
        rev,
        changed_paths,
        author,
        date,
        message,
    })
}

/// `( path token owner ( comment? ) created ( expires? ) )`
pub(crate) fn parse_lock(item: &SvnItem) -> Result<Lock, SvnError> {
    let items = item
        .as_list()
        .ok_or_else(|| SvnError::Protocol("lock description not a list".into()))?;
    let text = |index: usize, what: &str| {
        items
            .get(index)
            .and_then(SvnItem::as_string)
            .ok_or_else(|| SvnError::Protocol(format!("lock description {what} missing")))
    };
    Ok(Lock {
        path: absolute(&text(0, "path")?),
        token: text(1, "token")?,
        owner: text(2, "owner")?,
        comment: items.get(3).and_then(opt_tuple_string),
        created: text(4, "creation date")?,
        expires: items.get(5).and_then(opt_tuple_string),
    })
}

/// `( rev path )`
pub(crate) fn parse_location(items: &[SvnItem]) -> Result<Location, SvnError> {
    let rev = items
        .first()
        .and_then(SvnItem::as_u64)
        .ok_or_else(|| SvnError::Protocol("location rev not a number".into()))?;
    let path = items
        .get(1)
        .and_then(SvnItem::as_string)
        .ok_or_else(|| SvnError::Protocol("location path not a string".into()))?;
    Ok(Location {
        rev,
        path: absolute(&path),
    })
}

/// `( path rev rev-props ( ( name ( value? ) )* ) merged? )`; the delta
/// arrives separately, so `windows` starts out empty.
pub(crate) fn parse_file_revision(items: &[SvnItem]) -> Result<FileRevision, SvnError> {
    let path = items
        .first()
        .and_then(SvnItem::as_string)
        .ok_or_else(|| SvnError::Protocol("file-rev path not a string".into()))?;
    let rev = items
        .get(1)
        .and_then(SvnItem::as_u64)
        .ok_or_else(|| SvnError::Protocol("file-rev rev not a number".into()))?;
    let rev_props = match items.get(2) {
        Some(item) => parse_proplist(item)?,
        None => return Err(SvnError::Protocol("file-rev entry too short".into())),
    };
    let changes = items
        .get(3)
        .and_then(SvnItem::as_list)
        .ok_or_else(|| SvnError::Protocol("file-rev prop changes not a list".into()))?;
    let prop_changes = changes
        .iter()
        .filter_map(SvnItem::as_list)
        .filter_map(|change| {
            Some(PropChange {
                name: change.first()?.as_string()?,
                value: change.get(1).and_then(opt_tuple_bytes),
            })
        })
        .collect();
    Ok(FileRevision {
        path: absolute(&path),
        rev,
        rev_props,
        prop_changes,
        merged: items.get(4).and_then(SvnItem::as_bool).unwrap_or(false),
        windows: Vec::new(),
    })
}

fn absolute(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub(crate) fn opt_tuple_string(item: &SvnItem) -> Option<String> {
    match item {
        SvnItem::List(items) => items.first().and_then(SvnItem::as_string),
        _ => item.as_string(),
    }
}

pub(crate) fn opt_tuple_bytes(item: &SvnItem) -> Option<Vec<u8>> {
    match item {
        SvnItem::List(items) => items.first().and_then(SvnItem::as_bytes_string),
        _ => item.as_bytes_string(),
    }
}

pub(crate) fn opt_tuple_u64(item: &SvnItem) -> Option<u64> {
    match item {
        SvnItem::List(items) => items.first().and_then(SvnItem::as_u64),
        _ => item.as_u64(),
    }
}
