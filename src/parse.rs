//! Path handling and directory listing parsing.

use crate::error::{Error, Result};
use crate::stat::{Stat, decode_stats};

/// Split a path into parent directory and leaf name.
pub(crate) fn split_parent_name(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::NotFound(path.to_string()));
    }
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    };
    let parent = if parent.is_empty() { "/" } else { parent };
    if name.is_empty() || name == "." || name == ".." {
        Err(Error::NotFound(path.to_string()))
    } else {
        Ok((parent, name))
    }
}

/// Split a path into normalized components.
pub(crate) fn path_parts(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

/// Whether `name` can label a new namespace entry.
pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Parse a directory read, dropping the synthesized parent entry.
pub(crate) fn parse_dir_entries(data: &[u8], entries: &mut Vec<Stat>) -> Result<()> {
    for stat in decode_stats(data)? {
        if stat.name != "." && stat.name != ".." {
            entries.push(stat);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Qid, QidType};

    #[test]
    fn splits_parent_and_leaf() {
        assert_eq!(split_parent_name("/a/b/c").unwrap(), ("/a/b", "c"));
        assert_eq!(split_parent_name("/top/").unwrap(), ("/", "top"));
        assert_eq!(split_parent_name("leaf").unwrap(), ("/", "leaf"));
        assert!(split_parent_name("/").is_err());
        assert!(split_parent_name("/a/..").is_err());
    }

    #[test]
    fn normalizes_components() {
        assert_eq!(path_parts("//a/./b/"), vec!["a", "b"]);
        assert!(path_parts("/").is_empty());
        assert!(valid_name("greet"));
        assert!(!valid_name("a/b"));
        assert!(!valid_name(".."));
    }

    #[test]
    fn listing_skips_parent_entry() {
        let entry = |name: &str| Stat {
            type_: 0,
            dev: 0,
            qid: Qid::new(QidType::FILE, 0, 1),
            mode: 0o644,
            atime: 0,
            mtime: 0,
            length: 0,
            name: name.to_string(),
            uid: String::from("u"),
            gid: String::from("g"),
            muid: String::from("m"),
        };
        let mut data = entry("..").encode().unwrap();
        data.extend(entry("file").encode().unwrap());
        let mut entries = Vec::new();
        parse_dir_entries(&data, &mut entries).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "file");
        assert!(parse_dir_entries(&data[..5], &mut entries).is_err());
    }
}
