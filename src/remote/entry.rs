//! Remote directory entries and listings.

use std::cmp::Ordering;

use serde::Serialize;

use super::ChannelId;

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    Other,
}

impl EntryKind {
    /// Single-character marker as in `ls -l`.
    #[must_use]
    pub fn marker(self) -> char {
        match self {
            Self::Directory => 'd',
            Self::File => '-',
            Self::Symlink => 'l',
            Self::Other => '?',
        }
    }
}

/// One entry of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    /// Base name.
    pub name: String,
    /// Full remote path.
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits (`0o7777` mask).
    pub permissions: u32,
    /// Access time, unix seconds.
    pub accessed: Option<u64>,
    /// Modification time, unix seconds.
    pub modified: Option<u64>,
}

impl RemoteEntry {
    /// True if this is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Renders the permission bits as `rwxr-xr-x`, prefixed by the kind.
    #[must_use]
    pub fn mode_string(&self) -> String {
        let mut out = String::with_capacity(10);
        out.push(self.kind.marker());
        for shift in [6, 3, 0] {
            let bits = (self.permissions >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }
}

/// Directories first, then case-insensitive by name.
#[must_use]
pub fn compare_entries(a: &RemoteEntry, b: &RemoteEntry) -> Ordering {
    match (a.is_directory(), b.is_directory()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    }
}

/// Sorts entries for display.
pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(compare_entries);
}

/// Contents of one remote directory as seen through a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub channel_id: ChannelId,
    /// Directory that was listed.
    pub path: String,
    /// Sorted entries.
    pub entries: Vec<RemoteEntry>,
}
