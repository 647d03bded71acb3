//! Append-only journal of entry lifecycle records
//!
//! The journal is the source of truth after a restart. Replaying it from an
//! empty table reproduces which entries are readable, their slot lengths,
//! and their recency order (the order of each entry's last CLEAN or READ).
//!
//! Layout: a five line header followed by one record per line.
//!
//! ```text
//! photowall.disklrucache
//! 1
//! <schema version>
//! <slot count>
//!
//! DIRTY 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6 832 21054
//! READ 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! REMOVE 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! ```

use crate::error::{DiskCacheError, Result};
use crate::key::EntryId;
use lru::LruCache;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_TMP_FILE: &str = "journal.tmp";

const MAGIC: &str = "photowall.disklrucache";
const FORMAT_VERSION: &str = "1";

/// Superseded records tolerated before the journal is compacted
pub const REDUNDANT_OP_THRESHOLD: usize = 2000;

/// Parameters a journal must agree with to be replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub schema_version: u32,
    pub slot_count: usize,
}

impl JournalHeader {
    fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n\n",
            MAGIC, FORMAT_VERSION, self.schema_version, self.slot_count
        )
    }

    fn check(&self, lines: &[&str]) -> Result<()> {
        let expected = [
            MAGIC.to_string(),
            FORMAT_VERSION.to_string(),
            self.schema_version.to_string(),
            self.slot_count.to_string(),
            String::new(),
        ];
        if lines.len() < expected.len() {
            return Err(DiskCacheError::CorruptJournal(
                "journal header is truncated".to_string(),
            ));
        }
        for (found, wanted) in lines.iter().zip(expected.iter()) {
            if *found != wanted.as_str() {
                return Err(DiskCacheError::CorruptJournal(format!(
                    "unexpected journal header: {:?}",
                    &lines[..expected.len()]
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Dirty(EntryId),
    Clean(EntryId, Vec<u64>),
    Remove(EntryId),
    Read(EntryId),
}

impl Record {
    fn to_line(&self) -> String {
        match self {
            Record::Dirty(id) => format!("DIRTY {}\n", id),
            Record::Clean(id, lengths) => {
                let mut line = format!("CLEAN {}", id);
                for len in lengths {
                    line.push(' ');
                    line.push_str(&len.to_string());
                }
                line.push('\n');
                line
            }
            Record::Remove(id) => format!("REMOVE {}\n", id),
            Record::Read(id) => format!("READ {}\n", id),
        }
    }

    fn parse(line: &str, slot_count: usize) -> Result<Self> {
        let mut parts = line.split(' ');
        let op = parts.next().unwrap_or_default();
        let id = parts
            .next()
            .ok_or_else(|| DiskCacheError::CorruptJournal(format!("missing id: {:?}", line)))
            .and_then(EntryId::parse)?;
        let rest: Vec<&str> = parts.collect();

        let record = match op {
            "CLEAN" => {
                if rest.len() != slot_count {
                    return Err(DiskCacheError::CorruptJournal(format!(
                        "expected {} lengths: {:?}",
                        slot_count, line
                    )));
                }
                let lengths = rest
                    .iter()
                    .map(|s| s.parse::<u64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|_| {
                        DiskCacheError::CorruptJournal(format!("bad lengths: {:?}", line))
                    })?;
                if total_length(&lengths).is_none() {
                    return Err(DiskCacheError::CorruptJournal(format!(
                        "lengths overflow: {:?}",
                        line
                    )));
                }
                return Ok(Record::Clean(id, lengths));
            }
            "DIRTY" => Record::Dirty(id),
            "REMOVE" => Record::Remove(id),
            "READ" => Record::Read(id),
            _ => {
                return Err(DiskCacheError::CorruptJournal(format!(
                    "unknown op: {:?}",
                    line
                )))
            }
        };

        if !rest.is_empty() {
            return Err(DiskCacheError::CorruptJournal(format!(
                "trailing fields: {:?}",
                line
            )));
        }
        Ok(record)
    }
}

/// Sum of slot lengths, `None` on overflow
pub(crate) fn total_length(lengths: &[u64]) -> Option<u64> {
    lengths.iter().try_fold(0u64, |acc, len| acc.checked_add(*len))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReplayState {
    lengths: Vec<u64>,
    dirty: bool,
}

/// Table reconstructed from a journal
#[derive(Debug, Default)]
pub struct Replay {
    /// Readable entries and their slot lengths, least recently used first
    pub entries: Vec<(EntryId, Vec<u64>)>,
    /// Entries whose last edit never completed
    pub abandoned: Vec<EntryId>,
    /// Total bytes of the readable entries
    pub size: u64,
    /// Records that no longer describe current state
    pub redundant_ops: usize,
    /// The final line was cut short by a crash
    pub torn_tail: bool,
}

/// Replay the journal in `dir`. `Ok(None)` means there is no journal yet.
pub fn replay(dir: &Path, header: JournalHeader) -> Result<Option<Replay>> {
    let path = dir.join(JOURNAL_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(DiskCacheError::CorruptJournal(
                "journal is not valid UTF-8".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let mut lines: Vec<&str> = content.split('\n').collect();
    // split leaves an empty final element after a terminated last line
    let torn_tail = match lines.pop() {
        Some("") | None => false,
        Some(_) => true,
    };

    header.check(&lines)?;

    let mut table: LruCache<EntryId, ReplayState> = LruCache::unbounded();
    let mut record_count = 0;
    for line in &lines[5..] {
        record_count += 1;
        match Record::parse(line, header.slot_count)? {
            Record::Dirty(id) => match table.peek_mut(&id) {
                Some(state) => state.dirty = true,
                None => {
                    table.put(
                        id,
                        ReplayState {
                            lengths: vec![0; header.slot_count],
                            dirty: true,
                        },
                    );
                }
            },
            Record::Clean(id, lengths) => {
                table.put(
                    id,
                    ReplayState {
                        lengths,
                        dirty: false,
                    },
                );
            }
            Record::Remove(id) => {
                table.pop(&id);
            }
            Record::Read(id) => {
                table.promote(&id);
            }
        }
    }

    let mut replayed = Replay {
        redundant_ops: record_count - table.len(),
        torn_tail,
        ..Replay::default()
    };
    // lru iterates most recent first
    for (id, state) in table.iter().rev() {
        if state.dirty {
            replayed.abandoned.push(id.clone());
        } else {
            replayed.size = total_length(&state.lengths)
                .and_then(|len| replayed.size.checked_add(len))
                .ok_or_else(|| {
                    DiskCacheError::CorruptJournal("total size overflows".to_string())
                })?;
            replayed.entries.push((id.clone(), state.lengths.clone()));
        }
    }

    debug!(
        entries = replayed.entries.len(),
        abandoned = replayed.abandoned.len(),
        redundant = replayed.redundant_ops,
        "Replayed journal"
    );
    Ok(Some(replayed))
}

/// Write a complete journal to a temp file and rename it over the live one
pub fn rewrite<I>(dir: &Path, header: JournalHeader, records: I) -> Result<()>
where
    I: IntoIterator<Item = Record>,
{
    let tmp_path = dir.join(JOURNAL_TMP_FILE);
    let result = (|| -> Result<()> {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(header.render().as_bytes())?;
        for record in records {
            writer.write_all(record.to_line().as_bytes())?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp_path, dir.join(JOURNAL_FILE))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Serialized append handle on the live journal
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JournalWriter {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            writer: BufWriter::new(file),
        }
    }

    /// Append one record and hand it to the OS
    pub fn append(&mut self, record: &Record) -> Result<()> {
        self.writer.write_all(record.to_line().as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Replace the journal with `records`, then continue appending to it.
    /// On failure the previous journal stays live.
    pub fn rebuild<I>(&mut self, header: JournalHeader, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        self.writer.flush()?;
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        rewrite(&dir, header, records)?;
        *self = Self::open(&dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HEADER: JournalHeader = JournalHeader {
        schema_version: 1,
        slot_count: 2,
    };

    fn id(key: &str) -> EntryId {
        EntryId::from_key(key)
    }

    fn write_journal(dir: &Path, body: &str) {
        fs::write(dir.join(JOURNAL_FILE), format!("{}{}", HEADER.render(), body)).unwrap();
    }

    #[test]
    fn test_record_lines() {
        let a = id("a");
        assert_eq!(Record::Dirty(a.clone()).to_line(), format!("DIRTY {}\n", a));
        assert_eq!(
            Record::Clean(a.clone(), vec![3, 40]).to_line(),
            format!("CLEAN {} 3 40\n", a)
        );
        assert_eq!(
            Record::parse(&format!("CLEAN {} 3 40", a), 2).unwrap(),
            Record::Clean(a.clone(), vec![3, 40])
        );
        assert_eq!(
            Record::parse(&format!("READ {}", a), 2).unwrap(),
            Record::Read(a)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let a = id("a");
        assert!(Record::parse("", 2).is_err());
        assert!(Record::parse("CLEAN", 2).is_err());
        assert!(Record::parse(&format!("CLEAN {} 3", a), 2).is_err());
        assert!(Record::parse(&format!("CLEAN {} 3 x", a), 2).is_err());
        assert!(Record::parse(&format!("UPDATE {}", a), 2).is_err());
        assert!(Record::parse(&format!("REMOVE {} 1", a), 2).is_err());
    }

    #[test]
    fn test_overflowing_lengths_are_corrupt() {
        let (a, b) = (id("a"), id("b"));
        assert!(matches!(
            Record::parse(&format!("CLEAN {} {} 1", a, u64::MAX), 2),
            Err(DiskCacheError::CorruptJournal(_))
        ));

        // each record fits, the table total does not
        let dir = tempdir().unwrap();
        let half = u64::MAX / 2 + 1;
        write_journal(
            dir.path(),
            &format!("CLEAN {a} {half} 0\nCLEAN {b} {half} 0\n"),
        );
        assert!(matches!(
            replay(dir.path(), HEADER),
            Err(DiskCacheError::CorruptJournal(_))
        ));
    }

    #[test]
    fn test_missing_journal() {
        let dir = tempdir().unwrap();
        assert!(replay(dir.path(), HEADER).unwrap().is_none());
    }

    #[test]
    fn test_replay_order_and_state() {
        let dir = tempdir().unwrap();
        let (a, b, c) = (id("a"), id("b"), id("c"));
        write_journal(
            dir.path(),
            &format!(
                "DIRTY {a}\nCLEAN {a} 1 2\nDIRTY {b}\nCLEAN {b} 3 4\nDIRTY {c}\nCLEAN {c} 5 6\n\
                 READ {a}\nDIRTY {b}\nREMOVE {c}\n"
            ),
        );

        let replayed = replay(dir.path(), HEADER).unwrap().unwrap();
        // b was mid-edit when the journal ended, so its old generation goes too
        assert_eq!(replayed.entries, vec![(a.clone(), vec![1, 2])]);
        assert_eq!(replayed.abandoned, vec![b]);
        assert_eq!(replayed.size, 3);
        assert_eq!(replayed.redundant_ops, 9 - 2);
        assert!(!replayed.torn_tail);
    }

    #[test]
    fn test_dirty_does_not_touch_recency() {
        let dir = tempdir().unwrap();
        let (a, b) = (id("a"), id("b"));
        write_journal(
            dir.path(),
            &format!("CLEAN {a} 1 1\nCLEAN {b} 1 1\nDIRTY {a}\nCLEAN {b} 2 2\n"),
        );
        let replayed = replay(dir.path(), HEADER).unwrap().unwrap();
        assert_eq!(replayed.abandoned, vec![a]);
        assert_eq!(replayed.entries, vec![(b, vec![2, 2])]);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let (a, b) = (id("a"), id("b"));
        write_journal(
            dir.path(),
            &format!("DIRTY {a}\nCLEAN {a} 1 2\nDIRTY {b}\nCLEAN {b} 3"),
        );
        let replayed = replay(dir.path(), HEADER).unwrap().unwrap();
        assert!(replayed.torn_tail);
        assert_eq!(replayed.entries, vec![(a, vec![1, 2])]);
        assert_eq!(replayed.abandoned, vec![b]);
    }

    #[test]
    fn test_header_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        write_journal(dir.path(), "");
        let other = JournalHeader {
            schema_version: 2,
            slot_count: 2,
        };
        assert!(matches!(
            replay(dir.path(), other),
            Err(DiskCacheError::CorruptJournal(_))
        ));

        fs::write(dir.path().join(JOURNAL_FILE), "photowall.disklrucache\n1\n").unwrap();
        assert!(matches!(
            replay(dir.path(), HEADER),
            Err(DiskCacheError::CorruptJournal(_))
        ));
    }

    #[test]
    fn test_rewrite_then_append() {
        let dir = tempdir().unwrap();
        let (a, b) = (id("a"), id("b"));
        rewrite(
            dir.path(),
            HEADER,
            vec![Record::Clean(a.clone(), vec![1, 1])],
        )
        .unwrap();
        assert!(!dir.path().join(JOURNAL_TMP_FILE).exists());

        let mut writer = JournalWriter::open(dir.path()).unwrap();
        writer.append(&Record::Dirty(b.clone())).unwrap();
        writer.append(&Record::Clean(b.clone(), vec![2, 2])).unwrap();
        writer.sync().unwrap();

        let replayed = replay(dir.path(), HEADER).unwrap().unwrap();
        assert_eq!(replayed.entries, vec![(a, vec![1, 1]), (b, vec![2, 2])]);
    }

    #[test]
    fn test_rebuild_replaces_journal() {
        let dir = tempdir().unwrap();
        let a = id("a");
        rewrite(dir.path(), HEADER, Vec::new()).unwrap();
        let mut writer = JournalWriter::open(dir.path()).unwrap();
        for _ in 0..10 {
            writer.append(&Record::Clean(a.clone(), vec![1, 1])).unwrap();
        }
        writer
            .rebuild(HEADER, vec![Record::Clean(a.clone(), vec![1, 1])])
            .unwrap();
        writer.append(&Record::Read(a.clone())).unwrap();

        let content = fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert_eq!(content.lines().count(), 5 + 2);
        let replayed = replay(dir.path(), HEADER).unwrap().unwrap();
        assert_eq!(replayed.entries, vec![(a, vec![1, 1])]);
        assert_eq!(replayed.redundant_ops, 1);
    }
}
