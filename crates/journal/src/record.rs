//! Journal file names, header and line records

use crate::error::{Error, Result};
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Name of the live journal
pub const JOURNAL_FILE: &str = "journal";
/// Name of a journal being rewritten
pub const JOURNAL_FILE_TEMP: &str = "journal.tmp";
/// Name of the previous journal while a rewrite is swapped in
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
/// First header line of every journal
pub const MAGIC: &str = "pictor.io.DiskLruCache";
/// Journal format version
pub const VERSION: &str = "1";

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// The five header lines identifying a journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Version of the application that wrote the journal
    pub app_version: u32,
    /// Number of values stored per entry
    pub value_count: usize,
}

impl Header {
    /// Number of lines the header occupies, including the trailing blank line
    pub const LINES: usize = 5;

    /// Header of the journal in `directory`, or `None` if there is no
    /// journal or it does not start with a well-formed header
    ///
    /// Lets tools open an existing cache with matching parameters instead of
    /// discarding it.
    pub fn read(directory: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = directory.as_ref().join(JOURNAL_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let lines: Vec<&str> = text.lines().take(Self::LINES).collect();
        Ok(Self::parse(&lines))
    }

    fn parse(lines: &[&str]) -> Option<Self> {
        let [magic, version, app, count, blank] = lines else {
            return None;
        };
        if *magic != MAGIC || *version != VERSION || !blank.is_empty() {
            return None;
        }
        Some(Self {
            app_version: app.parse().ok()?,
            value_count: count.parse().ok()?,
        })
    }

    pub(crate) fn write_to(self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "{MAGIC}")?;
        writeln!(out, "{VERSION}")?;
        writeln!(out, "{}", self.app_version)?;
        writeln!(out, "{}", self.value_count)?;
        writeln!(out)
    }

    /// Validate the first lines of a journal against this header
    pub(crate) fn check(self, lines: &[&str]) -> Result<()> {
        let app_version = self.app_version.to_string();
        let value_count = self.value_count.to_string();
        match lines {
            [magic, version, app, count, blank, ..]
                if *magic == MAGIC
                    && *version == VERSION
                    && *app == app_version
                    && *count == value_count
                    && blank.is_empty() =>
            {
                Ok(())
            }
            _ => Err(Error::corrupt(format!(
                "unexpected journal header: {:?}",
                &lines[..lines.len().min(Self::LINES)]
            ))),
        }
    }
}

/// One journal line after the header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<'a> {
    /// A committed entry with the byte length of every value
    Clean {
        key: &'a str,
        lengths: Cow<'a, [u64]>,
    },
    /// An edit was opened
    Dirty { key: &'a str },
    /// The entry was removed
    Remove { key: &'a str },
    /// The entry was read
    Read { key: &'a str },
}

impl<'a> Record<'a> {
    pub fn parse(line: &'a str, value_count: usize) -> Result<Self> {
        let corrupt = || Error::corrupt(format!("unexpected journal line: {line:?}"));
        let mut parts = line.split(' ');
        let state = parts.next().ok_or_else(corrupt)?;
        let key = parts.next().filter(|k| !k.is_empty()).ok_or_else(corrupt)?;

        let record = match state {
            CLEAN => {
                let lengths = parts
                    .map(|part| part.parse::<u64>().map_err(|_| corrupt()))
                    .collect::<Result<Vec<_>>>()?;
                if lengths.len() != value_count {
                    return Err(corrupt());
                }
                return Ok(Self::Clean {
                    key,
                    lengths: Cow::Owned(lengths),
                });
            }
            DIRTY => Self::Dirty { key },
            REMOVE => Self::Remove { key },
            READ => Self::Read { key },
            _ => return Err(corrupt()),
        };

        if parts.next().is_some() {
            return Err(corrupt());
        }
        Ok(record)
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean { key, lengths } => {
                write!(f, "{CLEAN} {key}")?;
                for length in lengths.iter() {
                    write!(f, " {length}")?;
                }
                Ok(())
            }
            Self::Dirty { key } => write!(f, "{DIRTY} {key}"),
            Self::Remove { key } => write!(f, "{REMOVE} {key}"),
            Self::Read { key } => write!(f, "{READ} {key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_line() {
        let record = Record::parse("CLEAN k1 10 20", 2).unwrap();
        assert_eq!(
            record,
            Record::Clean {
                key: "k1",
                lengths: Cow::Owned(vec![10, 20]),
            }
        );
        assert_eq!(record.to_string(), "CLEAN k1 10 20");
    }

    #[test]
    fn test_parse_simple_states() {
        assert_eq!(
            Record::parse("DIRTY k1", 1).unwrap(),
            Record::Dirty { key: "k1" }
        );
        assert_eq!(
            Record::parse("REMOVE k1", 1).unwrap(),
            Record::Remove { key: "k1" }
        );
        assert_eq!(
            Record::parse("READ k1", 1).unwrap(),
            Record::Read { key: "k1" }
        );
    }

    #[test]
    fn test_parse_rejects_wrong_length_count() {
        assert!(Record::parse("CLEAN k1 10", 2).is_err());
        assert!(Record::parse("CLEAN k1 10 20 30", 2).is_err());
    }

    #[test]
    fn test_parse_rejects_non_numeric_length() {
        assert!(Record::parse("CLEAN k1 ten", 1).is_err());
        assert!(Record::parse("CLEAN k1 -1", 1).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_state_and_missing_key() {
        assert!(Record::parse("UPDATE k1", 1).is_err());
        assert!(Record::parse("DIRTY", 1).is_err());
        assert!(Record::parse("", 1).is_err());
        assert!(Record::parse("REMOVE k1 extra", 1).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            app_version: 3,
            value_count: 2,
        };
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split('\n').collect();
        header.check(&lines).unwrap();
    }

    #[test]
    fn test_header_rejects_other_app_version() {
        let lines = [MAGIC, VERSION, "2", "1", ""];
        let header = Header {
            app_version: 1,
            value_count: 1,
        };
        assert!(matches!(
            header.check(&lines),
            Err(Error::CorruptJournal { .. })
        ));
    }

    #[test]
    fn test_header_rejects_short_input() {
        let header = Header {
            app_version: 1,
            value_count: 1,
        };
        assert!(header.check(&[MAGIC, VERSION]).is_err());
    }

    #[test]
    fn test_header_read_from_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(Header::read(dir.path()).unwrap(), None);

        let header = Header {
            app_version: 7,
            value_count: 3,
        };
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();
        out.extend_from_slice(b"CLEAN k1 1 2 3\n");
        fs::write(dir.path().join(JOURNAL_FILE), &out).unwrap();
        assert_eq!(Header::read(dir.path()).unwrap(), Some(header));

        fs::write(dir.path().join(JOURNAL_FILE), "garbage\n").unwrap();
        assert_eq!(Header::read(dir.path()).unwrap(), None);
    }
}
