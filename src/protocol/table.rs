//! The controller command vocabulary.
//!
//! Commands are described by a line-oriented configuration file (`cfgmas.dat`)
//! that ships with the spectrometer software:
//!
//! ```text
//! MASCMD
//! MA MA,0,1
//! AS AS,0,5
//! DS DS,1,1
//!
//! ```
//!
//! The first line must carry the `MASCMD` tag. Each entry names the command
//! code twice (once bare, once as the first comma field) followed by the
//! argument count and the number of reply fields. A blank line ends the
//! table; lines consisting of a lone `;` are comments. Every command sent to
//! the controller is checked against this table first, so a typo'd code or a
//! wrong argument count never reaches the wire.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{MasError, MasResult};

/// Header tag required on the first line of the command file.
const HEADER_TAG: &str = "MASCMD";

/// One command's metadata from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    /// Number of arguments the command requires.
    pub args: usize,
    /// Number of fields in the controller's reply. Carried through from the
    /// configuration file but not interpreted here.
    pub reply_fields: u32,
}

/// Immutable mapping from two-character command code to its metadata.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: HashMap<String, CommandEntry>,
}

impl CommandTable {
    /// Load the table from a file on disk.
    pub fn load(path: &Path) -> MasResult<Self> {
        let source = fs::read_to_string(path).map_err(|e| {
            MasError::Config(format!(
                "cannot read command file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&source)
    }

    /// Parse the table from in-memory text.
    pub fn parse(source: &str) -> MasResult<Self> {
        let mut lines = source.lines();
        let header = lines
            .next()
            .ok_or_else(|| MasError::Config("command file is empty".into()))?;
        if header.split_whitespace().next() != Some(HEADER_TAG) {
            return Err(MasError::Config(format!(
                "command file must start with '{HEADER_TAG}'"
            )));
        }

        let mut entries = HashMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if line == ";" {
                continue;
            }

            let mut words = line.split_whitespace();
            let (Some(code), Some(detail)) = (words.next(), words.next()) else {
                return Err(MasError::Config(format!("malformed command entry: '{line}'")));
            };
            let fields: Vec<&str> = detail.split(',').collect();
            if fields.len() != 3 {
                return Err(MasError::Config(format!("malformed command entry: '{line}'")));
            }
            if code != fields[0] {
                return Err(MasError::Config(format!(
                    "command codes disagree in entry: '{line}'"
                )));
            }

            let args: usize = fields[1].parse().map_err(|_| {
                MasError::Config(format!("invalid argument count in entry: '{line}'"))
            })?;
            let reply_fields: u32 = fields[2].parse().map_err(|_| {
                MasError::Config(format!("invalid reply field count in entry: '{line}'"))
            })?;

            entries.insert(code.to_owned(), CommandEntry { args, reply_fields });
        }

        Ok(Self { entries })
    }

    /// Check a command code and its arguments against the table.
    ///
    /// Returns a protocol error if the code is unknown or the argument count
    /// does not match the declared arity.
    pub fn validate(&self, code: &str, args: &[String]) -> MasResult<()> {
        let entry = self
            .entries
            .get(code)
            .ok_or_else(|| MasError::Protocol(format!("unknown command '{code}'")))?;
        if args.len() != entry.args {
            return Err(MasError::Protocol(format!(
                "command '{code}' takes {} argument(s), got {}",
                entry.args,
                args.len()
            )));
        }
        Ok(())
    }

    /// Metadata for a command code, if present.
    pub fn get(&self, code: &str) -> Option<&CommandEntry> {
        self.entries.get(code)
    }

    /// Whether the table knows `code`.
    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    /// Iterate over all (code, entry) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CommandEntry)> {
        self.entries.iter().map(|(code, entry)| (code.as_str(), entry))
    }

    /// Number of commands in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no commands.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MASCMD\n\
                          MA MA,0,1\n\
                          AS AS,0,5\n\
                          VD VD,0,1\n\
                          ;\n\
                          DS DS,1,1\n\
                          BP BP,1,1\n\
                          \n\
                          XX XX,9,9\n";

    #[test]
    fn parses_entries_until_blank_line() {
        let table = CommandTable::parse(SAMPLE).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.get("AS").unwrap().args, 0);
        assert_eq!(table.get("AS").unwrap().reply_fields, 5);
        assert_eq!(table.get("DS").unwrap().args, 1);
        // XX sits after the blank terminator and must not be loaded.
        assert!(!table.contains("XX"));
    }

    #[test]
    fn comment_lines_are_skipped() {
        let table = CommandTable::parse("MASCMD\n;\nMA MA,0,1\n").unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rejects_wrong_header() {
        let err = CommandTable::parse("NOTCMD\nMA MA,0,1\n").unwrap_err();
        assert!(matches!(err, MasError::Config(_)));
    }

    #[test]
    fn rejects_disagreeing_codes() {
        let err = CommandTable::parse("MASCMD\nMA MB,0,1\n").unwrap_err();
        assert!(matches!(err, MasError::Config(_)));
    }

    #[test]
    fn rejects_non_integer_counts() {
        for bad in ["MASCMD\nMA MA,x,1\n", "MASCMD\nMA MA,0,y\n"] {
            let err = CommandTable::parse(bad).unwrap_err();
            assert!(matches!(err, MasError::Config(_)));
        }
    }

    #[test]
    fn rejects_malformed_entries() {
        for bad in ["MASCMD\nMA\n", "MASCMD\nMA MA,0\n", "MASCMD\nMA MA,0,1,2\n"] {
            let err = CommandTable::parse(bad).unwrap_err();
            assert!(matches!(err, MasError::Config(_)), "accepted: {bad:?}");
        }
    }

    #[test]
    fn validate_checks_arity_for_every_entry() {
        let table = CommandTable::parse(SAMPLE).unwrap();
        let codes: Vec<String> = table.iter().map(|(c, _)| c.to_owned()).collect();
        for code in codes {
            let arity = table.get(&code).unwrap().args;
            let good: Vec<String> = (0..arity).map(|i| i.to_string()).collect();
            assert!(table.validate(&code, &good).is_ok());

            let extra: Vec<String> = (0..arity + 1).map(|i| i.to_string()).collect();
            assert!(matches!(
                table.validate(&code, &extra),
                Err(MasError::Protocol(_))
            ));
            if arity > 0 {
                assert!(matches!(
                    table.validate(&code, &[]),
                    Err(MasError::Protocol(_))
                ));
            }
        }
    }

    #[test]
    fn validate_rejects_unknown_code() {
        let table = CommandTable::parse(SAMPLE).unwrap();
        assert!(matches!(
            table.validate("ZZ", &[]),
            Err(MasError::Protocol(_))
        ));
    }
}
