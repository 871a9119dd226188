//! Configuration discovery and parsing.
//!
//! Three pieces of configuration come from the spectrometer installation,
//! all in fixed line-oriented legacy formats rather than anything modern:
//!
//! - `cfgmas.dat` — the controller command table (parsed by
//!   [`crate::protocol::CommandTable`]; this module only locates it),
//! - `symbols.sh` — shell-style `export` assignments naming the controller's
//!   TCP node and port,
//! - `config_times.dat` — the plot range limits, whose largest entry doubles
//!   as the history retention window.
//!
//! Files are searched for in the working directory first, then in the
//! `config/` directory shipped with this program, then in the directories the
//! `RNMR_COMMON` / `RNMR_SPECIFIC` environment variables point at.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;

use crate::error::{MasError, MasResult};

/// Environment variable naming the shared spectrometer config directory.
const COMMON_DIR_VAR: &str = "RNMR_COMMON";

/// Environment variable naming the machine-specific config directory.
const SPECIFIC_DIR_VAR: &str = "RNMR_SPECIFIC";

/// Symbol names carrying the controller address in `symbols.sh`.
const NODE_SYMBOL: &str = "TRM1_TCP_NODE";
const PORT_SYMBOL: &str = "TRM1_TCP_PORT";

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

/// Candidate locations for the command table file, in search order.
pub fn command_file_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("cfgmas.dat"), PathBuf::from("config/cfgmas.dat")];
    if let Ok(common) = env::var(COMMON_DIR_VAR) {
        candidates.push(Path::new(&common).join("rnmra/cfgmas.dat"));
    }
    candidates
}

/// Locate the controller command table file.
pub fn find_command_file() -> MasResult<PathBuf> {
    first_existing(&command_file_candidates())
        .ok_or_else(|| MasError::Config("cannot find command file cfgmas.dat".into()))
}

/// Candidate locations for the spectrometer symbols file, in search order.
pub fn symbols_file_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("symbols.sh")];
    if let Ok(specific) = env::var(SPECIFIC_DIR_VAR) {
        candidates.push(Path::new(&specific).join("symbols.sh"));
    }
    candidates
}

/// Locate the spectrometer symbols file.
pub fn find_symbols_file() -> MasResult<PathBuf> {
    first_existing(&symbols_file_candidates())
        .ok_or_else(|| MasError::Config("cannot find symbols file symbols.sh".into()))
}

/// Candidate locations for the plot range file, in search order.
pub fn ranges_file_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("config_times.dat"),
        PathBuf::from("config/config_times.dat"),
    ]
}

/// Locate the plot range configuration file.
pub fn find_ranges_file() -> MasResult<PathBuf> {
    first_existing(&ranges_file_candidates())
        .ok_or_else(|| MasError::Config("cannot find plot range file config_times.dat".into()))
}

/// TCP endpoint of the MAS controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerAddress {
    /// Host name or IP of the controller.
    pub node: String,
    /// TCP port the controller listens on.
    pub port: u16,
}

impl ControllerAddress {
    /// Parse a `node:port` string as given on the command line.
    pub fn parse(spec: &str) -> MasResult<Self> {
        let (node, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| MasError::Config(format!("address must be node:port, got '{spec}'")))?;
        let port = port
            .parse()
            .map_err(|_| MasError::Config(format!("invalid port in address '{spec}'")))?;
        Ok(Self {
            node: node.to_owned(),
            port,
        })
    }

    /// Load the address from the spectrometer symbols file found on disk.
    pub fn discover() -> MasResult<Self> {
        let path = find_symbols_file()?;
        let text = fs::read_to_string(&path).map_err(|e| {
            MasError::Config(format!("cannot read symbols file '{}': {}", path.display(), e))
        })?;
        Self::from_symbols(&text)
    }

    /// Extract the address from symbols file text.
    ///
    /// The file carries shell assignments of the form
    /// `export TRM1_TCP_NODE = 'mas1'`; values are quoted and the `=` may or
    /// may not be surrounded by whitespace.
    pub fn from_symbols(text: &str) -> MasResult<Self> {
        let mut node = None;
        let mut port = None;

        for line in text.lines() {
            let tokens = shell_tokens(line);
            if tokens.len() != 4 || tokens[0] != "export" || tokens[2] != "=" {
                continue;
            }
            match tokens[1].as_str() {
                NODE_SYMBOL => node = Some(unquote(&tokens[3]).to_owned()),
                PORT_SYMBOL => {
                    port = Some(unquote(&tokens[3]).parse::<u16>().map_err(|_| {
                        MasError::Config(format!("invalid {PORT_SYMBOL} value in symbols file"))
                    })?);
                }
                _ => {}
            }
        }

        match (node, port) {
            (Some(node), Some(port)) => Ok(Self { node, port }),
            _ => Err(MasError::Config(format!(
                "{NODE_SYMBOL} and {PORT_SYMBOL} not found in symbols file"
            ))),
        }
    }

    /// `node:port` form suitable for a socket connect.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.node, self.port)
    }
}

/// Tokenize one line of shell-ish text: bare words, `=` as its own token,
/// quoted strings kept as single tokens (quotes included).
fn shell_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' || c == '"' {
            let quote = c;
            let mut token = String::from(quote);
            chars.next();
            for q in chars.by_ref() {
                token.push(q);
                if q == quote {
                    break;
                }
            }
            tokens.push(token);
        } else if c.is_alphanumeric() || c == '_' {
            let mut token = String::new();
            while let Some(&w) = chars.peek() {
                if w.is_alphanumeric() || w == '_' {
                    token.push(w);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(token);
        } else {
            tokens.push(c.to_string());
            chars.next();
        }
    }
    tokens
}

fn unquote(token: &str) -> &str {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[bytes.len() - 1] == bytes[0]
    {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

/// Tick spacing unit for a plot range, carried through to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickUnit {
    /// Ticks placed on second boundaries.
    Seconds,
    /// Ticks placed on minute boundaries.
    Minutes,
    /// Ticks placed on hour boundaries.
    Hours,
}

/// One selectable plot time range and its tick spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotRange {
    /// Maximum span of data shown at this setting.
    pub limit: TimeDelta,
    /// Spacing between axis ticks.
    pub tick: TimeDelta,
    /// Unit the tick spacing was declared in.
    pub tick_unit: TickUnit,
}

/// Ordered list of selectable plot ranges from `config_times.dat`.
///
/// The largest range doubles as the history retention window: the buffer
/// guarantees to keep at least this much recent data.
#[derive(Debug, Clone)]
pub struct PlotRanges {
    ranges: Vec<PlotRange>,
}

impl PlotRanges {
    /// Load and validate the plot range file.
    pub fn load(path: &Path) -> MasResult<Self> {
        let source = fs::read_to_string(path).map_err(|e| {
            MasError::Config(format!(
                "cannot read plot range file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&source)
    }

    /// Parse and validate plot range text.
    pub fn parse(source: &str) -> MasResult<Self> {
        let mut lines = source.lines();
        if lines.next() != Some("Limit Ticks") {
            return Err(MasError::Config(
                "plot range file must start with 'Limit Ticks'".into(),
            ));
        }

        let mut ranges: Vec<PlotRange> = Vec::new();
        for line in lines {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 4 {
                return Err(MasError::Config(format!("malformed plot range entry: '{line}'")));
            }

            let (limit, _) = parse_span(tokens[0], tokens[1], line)?;
            let (tick, tick_unit) = parse_span(tokens[2], tokens[3], line)?;

            if tick >= limit {
                return Err(MasError::Config(format!(
                    "tick interval must be less than its limit: '{line}'"
                )));
            }
            if let Some(previous) = ranges.last() {
                if limit <= previous.limit {
                    return Err(MasError::Config(
                        "plot range limits must be in increasing order".into(),
                    ));
                }
            }

            ranges.push(PlotRange {
                limit,
                tick,
                tick_unit,
            });
        }

        if ranges.is_empty() {
            return Err(MasError::Config("plot range file has no entries".into()));
        }
        Ok(Self { ranges })
    }

    /// All ranges, smallest first.
    pub fn ranges(&self) -> &[PlotRange] {
        &self.ranges
    }

    /// The retention window implied by the largest range.
    pub fn history_length(&self) -> TimeDelta {
        // parse() guarantees at least one entry.
        self.ranges.last().map(|r| r.limit).unwrap_or(TimeDelta::hours(24))
    }
}

fn parse_span(value: &str, unit: &str, line: &str) -> MasResult<(TimeDelta, TickUnit)> {
    let value: i64 = value
        .parse()
        .map_err(|_| MasError::Config(format!("invalid duration in plot range entry: '{line}'")))?;
    match unit {
        "s" => Ok((TimeDelta::seconds(value), TickUnit::Seconds)),
        "m" => Ok((TimeDelta::minutes(value), TickUnit::Minutes)),
        "h" => Ok((TimeDelta::hours(value), TickUnit::Hours)),
        other => Err(MasError::Config(format!(
            "invalid time unit '{other}' in plot range entry: '{line}'"
        ))),
    }
}
