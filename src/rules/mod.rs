//! Domain routing rules
//!
//! A rule's text form is a one-character mode marker followed by a domain or
//! domain suffix, e.g. `~example.com`. Resolution walks the hostname from the
//! full name down to its shortest suffix, so a rule for `example.com` also
//! covers `www.example.com` but not `notexample.com`.

use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;

/// Rule errors
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule mode must be one of [~, @, !]: {0:?}")]
    InvalidRule(String),
}

/// Routing decision for a connection.
///
/// `Rule` is the lookup sentinel: as a table's global mode it means "consult
/// the rules", and as a resolution result it means "no rule matched". It is
/// never a stored entry's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Rule = b'*',
    Tunnel = b'~',
    Direct = b'@',
    Drop = b'!',
}

impl Mode {
    /// The marker character used in rule text and logs.
    pub fn marker(self) -> char {
        self as u8 as char
    }

    pub fn from_marker(c: char) -> Option<Self> {
        match c {
            '*' => Some(Mode::Rule),
            '~' => Some(Mode::Tunnel),
            '@' => Some(Mode::Direct),
            '!' => Some(Mode::Drop),
            _ => None,
        }
    }

    fn from_u8(b: u8) -> Self {
        Mode::from_marker(b as char).unwrap_or(Mode::Tunnel)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.marker())
    }
}

/// One parsed rule: a domain (or suffix) and its routing mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub domain: String,
    pub mode: Mode,
}

impl Rule {
    /// Parse the text form `<marker><domain>`.
    ///
    /// The reserved `*` marker and anything that is not a known marker is
    /// rejected; so is an empty domain.
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let mut chars = text.chars();
        let marker = chars.next().ok_or_else(|| RuleError::InvalidRule(text.to_string()))?;
        let domain = chars.as_str();

        let mode = match Mode::from_marker(marker) {
            Some(Mode::Rule) | None => return Err(RuleError::InvalidRule(text.to_string())),
            Some(m) => m,
        };
        if domain.is_empty() {
            return Err(RuleError::InvalidRule(text.to_string()));
        }

        Ok(Self { domain: domain.to_string(), mode })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mode, self.domain)
    }
}

/// Concurrent domain → mode table with a global default mode.
///
/// Reads never block writers; a resolution sees either the old or the new
/// state of a concurrent mutation, never a torn entry.
pub struct RuleTable {
    rules: DashMap<String, Mode>,
    mode: AtomicU8,
    persist_lock: parking_lot::Mutex<()>,
}

impl RuleTable {
    pub fn new(mode: Mode) -> Self {
        Self {
            rules: DashMap::new(),
            mode: AtomicU8::new(mode as u8),
            persist_lock: parking_lot::Mutex::new(()),
        }
    }

    /// The global mode.
    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Change the global mode. Takes effect for connections resolved after
    /// the store; in-flight connections keep the mode they already resolved.
    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Resolve a hostname to a routing mode.
    ///
    /// When the global mode is anything but `Rule` it wins unconditionally.
    /// Otherwise the hostname is matched longest-suffix-first: the full name,
    /// then with the leftmost label stripped, until a rule matches or no dot
    /// remains. `Mode::Rule` comes back as the "no match" sentinel.
    pub fn resolve(&self, host: &str) -> Mode {
        let global = self.mode();
        if global != Mode::Rule {
            return global;
        }

        let mut suffix = host;
        loop {
            if let Some(mode) = self.rules.get(suffix) {
                return *mode;
            }
            match suffix.find('.') {
                Some(i) => suffix = &suffix[i + 1..],
                None => return Mode::Rule,
            }
        }
    }

    /// Parse and store a rule, overwriting any entry for the same domain.
    pub fn add(&self, text: &str) -> Result<(), RuleError> {
        let rule = Rule::parse(text)?;
        self.rules.insert(rule.domain, rule.mode);
        Ok(())
    }

    /// Remove the entry for a rule's domain (marker stripped); removing an
    /// absent rule is not an error.
    pub fn delete(&self, text: &str) {
        let mut chars = text.chars();
        if chars.next().is_some() {
            self.rules.remove(chars.as_str());
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All rules in text form, sorted by domain ascending.
    pub fn sorted(&self) -> Vec<String> {
        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .map(|e| Rule { domain: e.key().clone(), mode: *e.value() })
            .collect();
        rules.sort_by(|a, b| a.domain.cmp(&b.domain));
        rules.iter().map(Rule::to_string).collect()
    }

    /// Load rules from a text file, one per line. Malformed lines are warned
    /// and skipped, not fatal. Returns the number of rules added.
    pub fn load(&self, path: &Path) -> std::io::Result<usize> {
        let file = std::fs::File::open(path)?;
        let mut count = 0;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match self.add(&line) {
                Ok(()) => count += 1,
                Err(e) => warn!("skipping rule line: {e}"),
            }
        }
        Ok(count)
    }

    /// Write all rules back to a text file, sorted, via a temp file in the
    /// same directory and an atomic rename. A reader never observes a
    /// partial file; concurrent persists serialize on an in-process lock.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        let _guard = self.persist_lock.lock();

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(format!(".{nanos}"));

        let mut file = std::fs::File::create(&tmp)?;
        for rule in self.sorted() {
            writeln!(file, "{rule}")?;
        }
        drop(file);

        std::fs::rename(&tmp, path)
    }
}
