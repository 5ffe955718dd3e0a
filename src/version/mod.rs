// src/version/mod.rs

//! Version handling and constraint satisfaction for package dependencies
//!
//! Versions are semantic versions (`major.minor.patch[-prerelease]`). Parsing
//! is lenient the way package tags are written in practice: a leading `v` is
//! accepted and missing minor/patch components default to zero.
//!
//! Constraints are an OR-set of AND-sets of comparators:
//!
//! ```text
//! >=1.2.3, <2.0.0 || ^3.1
//! \_____________/    \__/
//!   AND-clause      AND-clause
//! ```

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A semantic version with a total order
///
/// Build metadata is kept for display but ignored for ordering and equality,
/// so `1.0.0+a` and `1.0.0+b` are the same version.
#[derive(Debug, Clone)]
pub struct Version(semver::Version);

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Sentinel used as the lower bound of a clause that has none
    pub fn unbounded_low() -> Self {
        let mut v = semver::Version::new(0, 0, 0);
        v.pre = semver::Prerelease::new("a").unwrap_or(semver::Prerelease::EMPTY);
        Self(v)
    }

    /// Parse a version string
    ///
    /// Examples:
    /// - "1.2.3" → 1.2.3
    /// - "v1.2" → 1.2.0
    /// - "2.0.0-rc.1" → 2.0.0-rc.1
    pub fn parse(s: &str) -> Result<Self> {
        let (version, precision) = parse_partial(s)?;
        if precision == 0 {
            return Err(Error::ParseError(format!(
                "Wildcard is not a version: '{}'",
                s
            )));
        }
        Ok(version)
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// The first version that would be a breaking change from this one
    ///
    /// - 1.4.2 → 2.0.0
    /// - 0.4.2 → 0.5.0
    /// - 0.0.2 → 0.0.3
    pub fn next_breaking(&self) -> Version {
        if self.0.major > 0 {
            Version::new(self.0.major + 1, 0, 0)
        } else if self.0.minor > 0 {
            Version::new(0, self.0.minor + 1, 0)
        } else {
            Version::new(0, 0, self.0.patch + 1)
        }
    }

    fn precedence_key(&self) -> (u64, u64, u64) {
        (self.0.major, self.0.minor, self.0.patch)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence_key()
            .cmp(&other.precedence_key())
            .then_with(|| self.0.pre.cmp(&other.0.pre))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

/// Parse a possibly partial version, returning how many numeric components
/// were given (0 for a bare wildcard)
fn parse_partial(input: &str) -> Result<(Version, u8)> {
    let s = input.trim();
    let s = s
        .strip_prefix('v')
        .or_else(|| s.strip_prefix('V'))
        .unwrap_or(s);

    if s.is_empty() {
        return Err(Error::ParseError("Empty version".to_string()));
    }

    let (s, build) = match s.split_once('+') {
        Some((v, b)) => (v, Some(b)),
        None => (s, None),
    };
    let (core, pre) = match s.split_once('-') {
        Some((v, p)) => (v, Some(p)),
        None => (s, None),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 {
        return Err(Error::ParseError(format!(
            "Too many version components in '{}'",
            input
        )));
    }

    let mut numbers = [0u64; 3];
    let mut precision = 0u8;
    for (i, part) in parts.iter().enumerate() {
        if is_wildcard(part) {
            break;
        }
        numbers[i] = part.parse::<u64>().map_err(|e| {
            Error::ParseError(format!("Invalid version component '{}' in '{}': {}", part, input, e))
        })?;
        precision += 1;
    }

    // Anything after a wildcard must also be a wildcard
    if parts.iter().skip(precision as usize).any(|p| !is_wildcard(p)) {
        return Err(Error::ParseError(format!(
            "Version component follows a wildcard in '{}'",
            input
        )));
    }

    let mut version = semver::Version::new(numbers[0], numbers[1], numbers[2]);
    if let Some(pre) = pre {
        version.pre = semver::Prerelease::new(pre).map_err(|e| {
            Error::ParseError(format!("Invalid prerelease in '{}': {}", input, e))
        })?;
    }
    if let Some(build) = build {
        version.build = semver::BuildMetadata::new(build).map_err(|e| {
            Error::ParseError(format!("Invalid build metadata in '{}': {}", input, e))
        })?;
    }

    Ok((Version(version), precision))
}

fn is_wildcard(part: &str) -> bool {
    matches!(part, "x" | "X" | "*")
}

/// Comparison operators accepted in constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `=` or a bare version
    Equal,
    /// `!=`
    NotEqual,
    /// `>`
    Greater,
    /// `>=` or `=>`
    GreaterOrEqual,
    /// `<`
    Less,
    /// `<=` or `=<`
    LessOrEqual,
    /// `~` or `~>`: patch-level changes
    Tilde,
    /// `^`: changes that do not modify the left-most non-zero component
    Caret,
}

impl Operator {
    /// Operator spellings, longest first so prefixes match correctly
    const SPELLINGS: &'static [(&'static str, Operator)] = &[
        ("~>", Operator::Tilde),
        (">=", Operator::GreaterOrEqual),
        ("=>", Operator::GreaterOrEqual),
        ("<=", Operator::LessOrEqual),
        ("=<", Operator::LessOrEqual),
        ("!=", Operator::NotEqual),
        (">", Operator::Greater),
        ("<", Operator::Less),
        ("=", Operator::Equal),
        ("~", Operator::Tilde),
        ("^", Operator::Caret),
    ];

    fn split_prefix(s: &str) -> (Option<Operator>, &str) {
        for (spelling, op) in Self::SPELLINGS {
            if let Some(rest) = s.strip_prefix(*spelling) {
                return (Some(*op), rest);
            }
        }
        (None, s)
    }

    /// Whether this operator establishes a lower bound for its version
    pub fn is_lower_bound(&self) -> bool {
        matches!(
            self,
            Operator::Equal
                | Operator::Greater
                | Operator::GreaterOrEqual
                | Operator::Tilde
                | Operator::Caret
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Tilde => "~",
            Operator::Caret => "^",
        }
    }
}

/// A single operator/version pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    pub op: Operator,
    pub version: Version,
    /// Number of numeric components written (0 for `*`)
    precision: u8,
}

impl Comparator {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (op, rest) = Operator::split_prefix(s);
        let (version, precision) = parse_partial(rest)?;
        Ok(Self {
            op: op.unwrap_or(Operator::Equal),
            version,
            precision,
        })
    }

    /// Exclusive upper bound of the wildcard range this comparator names
    ///
    /// `1.2` covers `[1.2.0, 1.3.0)`, `1` covers `[1.0.0, 2.0.0)`.
    fn wildcard_upper(&self) -> Version {
        let v = &self.version;
        match self.precision {
            1 => Version::new(v.major() + 1, 0, 0),
            2 => Version::new(v.major(), v.minor() + 1, 0),
            _ => Version::new(v.major(), v.minor(), v.patch() + 1),
        }
    }

    fn tilde_upper(&self) -> Version {
        let v = &self.version;
        if self.precision >= 2 {
            Version::new(v.major(), v.minor() + 1, 0)
        } else {
            Version::new(v.major() + 1, 0, 0)
        }
    }

    fn caret_upper(&self) -> Version {
        let v = &self.version;
        if v.major() > 0 || self.precision == 1 {
            Version::new(v.major() + 1, 0, 0)
        } else if v.minor() > 0 || self.precision == 2 {
            Version::new(0, v.minor() + 1, 0)
        } else {
            Version::new(0, 0, v.patch() + 1)
        }
    }

    /// True for `=` against a fully written version
    pub fn is_exact(&self) -> bool {
        self.op == Operator::Equal && self.precision == 3
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        if self.precision == 0 {
            // `*` in any position other than `!=` matches everything
            return self.op != Operator::NotEqual;
        }

        let v = &self.version;
        let exact = self.precision == 3;
        let in_range = |upper: Version| candidate >= v && *candidate < upper;

        match self.op {
            Operator::Equal if exact => candidate == v,
            Operator::Equal => in_range(self.wildcard_upper()),
            Operator::NotEqual if exact => candidate != v,
            Operator::NotEqual => !in_range(self.wildcard_upper()),
            Operator::Greater if exact => candidate > v,
            Operator::Greater => *candidate >= self.wildcard_upper(),
            Operator::GreaterOrEqual => candidate >= v,
            Operator::Less => candidate < v,
            Operator::LessOrEqual if exact => candidate <= v,
            Operator::LessOrEqual => *candidate < self.wildcard_upper(),
            Operator::Tilde => in_range(self.tilde_upper()),
            Operator::Caret => in_range(self.caret_upper()),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.precision == 0 {
            return write!(f, "*");
        }
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// A parsed version constraint: an OR of AND-clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    raw: String,
    clauses: Vec<Vec<Comparator>>,
}

impl Constraint {
    /// Parse a constraint expression
    ///
    /// Examples:
    /// - ">=1.2.3, <2.0.0" → one clause, two comparators
    /// - "^1.2 || ~2.0" → two clauses
    /// - ">= 1.0 < 2.0" → whitespace-separated comparators are ANDed
    /// - "" or "*" → matches everything
    pub fn parse(expr: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        let blank = expr.trim().is_empty();

        for clause in expr.split("||") {
            if !blank && clause.trim().is_empty() {
                return Err(Error::ParseError(format!(
                    "Empty clause in constraint '{}'",
                    expr
                )));
            }
            let mut comparators = Vec::new();
            for piece in clause.split(',') {
                for token in join_operator_tokens(piece) {
                    let comparator = Comparator::parse(&token).map_err(|e| {
                        Error::ParseError(format!("Invalid constraint '{}': {}", expr, e))
                    })?;
                    comparators.push(comparator);
                }
            }
            clauses.push(comparators);
        }

        Ok(Self {
            raw: expr.trim().to_string(),
            clauses,
        })
    }

    pub fn clauses(&self) -> &[Vec<Comparator>] {
        &self.clauses
    }

    /// The single version this constraint pins, if it pins one
    pub fn exact_version(&self) -> Option<&Version> {
        match self.clauses.as_slice() {
            [clause] => match clause.as_slice() {
                [comparator] if comparator.is_exact() => Some(&comparator.version),
                _ => None,
            },
            _ => None,
        }
    }

    /// Check if a version satisfies any clause of this constraint
    pub fn satisfies(&self, version: &Version) -> bool {
        self.clauses.iter().any(|clause| {
            // Prereleases only match clauses that explicitly mention one
            if version.is_prerelease() && !clause.iter().any(|c| c.version.is_prerelease()) {
                return false;
            }
            clause.iter().all(|c| c.matches(version))
        })
    }

    /// The greatest lower bound of each OR-clause, in clause order
    ///
    /// Comparators with `<`, `<=` or `!=` contribute no bound. A clause with
    /// no bounding comparator yields [`Version::unbounded_low`].
    pub fn greatest_lower_bounds(&self) -> Vec<Version> {
        self.clauses
            .iter()
            .map(|clause| {
                clause
                    .iter()
                    .filter(|c| c.op.is_lower_bound())
                    .map(|c| c.version.clone())
                    .max()
                    .unwrap_or_else(Version::unbounded_low)
            })
            .collect()
    }

    /// Check a version against this constraint without silently crossing a
    /// breaking boundary
    ///
    /// Versions below `breaking` pass unconditionally. At or past it, the
    /// version passes only if some clause's lower bound is itself at or past
    /// `breaking` and the constraint is satisfied, i.e. the constraint asks for
    /// the breaking release rather than merely tolerating it.
    pub fn check_with_breaking_version(&self, version: &Version, breaking: &Version) -> bool {
        if version < breaking {
            return true;
        }

        let forces_breaking = self
            .greatest_lower_bounds()
            .iter()
            .any(|bound| bound >= breaking);

        forces_breaking && self.satisfies(version)
    }
}

/// Split a clause on whitespace, gluing a bare operator to the version after it
fn join_operator_tokens(piece: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;

    for token in piece.split_whitespace() {
        if let Some(op) = pending_op.take() {
            tokens.push(format!("{}{}", op, token));
            continue;
        }
        let (op, rest) = Operator::split_prefix(token);
        if op.is_some() && rest.is_empty() {
            pending_op = Some(token);
        } else {
            tokens.push(token.to_string());
        }
    }

    if let Some(op) = pending_op {
        // Dangling operator; let the comparator parser report it
        tokens.push(op.to_string());
    }

    tokens
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.raw)
        }
    }
}

impl FromStr for Constraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Constraint::parse(s)
    }
}

/// Parse `expr` and check it against `breaking` in one call
pub fn check_with_breaking_version(expr: &str, version: &str, breaking: &str) -> Result<bool> {
    let constraint = Constraint::parse(expr)?;
    let version = Version::parse(version)?;
    let breaking = Version::parse(breaking)?;
    Ok(constraint.check_with_breaking_version(&version, &breaking))
}
