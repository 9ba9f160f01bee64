//! Location specs: the friendlier way of saying where to watch.
//!
//! A `LocationSpec` names a function, a whole module or an exact `Location`,
//! optionally narrowed by identifiers (`<start>`, `<return>`, `<raise>`,
//! absolute lines, `+N` offsets, source prefixes). Resolution against the host
//! turns it into the concrete locations triggers are registered at.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::error::{HostError, RegistrationError};
use crate::host::{CodeInfo, HostRuntime};

use super::{FunctionRef, Location, Target};

/// Narrows a spec to specific points of the target code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Function entry (`<start>`).
    Start,
    /// Function exit (`<return>`).
    Return,
    /// Exception raised in the function (`<raise>`).
    Raise,
    /// Absolute line number.
    Line(u32),
    /// Line relative to the function's first line (`+N`).
    Offset(u32),
    /// Every line whose stripped source starts with this text.
    Source(String),
    /// Lines matched by all of the nested line identifiers.
    AllOf(Vec<Identifier>),
}

impl Identifier {
    /// Parse the textual form used by front-ends.
    ///
    /// ```
    /// use kyrowatch::location::Identifier;
    ///
    /// assert_eq!(Identifier::parse("<start>").unwrap(), Identifier::Start);
    /// assert_eq!(Identifier::parse("+2").unwrap(), Identifier::Offset(2));
    /// assert_eq!(Identifier::parse("12").unwrap(), Identifier::Line(12));
    /// assert_eq!(
    ///     Identifier::parse("return x").unwrap(),
    ///     Identifier::Source("return x".to_string())
    /// );
    /// ```
    pub fn parse(text: &str) -> Result<Self, RegistrationError> {
        let invalid = || RegistrationError::InvalidIdentifier {
            identifier: text.to_string(),
        };
        let trimmed = text.trim();
        match trimmed {
            "" => Err(invalid()),
            "<start>" => Ok(Self::Start),
            "<return>" => Ok(Self::Return),
            "<raise>" => Ok(Self::Raise),
            _ => {
                if let Some(rest) = trimmed.strip_prefix('+') {
                    if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                        return rest.parse().map(Self::Offset).map_err(|_| invalid());
                    }
                }
                if trimmed.bytes().all(|b| b.is_ascii_digit()) {
                    return trimmed.parse().map(Self::Line).map_err(|_| invalid());
                }
                Ok(Self::Source(trimmed.to_string()))
            }
        }
    }

    pub(crate) fn line_set(&self, code: &CodeInfo) -> Result<BTreeSet<u32>, RegistrationError> {
        let candidates: BTreeSet<u32> = match self {
            Self::Line(line) => BTreeSet::from([*line]),
            Self::Offset(offset) => BTreeSet::from([code.first_line.saturating_add(*offset)]),
            Self::Source(prefix) => (code.first_line..)
                .zip(code.source.iter())
                .filter(|(_, text)| text.trim().starts_with(prefix.as_str()))
                .map(|(line, _)| line)
                .collect(),
            Self::AllOf(parts) => {
                let mut iter = parts.iter();
                let first = iter.next().ok_or_else(|| RegistrationError::InvalidIdentifier {
                    identifier: self.to_string(),
                })?;
                let mut acc = first.line_set(code)?;
                for part in iter {
                    let next = part.line_set(code)?;
                    acc.retain(|line| next.contains(line));
                }
                acc
            }
            Self::Start | Self::Return | Self::Raise => {
                return Err(RegistrationError::InvalidIdentifier {
                    identifier: self.to_string(),
                })
            }
        };
        Ok(candidates.into_iter().filter(|line| code.has_line(*line)).collect())
    }
}

impl From<u32> for Identifier {
    fn from(line: u32) -> Self {
        Self::Line(line)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("<start>"),
            Self::Return => f.write_str("<return>"),
            Self::Raise => f.write_str("<raise>"),
            Self::Line(line) => write!(f, "{line}"),
            Self::Offset(offset) => write!(f, "+{offset}"),
            Self::Source(prefix) => f.write_str(prefix),
            Self::AllOf(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// What a spec is anchored on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecTarget {
    Exact(Location),
    Function(FunctionRef),
    Module(String),
}

/// A not-yet-resolved description of where to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationSpec {
    target: SpecTarget,
    identifiers: Vec<Identifier>,
    source_hash: Option<String>,
}

impl LocationSpec {
    /// Watch `function`; with no identifiers, every executable line of it.
    #[must_use]
    pub const fn function(function: FunctionRef) -> Self {
        Self {
            target: SpecTarget::Function(function),
            identifiers: Vec::new(),
            source_hash: None,
        }
    }

    /// Watch every function of `module`.
    #[must_use]
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            target: SpecTarget::Module(module.into()),
            identifiers: Vec::new(),
            source_hash: None,
        }
    }

    /// Watch exactly one location.
    #[must_use]
    pub const fn exact(location: Location) -> Self {
        Self {
            target: SpecTarget::Exact(location),
            identifiers: Vec::new(),
            source_hash: None,
        }
    }

    /// Add an identifier.
    #[must_use]
    pub fn at(mut self, identifier: impl Into<Identifier>) -> Self {
        self.identifiers.push(identifier.into());
        self
    }

    /// Add an identifier in its textual form.
    pub fn at_str(self, text: &str) -> Result<Self, RegistrationError> {
        Ok(self.at(Identifier::parse(text)?))
    }

    /// Require the target's source to hash to `hash` (see [`source_hash`]).
    #[must_use]
    pub fn expect_source_hash(mut self, hash: impl Into<String>) -> Self {
        self.source_hash = Some(hash.into());
        self
    }

    #[must_use]
    pub const fn target(&self) -> &SpecTarget {
        &self.target
    }

    #[must_use]
    pub fn identifiers(&self) -> &[Identifier] {
        &self.identifiers
    }

    /// Resolve against the host's current program image.
    ///
    /// The result is de-duplicated and keeps the order in which identifiers
    /// and functions were given.
    pub fn resolve(&self, host: &dyn HostRuntime) -> Result<Vec<Location>, RegistrationError> {
        let codes = match &self.target {
            SpecTarget::Exact(location) => {
                if let Some(ident) = self.identifiers.first() {
                    return Err(RegistrationError::InvalidIdentifier {
                        identifier: ident.to_string(),
                    });
                }
                validate_location(host, location)?;
                if self.source_hash.is_some() {
                    let codes = match location.target() {
                        Target::Function(function) => vec![host
                            .code(function)
                            .map_err(|e| invalid(&self.to_string(), &e))?],
                        Target::Line { module, .. } => host
                            .module_code(module)
                            .map_err(|e| invalid(&self.to_string(), &e))?,
                    };
                    self.check_hash(&codes)?;
                }
                return Ok(vec![location.clone()]);
            }
            SpecTarget::Function(function) => {
                vec![host.code(function).map_err(|e| invalid(&self.to_string(), &e))?]
            }
            SpecTarget::Module(module) => host
                .module_code(module)
                .map_err(|e| invalid(&self.to_string(), &e))?,
        };
        self.check_hash(&codes)?;

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |location: Location| {
            if seen.insert(location.clone()) {
                out.push(location);
            }
        };

        if self.identifiers.is_empty() {
            for code in &codes {
                for &line in &code.lines {
                    push(Location::line(code.function.module_arc().clone(), line));
                }
            }
        }

        for ident in &self.identifiers {
            for code in &codes {
                match ident {
                    Identifier::Start => push(Location::enter(code.function.clone())),
                    Identifier::Return => push(Location::exit(code.function.clone())),
                    Identifier::Raise => push(Location::raise(code.function.clone())),
                    other => {
                        for line in other.line_set(code)? {
                            push(Location::line(code.function.module_arc().clone(), line));
                        }
                    }
                }
            }
        }

        if out.is_empty() {
            return Err(RegistrationError::InvalidLocation {
                location: self.to_string(),
                reason: "could not set any event from the target and identifiers".to_string(),
            });
        }
        Ok(out)
    }

    fn check_hash(&self, codes: &[CodeInfo]) -> Result<(), RegistrationError> {
        let Some(expected) = &self.source_hash else {
            return Ok(());
        };
        let actual = hash_codes(codes);
        if &actual == expected {
            Ok(())
        } else {
            Err(RegistrationError::SourceHashMismatch {
                expected: expected.clone(),
                actual,
            })
        }
    }
}

impl From<Location> for LocationSpec {
    fn from(location: Location) -> Self {
        Self::exact(location)
    }
}

impl From<FunctionRef> for LocationSpec {
    fn from(function: FunctionRef) -> Self {
        Self::function(function)
    }
}

impl fmt::Display for LocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            SpecTarget::Exact(location) => write!(f, "{location}")?,
            SpecTarget::Function(function) => write!(f, "{function}")?,
            SpecTarget::Module(module) => write!(f, "module {module}")?,
        }
        for ident in &self.identifiers {
            write!(f, " @{ident}")?;
        }
        Ok(())
    }
}

/// Short stable hash of a function's source (last 8 hex chars of blake3).
#[must_use]
pub fn source_hash(code: &CodeInfo) -> String {
    hash_codes(std::slice::from_ref(code))
}

fn hash_codes(codes: &[CodeInfo]) -> String {
    let mut hasher = blake3::Hasher::new();
    for code in codes {
        for line in &code.source {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
    }
    let hex = hasher.finalize().to_hex().to_string();
    hex[hex.len() - 8..].to_string()
}

fn invalid(spec: &str, err: &HostError) -> RegistrationError {
    RegistrationError::InvalidLocation {
        location: spec.to_string(),
        reason: err.to_string(),
    }
}

/// Check that `location` exists in the host's current program image.
pub(crate) fn validate_location(host: &dyn HostRuntime, location: &Location) -> Result<(), RegistrationError> {
    match location.target() {
        Target::Function(function) => host
            .code(function)
            .map(|_| ())
            .map_err(|e| invalid(&location.to_string(), &e)),
        Target::Line { module, line } => {
            let codes = host
                .module_code(module)
                .map_err(|e| invalid(&location.to_string(), &e))?;
            if codes.iter().any(|code| code.has_line(*line)) {
                Ok(())
            } else {
                Err(RegistrationError::InvalidLocation {
                    location: location.to_string(),
                    reason: format!("line {line} is not an executable line of {module}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ProgramImage, SimulatedHost};

    fn host() -> SimulatedHost {
        SimulatedHost::new(
            ProgramImage::new()
                .function(
                    "app",
                    "f",
                    10,
                    &["def f(x):", "    x += 100", "    # change x", "    return x"],
                )
                .function("app", "g", 20, &["def g():", "    y = 1", "    return y"]),
        )
    }

    fn f() -> FunctionRef {
        FunctionRef::new("app", "f")
    }

    #[test]
    fn parse_rejects_empty_identifier() {
        assert!(matches!(
            Identifier::parse("  "),
            Err(RegistrationError::InvalidIdentifier { .. })
        ));
        assert_eq!(Identifier::parse("<raise>").unwrap(), Identifier::Raise);
        assert_eq!(Identifier::parse("+x").unwrap(), Identifier::Source("+x".to_string()));
    }

    #[test]
    fn no_identifiers_watches_every_executable_line() {
        let locs = LocationSpec::function(f()).resolve(&host()).unwrap();
        assert_eq!(locs, vec![Location::line("app", 11), Location::line("app", 13)]);
    }

    #[test]
    fn source_prefix_offset_and_line_resolve_to_lines() {
        let h = host();
        let by_source = LocationSpec::function(f()).at_str("return x").unwrap().resolve(&h).unwrap();
        assert_eq!(by_source, vec![Location::line("app", 13)]);

        let by_offset = LocationSpec::function(f()).at(Identifier::Offset(1)).resolve(&h).unwrap();
        assert_eq!(by_offset, vec![Location::line("app", 11)]);

        let by_line = LocationSpec::function(f()).at(13).resolve(&h).unwrap();
        assert_eq!(by_line, vec![Location::line("app", 13)]);
    }

    #[test]
    fn comment_lines_are_not_resolvable() {
        let err = LocationSpec::function(f()).at(12).resolve(&host()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidLocation { .. }));
    }

    #[test]
    fn all_of_intersects_line_identifiers() {
        let h = host();
        let both = LocationSpec::function(f())
            .at(Identifier::AllOf(vec![Identifier::Source("return".to_string()), Identifier::Line(13)]))
            .resolve(&h)
            .unwrap();
        assert_eq!(both, vec![Location::line("app", 13)]);

        let disjoint = LocationSpec::function(f())
            .at(Identifier::AllOf(vec![Identifier::Source("return".to_string()), Identifier::Line(11)]))
            .resolve(&h);
        assert!(disjoint.is_err());

        let mixed = LocationSpec::function(f())
            .at(Identifier::AllOf(vec![Identifier::Start]))
            .resolve(&h);
        assert!(matches!(mixed, Err(RegistrationError::InvalidIdentifier { .. })));
    }

    #[test]
    fn module_spec_covers_every_function() {
        let locs = LocationSpec::module("app").at(Identifier::Start).resolve(&host()).unwrap();
        assert_eq!(
            locs,
            vec![
                Location::enter(FunctionRef::new("app", "f")),
                Location::enter(FunctionRef::new("app", "g")),
            ]
        );
    }

    #[test]
    fn duplicates_are_collapsed() {
        let locs = LocationSpec::function(f())
            .at(Identifier::Return)
            .at(Identifier::Return)
            .resolve(&host())
            .unwrap();
        assert_eq!(locs, vec![Location::exit(f())]);
    }

    #[test]
    fn source_hash_guard() {
        let h = host();
        let code = h.code(&f()).unwrap();
        let good = source_hash(&code);
        assert_eq!(good.len(), 8);

        assert!(LocationSpec::function(f())
            .at(Identifier::Start)
            .expect_source_hash(good.clone())
            .resolve(&h)
            .is_ok());

        let err = LocationSpec::function(f())
            .at(Identifier::Start)
            .expect_source_hash("deadbeef")
            .resolve(&h)
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::SourceHashMismatch {
                expected: "deadbeef".to_string(),
                actual: good,
            }
        );
    }

    #[test]
    fn exact_locations_are_validated() {
        let h = host();
        assert!(LocationSpec::exact(Location::line("app", 21)).resolve(&h).is_ok());
        assert!(LocationSpec::exact(Location::line("app", 99)).resolve(&h).is_err());
        assert!(LocationSpec::exact(Location::enter(FunctionRef::new("app", "zzz")))
            .resolve(&h)
            .is_err());
        assert!(LocationSpec::exact(Location::enter(f())).at(Identifier::Start).resolve(&h).is_err());
    }

    #[test]
    fn unknown_module_is_invalid_location() {
        let err = LocationSpec::module("missing").resolve(&host()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidLocation { .. }));
    }
}
