//! Hierarchical deterministic account derivation paths.
//!
//! BIP-32 defines derivation paths of the form
//! `m / purpose' / coin_type' / account' / change / address_index`, BIP-44
//! fixes the purpose at 44' for crypto currencies, and SLIP-44 assigns coin
//! type 60' to the chain served here. Accounts increment the last path
//! component; the Ledger Live derivation scheme instead increments the
//! hardened account component (see [`ledger_live_iterator`]).

use std::fmt;
use std::num::IntErrorKind;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AccountError;

/// Offset added to a component to mark it as hardened.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Computer friendly form of a hierarchical deterministic account derivation
/// path: one `u32` per level, hardened components carrying [`HARDENED_OFFSET`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    /// Root path to which custom derivation endpoints are appended: the
    /// first account sits at m/44'/60'/0'/0, the second at m/44'/60'/0'/1.
    pub fn default_root() -> Self {
        Self(vec![HARDENED_OFFSET + 44, HARDENED_OFFSET + 60, HARDENED_OFFSET, 0])
    }

    /// Base path from which custom derivation endpoints are incremented: the
    /// first account sits at m/44'/60'/0'/0/0, the second at m/44'/60'/0'/0/1.
    pub fn default_base() -> Self {
        Self(vec![HARDENED_OFFSET + 44, HARDENED_OFFSET + 60, HARDENED_OFFSET, 0, 0])
    }

    /// Legacy base path used by older Ledger firmware, identical to the root
    /// path: endpoints increment the change-level component directly.
    pub fn legacy_ledger_base() -> Self {
        Self::default_root()
    }

    /// The raw path components in derivation order.
    pub fn components(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u32>> for DerivationPath {
    fn from(components: Vec<u32>) -> Self {
        Self(components)
    }
}

impl AsRef<[u32]> for DerivationPath {
    fn as_ref(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for DerivationPath {
    type Err = AccountError;

    /// Converts a user specified derivation path string to the internal
    /// binary representation.
    ///
    /// Full derivation paths start with the `m/` prefix; relative paths get
    /// appended to the default root path and must not have a prefix in front
    /// of the first element. Whitespace is ignored.
    fn from_str(path: &str) -> Result<Self, AccountError> {
        if path.trim().is_empty() {
            return Err(AccountError::EmptyPath);
        }
        let split: Vec<&str> = path.split('/').collect();
        let mut components: &[&str] = &split;

        let mut result = Vec::new();
        match components.first().map(|first| first.trim()) {
            Some("") => return Err(AccountError::AmbiguousPath),
            Some("m") => components = &components[1..],
            _ => result.extend_from_slice(Self::default_root().components()),
        }
        // All remaining components are relative, append them one by one.
        if components.is_empty() {
            return Err(AccountError::EmptyPath);
        }
        for component in components {
            result.push(parse_component(component)?);
        }
        Ok(Self(result))
    }
}

/// Parse a single textual path component into its `u32` form.
fn parse_component(component: &str) -> Result<u32, AccountError> {
    let mut component = component.trim();

    // Handle hardened components.
    let mut offset: u32 = 0;
    if let Some(stripped) = component.strip_suffix('\'') {
        offset = HARDENED_OFFSET;
        component = stripped.trim();
    }
    let (negative, numeral) = match component.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, component),
    };
    // Numeric literals follow the usual prefix conventions: 0x hex, 0o or a
    // plain leading zero octal, 0b binary, decimal otherwise.
    let (radix, digits) = if let Some(d) = numeral.strip_prefix("0x").or_else(|| numeral.strip_prefix("0X")) {
        (16, d)
    } else if let Some(d) = numeral.strip_prefix("0o").or_else(|| numeral.strip_prefix("0O")) {
        (8, d)
    } else if let Some(d) = numeral.strip_prefix("0b").or_else(|| numeral.strip_prefix("0B")) {
        (2, d)
    } else if numeral.len() > 1 && numeral.starts_with('0') {
        (8, &numeral[1..])
    } else {
        (10, numeral)
    };
    let max = u32::MAX - offset;
    let value = match u64::from_str_radix(digits, radix) {
        Ok(value) => value,
        Err(err) if *err.kind() == IntErrorKind::PosOverflow => {
            return Err(out_of_range(component, offset, max));
        }
        Err(_) => return Err(AccountError::InvalidComponent(component.to_string())),
    };
    if negative || value > u64::from(max) {
        let rendered = if negative { format!("-{value}") } else { value.to_string() };
        return Err(out_of_range(&rendered, offset, max));
    }
    Ok(offset + value as u32)
}

fn out_of_range(value: &str, offset: u32, max: u32) -> AccountError {
    let value = value.to_string();
    if offset == 0 {
        AccountError::ComponentOutOfRange { value, max }
    } else {
        AccountError::HardenedComponentOutOfRange { value, max }
    }
}

impl fmt::Display for DerivationPath {
    /// Canonical representation: always absolute, hardened components carry
    /// a trailing mark. Round-trips with [`FromStr`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for &component in &self.0 {
            if component >= HARDENED_OFFSET {
                write!(f, "/{}'", component - HARDENED_OFFSET)?;
            } else {
                write!(f, "/{}", component)?;
            }
        }
        Ok(())
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Infinite path sequence advancing one fixed component per step.
///
/// Yields its base first, then successive increments, so the first account
/// equals the base itself. Each iterator owns its cursor: instances never
/// affect one another.
#[derive(Debug, Clone)]
pub struct DerivationPathIterator {
    path: DerivationPath,
    component: usize,
}

impl Iterator for DerivationPathIterator {
    type Item = DerivationPath;

    fn next(&mut self) -> Option<DerivationPath> {
        let current = self.path.clone();
        let component = &mut self.path.0[self.component];
        *component = component.wrapping_add(1);
        Some(current)
    }
}

/// BIP-32 account iterator, progressing by increasing the last component:
/// m/44'/60'/0'/0/0, m/44'/60'/0'/0/1, m/44'/60'/0'/0/2, ...
///
/// The base must be non-empty.
pub fn default_iterator(base: DerivationPath) -> DerivationPathIterator {
    let component = base.0.len().saturating_sub(1);
    DerivationPathIterator { path: base, component }
}

/// BIP-44 account iterator for Ledger Live, which assigns one account per
/// hardened account-level component rather than per address index:
/// m/44'/60'/0'/0/0, m/44'/60'/1'/0/0, m/44'/60'/2'/0/0, ...
///
/// The base must have at least three components.
pub fn ledger_live_iterator(base: DerivationPath) -> DerivationPathIterator {
    DerivationPathIterator { path: base, component: 2 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<DerivationPath, AccountError> {
        text.parse()
    }

    #[test]
    fn test_parse_absolute() {
        let path = parse("m/44'/60'/0'/0").unwrap();
        assert_eq!(
            path.components(),
            &[HARDENED_OFFSET + 44, HARDENED_OFFSET + 60, HARDENED_OFFSET, 0]
        );
    }

    #[test]
    fn test_parse_relative_appends_root() {
        let path = parse("44/60").unwrap();
        let mut expected = DerivationPath::default_root().components().to_vec();
        expected.extend_from_slice(&[44, 60]);
        assert_eq!(path.components(), &expected[..]);
    }

    #[test]
    fn test_parse_whitespace_ignored() {
        let path = parse(" m  /   44'\t/\n60'\r/0'/0").unwrap();
        assert_eq!(path, parse("m/44'/60'/0'/0").unwrap());
    }

    #[test]
    fn test_parse_empty() {
        assert!(matches!(parse(""), Err(AccountError::EmptyPath)));
        assert!(matches!(parse("   "), Err(AccountError::EmptyPath)));
        assert!(matches!(parse("m"), Err(AccountError::EmptyPath)));
    }

    #[test]
    fn test_parse_leading_slash_ambiguous() {
        assert!(matches!(parse("/44"), Err(AccountError::AmbiguousPath)));
        assert!(matches!(parse("/"), Err(AccountError::AmbiguousPath)));
    }

    #[test]
    fn test_parse_invalid_component() {
        assert!(matches!(parse("m/fourty-four"), Err(AccountError::InvalidComponent(_))));
        assert!(matches!(parse("m/"), Err(AccountError::InvalidComponent(_))));
    }

    #[test]
    fn test_parse_numeric_literals() {
        // 0x2c == 44, 0o74 == 60, 074 == 60, 0b101100 == 44.
        let hex = parse("m/0x2c'/0x3c'/0x0'/0x0").unwrap();
        assert_eq!(hex, parse("m/44'/60'/0'/0").unwrap());
        let octal = parse("m/054'/0o74'/0'/0").unwrap();
        assert_eq!(octal, parse("m/44'/60'/0'/0").unwrap());
        let binary = parse("m/0b101100'/60'/0'/0").unwrap();
        assert_eq!(binary, parse("m/44'/60'/0'/0").unwrap());
    }

    #[test]
    fn test_parse_component_bounds() {
        // Non-hardened components span the full u32 range.
        let path = parse("m/4294967295").unwrap();
        assert_eq!(path.components(), &[u32::MAX]);
        assert!(matches!(
            parse("m/4294967296"),
            Err(AccountError::ComponentOutOfRange { max: u32::MAX, .. })
        ));

        // Hardened components stop at 2^31 - 1 before the offset.
        let path = parse("m/2147483647'").unwrap();
        assert_eq!(path.components(), &[u32::MAX]);
        assert!(matches!(
            parse("m/2147483648'"),
            Err(AccountError::HardenedComponentOutOfRange { max: 0x7fff_ffff, .. })
        ));
    }

    #[test]
    fn test_parse_negative_component() {
        let err = parse("m/-5").unwrap_err();
        assert_eq!(err.to_string(), "component -5 out of allowed range [0, 4294967295]");
    }

    #[test]
    fn test_parse_huge_numeral() {
        // Larger than any machine integer still reports the range, not a
        // syntax error.
        assert!(matches!(
            parse("m/340282366920938463463374607431768211456"),
            Err(AccountError::ComponentOutOfRange { .. })
        ));
    }

    #[test]
    fn test_display_round_trip() {
        for text in [
            "m/44'/60'/0'/0",
            "m/44'/60'/0'/0/0",
            "m/0/1/2",
            "m/2147483647'/4294967295",
        ] {
            let path = parse(text).unwrap();
            assert_eq!(path.to_string(), text);
            assert_eq!(parse(&path.to_string()).unwrap(), path);
        }
    }

    #[test]
    fn test_display_normalizes() {
        assert_eq!(parse("m/0x2c'/60'/0'/0").unwrap().to_string(), "m/44'/60'/0'/0");
        assert_eq!(parse("44").unwrap().to_string(), "m/44'/60'/0'/0/44");
    }

    #[test]
    fn test_serde_round_trip() {
        let path = parse("m/44'/60'/0'/0/7").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"m/44'/60'/0'/0/7\"");
        let back: DerivationPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn test_serde_rejects_malformed() {
        assert!(serde_json::from_str::<DerivationPath>("\"/44\"").is_err());
        assert!(serde_json::from_str::<DerivationPath>("\"\"").is_err());
    }

    #[test]
    fn test_default_iterator_starts_at_base() {
        let base = DerivationPath::default_base();
        let mut iter = default_iterator(base.clone());
        assert_eq!(iter.next().unwrap(), base);
        assert_eq!(iter.next().unwrap().to_string(), "m/44'/60'/0'/0/1");
        assert_eq!(iter.next().unwrap().to_string(), "m/44'/60'/0'/0/2");
    }

    #[test]
    fn test_default_iterator_nth() {
        let base = DerivationPath::default_base();
        let path = default_iterator(base).nth(9).unwrap();
        assert_eq!(path.to_string(), "m/44'/60'/0'/0/9");
    }

    #[test]
    fn test_ledger_live_iterator_varies_third_component() {
        let base = DerivationPath::default_base();
        let mut iter = ledger_live_iterator(base.clone());
        assert_eq!(iter.next().unwrap(), base);
        assert_eq!(iter.next().unwrap().to_string(), "m/44'/60'/1'/0/0");
        assert_eq!(iter.next().unwrap().to_string(), "m/44'/60'/2'/0/0");
    }

    #[test]
    fn test_iterators_are_independent() {
        let base = DerivationPath::default_base();
        let mut first = default_iterator(base.clone());
        let mut second = default_iterator(base.clone());
        first.next();
        first.next();
        // Advancing one iterator leaves the other at the base.
        assert_eq!(second.next().unwrap(), base);
    }

    #[test]
    fn test_well_known_paths() {
        assert_eq!(DerivationPath::default_root().to_string(), "m/44'/60'/0'/0");
        assert_eq!(DerivationPath::default_base().to_string(), "m/44'/60'/0'/0/0");
        assert_eq!(DerivationPath::legacy_ledger_base(), DerivationPath::default_root());
    }
}
