use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// A normalized email address. Lowercased at parse time, so two addresses
/// that differ only in case compare equal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EmailAddress(SmolStr);

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid email address")]
pub struct EmailAddressError;

impl EmailAddress {
    pub fn parse(address: impl AsRef<str>) -> Result<Self, EmailAddressError> {
        let address = address.as_ref().trim();
        let (local, domain) = address.split_once('@').ok_or(EmailAddressError)?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(EmailAddressError);
        }
        if address.chars().any(char::is_whitespace) {
            return Err(EmailAddressError);
        }
        Ok(Self(SmolStr::new(address.to_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the `@`.
    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or("")
    }

    /// The part after the `@`.
    pub fn domain(&self) -> &str {
        self.0.split('@').nth(1).unwrap_or("")
    }
}

impl FromStr for EmailAddress {
    type Err = EmailAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EmailAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = SmolStr::deserialize(deserializer)?;
        EmailAddress::parse(value).map_err(serde::de::Error::custom)
    }
}

/// The local-part grammar for mailboxes created on this server: 3 to 20
/// characters from `[A-Za-z0-9._]`, no leading or trailing dot, no doubled
/// dot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MailboxName(SmolStr);

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid mailbox name")]
pub struct MailboxNameError;

impl MailboxName {
    pub fn parse(name: impl AsRef<str>) -> Result<Self, MailboxNameError> {
        let name = name.as_ref();
        if !MAILBOX_NAME_RE.is_match(name) {
            return Err(MailboxNameError);
        }
        if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return Err(MailboxNameError);
        }
        Ok(Self(SmolStr::new(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MailboxName {
    type Err = MailboxNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MailboxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static MAILBOX_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._]{3,20}$").expect("valid mailbox name regex"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_lowercased() {
        let addr = EmailAddress::parse("Alice@Example.TEST").expect("valid address");
        assert_eq!(addr.as_str(), "alice@example.test");
    }

    #[test]
    fn case_variants_compare_equal() {
        let a = EmailAddress::parse("a@d.test").expect("valid");
        let b = EmailAddress::parse("A@D.TEST").expect("valid");
        assert_eq!(a, b);
    }

    #[test]
    fn address_parts() {
        let addr = EmailAddress::parse("alice@example.test").expect("valid");
        assert_eq!(addr.local_part(), "alice");
        assert_eq!(addr.domain(), "example.test");
    }

    #[test]
    fn malformed_addresses_rejected() {
        for bad in ["", "no-at-sign", "@d.test", "a@", "a@b@c", "a b@d.test"] {
            assert!(EmailAddress::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn mailbox_name_grammar() {
        assert!(MailboxName::parse("ab").is_err());
        assert!(MailboxName::parse("a.b").is_ok());
        assert!(MailboxName::parse(".ab").is_err());
        assert!(MailboxName::parse("ab.").is_err());
        assert!(MailboxName::parse("a..b").is_err());
        assert!(MailboxName::parse("alice_01").is_ok());
        assert!(MailboxName::parse("abcdefghijklmnopqrstu").is_err());
        assert!(MailboxName::parse("with space").is_err());
    }
}
