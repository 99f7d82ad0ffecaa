//! The 44-digit invoice access key ("chave de acesso").
//!
//! Layout, left to right:
//! `UF(2) AAMM(4) CNPJ(14) MOD(2) SERIE(3) NNF(9) TPEMIS(1) CNF(8) DV(1)`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BrisaError, BrisaResult};

/// Number of digits in an access key.
pub const ACCESS_KEY_LEN: usize = 44;

/// A validated access key: exactly 44 ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    /// Validate a key that must already be exactly 44 digits.
    pub fn new(key: impl Into<String>) -> BrisaResult<Self> {
        let key = key.into();
        if key.len() != ACCESS_KEY_LEN {
            return Err(BrisaError::InvalidAccessKey(format!(
                "expected {ACCESS_KEY_LEN} digits, got {} characters",
                key.chars().count()
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BrisaError::InvalidAccessKey(
                "access key must contain digits only".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Validate user input, ignoring the grouping separators printed on receipts
    /// (spaces, dots, dashes, slashes).
    pub fn parse(input: &str) -> BrisaResult<Self> {
        let compact: String = input
            .chars()
            .filter(|c| !matches!(c, ' ' | '.' | '-' | '/' | '\u{a0}' | '\t'))
            .collect();
        Self::new(compact)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// IBGE code of the issuing state.
    pub fn state_code(&self) -> &str {
        &self.0[0..2]
    }

    /// Year and month of emission as `YYMM`.
    pub fn year_month(&self) -> &str {
        &self.0[2..6]
    }

    pub fn issuer_cnpj(&self) -> &str {
        &self.0[6..20]
    }

    /// Document model: `55` for NF-e, `65` for NFC-e.
    pub fn model(&self) -> &str {
        &self.0[20..22]
    }

    pub fn series(&self) -> &str {
        &self.0[22..25]
    }

    pub fn number(&self) -> &str {
        &self.0[25..34]
    }

    pub fn emission_type(&self) -> &str {
        &self.0[34..35]
    }

    pub fn numeric_code(&self) -> &str {
        &self.0[35..43]
    }

    pub fn check_digit(&self) -> u32 {
        u32::from(self.0.as_bytes()[43] - b'0')
    }

    /// Modulo-11 verifier computed over the first 43 digits.
    pub fn expected_check_digit(&self) -> u32 {
        let mut weight = 2;
        let mut sum = 0u32;
        for b in self.0.as_bytes()[..ACCESS_KEY_LEN - 1].iter().rev() {
            sum += u32::from(b - b'0') * weight;
            weight = if weight == 9 { 2 } else { weight + 1 };
        }
        match sum % 11 {
            0 | 1 => 0,
            r => 11 - r,
        }
    }

    /// Whether the last digit matches the modulo-11 verifier. Advisory only.
    pub fn check_digit_matches(&self) -> bool {
        self.check_digit() == self.expected_check_digit()
    }

    /// Key printed in groups of four digits, as on DANFE receipts.
    pub fn formatted(&self) -> String {
        self.0
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccessKey {
    type Err = BrisaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AccessKey {
    type Error = BrisaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

impl AsRef<str> for AccessKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
