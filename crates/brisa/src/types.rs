//! Invoice domain model.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::access_key::AccessKey;
use crate::error::{BrisaError, BrisaResult};

/// Absolute tolerance when checking `total ≈ quantity × unit price`.
pub const ROUNDING_TOLERANCE: f64 = 0.01;

/// Digits in a CNPJ (legal entity tax id).
pub const CNPJ_LEN: usize = 14;

/// Digits in a CPF (individual tax id).
pub const CPF_LEN: usize = 11;

/// A complete electronic invoice. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    access_key: AccessKey,
    issue_date: DateTime<FixedOffset>,
    total_value: f64,
    merchant: Merchant,
    customer: Option<Customer>,
    items: Vec<InvoiceItem>,
    payment_method: String,
    taxes: Taxes,
    raw: RawInvoiceData,
}

impl Invoice {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn issue_date(&self) -> DateTime<FixedOffset> {
        self.issue_date
    }

    pub fn total_value(&self) -> f64 {
        self.total_value
    }

    pub fn merchant(&self) -> &Merchant {
        &self.merchant
    }

    pub fn customer(&self) -> Option<&Customer> {
        self.customer.as_ref()
    }

    pub fn items(&self) -> &[InvoiceItem] {
        &self.items
    }

    /// Payment method as shown by the portal; empty when the source omits it.
    pub fn payment_method(&self) -> &str {
        &self.payment_method
    }

    pub fn taxes(&self) -> &Taxes {
        &self.taxes
    }

    pub fn raw(&self) -> &RawInvoiceData {
        &self.raw
    }
}

/// The invoice issuer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub name: String,
    /// CNPJ, 14 digits.
    pub tax_id: String,
    pub address: Address,
    pub state_registration_code: String,
}

/// The invoice recipient, when identified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    /// CPF (11 digits) or, for company recipients, CNPJ (14 digits).
    pub tax_id: String,
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub number: String,
    pub district: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.street.is_empty()
            && self.number.is_empty()
            && self.district.is_empty()
            && self.city.is_empty()
            && self.state.is_empty()
            && self.postal_code.is_empty()
    }
}

/// A line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub code: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
    /// NCM classification code.
    pub tax_code: String,
}

impl InvoiceItem {
    /// Whether `total_price` matches `quantity × unit_price` within rounding.
    /// Discounts legitimately break this, so it is advisory.
    pub fn is_consistent(&self) -> bool {
        (self.quantity * self.unit_price - self.total_price).abs() <= ROUNDING_TOLERANCE
    }
}

/// Tax amounts. `total` is reported by the source and need not equal the sum
/// of the components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Taxes {
    pub icms: f64,
    pub pis: f64,
    pub cofins: f64,
    pub total: f64,
}

/// Unparsed response body kept for diagnostics and re-parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInvoiceData {
    html: String,
}

impl RawInvoiceData {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    pub fn html(&self) -> &str {
        &self.html
    }
}

/// Partially assembled invoice. Parsers fill what they find; [`InvoiceBuilder::build`]
/// enforces the invariants.
#[derive(Debug, Clone, Default)]
pub struct InvoiceBuilder {
    pub access_key: Option<String>,
    pub issue_date: Option<DateTime<FixedOffset>>,
    pub total_value: Option<f64>,
    pub merchant: Option<Merchant>,
    pub customer: Option<Customer>,
    pub items: Vec<InvoiceItem>,
    pub payment_method: Option<String>,
    /// ICMS, PIS, COFINS, reported total.
    pub taxes: (Option<f64>, Option<f64>, Option<f64>, Option<f64>),
    pub raw: String,
}

impl InvoiceBuilder {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Default::default()
        }
    }

    pub fn build(self) -> BrisaResult<Invoice> {
        let key = self
            .access_key
            .ok_or_else(|| BrisaError::malformed("access key not found"))?;
        let access_key = AccessKey::parse(&key)
            .map_err(|e| BrisaError::malformed(format!("access key in response is unusable ({e})")))?;

        let merchant = self
            .merchant
            .ok_or_else(|| BrisaError::malformed("merchant block not found"))?;
        if merchant.name.is_empty() {
            return Err(BrisaError::malformed("merchant name not found"));
        }
        if merchant.tax_id.len() != CNPJ_LEN {
            return Err(BrisaError::malformed(format!(
                "merchant CNPJ must have {CNPJ_LEN} digits, found '{}'",
                merchant.tax_id
            )));
        }

        if let Some(customer) = &self.customer {
            if customer.tax_id.len() != CPF_LEN && customer.tax_id.len() != CNPJ_LEN {
                return Err(BrisaError::malformed(format!(
                    "customer tax id must have {CPF_LEN} or {CNPJ_LEN} digits, found '{}'",
                    customer.tax_id
                )));
            }
        }

        if self.items.is_empty() {
            return Err(BrisaError::malformed("no invoice items found"));
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.quantity < 0.0 || item.unit_price < 0.0 || item.total_price < 0.0 {
                return Err(BrisaError::malformed(format!(
                    "item {} has a negative amount",
                    i + 1
                )));
            }
            if !item.is_consistent() {
                tracing::warn!(
                    item = i + 1,
                    code = %item.code,
                    quantity = item.quantity,
                    unit_price = item.unit_price,
                    total_price = item.total_price,
                    "item total differs from quantity × unit price"
                );
            }
        }

        let issue_date = self
            .issue_date
            .ok_or_else(|| BrisaError::malformed("issue date not found"))?;

        let total_value = match self.total_value {
            Some(v) => v,
            None => {
                tracing::debug!("invoice total not reported, summing items");
                self.items.iter().map(|i| i.total_price).sum()
            }
        };

        let (icms, pis, cofins, reported) = self.taxes;
        let icms = icms.unwrap_or(0.0);
        let pis = pis.unwrap_or(0.0);
        let cofins = cofins.unwrap_or(0.0);
        let taxes = Taxes {
            icms,
            pis,
            cofins,
            total: reported.unwrap_or(icms + pis + cofins),
        };
        if total_value < 0.0 || taxes.total < 0.0 {
            return Err(BrisaError::malformed("negative invoice or tax total"));
        }

        Ok(Invoice {
            access_key,
            issue_date,
            total_value,
            merchant,
            customer: self.customer,
            items: self.items,
            payment_method: self.payment_method.unwrap_or_default(),
            taxes,
            raw: RawInvoiceData::new(self.raw),
        })
    }
}
