//! NF-e XML documents (`nfeProc` or bare `NFe`).

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::text::{digits, parse_date_iso, parse_decimal, payment_method_label};
use crate::error::{BrisaError, BrisaResult};
use crate::types::{Address, Customer, Invoice, InvoiceBuilder, InvoiceItem, Merchant};

#[derive(Default)]
struct ItemDraft {
    code: String,
    description: String,
    quantity: Option<f64>,
    unit_price: Option<f64>,
    total_price: Option<f64>,
    tax_code: String,
}

impl ItemDraft {
    fn finish(self, position: usize) -> BrisaResult<InvoiceItem> {
        let missing = |what: &str| BrisaError::malformed(format!("item {position} has no {what}"));
        Ok(InvoiceItem {
            code: self.code,
            description: self.description,
            quantity: self.quantity.ok_or_else(|| missing("quantity"))?,
            unit_price: self.unit_price.ok_or_else(|| missing("unit price"))?,
            total_price: self.total_price.ok_or_else(|| missing("total value"))?,
            tax_code: self.tax_code,
        })
    }
}

#[derive(Default)]
struct Draft {
    id_key: Option<String>,
    protocol_key: Option<String>,
    issue_date: Option<String>,
    merchant: Option<Merchant>,
    customer: Option<Customer>,
    customer_address: Address,
    item: Option<ItemDraft>,
    items: Vec<InvoiceItem>,
    icms: Option<f64>,
    pis: Option<f64>,
    cofins: Option<f64>,
    tax_total: Option<f64>,
    total: Option<f64>,
    payment: Option<String>,
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len() && path[path.len() - suffix.len()..].iter().zip(suffix).all(|(a, b)| a == b)
}

impl Draft {
    fn start(&mut self, e: &BytesStart<'_>, name: &str) -> BrisaResult<()> {
        match name {
            "infNFe" => {
                let id = e
                    .try_get_attribute("Id")
                    .map_err(|err| BrisaError::malformed(format!("bad infNFe attribute: {err}")))?;
                if let Some(attr) = id {
                    let value = attr
                        .unescape_value()
                        .map_err(|err| BrisaError::malformed(format!("bad infNFe Id: {err}")))?;
                    self.id_key = Some(value.trim_start_matches("NFe").to_string());
                }
            }
            "emit" => self.merchant = Some(Merchant::default()),
            "dest" => {
                self.customer = Some(Customer::default());
                self.customer_address = Address::default();
            }
            "det" => self.item = Some(ItemDraft::default()),
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &str) -> BrisaResult<()> {
        match name {
            "det" => {
                if let Some(item) = self.item.take() {
                    let position = self.items.len() + 1;
                    self.items.push(item.finish(position)?);
                }
            }
            "dest" => {
                if let Some(customer) = &mut self.customer {
                    let address = std::mem::take(&mut self.customer_address);
                    customer.address = (!address.is_empty()).then_some(address);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, path: &[String], text: String) {
        let Some(leaf) = path.last().map(String::as_str) else {
            return;
        };

        if ends_with(path, &["ide", leaf]) {
            if matches!(leaf, "dhEmi" | "dEmi") && self.issue_date.is_none() {
                self.issue_date = Some(text);
            }
        } else if ends_with(path, &["infProt", "chNFe"]) {
            self.protocol_key = Some(text);
        } else if ends_with(path, &["emit", leaf]) {
            if let Some(m) = &mut self.merchant {
                match leaf {
                    "xNome" => m.name = text,
                    "CNPJ" => m.tax_id = digits(&text),
                    "IE" => m.state_registration_code = text,
                    _ => {}
                }
            }
        } else if ends_with(path, &["enderEmit", leaf]) {
            if let Some(m) = &mut self.merchant {
                set_address(&mut m.address, leaf, text);
            }
        } else if ends_with(path, &["dest", leaf]) {
            if let Some(c) = &mut self.customer {
                match leaf {
                    "xNome" => c.name = text,
                    "CPF" | "CNPJ" => c.tax_id = digits(&text),
                    _ => {}
                }
            }
        } else if ends_with(path, &["enderDest", leaf]) {
            set_address(&mut self.customer_address, leaf, text);
        } else if ends_with(path, &["det", "prod", leaf]) {
            if let Some(item) = &mut self.item {
                match leaf {
                    "cProd" => item.code = text,
                    "xProd" => item.description = text,
                    "qCom" => item.quantity = parse_decimal(&text),
                    "vUnCom" => item.unit_price = parse_decimal(&text),
                    "vProd" => item.total_price = parse_decimal(&text),
                    "NCM" => item.tax_code = text,
                    _ => {}
                }
            }
        } else if ends_with(path, &["ICMSTot", leaf]) {
            match leaf {
                "vICMS" => self.icms = parse_decimal(&text),
                "vPIS" => self.pis = parse_decimal(&text),
                "vCOFINS" => self.cofins = parse_decimal(&text),
                "vTotTrib" => self.tax_total = parse_decimal(&text),
                "vNF" => self.total = parse_decimal(&text),
                _ => {}
            }
        } else if ends_with(path, &["detPag", "tPag"]) && self.payment.is_none() {
            self.payment = Some(payment_method_label(&text));
        }
    }

    fn into_builder(self, raw: &str) -> BrisaResult<InvoiceBuilder> {
        let issue_date = match self.issue_date {
            Some(s) => Some(
                parse_date_iso(&s).ok_or_else(|| BrisaError::malformed(format!("unparseable issue date '{s}'")))?,
            ),
            None => None,
        };

        let customer = self.customer.filter(|c| {
            let anonymous = c.tax_id.is_empty();
            if anonymous {
                tracing::debug!("dest block without CPF or CNPJ, treating as anonymous");
            }
            !anonymous
        });

        let mut builder = InvoiceBuilder::new(raw);
        builder.access_key = self.id_key.filter(|k| !k.is_empty()).or(self.protocol_key);
        builder.issue_date = issue_date;
        builder.total_value = self.total;
        builder.merchant = self.merchant;
        builder.customer = customer;
        builder.items = self.items;
        builder.payment_method = self.payment;
        builder.taxes = (self.icms, self.pis, self.cofins, self.tax_total);
        Ok(builder)
    }
}

fn set_address(address: &mut Address, leaf: &str, text: String) {
    match leaf {
        "xLgr" => address.street = text,
        "nro" => address.number = text,
        "xBairro" => address.district = text,
        "xMun" => address.city = text,
        "UF" => address.state = text,
        "CEP" => address.postal_code = digits(&text),
        _ => {}
    }
}

pub fn parse_xml(raw: &str) -> BrisaResult<Invoice> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut draft = Draft::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                draft.start(&e, &name)?;
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                draft.start(&e, &name)?;
                draft.end(&name)?;
            }
            Ok(Event::End(_)) => {
                if let Some(name) = path.pop() {
                    draft.end(&name)?;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| BrisaError::malformed(format!("bad XML text: {e}")))?;
                draft.text(&path, text.trim().to_string());
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).trim().to_string();
                draft.text(&path, text);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(BrisaError::malformed(format!(
                    "invalid XML at position {}: {e}",
                    reader.error_position()
                )));
            }
            _ => {}
        }
    }

    draft.into_builder(raw)?.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const KEY: &str = "35240512345678000190550010000000011234567890";

    fn nfe(dest: &str, det: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<NFe xmlns="http://www.portalfiscal.inf.br/nfe">
  <infNFe versao="4.00" Id="NFe{KEY}">
    <ide><dhEmi>2024-05-15T14:30:05-03:00</dhEmi></ide>
    <emit><CNPJ>12345678000190</CNPJ><xNome>MERCADO &amp; CIA</xNome>
      <enderEmit><xLgr>RUA A</xLgr><nro>10</nro><xMun>SAO PAULO</xMun><UF>SP</UF></enderEmit>
      <IE>123456789</IE></emit>
    {dest}
    {det}
    <total><ICMSTot><vICMS>1.80</vICMS><vPIS>0.33</vPIS><vCOFINS>1.52</vCOFINS><vNF>10.00</vNF></ICMSTot></total>
    <pag><detPag><tPag>01</tPag><vPag>10.00</vPag></detPag></pag>
  </infNFe>
</NFe>"#
        )
    }

    const DET: &str = r#"<det nItem="1"><prod><cProd>7891</cProd><xProd>CAFE</xProd><NCM>09012100</NCM>
        <qCom>1.0000</qCom><vUnCom>10.00</vUnCom><vProd>10.00</vProd></prod></det>"#;

    #[test]
    fn test_bare_nfe() {
        let invoice = parse_xml(&nfe("", DET)).unwrap();
        assert_eq!(invoice.access_key().as_str(), KEY);
        assert_eq!(invoice.merchant().name, "MERCADO & CIA");
        assert_eq!(invoice.merchant().address.street, "RUA A");
        assert!(invoice.customer().is_none());
        assert_eq!(invoice.items()[0].tax_code, "09012100");
        assert_eq!(invoice.payment_method(), "Dinheiro");
        let taxes = invoice.taxes();
        assert!((taxes.total - 3.65).abs() < 1e-9, "falls back to component sum");
    }

    #[test]
    fn test_customer_cnpj_accepted() {
        let dest = "<dest><CNPJ>98765432000110</CNPJ><xNome>EMPRESA CLIENTE</xNome></dest>";
        let invoice = parse_xml(&nfe(dest, DET)).unwrap();
        let customer = invoice.customer().unwrap();
        assert_eq!(customer.tax_id, "98765432000110");
        assert!(customer.address.is_none());
    }

    #[test]
    fn test_item_missing_quantity() {
        let det = "<det><prod><cProd>1</cProd><vUnCom>1.00</vUnCom><vProd>1.00</vProd></prod></det>";
        let err = parse_xml(&nfe("", det)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_mismatched_tags() {
        let err = parse_xml("<NFe><ide><dhEmi>x</ide></NFe>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }
}
