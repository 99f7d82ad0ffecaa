//! The portal's HTML invoice view.
//!
//! Data sits in `fieldset`s named by their `legend`. Inside a section each
//! `label` names the value in the `span` right after it.

use scraper::{ElementRef, Html, Selector};

use super::text::{digits, fold, normalize_ws, parse_date_br, parse_decimal_br, payment_method_label};
use crate::error::{BrisaError, BrisaResult};
use crate::types::{Address, Customer, Invoice, InvoiceBuilder, InvoiceItem, Merchant};

const SECTION_INVOICE: &str = "Dados da NF-e";
const SECTION_MERCHANT: &str = "Emitente";
const SECTION_CUSTOMER: &str = "Destinatário";
const SECTION_PRODUCTS: &str = "Produtos e Serviços";
const SECTION_TOTALS: &str = "Totais";
const SECTION_PAYMENT: &str = "Formas de Pagamento";

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector is valid")
}

/// Label/value pairs of one section, labels folded for matching.
struct Fields(Vec<(String, String)>);

impl Fields {
    fn of(scope: ElementRef<'_>) -> Self {
        let label_sel = sel("label");
        let mut pairs = Vec::new();
        for label in scope.select(&label_sel) {
            let Some(value) = label
                .next_siblings()
                .find_map(ElementRef::wrap)
                .filter(|el| el.value().name() == "span")
            else {
                continue;
            };
            pairs.push((fold(&element_text(label)), element_text(value)));
        }
        Fields(pairs)
    }

    /// First non-empty value under any of `labels`.
    fn get(&self, labels: &[&str]) -> Option<&str> {
        labels.iter().find_map(|wanted| {
            let wanted = fold(wanted);
            self.0
                .iter()
                .find(|(label, value)| *label == wanted && !value.is_empty())
                .map(|(_, value)| value.as_str())
        })
    }

    fn string(&self, labels: &[&str]) -> String {
        self.get(labels).unwrap_or_default().to_string()
    }

    fn decimal(&self, labels: &[&str]) -> Option<f64> {
        self.get(labels).and_then(parse_decimal_br)
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_ws(&el.text().collect::<String>())
}

struct Sections<'a>(Vec<(String, ElementRef<'a>)>);

impl<'a> Sections<'a> {
    fn of(doc: &'a Html) -> Self {
        let fieldset_sel = sel("fieldset");
        let sections = doc
            .select(&fieldset_sel)
            .filter_map(|fieldset| {
                let legend = fieldset
                    .children()
                    .filter_map(ElementRef::wrap)
                    .find(|el| el.value().name() == "legend")?;
                Some((fold(&element_text(legend)), fieldset))
            })
            .collect();
        Sections(sections)
    }

    fn find(&self, name: &str) -> Option<ElementRef<'a>> {
        let wanted = fold(name);
        self.0
            .iter()
            .find(|(legend, _)| legend.contains(&wanted))
            .map(|(_, el)| *el)
    }

    fn fields(&self, name: &str) -> Option<Fields> {
        self.find(name).map(Fields::of)
    }
}

pub fn parse_html(raw: &str) -> BrisaResult<Invoice> {
    let doc = Html::parse_document(raw);
    let sections = Sections::of(&doc);
    let mut builder = InvoiceBuilder::new(raw);

    let invoice = sections.fields(SECTION_INVOICE);
    builder.access_key = access_key(&doc, invoice.as_ref());
    if let Some(invoice) = &invoice {
        builder.issue_date = invoice
            .get(&["Data de Emissão", "Data Emissão"])
            .and_then(parse_date_br);
        builder.total_value = invoice.decimal(&["Valor Total da Nota Fiscal", "Valor Total da NF-e"]);
    }

    builder.merchant = sections.fields(SECTION_MERCHANT).map(|f| merchant(&f));
    builder.customer = sections.fields(SECTION_CUSTOMER).and_then(|f| customer(&f));
    builder.items = items(&doc, sections.find(SECTION_PRODUCTS))?;

    if let Some(totals) = sections.fields(SECTION_TOTALS) {
        builder.taxes = (
            totals.decimal(&["Valor do ICMS"]),
            totals.decimal(&["Valor do PIS"]),
            totals.decimal(&["Valor da COFINS", "Valor do COFINS"]),
            totals.decimal(&["Valor Aproximado dos Tributos", "Valor Aproximado Total dos Tributos"]),
        );
        if builder.total_value.is_none() {
            builder.total_value = totals.decimal(&["Valor Total da NFe", "Valor Total da Nota Fiscal"]);
        }
    }

    builder.payment_method = sections
        .fields(SECTION_PAYMENT)
        .and_then(|f| f.get(&["Meio de Pagamento", "Forma de Pagamento"]).map(payment_method_label));

    builder.build()
}

fn access_key(doc: &Html, invoice: Option<&Fields>) -> Option<String> {
    let chave = doc
        .select(&sel("span.chave"))
        .map(element_text)
        .find(|text| !digits(text).is_empty());
    chave
        .or_else(|| invoice.and_then(|f| f.get(&["Chave de Acesso"])).map(str::to_string))
        .map(|key| digits(&key))
}

fn address(fields: &Fields) -> Address {
    let (street, number) = split_street(&fields.string(&["Endereço", "Logradouro"]));
    let number = fields.get(&["Número"]).map(str::to_string).unwrap_or(number);
    Address {
        street,
        number,
        district: fields.string(&["Bairro / Distrito", "Bairro"]),
        city: strip_code_prefix(&fields.string(&["Município"])),
        state: fields.string(&["UF"]),
        postal_code: digits(&fields.string(&["CEP"])),
    }
}

fn merchant(fields: &Fields) -> Merchant {
    Merchant {
        name: fields.string(&["Nome / Razão Social", "Razão Social", "Nome"]),
        tax_id: digits(&fields.string(&["CNPJ"])),
        address: address(fields),
        state_registration_code: fields.string(&["Inscrição Estadual"]),
    }
}

fn customer(fields: &Fields) -> Option<Customer> {
    let tax_id = digits(&fields.string(&["CPF", "CNPJ", "CPF / CNPJ"]));
    if tax_id.is_empty() {
        tracing::debug!("customer section without a tax id, treating as anonymous");
        return None;
    }
    let address = address(fields);
    Some(Customer {
        name: fields.string(&["Nome / Razão Social", "Razão Social", "Nome"]),
        tax_id,
        address: (!address.is_empty()).then_some(address),
    })
}

/// `"RUA DAS FLORES, 123"` → `("RUA DAS FLORES", "123")`.
fn split_street(s: &str) -> (String, String) {
    match s.rsplit_once(',') {
        Some((street, number))
            if number.trim().starts_with(|c: char| c.is_ascii_digit())
                || fold(number).starts_with("s/n") =>
        {
            (street.trim().to_string(), number.trim().to_string())
        }
        _ => (s.to_string(), String::new()),
    }
}

/// `"3550308 - SAO PAULO"` → `"SAO PAULO"`.
fn strip_code_prefix(s: &str) -> String {
    match s.split_once(" - ") {
        Some((code, name)) if code.chars().all(|c| c.is_ascii_digit()) => name.trim().to_string(),
        _ => s.to_string(),
    }
}

fn items(doc: &Html, products: Option<ElementRef<'_>>) -> BrisaResult<Vec<InvoiceItem>> {
    let summary_sel = sel("table.toggle");
    let detail_sel = sel("table.toggable");
    let (summaries, details): (Vec<_>, Vec<_>) = match products {
        Some(scope) => (
            scope.select(&summary_sel).collect(),
            scope.select(&detail_sel).collect(),
        ),
        None => (doc.select(&summary_sel).collect(), doc.select(&detail_sel).collect()),
    };

    summaries
        .iter()
        .enumerate()
        .map(|(i, summary)| item(i + 1, *summary, details.get(i).copied()))
        .collect()
}

fn item(position: usize, summary: ElementRef<'_>, detail: Option<ElementRef<'_>>) -> BrisaResult<InvoiceItem> {
    let cell = |class: &str| {
        summary
            .select(&sel(&format!("td.fixo-prod-serv-{class}")))
            .next()
            .map(element_text)
            .unwrap_or_default()
    };
    let detail = detail.map(Fields::of);
    let detail_get = |labels: &[&str]| detail.as_ref().and_then(|d| d.get(labels)).map(str::to_string);

    let quantity = parse_decimal_br(&cell("qtd"))
        .ok_or_else(|| BrisaError::malformed(format!("item {position} has no quantity")))?;
    let total_price = parse_decimal_br(&cell("vb"))
        .ok_or_else(|| BrisaError::malformed(format!("item {position} has no total value")))?;
    let unit_price = detail_get(&["Valor unitário de comercialização"])
        .and_then(|v| parse_decimal_br(&v))
        .unwrap_or_else(|| {
            if quantity > 0.0 {
                total_price / quantity
            } else {
                0.0
            }
        });

    Ok(InvoiceItem {
        code: detail_get(&["Código do Produto"]).unwrap_or_else(|| cell("numero")),
        description: cell("descricao"),
        quantity,
        unit_price,
        total_price,
        tax_code: detail_get(&["Código NCM"]).unwrap_or_default(),
    })
}
