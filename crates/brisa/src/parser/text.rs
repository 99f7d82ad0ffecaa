//! Text normalization and Brazilian number/date formats.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone};
use regex::Regex;

/// Brasília time (UTC−3), used when a timestamp carries no offset.
const BRASILIA_WEST_SECS: i32 = 3 * 3600;

/// Collapse runs of whitespace (including non-breaking spaces) and trim.
pub fn normalize_ws(s: &str) -> String {
    s.split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whitespace-normalized, lower-cased, accent-free form used for matching.
pub fn fold(s: &str) -> String {
    normalize_ws(s)
        .chars()
        .flat_map(char::to_lowercase)
        .map(strip_accent)
        .collect()
}

fn strip_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

pub fn digits(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

/// Parse `1.234,56`, `R$ 10,00` or a plain dot-decimal number.
pub fn parse_decimal_br(s: &str) -> Option<f64> {
    let cleaned: String = s
        .replace("R$", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let canonical = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    canonical.parse().ok().filter(|v: &f64| v.is_finite())
}

/// Parse a dot-decimal number as found in NF-e XML.
pub fn parse_decimal(s: &str) -> Option<f64> {
    s.trim().parse().ok().filter(|v: &f64| v.is_finite())
}

pub fn brasilia() -> FixedOffset {
    FixedOffset::west_opt(BRASILIA_WEST_SECS).unwrap_or(chrono::Utc.fix())
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(\d{2})/(\d{2})/(\d{4})(?:\s+(\d{2}):(\d{2})(?::(\d{2}))?)?\s*(?:([+-])(\d{2}):?(\d{2}))?",
        )
        .expect("date regex is valid")
    })
}

/// Parse `dd/mm/yyyy[ hh:mm[:ss]][±hh:mm]`, defaulting to Brasília time.
pub fn parse_date_br(s: &str) -> Option<DateTime<FixedOffset>> {
    let caps = date_regex().captures(s)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let date = NaiveDate::from_ymd_opt(num(3)? as i32, num(2)?, num(1)?)?;
    let time = NaiveTime::from_hms_opt(num(4).unwrap_or(0), num(5).unwrap_or(0), num(6).unwrap_or(0))?;

    let offset = match caps.get(7) {
        Some(sign) => {
            let secs = (num(8)? * 3600 + num(9)? * 60) as i32;
            let secs = if sign.as_str() == "-" { -secs } else { secs };
            FixedOffset::east_opt(secs)?
        }
        None => brasilia(),
    };
    offset
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .single()
}

/// Parse an RFC 3339 timestamp, or a bare `yyyy-mm-dd` date in Brasília time.
pub fn parse_date_iso(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    brasilia()
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
}

/// Display name for an NF-e `tPag` payment code.
pub fn payment_method_name(code: &str) -> Option<&'static str> {
    Some(match code.trim() {
        "01" => "Dinheiro",
        "02" => "Cheque",
        "03" => "Cartão de Crédito",
        "04" => "Cartão de Débito",
        "05" => "Crédito Loja",
        "10" => "Vale Alimentação",
        "11" => "Vale Refeição",
        "12" => "Vale Presente",
        "13" => "Vale Combustível",
        "15" => "Boleto Bancário",
        "16" => "Depósito Bancário",
        "17" => "Pagamento Instantâneo (PIX)",
        "18" => "Transferência bancária, Carteira Digital",
        "19" => "Programa de fidelidade, Cashback, Crédito Virtual",
        "90" => "Sem pagamento",
        "99" => "Outros",
        _ => return None,
    })
}

/// Payment label as shown by the portal: `17 - Pagamento Instantâneo (PIX)`,
/// a bare code, or a bare name.
pub fn payment_method_label(s: &str) -> String {
    let s = normalize_ws(s);
    if let Some((code, name)) = s.split_once(" - ") {
        if code.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() {
            return name.trim().to_string();
        }
    }
    payment_method_name(&s).map(str::to_string).unwrap_or(s)
}
