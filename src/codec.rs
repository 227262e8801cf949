//! Command formatting and reply parsing.
//!
//! Set commands are printf-style templates (`"FREQ %g"`, `"SOUR{ch}:VOLT %f"`)
//! and may also carry `{token}` placeholders that are rendered from a token
//! table before the value is formatted in. Replies are split and cast into
//! [`Value`]s; binary block transfers are decoded with the `bytes` crate.

use bytes::Buf;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::trace;

use crate::error::{PropError, Result};
use crate::value::Value;

/// Matches printf directives like `%g`, `%.3f`, `%+08.2e` or `%%`.
#[allow(clippy::expect_used)]
static DIRECTIVE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%([-+ 0#]*)(\d+)?(?:\.(\d+))?([sdifFeEgGxXo%])").expect("Invalid directive regex")
});

/// Matches `{token}` placeholders.
#[allow(clippy::expect_used)]
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid token regex")
});

// =============================================================================
// Template tokens
// =============================================================================

/// Names of the `{token}` placeholders in `template`, in order of appearance.
pub fn tokens_in(template: &str) -> Vec<String> {
    TOKEN_REGEX
        .captures_iter(template)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Substitute the tokens present in `tokens`, leaving the others untouched.
pub fn render_partial(template: &str, tokens: &BTreeMap<String, String>) -> String {
    TOKEN_REGEX
        .replace_all(template, |cap: &Captures| match tokens.get(&cap[1]) {
            Some(value) => value.clone(),
            None => cap[0].to_string(),
        })
        .into_owned()
}

/// Substitute every token, failing on the first one `tokens` cannot resolve.
pub fn render(template: &str, tokens: &BTreeMap<String, String>) -> Result<String> {
    if let Some(missing) = tokens_in(template)
        .into_iter()
        .find(|token| !tokens.contains_key(token))
    {
        return Err(PropError::Template {
            token: missing,
            template: template.to_string(),
        });
    }
    Ok(render_partial(template, tokens))
}

// =============================================================================
// printf-style formatting
// =============================================================================

#[derive(Debug, Default)]
struct Directive {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: Option<usize>,
    precision: Option<usize>,
    conversion: char,
}

impl Directive {
    fn from_captures(cap: &Captures) -> Self {
        let flags = cap.get(1).map_or("", |m| m.as_str());
        Self {
            left: flags.contains('-'),
            plus: flags.contains('+'),
            space: flags.contains(' '),
            zero: flags.contains('0'),
            alt: flags.contains('#'),
            width: cap.get(2).and_then(|m| m.as_str().parse().ok()),
            precision: cap.get(3).and_then(|m| m.as_str().parse().ok()),
            conversion: cap[4].chars().next().unwrap_or('s'),
        }
    }
}

/// Number of value placeholders in a printf template (`%%` excluded).
pub fn placeholder_count(template: &str) -> usize {
    DIRECTIVE_REGEX
        .captures_iter(template)
        .filter(|cap| &cap[4] != "%")
        .count()
}

/// Format `args` into a printf-style template, C/Python style.
///
/// ```
/// use daq_props::codec::printf;
///
/// assert_eq!(printf("FREQ %g", &[1e7.into()]).unwrap(), "FREQ 1e+07");
/// assert_eq!(printf("VOLT %f", &[1.5.into()]).unwrap(), "VOLT 1.500000");
/// ```
pub fn printf(template: &str, args: &[Value]) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut last = 0;
    let mut remaining = args.iter();

    for cap in DIRECTIVE_REGEX.captures_iter(template) {
        let whole = cap.get(0).map_or(0..0, |m| m.range());
        out.push_str(&template[last..whole.start]);
        last = whole.end;

        let directive = Directive::from_captures(&cap);
        if directive.conversion == '%' {
            out.push('%');
            continue;
        }
        let arg = remaining.next().ok_or_else(|| {
            PropError::Format(format!("not enough arguments for format '{template}'"))
        })?;
        out.push_str(&format_one(&directive, arg)?);
    }
    out.push_str(&template[last..]);

    if remaining.next().is_some() {
        return Err(PropError::Format(format!(
            "not all arguments converted by format '{template}'"
        )));
    }
    Ok(out)
}

fn format_one(d: &Directive, arg: &Value) -> Result<String> {
    let (negative, body, numeric) = match d.conversion {
        's' => {
            let mut s = python_str(arg);
            if let Some(precision) = d.precision {
                s = s.chars().take(precision).collect();
            }
            (false, s, false)
        }
        'd' | 'i' | 'x' | 'X' | 'o' => {
            let i = arg
                .to_i64()
                .map_err(|_| PropError::Format(format!("%{} needs a number, got {arg:?}", d.conversion)))?;
            let magnitude = i.unsigned_abs();
            let digits = match d.conversion {
                'x' if d.alt => format!("0x{magnitude:x}"),
                'x' => format!("{magnitude:x}"),
                'X' if d.alt => format!("0X{magnitude:X}"),
                'X' => format!("{magnitude:X}"),
                'o' if d.alt => format!("0o{magnitude:o}"),
                'o' => format!("{magnitude:o}"),
                _ => magnitude.to_string(),
            };
            (i < 0, digits, true)
        }
        _ => {
            let x = arg
                .to_f64()
                .map_err(|_| PropError::Format(format!("%{} needs a number, got {arg:?}", d.conversion)))?;
            (x.is_sign_negative() && !x.is_nan(), format_float(d, x.abs()), true)
        }
    };

    let sign = if negative {
        "-"
    } else if numeric && d.plus {
        "+"
    } else if numeric && d.space {
        " "
    } else {
        ""
    };

    let len = sign.len() + body.chars().count();
    let width = d.width.unwrap_or(0);
    if len >= width {
        return Ok(format!("{sign}{body}"));
    }
    let pad = width - len;
    Ok(if d.left {
        format!("{sign}{body}{}", " ".repeat(pad))
    } else if d.zero && numeric && !body.to_ascii_lowercase().starts_with(['i', 'n']) {
        format!("{sign}{}{body}", "0".repeat(pad))
    } else {
        format!("{}{sign}{body}", " ".repeat(pad))
    })
}

/// `%s` text of a value: `True`/`False` for booleans, floats always with a
/// fraction or an exponent (`1.0`, `1e-05`, `1.5e+16`).
fn python_str(arg: &Value) -> String {
    match arg {
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Float(x) => python_float(*x),
        Value::List(items) => items.iter().map(python_str).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn python_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let shortest = format!("{x:e}");
    let (mantissa, exp) = match shortest.split_once('e') {
        Some((mantissa, exp)) => (mantissa, exp.parse::<i32>().unwrap_or(0)),
        None => (shortest.as_str(), 0),
    };
    if (-4..16).contains(&exp) {
        let plain = x.to_string();
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    }
}

fn format_float(d: &Directive, x: f64) -> String {
    let upper = d.conversion.is_ascii_uppercase();
    if !x.is_finite() {
        let s = if x.is_nan() { "nan" } else { "inf" };
        return if upper { s.to_uppercase() } else { s.to_string() };
    }
    let s = match d.conversion.to_ascii_lowercase() {
        'f' => format!("{:.*}", d.precision.unwrap_or(6), x),
        'e' => exponential(x, d.precision.unwrap_or(6)),
        _ => general(x, d.precision.unwrap_or(6), d.alt),
    };
    if upper {
        s.to_uppercase()
    } else {
        s
    }
}

/// Mantissa and decimal exponent of `x` rounded to `precision` digits.
fn exp_parts(x: f64, precision: usize) -> (String, i32) {
    let s = format!("{:.*e}", precision, x);
    match s.split_once('e') {
        Some((mantissa, exp)) => (mantissa.to_string(), exp.parse().unwrap_or(0)),
        None => (s, 0),
    }
}

fn exponential(x: f64, precision: usize) -> String {
    let (mantissa, exp) = exp_parts(x, precision);
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exp.abs())
}

fn general(x: f64, precision: usize, keep_zeros: bool) -> String {
    let p = precision.max(1);
    let exp = if x == 0.0 { 0 } else { exp_parts(x, p - 1).1 };

    if exp >= -4 && exp < p as i32 {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, x);
        if keep_zeros {
            s
        } else {
            strip_zeros(&s)
        }
    } else {
        let s = exponential(x, p - 1);
        if keep_zeros {
            return s;
        }
        match s.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{exp}", strip_zeros(mantissa)),
            None => s,
        }
    }
}

fn strip_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

// =============================================================================
// Reply parsing
// =============================================================================

/// How each item of a split reply is converted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cast {
    #[default]
    Float,
    Int,
    Bool,
    Str,
}

impl Cast {
    /// Convert one reply item; items that do not cast are kept as strings.
    pub fn apply(self, item: &str) -> Value {
        let item = item.trim();
        let cast = match self {
            Cast::Float => item.parse::<f64>().ok().map(Value::Float),
            Cast::Int => item.parse::<i64>().ok().map(Value::Int),
            Cast::Bool => item.parse::<f64>().ok().map(|f| Value::Bool(f != 0.0)),
            Cast::Str => None,
        };
        cast.unwrap_or_else(|| Value::Str(item.to_string()))
    }
}

/// Split and cast rules for a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFormat {
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Maximum number of splits, `None` for unlimited
    #[serde(default)]
    pub maxsplit: Option<usize>,
    #[serde(default)]
    pub cast: Cast,
}

fn default_separator() -> String {
    ",".to_string()
}

impl Default for ReplyFormat {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            maxsplit: None,
            cast: Cast::Float,
        }
    }
}

/// Split `reply` on the separator and cast every item.
pub fn parse_reply(reply: &str, format: &ReplyFormat) -> Vec<Value> {
    let reply = reply.trim();
    let items: Vec<&str> = if format.separator.is_empty() {
        vec![reply]
    } else {
        match format.maxsplit {
            Some(n) => reply.splitn(n + 1, format.separator.as_str()).collect(),
            None => reply.split(format.separator.as_str()).collect(),
        }
    };
    let values: Vec<Value> = items.into_iter().map(|item| format.cast.apply(item)).collect();
    trace!(reply, ?values, "parsed reply");
    values
}

// =============================================================================
// Binary blocks
// =============================================================================

/// Element type and byte order of a binary block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryFormat {
    I16Le,
    I16Be,
    I32Le,
    I32Be,
    F32Le,
    F32Be,
    F64Le,
    F64Be,
}

impl BinaryFormat {
    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            BinaryFormat::I16Le | BinaryFormat::I16Be => 2,
            BinaryFormat::I32Le | BinaryFormat::I32Be | BinaryFormat::F32Le | BinaryFormat::F32Be => 4,
            BinaryFormat::F64Le | BinaryFormat::F64Be => 8,
        }
    }
}

/// Decode a block of fixed-width elements. Trailing bytes that do not fill a
/// whole element are an error.
pub fn decode_block(mut data: &[u8], format: BinaryFormat) -> Result<Vec<Value>> {
    let size = format.size();
    if data.len() % size != 0 {
        return Err(PropError::Protocol(format!(
            "binary block of {} bytes is not a multiple of {size}",
            data.len()
        )));
    }
    let mut values = Vec::with_capacity(data.len() / size);
    while data.has_remaining() {
        let value = match format {
            BinaryFormat::I16Le => Value::Int(i64::from(data.get_i16_le())),
            BinaryFormat::I16Be => Value::Int(i64::from(data.get_i16())),
            BinaryFormat::I32Le => Value::Int(i64::from(data.get_i32_le())),
            BinaryFormat::I32Be => Value::Int(i64::from(data.get_i32())),
            BinaryFormat::F32Le => Value::Float(f64::from(data.get_f32_le())),
            BinaryFormat::F32Be => Value::Float(f64::from(data.get_f32())),
            BinaryFormat::F64Le => Value::Float(data.get_f64_le()),
            BinaryFormat::F64Be => Value::Float(data.get_f64()),
        };
        values.push(value);
    }
    Ok(values)
}

/// Parse the length digits of an IEEE 488.2 definite-length header
/// (`#<n><length>`), returning the payload length.
pub fn ieee_block_length(digits: &[u8]) -> Result<usize> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            PropError::Protocol(format!(
                "invalid IEEE 488.2 block length {:?}",
                String::from_utf8_lossy(digits)
            ))
        })
}

/// Framing of a binary reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Block {
    /// IEEE 488.2 definite-length block, `#<n><length><payload>`
    Ieee488,
    /// `header_bytes` to skip, then `count` elements
    Fixed { header_bytes: usize, count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(template: &str, value: impl Into<Value>) -> String {
        printf(template, &[value.into()]).unwrap()
    }

    #[test]
    fn general_format_matches_c() {
        assert_eq!(f("%g", 1e7), "1e+07");
        assert_eq!(f("%g", 1.5), "1.5");
        assert_eq!(f("%g", 0.0001), "0.0001");
        assert_eq!(f("%g", 0.00001), "1e-05");
        assert_eq!(f("%g", 123456.0), "123456");
        assert_eq!(f("%g", 1234567.0), "1.23457e+06");
        assert_eq!(f("%g", -2.5e-3), "-0.0025");
        assert_eq!(f("%g", 0.0), "0");
        assert_eq!(f("%.3g", 52.5e6), "5.25e+07");
        assert_eq!(f("%#g", 1.5), "1.50000");
    }

    #[test]
    fn fixed_and_exponential() {
        assert_eq!(f("%f", 1.5), "1.500000");
        assert_eq!(f("%.2f", 2.0 / 3.0), "0.67");
        assert_eq!(f("%e", 12345.678), "1.234568e+04");
        assert_eq!(f("%.2E", 0.000123), "1.23E-04");
        assert_eq!(f("%.1f", -0.04), "-0.0");
    }

    #[test]
    fn integers_and_padding() {
        assert_eq!(f("%d", 42), "42");
        assert_eq!(f("%d", 1.9), "1");
        assert_eq!(f("%d", true), "1");
        assert_eq!(f("%03d", 7), "007");
        assert_eq!(f("%+d", 7), "+7");
        assert_eq!(f("%-4d|", 7), "7   |");
        assert_eq!(f("%5.1f", 2.24), "  2.2");
        assert_eq!(f("%08.3f", -1.5), "-001.500");
        assert_eq!(f("%X", 255), "FF");
        assert_eq!(f("%04x", 255), "00ff");
        assert_eq!(f("%x", -255), "-ff");
    }

    #[test]
    fn strings_and_literals() {
        assert_eq!(f("FUNC %s", "SIN"), "FUNC SIN");
        assert_eq!(f("%.3s", "ABCDEF"), "ABC");
        assert_eq!(f("DUTY %d%%", 50), "DUTY 50%");
        assert_eq!(placeholder_count("A %d%% B %s"), 2);
    }

    #[test]
    fn string_conversion_of_numbers_and_booleans() {
        assert_eq!(f("MODE %s", 1.0), "MODE 1.0");
        assert_eq!(f("%s", 2.5), "2.5");
        assert_eq!(f("%s", 7), "7");
        assert_eq!(f("OUTP %s", true), "OUTP True");
        assert_eq!(f("%s", 1e-5), "1e-05");
        assert_eq!(f("%s", 1.5e16), "1.5e+16");
        assert_eq!(f("%s", 123456.0), "123456.0");
        assert_eq!(f("%s", -0.25), "-0.25");
    }

    #[test]
    fn argument_count_mismatch_is_an_error() {
        assert!(printf("VOLT %g,%g", &[1.0.into()]).is_err());
        assert!(printf("OUTP ON", &[1.0.into()]).is_err());
        assert_eq!(
            printf("APPL %g,%g", &[1.0.into(), 2.5.into()]).unwrap(),
            "APPL 1,2.5"
        );
    }

    #[test]
    fn numeric_directive_rejects_strings() {
        assert!(matches!(
            printf("FREQ %g", &["fast".into()]),
            Err(PropError::Format(_))
        ));
    }

    #[test]
    fn render_tokens() {
        let mut tokens = BTreeMap::new();
        tokens.insert("ch".to_string(), "2".to_string());
        assert_eq!(render_partial("SOUR{ch}:{function}?", &tokens), "SOUR2:{function}?");
        let err = render("SOUR{ch}:{function}?", &tokens).unwrap_err();
        assert!(matches!(err, PropError::Template { ref token, .. } if token == "function"));
        tokens.insert("function".to_string(), "VOLT".to_string());
        assert_eq!(render("SOUR{ch}:{function}?", &tokens).unwrap(), "SOUR2:VOLT?");
        assert_eq!(tokens_in(":{a}:{b_2}:{ 3}"), vec!["a", "b_2"]);
    }

    #[test]
    fn parse_reply_splits_and_casts() {
        let values = parse_reply(" 1.5, 2 ,OVLD\n", &ReplyFormat::default());
        assert_eq!(
            values,
            vec![Value::Float(1.5), Value::Float(2.0), Value::from("OVLD")]
        );
    }

    #[test]
    fn parse_reply_honours_maxsplit_and_cast() {
        let format = ReplyFormat {
            separator: ",".into(),
            maxsplit: Some(1),
            cast: Cast::Str,
        };
        assert_eq!(
            parse_reply("-222,\"Data out of range, clamped\"", &format),
            vec![Value::from("-222"), Value::from("\"Data out of range, clamped\"")]
        );

        let ints = ReplyFormat {
            cast: Cast::Int,
            ..Default::default()
        };
        assert_eq!(parse_reply("3,1.5", &ints), vec![Value::Int(3), Value::from("1.5")]);

        let bools = ReplyFormat {
            cast: Cast::Bool,
            ..Default::default()
        };
        assert_eq!(parse_reply("0", &bools), vec![Value::Bool(false)]);
    }

    #[test]
    fn decode_blocks() {
        let data = [0x01, 0x00, 0xff, 0xff];
        assert_eq!(
            decode_block(&data, BinaryFormat::I16Le).unwrap(),
            vec![Value::Int(1), Value::Int(-1)]
        );
        let mut floats = Vec::new();
        floats.extend_from_slice(&1.5f32.to_be_bytes());
        assert_eq!(
            decode_block(&floats, BinaryFormat::F32Be).unwrap(),
            vec![Value::Float(1.5)]
        );
        assert!(decode_block(&data[..3], BinaryFormat::I16Le).is_err());
        assert_eq!(ieee_block_length(b"0012").unwrap(), 12);
        assert!(ieee_block_length(b"1a").is_err());
    }
}
