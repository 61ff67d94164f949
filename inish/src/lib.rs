//! A minimal, dependency-free INI file parser.
//!
//! Sections are `[name]` headers; keys are `key=value` or `key = value`.
//! `;` and `#` start a comment that runs to the end of the line. Blank
//! lines and lines before the first section header are ignored.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// A parsed INI document: section name -> (key -> value), insertion order
/// preserved for both sections and keys.
#[derive(Debug, Default, Clone)]
pub struct Ini {
    order: Vec<String>,
    sections: HashMap<String, Section>,
}

#[derive(Debug, Default, Clone)]
pub struct Section {
    order: Vec<String>,
    values: HashMap<String, String>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    fn set(&mut self, key: String, value: String) {
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value);
    }
}

impl Ini {
    pub fn parse(text: &str) -> Result<Ini, ParseError> {
        let mut ini = Ini::default();
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = parse_section_header(line, line_no)? {
                if !ini.sections.contains_key(&name) {
                    ini.order.push(name.clone());
                    ini.sections.insert(name.clone(), Section::default());
                }
                current = Some(name);
                continue;
            }

            let section_name = current.as_ref().ok_or_else(|| ParseError {
                line: line_no,
                message: "key outside of any section".to_string(),
            })?;

            let (key, value) = parse_key_value(line, line_no)?;
            ini.sections.get_mut(section_name).unwrap().set(key, value);
        }

        Ok(ini)
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.order
            .iter()
            .map(move |name| (name.as_str(), &self.sections[name]))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }
}

fn strip_comment(line: &str) -> &str {
    for (i, c) in line.char_indices() {
        if c == ';' || c == '#' {
            return &line[..i];
        }
    }
    line
}

fn parse_section_header(line: &str, line_no: usize) -> Result<Option<String>, ParseError> {
    if !line.starts_with('[') {
        return Ok(None);
    }
    let end = line.find(']').ok_or_else(|| ParseError {
        line: line_no,
        message: "unterminated section header".to_string(),
    })?;
    Ok(Some(line[1..end].trim().to_string()))
}

fn parse_key_value(line: &str, line_no: usize) -> Result<(String, String), ParseError> {
    let eq = line.find('=').ok_or_else(|| ParseError {
        line: line_no,
        message: format!("expected 'key=value', got: {}", line),
    })?;
    let key = line[..eq].trim().to_string();
    let value = line[eq + 1..].trim().to_string();
    if key.is_empty() {
        return Err(ParseError {
            line: line_no,
            message: "empty key".to_string(),
        });
    }
    Ok((key, unquote(&value)))
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_sections_and_keys() {
        let ini = Ini::parse(
            "
            [LightDM]
            minimum-vt=7 ; first vt to try
            pam-service = lightdm

            [SeatDefaults]
            allow-guest=true
            ",
        )
        .unwrap();

        assert_eq!(ini.get("LightDM", "minimum-vt"), Some("7"));
        assert_eq!(ini.get("LightDM", "pam-service"), Some("lightdm"));
        assert_eq!(ini.get("SeatDefaults", "allow-guest"), Some("true"));
        assert_eq!(ini.get("SeatDefaults", "missing"), None);
    }

    #[test]
    fn rejects_key_outside_section() {
        assert!(Ini::parse("key=value").is_err());
    }

    #[test]
    fn strips_full_line_comments() {
        let ini = Ini::parse("# comment\n[A]\n# another\nk=v\n").unwrap();
        assert_eq!(ini.get("A", "k"), Some("v"));
    }

    #[test]
    fn later_key_wins_but_order_is_first_seen() {
        let ini = Ini::parse("[A]\nk=1\nk=2\n").unwrap();
        let section = ini.section("A").unwrap();
        assert_eq!(section.get("k"), Some("2"));
        assert_eq!(section.keys().collect::<Vec<_>>(), vec!["k"]);
    }
}
