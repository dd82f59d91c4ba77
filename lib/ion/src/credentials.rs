use crate::encoding::hex;
use hashbrown::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

pub const KEY_SIZE: usize = 32;
pub const MAX_NAME_LEN: usize = 64;

/// Secret key shared between a named principal and the nodes.
pub type Key = [u8; KEY_SIZE];

#[derive(Debug)]
pub enum CredentialsError {
    Io(io::Error),
    Empty,
    /// A client credentials file must hold exactly one entry.
    MultipleEntries,
    MalformedEntry { line: usize },
    BadName { line: usize },
    BadKey { line: usize },
    DuplicateName { line: usize },
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CredentialsError::Io(err) => write!(f, "credentials file unreadable: {}", err),
            CredentialsError::Empty => write!(f, "credentials file is empty"),
            CredentialsError::MultipleEntries => {
                write!(f, "client credentials file must hold exactly one entry")
            }
            CredentialsError::MalformedEntry { line } => {
                write!(f, "malformed credentials entry on line {}", line)
            }
            CredentialsError::BadName { line } => write!(f, "invalid principal name on line {}", line),
            CredentialsError::BadKey { line } => write!(f, "invalid key on line {}", line),
            CredentialsError::DuplicateName { line } => {
                write!(f, "duplicate principal name on line {}", line)
            }
        }
    }
}

impl From<io::Error> for CredentialsError {
    fn from(err: io::Error) -> Self {
        CredentialsError::Io(err)
    }
}

/// Registry of `name -> key` entries parsed from a credentials file.
///
/// The file is UTF-8 with LF terminated lines, one `name:hex64` entry per
/// line. Nodes load every entry; a client loads exactly one.
pub struct Credentials {
    entries: HashMap<String, Key>,
}

impl Credentials {
    pub fn parse(text: &str) -> Result<Credentials, CredentialsError> {
        let mut entries = HashMap::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let (name, key) = parse_entry(line, line_no)?;

            if entries.insert(name, key).is_some() {
                return Err(CredentialsError::DuplicateName { line: line_no });
            }
        }

        if entries.is_empty() {
            return Err(CredentialsError::Empty);
        }

        Ok(Credentials { entries })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Credentials, CredentialsError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parses a client credentials file, which must hold exactly one entry.
    pub fn parse_single(text: &str) -> Result<(String, Key), CredentialsError> {
        let parsed = Self::parse(text)?;

        if parsed.entries.len() > 1 {
            return Err(CredentialsError::MultipleEntries);
        }

        Ok(parsed
            .entries
            .into_iter()
            .next()
            .expect("Parsed credentials cannot be empty"))
    }

    pub fn single_from_file<P: AsRef<Path>>(path: P) -> Result<(String, Key), CredentialsError> {
        Self::parse_single(&fs::read_to_string(path)?)
    }

    #[inline]
    pub fn key(&self, name: &str) -> Option<&Key> {
        self.entries.get(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn parse_entry(line: &str, line_no: usize) -> Result<(String, Key), CredentialsError> {
    let mut parts = line.splitn(2, ':');

    let name = parts.next().unwrap_or("");
    let key_text = match parts.next() {
        Some(text) => text,
        None => return Err(CredentialsError::MalformedEntry { line: line_no }),
    };

    if !valid_name(name) {
        return Err(CredentialsError::BadName { line: line_no });
    }

    if key_text.len() != KEY_SIZE * 2 {
        return Err(CredentialsError::BadKey { line: line_no });
    }

    let raw = hex::decode(key_text).map_err(|_| CredentialsError::BadKey { line: line_no })?;

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&raw);

    Ok((name.to_string(), key))
}

fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => (),
        _ => return false,
    }

    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_key_entry(name: &str) -> String {
        format!("{}:{}", name, "0".repeat(64))
    }

    #[test]
    fn test_single_zero_key() {
        let (name, key) = Credentials::parse_single(&zero_key_entry("test")).unwrap();

        assert_eq!(name, "test");
        assert_eq!(key, [0u8; KEY_SIZE]);
    }

    #[test]
    fn test_multi_entry_node_file() {
        let text = format!("{}\n{}\n", zero_key_entry("alpha"), zero_key_entry("beta"));
        let creds = Credentials::parse(&text).unwrap();

        assert_eq!(creds.len(), 2);
        assert!(creds.key("alpha").is_some());
        assert!(creds.key("beta").is_some());
        assert!(creds.key("gamma").is_none());
    }

    #[test]
    fn test_client_rejects_multiple_entries() {
        let text = format!("{}\n{}\n", zero_key_entry("alpha"), zero_key_entry("beta"));

        match Credentials::parse_single(&text) {
            Err(CredentialsError::MultipleEntries) => (),
            other => panic!("Unexpected result {:?}", other.map(|entry| entry.0)),
        }
    }

    #[test]
    fn test_empty_file() {
        match Credentials::parse("") {
            Err(CredentialsError::Empty) => (),
            _ => panic!("Empty file must be rejected"),
        }
    }

    #[test]
    fn test_blank_line_rejected() {
        let text = format!("{}\n\n", zero_key_entry("test"));

        match Credentials::parse(&text) {
            Err(CredentialsError::MalformedEntry { line: 2 }) => (),
            other => panic!("Unexpected result {:?}", other.err()),
        }
    }

    #[test]
    fn test_short_key_rejected() {
        match Credentials::parse("test:0011\n") {
            Err(CredentialsError::BadKey { line: 1 }) => (),
            other => panic!("Unexpected result {:?}", other.err()),
        }
    }

    #[test]
    fn test_non_hex_key_rejected() {
        let text = format!("test:{}\n", "g".repeat(64));

        match Credentials::parse(&text) {
            Err(CredentialsError::BadKey { line: 1 }) => (),
            other => panic!("Unexpected result {:?}", other.err()),
        }
    }

    #[test]
    fn test_bad_names_rejected() {
        for name in &["1abc", "", "na me", "übel"] {
            let text = format!("{}:{}\n", name, "0".repeat(64));
            match Credentials::parse(&text) {
                Err(CredentialsError::BadName { line: 1 }) => (),
                Err(CredentialsError::MalformedEntry { line: 1 }) if name.is_empty() => (),
                other => panic!("Name {:?} must be rejected, got {:?}", name, other.err()),
            }
        }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let text = format!("{}\n{}\n", zero_key_entry("test"), zero_key_entry("test"));

        match Credentials::parse(&text) {
            Err(CredentialsError::DuplicateName { line: 2 }) => (),
            other => panic!("Unexpected result {:?}", other.err()),
        }
    }

    #[test]
    fn test_name_length_bounds() {
        let long = "a".repeat(65);
        let text = format!("{}:{}\n", long, "0".repeat(64));

        match Credentials::parse(&text) {
            Err(CredentialsError::BadName { line: 1 }) => (),
            other => panic!("Unexpected result {:?}", other.err()),
        }

        let max = "a".repeat(64);
        let text = format!("{}:{}\n", max, "0".repeat(64));
        assert_eq!(Credentials::parse(&text).unwrap().len(), 1);
    }
}
