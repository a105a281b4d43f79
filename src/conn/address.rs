//! The feed address string:
//! `[codec+…]host[:port][[prop,…]]`, comma-separated, entries optionally
//! wrapped in parentheses. Recognised codecs are `tls` (with key-store and
//! trust-store properties) and `gzip`; recognised entry properties are
//! `username` and `password`.
//!
//! Example:
//! `(tls[trustStore=ca.pem]+h1.example:7300[username=u,password=p]),h2.example:7300`
//!
//! The parser performs no name resolution; TLS and gzip are surfaced as
//! typed data for the embedding transport, not implemented here.

use crate::{FeedError, FeedResult};
use secstr::SecUtf8;
use std::fmt;

/// TLS codec properties of one address entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TlsOptions {
    pub key_store: Option<String>,
    pub key_store_password: Option<SecUtf8>,
    pub trust_store: Option<String>,
    pub trust_store_password: Option<SecUtf8>,
}

/// One parsed address entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Address {
    host: String,
    port: Option<u16>,
    username: Option<String>,
    password: Option<SecUtf8>,
    tls: Option<TlsOptions>,
    gzip: bool,
}

impl Address {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, after list-level inheritance has been applied.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&SecUtf8> {
        self.password.as_ref()
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }

    pub fn gzip(&self) -> bool {
        self.gzip
    }

    /// Whether this entry carries any transport codec.
    pub fn has_codecs(&self) -> bool {
        self.tls.is_some() || self.gzip
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tls.is_some() {
            write!(f, "tls+")?;
        }
        if self.gzip {
            write!(f, "gzip+")?;
        }
        write!(f, "{}:{}", self.host, self.port())
    }
}

/// The parsed address collection.
#[derive(Clone, Debug, PartialEq)]
pub struct AddressList {
    entries: Vec<Address>,
}

impl AddressList {
    pub fn entries(&self) -> &[Address] {
        &self.entries
    }

    /// Parses a collection string and applies port inheritance: a portless
    /// entry takes the port of the last entry, which must carry one.
    pub fn parse(collection: &str) -> FeedResult<Self> {
        let mut entries = Vec::new();
        for entry in split_entries(collection)? {
            entries.push(parse_entry(entry)?);
        }
        if entries.is_empty() {
            return Err(FeedError::InvalidFunctionArg(
                "address collection is empty".to_string(),
            ));
        }
        let last_port = entries
            .last()
            .and_then(|a| a.port)
            .ok_or_else(|| {
                FeedError::InvalidFunctionArg(
                    "the last address entry must specify a port".to_string(),
                )
            })?;
        for entry in &mut entries {
            entry.port.get_or_insert(last_port);
        }
        Ok(Self { entries })
    }
}

/// Splits the collection into entries on commas, honouring parentheses so
/// a wrapped entry may itself contain commas.
fn split_entries(collection: &str) -> FeedResult<Vec<&str>> {
    let mut entries = Vec::new();
    let mut rest = collection.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('(') {
            let end = stripped
                .find(')')
                .ok_or_else(|| FeedError::InvalidFunctionArg("unbalanced '(' in address".into()))?;
            let entry = stripped[..end].trim();
            if !entry.is_empty() {
                entries.push(entry);
            }
            rest = stripped[end + 1..].trim_start_matches(|c: char| c == ',' || c == ' ');
        } else if rest.starts_with(')') {
            return Err(FeedError::InvalidFunctionArg(
                "unbalanced ')' in address".into(),
            ));
        } else {
            let end = rest.find([',', '(']).unwrap_or(rest.len());
            if rest[end..].starts_with('(') {
                return Err(FeedError::InvalidFunctionArg(
                    "'(' may only start an entry".into(),
                ));
            }
            let entry = rest[..end].trim();
            if !entry.is_empty() {
                entries.push(entry);
            }
            rest = rest[end..].trim_start_matches(|c: char| c == ',' || c == ' ');
        }
    }
    Ok(entries)
}

fn parse_entry(entry: &str) -> FeedResult<Address> {
    let mut address = Address {
        host: String::new(),
        port: None,
        username: None,
        password: None,
        tls: None,
        gzip: false,
    };

    // Everything up to the last '+' is the codec chain.
    let (codecs, host_part) = match entry.rfind('+') {
        Some(pos) => (&entry[..pos], &entry[pos + 1..]),
        None => ("", entry),
    };
    for codec in codecs.split('+') {
        let codec = codec.trim();
        if codec.is_empty() {
            continue;
        }
        parse_codec(codec, &mut address)?;
    }

    // Entry properties trail the host in brackets.
    let (host_port, props) = split_bracket_suffix(host_part)?;
    for (key, value) in parse_properties(props)? {
        match key {
            "username" => address.username = Some(value.to_string()),
            "password" => address.password = Some(SecUtf8::from(value.to_string())),
            _ => {
                return Err(FeedError::InvalidFunctionArg(format!(
                    "unknown address property {key:?}"
                )))
            }
        }
    }

    let host_port = host_port.trim();
    match host_port.rfind(':') {
        Some(pos) if host_port[pos + 1..].parse::<i64>().is_ok() => {
            let port: i64 = host_port[pos + 1..].parse().unwrap_or(-1);
            let port = u16::try_from(port)
                .map_err(|_| FeedError::InvalidPortValue(host_port[pos + 1..].to_string()))?;
            address.host = host_port[..pos].trim().to_string();
            address.port = Some(port);
        }
        // no port, or a non-numeric suffix that stays part of the host
        _ => address.host = host_port.to_string(),
    }
    if address.host.is_empty() {
        return Err(FeedError::InvalidFunctionArg(
            "address entry without a host".to_string(),
        ));
    }
    Ok(address)
}

fn parse_codec(codec: &str, address: &mut Address) -> FeedResult<()> {
    let (name, props) = split_bracket_suffix(codec)?;
    let name = name.trim();
    if name.eq_ignore_ascii_case("tls") {
        let mut tls = TlsOptions::default();
        for (key, value) in parse_properties(props)? {
            match key {
                "keyStore" => tls.key_store = Some(value.to_string()),
                "keyStorePassword" => tls.key_store_password = Some(SecUtf8::from(value.to_string())),
                "trustStore" => tls.trust_store = Some(value.to_string()),
                "trustStorePassword" => tls.trust_store_password = Some(SecUtf8::from(value.to_string())),
                _ => {
                    return Err(FeedError::InvalidFunctionArg(format!(
                        "unknown TLS property {key:?}"
                    )))
                }
            }
        }
        address.tls = Some(tls);
        Ok(())
    } else if name.eq_ignore_ascii_case("gzip") {
        if !props.is_empty() {
            return Err(FeedError::InvalidFunctionArg(
                "the gzip codec takes no properties".to_string(),
            ));
        }
        address.gzip = true;
        Ok(())
    } else {
        Err(FeedError::UnknownCodec(name.to_string()))
    }
}

/// Splits `name[k=v,…]` into the name and the bracket content; brackets
/// must close at the very end when present.
fn split_bracket_suffix(s: &str) -> FeedResult<(&str, &str)> {
    match s.find('[') {
        None => Ok((s, "")),
        Some(open) => {
            let rest = &s[open..];
            if !rest.ends_with(']') {
                return Err(FeedError::InvalidFunctionArg(format!(
                    "malformed bracket section in {s:?}"
                )));
            }
            Ok((&s[..open], &rest[1..rest.len() - 1]))
        }
    }
}

fn parse_properties(props: &str) -> FeedResult<Vec<(&str, &str)>> {
    let mut out = Vec::new();
    for item in props.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (key, value) = item.split_once('=').ok_or_else(|| {
            FeedError::InvalidFunctionArg(format!("property {item:?} is not key=value"))
        })?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(FeedError::InvalidFunctionArg(format!(
                "property {item:?} has an empty key or value"
            )));
        }
        out.push((key, value));
    }
    Ok(out)
}
