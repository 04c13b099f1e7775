// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{
    client::ClientLease,
    dhcpv4::options::{
        def_by_name, option_name, parse_option_text, pretty_print_option,
        OptFormat, Universe,
    },
    duid::Duid,
    time::{format_lease_time, parse_lease_time},
    DhcpError, ErrorKind,
};

/// Appends between full rewrites of the database.
const REWRITE_AFTER_WRITES: u32 = 20;

/// One committed lease as the database stores it.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct JournalEntry {
    pub iface: String,
    pub client: Option<String>,
    pub lease: ClientLease,
}

/// Append-oriented textual store for IPv4 leases and the client DUID.
///
/// Every committed lease is appended and flushed; after
/// [REWRITE_AFTER_WRITES] appends the whole file is rewritten from the
/// journal's own mirror of committed state. `lease6` blocks found at
/// recovery are carried through rewrites verbatim so a database shared
/// with a DHCPv6 client survives us. Static (config-sourced) leases are
/// never persisted.
#[derive(Debug)]
pub struct LeaseJournal {
    path: PathBuf,
    file: Option<File>,
    writes_since_rewrite: u32,
    duid: Option<Duid>,
    entries: Vec<JournalEntry>,
    v6_blocks: Vec<String>,
}

impl LeaseJournal {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            writes_since_rewrite: 0,
            duid: None,
            entries: Vec::new(),
            v6_blocks: Vec::new(),
        }
    }

    pub fn duid(&self) -> Option<&Duid> {
        self.duid.as_ref()
    }

    pub fn set_duid(&mut self, duid: Duid) {
        self.duid = Some(duid);
    }

    pub fn entries(&self) -> &[JournalEntry] {
        self.entries.as_slice()
    }

    /// Parse the whole database and rebuild in-memory state. Unreadable
    /// blocks are logged and skipped; when duplicates arise for the
    /// same (address, is_static) pair, only the most recent wins.
    pub fn recover(&mut self) -> Result<(), DhcpError> {
        self.entries.clear();
        self.v6_blocks.clear();
        let mut content = String::new();
        match File::open(self.path.as_path()) {
            Ok(mut fd) => {
                fd.read_to_string(&mut content)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(
                    "Lease database {} does not exist yet",
                    self.path.display()
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let mut parser = Parser::new(content.as_str());
        loop {
            match parser.next_item() {
                Ok(Some(Item::Duid(duid))) => self.duid = Some(duid),
                Ok(Some(Item::Lease(entry))) => self.remember(*entry),
                Ok(Some(Item::V6Block(raw))) => self.v6_blocks.push(raw),
                Ok(None) => break,
                Err(e) => {
                    log::warn!(
                        "Skipping unreadable block in {}: {}",
                        self.path.display(),
                        e
                    );
                    if !parser.skip_to_next_item() {
                        break;
                    }
                }
            }
        }
        log::debug!(
            "Recovered {} lease(s) from {}",
            self.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    fn remember(&mut self, entry: JournalEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| {
            e.iface == entry.iface
                && e.lease.address == entry.lease.address
                && e.lease.is_static == entry.lease.is_static
        }) {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Append one committed lease. `makesure` forces the write to
    /// stable storage (required on release-time writes). Returns
    /// without touching the file for static leases.
    pub fn write_lease(
        &mut self,
        iface: &str,
        client: Option<&str>,
        lease: &ClientLease,
        makesure: bool,
    ) -> Result<(), DhcpError> {
        if lease.is_static {
            return Ok(());
        }
        let entry = JournalEntry {
            iface: iface.to_string(),
            client: client.map(|c| c.to_string()),
            lease: lease.clone(),
        };
        self.remember(entry.clone());

        if self.writes_since_rewrite >= REWRITE_AFTER_WRITES {
            self.rewrite()?;
        }
        self.writes_since_rewrite += 1;

        if self.file.is_none() {
            // First write after recovery compacts the recovered state
            // into a fresh file.
            self.rewrite()?;
        } else {
            let text = emit_lease(&entry);
            if let Some(fd) = self.file.as_mut() {
                fd.write_all(text.as_bytes())?;
                fd.flush()?;
            }
        }

        if makesure {
            if let Some(fd) = self.file.as_ref() {
                fd.sync_all()?;
            }
        }
        Ok(())
    }

    /// Full rewrite: DUID, preserved lease6 blocks, then every known
    /// dynamic lease. Resets the append counter.
    pub fn rewrite(&mut self) -> Result<(), DhcpError> {
        let mut fd = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path.as_path())?;
        fd.seek(SeekFrom::Start(0))?;
        if let Some(duid) = self.duid.as_ref() {
            fd.write_all(
                format!("default-duid {};\n", duid.to_hex()).as_bytes(),
            )?;
        }
        for block in &self.v6_blocks {
            fd.write_all(block.as_bytes())?;
            fd.write_all(b"\n")?;
        }
        for entry in &self.entries {
            fd.write_all(emit_lease(entry).as_bytes())?;
        }
        fd.flush()?;
        self.file = Some(fd);
        self.writes_since_rewrite = 0;
        Ok(())
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn emit_lease(entry: &JournalEntry) -> String {
    let lease = &entry.lease;
    let mut out = String::new();
    out.push_str("lease {\n");
    if lease.is_bootp {
        out.push_str("  bootp;\n");
    }
    out.push_str(&format!("  interface {};\n", quote(&entry.iface)));
    if let Some(client) = entry.client.as_ref() {
        out.push_str(&format!("  name {};\n", quote(client)));
    }
    out.push_str(&format!("  fixed-address {};\n", lease.address));
    if let Some(filename) = lease.filename.as_ref() {
        out.push_str(&format!("  filename {};\n", quote(filename)));
    }
    if let Some(server_name) = lease.server_name.as_ref() {
        out.push_str(&format!("  server-name {};\n", quote(server_name)));
    }
    if let Some(medium) = lease.medium.as_ref() {
        out.push_str(&format!("  medium {};\n", quote(medium)));
    }
    for (code, value) in lease.options.iter_universe(&Universe::Dhcp) {
        let data = match value.evaluate(code) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let format = crate::dhcpv4::options::def_by_code(code)
            .map(|d| d.format)
            .unwrap_or(OptFormat::Bytes);
        let printed = pretty_print_option(code, &data, true);
        let printed = if format == OptFormat::Text {
            quote(&printed)
        } else {
            printed
        };
        out.push_str(&format!("  option {} {};\n", option_name(code), printed));
    }
    out.push_str(&format!("  renew {};\n", format_lease_time(lease.renewal)));
    out.push_str(&format!("  rebind {};\n", format_lease_time(lease.rebind)));
    out.push_str(&format!("  expire {};\n", format_lease_time(lease.expiry)));
    out.push_str("}\n");
    out
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum Token {
    Ident(String),
    /// Quoted string, kept as raw bytes: a quoted DUID may hold
    /// arbitrary octal-escaped octets that are not UTF-8.
    Str(Vec<u8>),
    LBrace,
    RBrace,
    Semi,
}

enum Item {
    Duid(Duid),
    Lease(Box<JournalEntry>),
    V6Block(String),
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(Token, usize)>,
    index: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            tokens: tokenize(input),
            index: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let ret = self.tokens.get(self.index).map(|(t, _)| t.clone());
        if ret.is_some() {
            self.index += 1;
        }
        ret
    }

    fn expect_semi(&mut self) -> Result<(), DhcpError> {
        match self.next() {
            Some(Token::Semi) => Ok(()),
            other => Err(parse_err(format!("expected ';', got {other:?}"))),
        }
    }

    /// After a parse error, advance past the current statement or
    /// brace block so recovery can continue with the next item.
    fn skip_to_next_item(&mut self) -> bool {
        let mut depth = 0i32;
        while let Some(token) = self.next() {
            match token {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth -= 1;
                    if depth <= 0 {
                        return true;
                    }
                }
                Token::Semi if depth == 0 => return true,
                _ => (),
            }
        }
        false
    }

    fn next_item(&mut self) -> Result<Option<Item>, DhcpError> {
        let keyword = loop {
            match self.next() {
                None => return Ok(None),
                Some(Token::Ident(word)) => break word,
                Some(other) => {
                    return Err(parse_err(format!(
                        "expected statement keyword, got {other:?}"
                    )));
                }
            }
        };
        match keyword.as_str() {
            "default-duid" => {
                let duid = match self.next() {
                    Some(Token::Str(bytes)) => Duid::from_bytes(bytes),
                    Some(Token::Ident(word)) => Duid::from_hex(&word)?,
                    other => {
                        return Err(parse_err(format!(
                            "invalid default-duid value {other:?}"
                        )));
                    }
                };
                self.expect_semi()?;
                Ok(Some(Item::Duid(duid)))
            }
            "lease" => Ok(Some(Item::Lease(Box::new(self.parse_lease()?)))),
            "lease6" => Ok(Some(Item::V6Block(self.capture_block("lease6")?))),
            other => Err(parse_err(format!("unknown statement '{other}'"))),
        }
    }

    /// Capture the raw text of `<keyword> { ... }` without interpreting
    /// it, nested braces included. The keyword token has already been
    /// consumed; its offset marks the start of the raw block.
    fn capture_block(&mut self, keyword: &str) -> Result<String, DhcpError> {
        let start = match self.tokens.get(self.index.saturating_sub(1)) {
            Some((Token::Ident(_), offset)) => *offset,
            _ => {
                return Err(parse_err(format!(
                    "misplaced {keyword} block"
                )));
            }
        };
        if !matches!(self.peek(), Some(Token::LBrace)) {
            return Err(parse_err(format!(
                "expected '{{' after {keyword}"
            )));
        }
        let mut depth = 0i32;
        while let Some((token, offset)) = self.tokens.get(self.index) {
            let offset = *offset;
            let token = token.clone();
            self.index += 1;
            match token {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.input[start..=offset].to_string());
                    }
                }
                _ => (),
            }
        }
        Err(parse_err(format!("unterminated {keyword} block")))
    }

    fn parse_lease(&mut self) -> Result<JournalEntry, DhcpError> {
        match self.next() {
            Some(Token::LBrace) => (),
            other => {
                return Err(parse_err(format!(
                    "expected '{{' after lease, got {other:?}"
                )));
            }
        }
        let mut entry = JournalEntry {
            iface: String::new(),
            client: None,
            lease: ClientLease::default(),
        };
        loop {
            let keyword = match self.next() {
                Some(Token::RBrace) => break,
                Some(Token::Ident(word)) => word,
                other => {
                    return Err(parse_err(format!(
                        "expected lease statement, got {other:?}"
                    )));
                }
            };
            match keyword.as_str() {
                "bootp" => {
                    entry.lease.is_bootp = true;
                    self.expect_semi()?;
                }
                "interface" => {
                    entry.iface = self.parse_quoted()?;
                }
                "name" => {
                    entry.client = Some(self.parse_quoted()?);
                }
                "fixed-address" => {
                    let word = self.parse_word()?;
                    entry.lease.address =
                        Ipv4Addr::from_str(&word).map_err(|e| {
                            parse_err(format!(
                                "invalid fixed-address {word}: {e}"
                            ))
                        })?;
                }
                "next-server" => {
                    let word = self.parse_word()?;
                    entry.lease.next_server = Ipv4Addr::from_str(&word)
                        .map_err(|e| {
                            parse_err(format!(
                                "invalid next-server {word}: {e}"
                            ))
                        })?;
                }
                "filename" => {
                    entry.lease.filename = Some(self.parse_quoted()?);
                }
                "server-name" => {
                    entry.lease.server_name = Some(self.parse_quoted()?);
                }
                "medium" => {
                    entry.lease.medium = Some(self.parse_quoted()?);
                }
                "option" => self.parse_option(&mut entry.lease)?,
                "renew" => {
                    entry.lease.renewal = self.parse_time()?;
                }
                "rebind" => {
                    entry.lease.rebind = self.parse_time()?;
                }
                "expire" => {
                    entry.lease.expiry = self.parse_time()?;
                }
                other => {
                    // Unknown statements are tolerated so newer files
                    // still recover.
                    log::debug!("Ignoring lease statement '{other}'");
                    while !matches!(self.peek(), Some(Token::Semi) | None) {
                        self.next();
                    }
                    self.expect_semi()?;
                }
            }
        }
        if entry.lease.address == Ipv4Addr::UNSPECIFIED {
            return Err(parse_err(
                "lease block without fixed-address".to_string(),
            ));
        }
        if !entry.lease.times_ordered() {
            return Err(parse_err(format!(
                "lease {} has unordered renew/rebind/expire times",
                entry.lease.address
            )));
        }
        Ok(entry)
    }

    fn parse_quoted(&mut self) -> Result<String, DhcpError> {
        let ret = match self.next() {
            Some(Token::Str(bytes)) => {
                String::from_utf8_lossy(bytes.as_slice()).to_string()
            }
            other => {
                return Err(parse_err(format!(
                    "expected quoted string, got {other:?}"
                )));
            }
        };
        self.expect_semi()?;
        Ok(ret)
    }

    fn parse_word(&mut self) -> Result<String, DhcpError> {
        let ret = match self.next() {
            Some(Token::Ident(word)) => word,
            other => {
                return Err(parse_err(format!(
                    "expected word, got {other:?}"
                )));
            }
        };
        self.expect_semi()?;
        Ok(ret)
    }

    fn parse_time(&mut self) -> Result<i64, DhcpError> {
        let mut words = Vec::new();
        loop {
            match self.next() {
                Some(Token::Semi) => break,
                Some(Token::Ident(word)) => words.push(word),
                other => {
                    return Err(parse_err(format!(
                        "invalid time token {other:?}"
                    )));
                }
            }
        }
        let refs: Vec<&str> = words.iter().map(|s| s.as_str()).collect();
        parse_lease_time(&refs)
    }

    fn parse_option(
        &mut self,
        lease: &mut ClientLease,
    ) -> Result<(), DhcpError> {
        let name = match self.next() {
            Some(Token::Ident(word)) => word,
            other => {
                return Err(parse_err(format!(
                    "expected option name, got {other:?}"
                )));
            }
        };
        let mut words = Vec::new();
        let mut quoted = None;
        loop {
            match self.next() {
                Some(Token::Semi) => break,
                Some(Token::Ident(word)) => words.push(word),
                Some(Token::Str(bytes)) => quoted = Some(bytes),
                other => {
                    return Err(parse_err(format!(
                        "invalid option value token {other:?}"
                    )));
                }
            }
        }

        let (code, format) = match def_by_name(&name) {
            Some(def) => (def.code, def.format),
            None => match name.strip_prefix("unknown-") {
                Some(num) => (
                    num.parse::<u8>().map_err(|e| {
                        parse_err(format!("invalid option name {name}: {e}"))
                    })?,
                    OptFormat::Bytes,
                ),
                None => {
                    log::debug!("Ignoring unknown option '{name}'");
                    return Ok(());
                }
            },
        };
        let data = match quoted {
            Some(bytes) => bytes,
            None => parse_option_text(format, &words.join(" "))
                .map_err(|e| parse_err(format!("option {name}: {e}")))?,
        };
        lease.options.save_dhcp_raw(code, &data);
        Ok(())
    }
}

fn parse_err(msg: String) -> DhcpError {
    DhcpError::new(ErrorKind::InvalidLeaseFile, msg)
}

fn tokenize(input: &str) -> Vec<(Token, usize)> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '{' => {
                tokens.push((Token::LBrace, i));
                i += 1;
            }
            '}' => {
                tokens.push((Token::RBrace, i));
                i += 1;
            }
            ';' => {
                tokens.push((Token::Semi, i));
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut value = Vec::new();
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        i += 1;
                        match bytes[i] {
                            b'\\' => value.push(b'\\'),
                            b'"' => value.push(b'"'),
                            b'0'..=b'7' => {
                                // Up to three octal digits.
                                let mut v = 0u32;
                                let mut n = 0;
                                while n < 3
                                    && i < bytes.len()
                                    && bytes[i].is_ascii_digit()
                                    && bytes[i] < b'8'
                                {
                                    v = v * 8 + u32::from(bytes[i] - b'0');
                                    i += 1;
                                    n += 1;
                                }
                                i -= 1;
                                value.push(v as u8);
                            }
                            other => value.push(other),
                        }
                        i += 1;
                    } else {
                        value.push(bytes[i]);
                        i += 1;
                    }
                }
                i += 1; // closing quote
                tokens.push((Token::Str(value), start));
            }
            _ => {
                let start = i;
                while i < bytes.len()
                    && !b" \t\r\n\"{};#".contains(&bytes[i])
                {
                    i += 1;
                }
                tokens.push((
                    Token::Ident(input[start..i].to_string()),
                    start,
                ));
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcpv4::options::{
        DHO_DOMAIN_NAME, DHO_DOMAIN_NAME_SERVERS, DHO_LEASE_TIME,
        DHO_SERVER_IDENTIFIER, DHO_SUBNET_MASK,
    };
    use crate::iface::HwAddr;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "lessee_journal_test_{}_{}",
            tag,
            std::process::id()
        ))
    }

    fn sample_lease(address: Ipv4Addr) -> ClientLease {
        let mut lease = ClientLease {
            address,
            next_server: Ipv4Addr::new(192, 0, 2, 2),
            server_name: Some("boot.example".to_string()),
            filename: Some("pxe/loader".to_string()),
            expiry: 1_700_000_600,
            renewal: 1_700_000_300,
            rebind: 1_700_000_525,
            ..Default::default()
        };
        lease
            .options
            .save_dhcp_raw(DHO_SUBNET_MASK, &[255, 255, 255, 0]);
        lease
            .options
            .save_dhcp_raw(DHO_SERVER_IDENTIFIER, &[192, 0, 2, 1]);
        lease
            .options
            .save_dhcp_raw(DHO_LEASE_TIME, &600u32.to_be_bytes());
        lease.options.save_dhcp_raw(
            DHO_DOMAIN_NAME_SERVERS,
            &[192, 0, 2, 53, 192, 0, 2, 54],
        );
        lease
            .options
            .save_dhcp_raw(DHO_DOMAIN_NAME, b"example.org");
        lease
    }

    #[test]
    fn test_write_and_recover_round_trip() {
        let path = temp_path("round_trip");
        let _ = std::fs::remove_file(&path);

        let mut journal = LeaseJournal::new(&path);
        let hw = HwAddr::new_ethernet([0, 0x23, 0x45, 0x67, 0x89, 0x1a]);
        journal.set_duid(Duid::new_ll(&hw));
        let lease = sample_lease(Ipv4Addr::new(192, 0, 2, 50));
        journal.write_lease("eth0", None, &lease, false).unwrap();

        let mut recovered = LeaseJournal::new(&path);
        recovered.recover().unwrap();
        assert_eq!(recovered.duid(), journal.duid());
        assert_eq!(recovered.entries().len(), 1);
        let entry = &recovered.entries()[0];
        assert_eq!(entry.iface, "eth0");
        assert_eq!(entry.lease.address, Ipv4Addr::new(192, 0, 2, 50));
        assert_eq!(entry.lease.expiry, lease.expiry);
        assert_eq!(entry.lease.renewal, lease.renewal);
        assert_eq!(entry.lease.rebind, lease.rebind);
        assert_eq!(entry.lease.server_name, lease.server_name);
        assert_eq!(entry.lease.filename, lease.filename);
        assert_eq!(
            entry.lease.options.u32_dhcp(DHO_LEASE_TIME),
            Some(600)
        );
        assert_eq!(
            entry.lease.options.evaluate_dhcp(DHO_DOMAIN_NAME),
            Some(b"example.org".to_vec())
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_duplicate_latest_wins() {
        let path = temp_path("dup");
        let _ = std::fs::remove_file(&path);

        let mut journal = LeaseJournal::new(&path);
        let mut lease = sample_lease(Ipv4Addr::new(192, 0, 2, 50));
        journal.write_lease("eth0", None, &lease, false).unwrap();
        lease.expiry += 600;
        journal.write_lease("eth0", None, &lease, false).unwrap();

        let mut recovered = LeaseJournal::new(&path);
        recovered.recover().unwrap();
        assert_eq!(recovered.entries().len(), 1);
        assert_eq!(recovered.entries()[0].lease.expiry, lease.expiry);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_static_lease_never_persisted() {
        let path = temp_path("static");
        let _ = std::fs::remove_file(&path);

        let mut journal = LeaseJournal::new(&path);
        let lease = ClientLease {
            address: Ipv4Addr::new(192, 0, 2, 99),
            is_static: true,
            ..Default::default()
        };
        journal.write_lease("eth0", None, &lease, false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_compaction_after_twenty_writes() {
        let path = temp_path("compact");
        let _ = std::fs::remove_file(&path);

        let mut journal = LeaseJournal::new(&path);
        let mut lease = sample_lease(Ipv4Addr::new(192, 0, 2, 50));
        for i in 0..25 {
            lease.expiry = 1_700_000_600 + i;
            journal.write_lease("eth0", None, &lease, false).unwrap();
        }
        // After compaction the single current lease remains, not the
        // 25 appended copies.
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.matches("lease {").count() < 25);

        let mut recovered = LeaseJournal::new(&path);
        recovered.recover().unwrap();
        assert_eq!(recovered.entries().len(), 1);
        assert_eq!(recovered.entries()[0].lease.expiry, 1_700_000_624);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_lease6_blocks_preserved() {
        let path = temp_path("v6");
        let _ = std::fs::remove_file(&path);

        let v6_text = "lease6 {\n  interface \"eth0\";\n  ia-na 9f:a4:b2:01 {\n    starts 1700000000;\n    renew 250;\n    rebind 437;\n    iaaddr 2001:db8::99 {\n      starts 1700000000;\n      preferred-life 312;\n      max-life 500;\n    }\n  }\n}";
        std::fs::write(&path, format!("{v6_text}\n")).unwrap();

        let mut journal = LeaseJournal::new(&path);
        journal.recover().unwrap();
        let lease = sample_lease(Ipv4Addr::new(192, 0, 2, 50));
        journal.write_lease("eth0", None, &lease, false).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("ia-na 9f:a4:b2:01"));
        assert!(content.contains("iaaddr 2001:db8::99"));
        assert!(content.contains("fixed-address 192.0.2.50"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_recovery_skips_garbage_blocks() {
        let path = temp_path("garbage");
        let _ = std::fs::remove_file(&path);

        let good = emit_lease(&JournalEntry {
            iface: "eth0".to_string(),
            client: None,
            lease: sample_lease(Ipv4Addr::new(192, 0, 2, 50)),
        });
        std::fs::write(
            &path,
            format!(
                "lease {{\n  fixed-address not-an-address;\n}}\n{good}"
            ),
        )
        .unwrap();

        let mut journal = LeaseJournal::new(&path);
        journal.recover().unwrap();
        assert_eq!(journal.entries().len(), 1);
        assert_eq!(
            journal.entries()[0].lease.address,
            Ipv4Addr::new(192, 0, 2, 50)
        );

        let _ = std::fs::remove_file(&path);
    }
}
