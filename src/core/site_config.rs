//! Site configuration blobs and encryption-key carry-forward.
//!
//! A restored database is only readable with the key it was encrypted under, so
//! the key from the backup's configuration artifact replaces whatever key the
//! destination site has. Only the key's value bytes change; every other byte of
//! the destination document is preserved.

use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::remote::FileChannel;
use crate::error::{Error, Result};

pub const ENCRYPTION_KEY_FIELD: &str = "encryption_key";

/// A JSON object document kept as its original text.
#[derive(Debug, Clone)]
pub struct ConfigBlob {
    text: String,
    fields: Map<String, Value>,
}

impl ConfigBlob {
    pub fn parse(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let fields = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return Err(Error::Precondition("site configuration is not a JSON object".into())),
            Err(e) => return Err(Error::Precondition(format!("site configuration is not valid JSON: {e}"))),
        };
        Ok(Self { text, fields })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn encryption_key(&self) -> Option<&str> {
        self.fields.get(ENCRYPTION_KEY_FIELD).and_then(Value::as_str)
    }

    /// A copy whose `encryption_key` is `key`, all other bytes untouched.
    pub fn with_encryption_key(&self, key: &str) -> Result<Self> {
        let encoded = serde_json::to_string(key).map_err(|e| Error::Precondition(e.to_string()))?;

        let text = match find_top_level_value(&self.text, ENCRYPTION_KEY_FIELD) {
            Some(span) => {
                let mut text = self.text.clone();
                text.replace_range(span, &encoded);
                text
            }
            None => insert_member(&self.text, ENCRYPTION_KEY_FIELD, &encoded)?,
        };

        let updated = Self::parse(text)?;
        let mut expected = self.fields.clone();
        expected.insert(ENCRYPTION_KEY_FIELD.to_string(), Value::String(key.to_string()));
        if updated.fields != expected {
            return Err(Error::Precondition(
                "rewriting the encryption key would alter other configuration fields".into(),
            ));
        }
        Ok(updated)
    }
}

/// Index one past the closing quote of the string starting at `start`.
fn string_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn value_end(bytes: &[u8], start: usize) -> usize {
    match bytes.get(start) {
        Some(b'"') => string_end(bytes, start),
        Some(b'{' | b'[') => {
            let mut depth = 0usize;
            let mut i = start;
            while i < bytes.len() {
                match bytes[i] {
                    b'"' => {
                        i = string_end(bytes, i);
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return i + 1;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            bytes.len()
        }
        _ => {
            let mut i = start;
            while i < bytes.len() && !matches!(bytes[i], b',' | b'}' | b']') && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            i
        }
    }
}

/// Byte range of the value of top-level member `field`.
fn find_top_level_value(text: &str, field: &str) -> Option<Range<usize>> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let end = string_end(bytes, i);
                let after = skip_ws(bytes, end);
                let is_key = bytes.get(after) == Some(&b':');
                if depth == 1 && is_key && text.get(i + 1..end - 1) == Some(field) {
                    let value_start = skip_ws(bytes, after + 1);
                    return Some(value_start..value_end(bytes, value_start));
                }
                i = end;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    None
}

fn insert_member(text: &str, field: &str, encoded: &str) -> Result<String> {
    let close = text
        .rfind('}')
        .ok_or_else(|| Error::Precondition("site configuration has no closing brace".into()))?;
    let body_end = text[..close].trim_end().len();
    let empty = text[..body_end].ends_with('{');

    // Indent like the first member, if there is one on its own line.
    let indent: String = text
        .find('{')
        .and_then(|open| text[open + 1..].strip_prefix('\n').or_else(|| text[open + 1..].strip_prefix("\r\n")))
        .map(|rest| rest.chars().take_while(|c| *c == ' ' || *c == '\t').collect())
        .unwrap_or_default();
    let separator = if indent.is_empty() { " " } else { "\n" };

    let mut out = String::with_capacity(text.len() + field.len() + encoded.len() + 8);
    out.push_str(&text[..body_end]);
    if !empty {
        out.push(',');
    }
    out.push_str(separator);
    out.push_str(&indent);
    out.push_str(&format!("\"{field}\": {encoded}"));
    out.push_str(&text[body_end..]);
    Ok(out)
}

/// What carrying the key forward did to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCarry {
    Replaced,
    AlreadyMatching,
    Inserted,
    /// The destination had no configuration file; one holding only the key was written.
    Created,
    /// The backup's configuration has no key; the destination was left alone.
    NoKeyInBackup,
}

pub fn read_blob(channel: &mut dyn FileChannel, path: &Path) -> Result<Option<ConfigBlob>> {
    if channel.stat(path)?.is_none() {
        return Ok(None);
    }
    let mut text = String::new();
    channel.open_read(path, 0)?.read_to_string(&mut text)?;
    ConfigBlob::parse(text).map(Some)
}

fn write_atomically(channel: &mut dyn FileChannel, path: &Path, text: &str) -> Result<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".siteback-tmp");
    let tmp: PathBuf = path.with_file_name(tmp_name);

    let mut writer = channel.open_write(&tmp, 0)?;
    writer.write_all(text.as_bytes())?;
    writer.sync()?;
    drop(writer);
    channel.rename(&tmp, path)?;
    Ok(())
}

/// Write the backup's encryption key into the destination site configuration.
pub fn carry_forward_key(backup: &ConfigBlob, channel: &mut dyn FileChannel, destination: &Path) -> Result<KeyCarry> {
    let Some(key) = backup.encryption_key() else {
        info!("Backup configuration holds no encryption key, leaving destination unchanged");
        return Ok(KeyCarry::NoKeyInBackup);
    };

    let Some(current) = read_blob(channel, destination)? else {
        let mut fields = Map::new();
        fields.insert(ENCRYPTION_KEY_FIELD.to_string(), Value::String(key.to_string()));
        let text = serde_json::to_string_pretty(&Value::Object(fields)).map_err(|e| Error::Precondition(e.to_string()))?;
        write_atomically(channel, destination, &text)?;
        info!(path = %destination.display(), "Created site configuration with carried-forward key");
        return Ok(KeyCarry::Created);
    };

    if current.encryption_key() == Some(key) {
        debug!("Destination already holds the backup's encryption key");
        return Ok(KeyCarry::AlreadyMatching);
    }

    let had_key = current.get(ENCRYPTION_KEY_FIELD).is_some();
    let updated = current.with_encryption_key(key)?;
    write_atomically(channel, destination, updated.as_str())?;
    info!(path = %destination.display(), "Carried encryption key forward");
    Ok(if had_key { KeyCarry::Replaced } else { KeyCarry::Inserted })
}
