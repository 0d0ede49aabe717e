//! On-disk implementation of the UCI tree.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::error;

use super::{UciError, UciTree};

/// A single section: its type, and the options in file order.
#[derive(Debug, Clone, Default)]
struct Section {
    section_type: String,
    /// `None` for anonymous sections.
    name: Option<String>,
    options: Vec<(String, OptionValue)>,
}

#[derive(Debug, Clone)]
enum OptionValue {
    Plain(String),
    List(Vec<String>),
}

/// The parsed contents of one namespace file.
#[derive(Debug, Clone, Default)]
struct Package {
    sections: Vec<Section>,
}

impl Package {
    fn section(&self, key: &str) -> Option<&Section> {
        self.sections
            .iter()
            .enumerate()
            .find(|(i, s)| section_key(s, *i) == key)
            .map(|(_, s)| s)
    }

    fn section_mut(&mut self, key: &str) -> Option<&mut Section> {
        let idx = self
            .sections
            .iter()
            .enumerate()
            .find(|(i, s)| section_key(s, *i) == key)
            .map(|(i, _)| i)?;
        Some(&mut self.sections[idx])
    }
}

/// The lookup key of a section: its name, or a synthetic `@type[index]` for anonymous sections.
fn section_key(section: &Section, index: usize) -> String {
    match &section.name {
        Some(name) => name.clone(),
        None => format!("@{}[{}]", section.section_type, index),
    }
}

struct Inner {
    packages: HashMap<String, Package>,
    dirty: HashSet<String>,
}

/// UCI tree backed by the on-disk configuration directory.
///
/// Namespaces are loaded lazily and edits are buffered in memory. [`commit`](UciTree::commit)
/// writes every touched namespace with a write-to-temp-and-rename so a crash never leaves a half
/// written config file behind.
pub struct FsTree {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl FsTree {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            inner: Mutex::new(Inner {
                packages: HashMap::new(),
                dirty: HashSet::new(),
            }),
        }
    }

    fn load(&self, inner: &mut Inner, ns: &str) -> Result<(), UciError> {
        if inner.packages.contains_key(ns) {
            return Ok(());
        }
        let path = self.root.join(ns);
        let package = match fs::read_to_string(&path) {
            Ok(content) => parse_package(ns, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Package::default(),
            Err(e) => return Err(e.into()),
        };
        inner.packages.insert(ns.to_string(), package);
        Ok(())
    }

    fn with_section<R>(
        &self,
        ns: &str,
        section: &str,
        f: impl FnOnce(&mut Section) -> R,
    ) -> Result<R, UciError> {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner, ns)?;
        let package = inner.packages.get_mut(ns).expect("namespace just loaded");
        let Some(section) = package.section_mut(section) else {
            return Err(UciError::SectionNotFound {
                ns: ns.to_string(),
                section: section.to_string(),
            });
        };
        let result = f(section);
        inner.dirty.insert(ns.to_string());
        Ok(result)
    }
}

impl UciTree for FsTree {
    fn get(&self, ns: &str, section: &str, option: &str) -> Option<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        if let Err(e) = self.load(&mut inner, ns) {
            error!(ns, err = %e, "failed to load config namespace");
            return None;
        }
        let section = inner.packages.get(ns)?.section(section)?;
        section
            .options
            .iter()
            .rev()
            .find(|(key, _)| key == option)
            .map(|(_, value)| match value {
                OptionValue::Plain(v) => vec![v.clone()],
                OptionValue::List(vs) => vs.clone(),
            })
    }

    fn set_option(
        &self,
        ns: &str,
        section: &str,
        option: &str,
        value: &str,
    ) -> Result<(), UciError> {
        self.with_section(ns, section, |section| {
            section.options.retain(|(key, _)| key != option);
            section
                .options
                .push((option.to_string(), OptionValue::Plain(value.to_string())));
        })
    }

    fn set_list(
        &self,
        ns: &str,
        section: &str,
        option: &str,
        values: &[String],
    ) -> Result<(), UciError> {
        self.with_section(ns, section, |section| {
            section.options.retain(|(key, _)| key != option);
            section
                .options
                .push((option.to_string(), OptionValue::List(values.to_vec())));
        })
    }

    fn del(&self, ns: &str, section: &str, option: &str) -> Result<(), UciError> {
        self.with_section(ns, section, |section| {
            section.options.retain(|(key, _)| key != option);
        })
    }

    fn add_section(&self, ns: &str, section: &str, section_type: &str) -> Result<(), UciError> {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner, ns)?;
        let package = inner.packages.get_mut(ns).expect("namespace just loaded");
        if package.section(section).is_some() {
            return Ok(());
        }
        package.sections.push(Section {
            section_type: section_type.to_string(),
            name: Some(section.to_string()),
            options: Vec::new(),
        });
        inner.dirty.insert(ns.to_string());
        Ok(())
    }

    fn del_section(&self, ns: &str, section: &str) -> Result<(), UciError> {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner, ns)?;
        let package = inner.packages.get_mut(ns).expect("namespace just loaded");
        let before = package.sections.len();
        let mut index = 0;
        package.sections.retain(|s| {
            let keep = section_key(s, index) != section;
            index += 1;
            keep
        });
        if package.sections.len() != before {
            inner.dirty.insert(ns.to_string());
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), UciError> {
        let mut inner = self.inner.lock().unwrap();
        let dirty: Vec<String> = inner.dirty.iter().cloned().collect();
        for ns in dirty {
            let package = inner.packages.get(&ns).expect("dirty namespace is loaded");
            let serialized = serialize_package(package);

            fs::create_dir_all(&self.root)?;
            let path = self.root.join(&ns);
            let tmp_path = self.root.join(format!(".{ns}.tmp"));
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(serialized.as_bytes())?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, &path)?;

            inner.dirty.remove(&ns);
        }
        Ok(())
    }

    fn reload(&self) -> Result<(), UciError> {
        let mut inner = self.inner.lock().unwrap();
        inner.dirty.clear();
        let loaded: Vec<String> = inner.packages.keys().cloned().collect();
        inner.packages.clear();
        for ns in loaded {
            self.load(&mut inner, &ns)?;
        }
        Ok(())
    }
}

fn parse_package(ns: &str, content: &str) -> Result<Package, UciError> {
    let mut package = Package::default();

    for (line_no, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens = tokenize(line).ok_or(UciError::Parse {
            ns: ns.to_string(),
            line: line_no + 1,
        })?;
        let parse_err = || UciError::Parse {
            ns: ns.to_string(),
            line: line_no + 1,
        };

        match tokens.first().map(String::as_str) {
            Some("config") => {
                let section_type = tokens.get(1).ok_or_else(parse_err)?.clone();
                package.sections.push(Section {
                    section_type,
                    name: tokens.get(2).cloned(),
                    options: Vec::new(),
                });
            }
            Some("option") => {
                let key = tokens.get(1).ok_or_else(parse_err)?.clone();
                let value = tokens.get(2).cloned().unwrap_or_default();
                let section = package.sections.last_mut().ok_or_else(parse_err)?;
                section.options.push((key, OptionValue::Plain(value)));
            }
            Some("list") => {
                let key = tokens.get(1).ok_or_else(parse_err)?.clone();
                let value = tokens.get(2).cloned().unwrap_or_default();
                let section = package.sections.last_mut().ok_or_else(parse_err)?;
                match section.options.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, OptionValue::List(values))) => values.push(value),
                    Some(entry) => *entry = (key, OptionValue::List(vec![value])),
                    None => section.options.push((key, OptionValue::List(vec![value]))),
                }
            }
            _ => return Err(parse_err()),
        }
    }

    Ok(package)
}

/// Split a config line into words, honoring single and double quoted values.
fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '\'' || c == '"' {
            let quote = c;
            chars.next();
            loop {
                match chars.next() {
                    Some(c) if c == quote => break,
                    Some(c) => token.push(c),
                    // Unterminated quote.
                    None => return None,
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Some(tokens)
}

fn serialize_package(package: &Package) -> String {
    let mut out = String::new();
    for section in &package.sections {
        out.push_str("config ");
        out.push_str(&section.section_type);
        if let Some(name) = &section.name {
            out.push(' ');
            out.push_str(&quote(name));
        }
        out.push('\n');
        for (key, value) in &section.options {
            match value {
                OptionValue::Plain(v) => {
                    out.push_str("\toption ");
                    out.push_str(key);
                    out.push(' ');
                    out.push_str(&quote(v));
                    out.push('\n');
                }
                OptionValue::List(vs) => {
                    for v in vs {
                        out.push_str("\tlist ");
                        out.push_str(key);
                        out.push(' ');
                        out.push_str(&quote(v));
                        out.push('\n');
                    }
                }
            }
        }
        out.push('\n');
    }
    out
}

fn quote(value: &str) -> String {
    if value.contains('\'') {
        format!("\"{value}\"")
    } else {
        format!("'{value}'")
    }
}
