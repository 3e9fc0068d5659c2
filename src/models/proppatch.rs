//! Parsing of `<propertyupdate>` request bodies.

use quick_xml::{Reader, events::Event};
use thiserror::Error;

/// Property changes requested by one PROPPATCH, in document order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropPatch {
    /// `(name, text)` pairs from `<set>` blocks. Text from nested markup is
    /// concatenated, then trimmed once.
    pub set: Vec<(String, String)>,
    /// Names from `<remove>` blocks.
    pub remove: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PropPatchError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("undecodable character data")]
    InvalidText,
    #[error("missing propertyupdate element")]
    NotPropertyUpdate,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Set,
    Remove,
}

/// Property element currently being read.
struct Pending {
    name: String,
    value: String,
    /// Elements opened inside the property and not yet closed.
    depth: usize,
}

impl PropPatch {
    /// Every element other than the structural `propertyupdate`, `set`,
    /// `remove` and `prop` names a property. Namespaces are dropped and
    /// names are lower-cased.
    pub fn parse(xml: &[u8]) -> Result<Self, PropPatchError> {
        let mut reader = Reader::from_reader(xml);

        let mut patch = PropPatch::default();
        let mut seen_root = false;
        let mut mode = Mode::Idle;
        let mut pending: Option<Pending> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => {
                    if let Some(p) = pending.as_mut() {
                        p.depth += 1;
                    } else {
                        let name = local_name(e.local_name().as_ref());
                        match name.as_str() {
                            "propertyupdate" => seen_root = true,
                            "set" => mode = Mode::Set,
                            "remove" => mode = Mode::Remove,
                            "prop" => {}
                            _ if mode != Mode::Idle => {
                                pending = Some(Pending {
                                    name,
                                    value: String::new(),
                                    depth: 0,
                                })
                            }
                            _ => {}
                        }
                    }
                }
                Event::Empty(e) => {
                    if pending.is_none() {
                        let name = local_name(e.local_name().as_ref());
                        if !is_structural(&name) {
                            patch.push(mode, name, String::new());
                        }
                    }
                }
                Event::Text(t) => {
                    if let Some(p) = pending.as_mut() {
                        let text = t.unescape().map_err(|_| PropPatchError::InvalidText)?;
                        p.value.push_str(&text);
                    }
                }
                Event::CData(c) => {
                    if let Some(p) = pending.as_mut() {
                        p.value.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Event::End(e) => match pending.take() {
                    Some(mut p) if p.depth > 0 => {
                        p.depth -= 1;
                        pending = Some(p);
                    }
                    Some(p) => patch.push(mode, p.name, p.value),
                    None => {
                        if matches!(local_name(e.local_name().as_ref()).as_str(), "set" | "remove") {
                            mode = Mode::Idle;
                        }
                    }
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !seen_root {
            return Err(PropPatchError::NotPropertyUpdate);
        }
        Ok(patch)
    }

    fn push(&mut self, mode: Mode, name: String, value: String) {
        match mode {
            Mode::Set => self.set.push((name, value.trim().to_string())),
            Mode::Remove => self.remove.push(name),
            Mode::Idle => {}
        }
    }
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

fn is_structural(name: &str) -> bool {
    matches!(name, "propertyupdate" | "set" | "remove" | "prop")
}
