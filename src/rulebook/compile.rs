//! Compiling a rule script (itself parsed into a tree by
//! [`parse_xml_to_tree`]) into a [`Rulebook`], and the bootstrap that gets
//! a script tree in the first place without a rulebook of its own.

use log::{trace, warn};

use crate::atom::Atom;
use crate::error::{ParrotError, Result};
use crate::rulebook::{check_state_id, Action, Rulebook};
use crate::segment::FlexibleMemory;
use crate::strtab::ImmutableStringTable;
use crate::tree::{NodeType, Tree};
use crate::xml::{Source, TokenKind};

/// Script-tree nesting the compiler walks is at most `<script><state>
/// <rule/></state></script>` deep; four in-flight parents covers that
/// with room to spare, matching the depth bound the design notes place
/// on the compiler's own stack.
const MAX_COMPILE_DEPTH: usize = 4;

/// Parse plain XML directly into a persistent [`Tree`], with no rulebook
/// in the loop — every element and attribute is saved, every text node
/// is saved verbatim. This is how a rule script (itself XML) gets turned
/// into a tree before the *real* compiler in this module walks it; it's
/// also a reasonable generic "just parse the document" entry point when
/// no rule-driven filtering is wanted.
pub fn parse_xml_to_tree<'seg>(tree: &Tree<'seg>, strings: &ImmutableStringTable<'seg>, source: &mut Source) -> Result<Atom> {
    let mut stack: Vec<Atom> = Vec::with_capacity(MAX_COMPILE_DEPTH);
    let mut current: Atom = None;
    let mut root: Atom = None;

    loop {
        let tok = source.next_token();
        match tok.kind {
            TokenKind::Eof => break,
            TokenKind::Fail => return Err(ParrotError::Fail { line: 0 }),
            TokenKind::Open | TokenKind::Empty => {
                let name = strings.intern(append_nul(tok.data.unwrap_or(&[])).as_slice())?;
                let node_type = if tok.kind == TokenKind::Open { NodeType::Open } else { NodeType::Empty };
                let node = tree.create(node_type, name, None, current)?;
                if root.is_none() {
                    root = Some(node.expect("freshly created node is never null"));
                }
                save_attributes(tree, strings, node, tok.rest.unwrap_or(&[]))?;
                if tok.kind == TokenKind::Open {
                    stack.push(current);
                    current = node;
                }
            }
            TokenKind::Close => {
                current = stack.pop().unwrap_or(None);
            }
            TokenKind::Text => {
                let bytes = tok.data.unwrap_or(&[]);
                if !bytes.is_empty() {
                    let text_node = tree.create(NodeType::Text, None, None, current)?;
                    let content = strings.intern(bytes)?;
                    tree.set_content(text_node, content);
                }
            }
            TokenKind::Comment | TokenKind::Pi | TokenKind::Dtd | TokenKind::Attr | TokenKind::Ns => {
                trace!("skipping {:?} token while parsing a script tree", tok.kind);
            }
        }
    }
    Ok(root)
}

fn append_nul(bytes: &[u8]) -> Vec<u8> {
    let mut v = bytes.to_vec();
    v.push(0);
    v
}

fn save_attributes<'seg>(tree: &Tree<'seg>, strings: &ImmutableStringTable<'seg>, parent: Atom, mut rest: &[u8]) -> Result<()> {
    while let Some((kind, name, value)) = Source::next_attr(&mut rest) {
        let node_type = if kind == TokenKind::Ns { NodeType::Namespace } else { NodeType::Attribute };
        let name_atom = strings.intern(append_nul(name).as_slice())?;
        let attr = tree.create(node_type, name_atom, None, parent)?;
        let value_atom = strings.intern(value)?;
        tree.set_content(attr, value_atom);
    }
    Ok(())
}

fn attr_text<'seg>(tree: &Tree<'seg>, strings: &ImmutableStringTable<'seg>, node: Atom, attr_name: &str) -> Option<Vec<u8>> {
    let wanted = attr_name.as_bytes();
    for child in tree.children(node) {
        if tree.node_type(child) != NodeType::Attribute {
            continue;
        }
        let name_bytes = strings.deref(tree.name(child)?)?;
        let matches = name_bytes.len() == wanted.len() + 1 && &name_bytes[..wanted.len()] == wanted && name_bytes[wanted.len()] == 0;
        if matches {
            let content = tree.content(child)?;
            return strings.deref(content).map(|b| b.to_vec());
        }
    }
    None
}

fn parse_decimal(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() {
        return None;
    }
    let mut v: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }
    Some(v)
}

/// Compile a parsed `<script>` tree into a [`Rulebook`]: one pass per
/// `<state>`, allocating a rule record (and adding its tag to a bitmap)
/// per child `<rule>`.
pub fn compile<'seg>(rulebook: &Rulebook<'seg>, tree: &Tree<'seg>, strings: &ImmutableStringTable<'seg>, script_root: Atom) -> Result<()> {
    for state_node in tree.children(script_root) {
        if tree.node_type(state_node) != NodeType::Open && tree.node_type(state_node) != NodeType::Empty {
            continue;
        }
        let Some(id_bytes) = attr_text(tree, strings, state_node, "id") else {
            warn!("<state> with no id attribute, skipping");
            continue;
        };
        let Some(id_raw) = parse_decimal(&id_bytes) else {
            warn!("<state> id {:?} is not decimal, skipping", String::from_utf8_lossy(&id_bytes));
            continue;
        };
        let id = check_state_id(id_raw)?;
        let default_action = attr_text(tree, strings, state_node, "action").map(|a| Action::from_name(&a)).unwrap_or(Action::None);

        let state = rulebook.state_mut(id);
        state.default_action = default_action as u8;
        state.first_rule = 0;
        let mut tail: u32 = 0;

        for rule_node in tree.children(state_node) {
            if tree.node_type(rule_node) != NodeType::Open && tree.node_type(rule_node) != NodeType::Empty {
                continue;
            }
            let Some(tag_bytes) = attr_text(tree, strings, rule_node, "tag") else {
                warn!("<rule> with no tag attribute, skipping");
                continue;
            };
            let mut tag_bytes = tag_bytes;
            tag_bytes.push(0);
            let tag_atom = strings.intern(&tag_bytes)?;

            let action = attr_text(tree, strings, rule_node, "action").map(|a| Action::from_name(&a)).unwrap_or(Action::None);
            let use_tag = match attr_text(tree, strings, rule_node, "use-tag") {
                Some(mut bytes) => {
                    bytes.push(0);
                    strings.intern(&bytes)?
                }
                None => None,
            };
            let new_state = match attr_text(tree, strings, rule_node, "new-state") {
                Some(bytes) => {
                    let raw = parse_decimal(&bytes).ok_or_else(|| ParrotError::Shape { name: "new-state".into() })?;
                    check_state_id(raw)? as u32
                }
                None => 0,
            };

            let rule_atom = rulebook.rules.alloc()?;
            let bitmap_atom = rulebook.bitmaps.alloc()?;
            rulebook.bitmaps.set(bitmap_atom, crate::atom::atom_to_raw(tag_atom))?;

            let rec = rulebook.rules.addr_mut(rule_atom).unwrap().transmute_page_mut::<super::RuleRecord>();
            rec.action = action as u8;
            rec._pad = [0; 3];
            rec.use_tag = crate::atom::atom_to_raw(use_tag);
            rec.new_state = new_state;
            rec.tag_bitmap = crate::atom::atom_to_raw(bitmap_atom);
            rec.next_rule = 0;

            let raw_rule = crate::atom::atom_to_raw(rule_atom);
            if tail == 0 {
                rulebook.state_mut(id).first_rule = raw_rule;
            } else {
                let prev = rulebook.rules.addr_mut(crate::atom::atom_from_raw(tail)).unwrap().transmute_page_mut::<super::RuleRecord>();
                prev.next_rule = raw_rule;
            }
            tail = raw_rule;
        }
        trace!("compiled state {id} with default action {:?}", default_action);
    }
    Ok(())
}

/// Bootstrap convenience: tokenize `source` as a plain rule-script
/// document, build its tree, and compile the result in one call.
pub fn compile_from_xml<'seg>(rulebook: &Rulebook<'seg>, script_tree: &Tree<'seg>, strings: &ImmutableStringTable<'seg>, source: &mut Source) -> Result<()> {
    let root = parse_xml_to_tree(script_tree, strings, source)?;
    let root = root.ok_or_else(|| ParrotError::Shape { name: "<script>".into() })?;
    compile(rulebook, script_tree, strings, Some(root))
}
