//! Rule / state / rulebook records and the compiled lookup they support.
//!
//! A [`Rulebook`] owns a fixed pool of rules, a fixed pool of states
//! (indexed directly by the script's own 16-bit state id), and a bitmap
//! pool holding each rule's matched-tag set. [`compile`](compile::compile)
//! builds one from an already-parsed script tree; [`driver`] runs it
//! against a live token stream.

pub mod compile;
pub mod driver;

use log::warn;

use crate::atom::{atom_from_raw, atom_to_raw, Atom};
use crate::bitmap::BitmapPool;
use crate::error::{ParrotError, Result};
use crate::pool::FixedPool;
use crate::segment::Segment;

/// The closed set of actions a rule or state default can name. Parsed
/// from the rule script's strings at compile time so the driver never
/// repeats a string comparison at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    None = 0,
    Discard = 1,
    Save = 2,
    SaveSimple = 3,
    SaveWithAttributes = 4,
    Emit = 5,
    Return = 6,
}

impl Action {
    /// Unknown names compile to `None`, with a warning, per the script
    /// compiler's error policy.
    pub fn from_name(name: &[u8]) -> Action {
        match name {
            b"none" => Action::None,
            b"discard" => Action::Discard,
            b"save" => Action::Save,
            b"save-simple" => Action::SaveSimple,
            b"save-with-attributes" => Action::SaveWithAttributes,
            b"emit" => Action::Emit,
            b"return" => Action::Return,
            other => {
                warn!("unknown rulebook action {:?}, compiling as none", String::from_utf8_lossy(other));
                Action::None
            }
        }
    }

    fn from_u8(v: u8) -> Action {
        match v {
            1 => Action::Discard,
            2 => Action::Save,
            3 => Action::SaveSimple,
            4 => Action::SaveWithAttributes,
            5 => Action::Emit,
            6 => Action::Return,
            _ => Action::None,
        }
    }
}

/// State ids are 16-bit per the script format; a script that names a
/// larger id is rejected outright rather than silently truncated (see
/// the "prep phase" open question in the design notes).
pub const MAX_STATE_ID: u32 = u16::MAX as u32;

#[repr(C)]
struct StateRecord {
    default_action: u8,
    _pad: [u8; 3],
    first_rule: u32,
}

#[repr(C)]
struct RuleRecord {
    action: u8,
    _pad: [u8; 3],
    use_tag: u32,
    new_state: u32, // 0 = no state change
    tag_bitmap: u32,
    next_rule: u32,
}

const STATE_RECORD_SIZE: u32 = std::mem::size_of::<StateRecord>() as u32;
const RULE_RECORD_SIZE: u32 = std::mem::size_of::<RuleRecord>() as u32;

/// A matched rule, resolved during [`Rulebook::lookup`].
pub struct Matched {
    pub action: Action,
    pub use_tag: Atom,
    pub new_state: Option<u16>,
}

pub struct Rulebook<'seg> {
    states: FixedPool<'seg>,
    rules: FixedPool<'seg>,
    bitmaps: BitmapPool<'seg>,
}

impl<'seg> Rulebook<'seg> {
    pub fn open(segment: &'seg Segment, name: &str, max_rules: u32, flags: u8) -> Result<Rulebook<'seg>> {
        // States are indexed directly by id (atom = id + 1), so the pool
        // must be sized to cover the whole 16-bit id space up front.
        let states = FixedPool::open(segment, &format!("{name}.states"), 8, STATE_RECORD_SIZE, MAX_STATE_ID + 1, flags | crate::pool::INIT_ZERO)?;
        let rules = FixedPool::open(segment, &format!("{name}.rules"), 6, RULE_RECORD_SIZE, max_rules, flags | crate::pool::INIT_ZERO)?;
        let bitmaps = BitmapPool::open(segment, &format!("{name}.tags"), max_rules, flags)?;
        Ok(Rulebook { states, rules, bitmaps })
    }

    fn state_atom(id: u16) -> Atom {
        atom_from_raw(id as u32 + 1)
    }

    fn state(&self, id: u16) -> &StateRecord {
        self.states.addr(Self::state_atom(id)).expect("state id must resolve").transmute_page::<StateRecord>()
    }

    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self, id: u16) -> &mut StateRecord {
        self.states.addr_mut(Self::state_atom(id)).expect("state id must resolve").transmute_page_mut::<StateRecord>()
    }

    fn rule(&self, atom: Atom) -> &RuleRecord {
        self.rules.addr(atom).expect("rule atom must resolve").transmute_page::<RuleRecord>()
    }

    /// Whether state `id` was ever declared by the compiled script (a
    /// default action other than the zeroed-page default of `None` with
    /// no rules, the same "never touched" signal every other pool here
    /// uses for an unallocated slot).
    pub fn state_declared(&self, id: u16) -> bool {
        let s = self.state(id);
        s.default_action != 0 || s.first_rule != 0
    }

    /// Resolve `(state, tag)` to an action: scan the state's rule list in
    /// order, first match wins, else the state's default action.
    pub fn lookup(&self, state: u16, tag: Atom) -> Matched {
        let raw_tag = atom_to_raw(tag);
        let s = self.state(state);
        let mut cur = s.first_rule;
        while cur != 0 {
            let r = self.rule(atom_from_raw(cur));
            if self.bitmaps.test(atom_from_raw(r.tag_bitmap), raw_tag) {
                return Matched {
                    action: Action::from_u8(r.action),
                    use_tag: atom_from_raw(r.use_tag),
                    new_state: if r.new_state == 0 { None } else { Some(r.new_state as u16) },
                };
            }
            cur = r.next_rule;
        }
        Matched {
            action: Action::from_u8(s.default_action),
            use_tag: None,
            new_state: None,
        }
    }
}

fn check_state_id(id: u32) -> Result<u16> {
    if id > MAX_STATE_ID {
        return Err(ParrotError::Shape { name: format!("state id {id} exceeds 16 bits") });
    }
    Ok(id as u16)
}
