//! Mode registration tables.
//!
//! Channel and user modes are letter-keyed slots. Simple (boolean) modes
//! get a bit allocated from a fixed-width mask; parameterised, list and
//! status modes are special-cased by the engine. Modules extend the
//! tables at load time and a full table is a load failure, not a panic.

pub mod apply;

use std::collections::BTreeMap;
use thiserror::Error;

/// Bitmask of the simple modes set on a channel or user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeMask(u64);

impl ModeMask {
    pub fn set(&mut self, bit: u8) {
        self.0 |= 1u64 << bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !(1u64 << bit);
    }

    pub fn has(self, bit: u8) -> bool {
        self.0 & (1u64 << bit) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Rank a status mode grants on a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Op,
    Halfop,
    Voice,
}

impl StatusKind {
    pub fn sigil(self) -> char {
        match self {
            StatusKind::Op => '@',
            StatusKind::Halfop => '%',
            StatusKind::Voice => '+',
        }
    }
}

/// Which ban-style list a list mode addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Ban,
    Except,
    Invex,
    Quiet,
}

/// The two stateful parameterised channel modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Key,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelModeKind {
    Simple,
    Param(ParamKind),
    List(ListKind),
    Status(StatusKind),
}

#[derive(Debug, Clone)]
pub struct ChannelModeSlot {
    pub letter: char,
    pub kind: ChannelModeKind,
    /// Allocated bit, for `Simple` slots only.
    pub bit: Option<u8>,
    /// Only server operators may change this mode.
    pub oper_only: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeTableError {
    #[error("mode letter {0} already registered")]
    LetterTaken(char),
    #[error("mode bit table exhausted")]
    TableFull,
}

const MAX_MODE_BITS: u8 = 64;

pub struct ChannelModeTable {
    slots: BTreeMap<char, ChannelModeSlot>,
    next_bit: u8,
    free_bits: Vec<u8>,
}

impl ChannelModeTable {
    /// Table with the core channel modes registered.
    pub fn new() -> Self {
        let mut table = ChannelModeTable {
            slots: BTreeMap::new(),
            next_bit: 0,
            free_bits: Vec::new(),
        };
        let must = |r: Result<(), ModeTableError>| r.expect("core mode set fits the table");

        for letter in ['n', 't', 's', 'm', 'i'] {
            must(table.register(letter, ChannelModeKind::Simple, false));
        }
        // +P survives an empty channel; operator-reserved.
        must(table.register('P', ChannelModeKind::Simple, true));
        must(table.register('k', ChannelModeKind::Param(ParamKind::Key), false));
        must(table.register('l', ChannelModeKind::Param(ParamKind::Limit), false));
        must(table.register('b', ChannelModeKind::List(ListKind::Ban), false));
        must(table.register('e', ChannelModeKind::List(ListKind::Except), false));
        must(table.register('I', ChannelModeKind::List(ListKind::Invex), false));
        must(table.register('q', ChannelModeKind::List(ListKind::Quiet), false));
        must(table.register('o', ChannelModeKind::Status(StatusKind::Op), false));
        must(table.register('h', ChannelModeKind::Status(StatusKind::Halfop), false));
        must(table.register('v', ChannelModeKind::Status(StatusKind::Voice), false));
        table
    }

    pub fn register(
        &mut self,
        letter: char,
        kind: ChannelModeKind,
        oper_only: bool,
    ) -> Result<(), ModeTableError> {
        if self.slots.contains_key(&letter) {
            return Err(ModeTableError::LetterTaken(letter));
        }
        let bit = if kind == ChannelModeKind::Simple {
            Some(self.allocate_bit()?)
        } else {
            None
        };
        self.slots.insert(
            letter,
            ChannelModeSlot {
                letter,
                kind,
                bit,
                oper_only,
            },
        );
        Ok(())
    }

    /// Orphan a letter, releasing its bit for reuse.
    pub fn unregister(&mut self, letter: char) -> Option<ChannelModeSlot> {
        let slot = self.slots.remove(&letter)?;
        if let Some(bit) = slot.bit {
            self.free_bits.push(bit);
        }
        Some(slot)
    }

    fn allocate_bit(&mut self) -> Result<u8, ModeTableError> {
        if let Some(bit) = self.free_bits.pop() {
            return Ok(bit);
        }
        if self.next_bit >= MAX_MODE_BITS {
            return Err(ModeTableError::TableFull);
        }
        let bit = self.next_bit;
        self.next_bit += 1;
        Ok(bit)
    }

    pub fn get(&self, letter: char) -> Option<&ChannelModeSlot> {
        self.slots.get(&letter)
    }

    /// Bit for a simple letter, when registered.
    pub fn simple_bit(&self, letter: char) -> Option<u8> {
        self.slots.get(&letter).and_then(|s| s.bit)
    }

    /// The registered simple slots, in letter order.
    pub fn simple_slots(&self) -> impl Iterator<Item = &ChannelModeSlot> {
        self.slots
            .values()
            .filter(|s| s.kind == ChannelModeKind::Simple)
    }

    /// The ISUPPORT `CHANMODES=` token: list,param-unset,param-set,simple.
    pub fn chanmodes_token(&self) -> String {
        let mut lists = String::new();
        let mut key_like = String::new();
        let mut limit_like = String::new();
        let mut simple = String::new();
        for slot in self.slots.values() {
            match slot.kind {
                ChannelModeKind::List(_) => lists.push(slot.letter),
                ChannelModeKind::Param(ParamKind::Key) => key_like.push(slot.letter),
                ChannelModeKind::Param(ParamKind::Limit) => limit_like.push(slot.letter),
                ChannelModeKind::Simple => simple.push(slot.letter),
                ChannelModeKind::Status(_) => {}
            }
        }
        format!("{lists},{key_like},{limit_like},{simple}")
    }

    /// Letters with status semantics in rank order, for `PREFIX=`.
    pub fn prefix_token(&self) -> String {
        let mut letters = String::new();
        let mut sigils = String::new();
        for kind in [StatusKind::Op, StatusKind::Halfop, StatusKind::Voice] {
            if let Some(slot) = self
                .slots
                .values()
                .find(|s| s.kind == ChannelModeKind::Status(kind))
            {
                letters.push(slot.letter);
                sigils.push(kind.sigil());
            }
        }
        format!("({letters}){sigils}")
    }
}

impl Default for ChannelModeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct UserModeSlot {
    pub letter: char,
    pub bit: u8,
    /// Cannot be set by the user themselves (`+o` comes only from OPER).
    pub restricted: bool,
}

pub struct UserModeTable {
    slots: BTreeMap<char, UserModeSlot>,
    next_bit: u8,
    free_bits: Vec<u8>,
}

impl UserModeTable {
    pub fn new() -> Self {
        let mut table = UserModeTable {
            slots: BTreeMap::new(),
            next_bit: 0,
            free_bits: Vec::new(),
        };
        let must = |r: Result<u8, ModeTableError>| r.expect("core umode set fits the table");
        must(table.register('i', false));
        must(table.register('w', false));
        must(table.register('o', true));
        table
    }

    pub fn register(&mut self, letter: char, restricted: bool) -> Result<u8, ModeTableError> {
        if self.slots.contains_key(&letter) {
            return Err(ModeTableError::LetterTaken(letter));
        }
        let bit = match self.free_bits.pop() {
            Some(bit) => bit,
            None => {
                if self.next_bit >= MAX_MODE_BITS {
                    return Err(ModeTableError::TableFull);
                }
                let bit = self.next_bit;
                self.next_bit += 1;
                bit
            }
        };
        self.slots.insert(
            letter,
            UserModeSlot {
                letter,
                bit,
                restricted,
            },
        );
        Ok(bit)
    }

    pub fn unregister(&mut self, letter: char) -> Option<UserModeSlot> {
        let slot = self.slots.remove(&letter)?;
        self.free_bits.push(slot.bit);
        Some(slot)
    }

    pub fn get(&self, letter: char) -> Option<&UserModeSlot> {
        self.slots.get(&letter)
    }

    /// Render a user's mode mask as `+iw` style.
    pub fn render(&self, mask: ModeMask) -> String {
        let mut out = String::from("+");
        for slot in self.slots.values() {
            if mask.has(slot.bit) {
                out.push(slot.letter);
            }
        }
        out
    }

    pub fn letters(&self) -> String {
        self.slots.keys().collect()
    }
}

impl Default for UserModeTable {
    fn default() -> Self {
        Self::new()
    }
}
