use hashbrown::HashSet;

use crate::{api::HeapObjectHeader, bitmap::ObjectBitmap, card_table::CardTable};

/// Records which cards of an image or zygote space have ever been dirtied,
/// so collections that do not collect those spaces can find their references
/// into collected spaces without keeping the cards dirty in the card table.
///
/// The set only grows: once a card held a reference out of the space it is
/// rescanned by every subsequent collection.
pub struct ModUnionTable {
    name: &'static str,
    space_begin: *mut u8,
    space_end: *mut u8,
    cleared_cards: HashSet<*mut u8>,
}

impl ModUnionTable {
    pub fn new(name: &'static str, space_begin: *mut u8, space_end: *mut u8) -> Self {
        Self {
            name,
            space_begin,
            space_end,
            cleared_cards: HashSet::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cards(&self) -> usize {
        self.cleared_cards.len()
    }

    /// Pull the dirty cards of the covered space out of the card table and
    /// into this table, cleaning them there.
    pub fn clear_cards(&mut self, card_table: &CardTable) {
        let cleared_cards = &mut self.cleared_cards;
        card_table.modify_cards_atomic(
            self.space_begin,
            self.space_end,
            |card| {
                if card == CardTable::CARD_DIRTY {
                    CardTable::CARD_CLEAN
                } else {
                    card
                }
            },
            |card_addr, _old, _new| {
                cleared_cards.insert(card_addr);
            },
        );
    }

    /// Trace every object on a recorded card through `visitor`.
    pub fn update_and_mark_references(
        &self,
        card_table: &CardTable,
        live_bitmap: &ObjectBitmap,
        mut visitor: impl FnMut(*mut HeapObjectHeader),
    ) {
        for &card in self.cleared_cards.iter() {
            let start = card_table.addr_from_card(card);
            let end = unsafe { start.add(CardTable::CARD_SIZE) };
            live_bitmap.visit_marked_range(start, end, &mut visitor);
        }
    }

    pub fn contains_card_for(&self, card_table: &CardTable, addr: *const u8) -> bool {
        self.cleared_cards
            .contains(&card_table.card_from_addr(addr))
    }
}

/// Like [ModUnionTable] but for spaces whose references into the moving
/// spaces die off: cards whose objects no longer point there are dropped
/// after each scan.
pub struct RememberedSet {
    name: &'static str,
    space_begin: *mut u8,
    space_end: *mut u8,
    dirty_cards: HashSet<*mut u8>,
}

impl RememberedSet {
    pub fn new(name: &'static str, space_begin: *mut u8, space_end: *mut u8) -> Self {
        Self {
            name,
            space_begin,
            space_end,
            dirty_cards: HashSet::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cards(&self) -> usize {
        self.dirty_cards.len()
    }

    pub fn clear_cards(&mut self, card_table: &CardTable) {
        let dirty_cards = &mut self.dirty_cards;
        card_table.modify_cards_atomic(
            self.space_begin,
            self.space_end,
            |card| {
                if card == CardTable::CARD_DIRTY {
                    CardTable::CARD_CLEAN
                } else {
                    card
                }
            },
            |card_addr, _old, _new| {
                dirty_cards.insert(card_addr);
            },
        );
    }

    /// Trace objects on dirty cards; `visitor` returns whether the object
    /// still references the target spaces. Cards with no remaining
    /// references are forgotten.
    pub fn update_and_mark_references(
        &mut self,
        card_table: &CardTable,
        live_bitmap: &ObjectBitmap,
        mut visitor: impl FnMut(*mut HeapObjectHeader) -> bool,
    ) {
        let mut remove_cards = Vec::new();
        for &card in self.dirty_cards.iter() {
            let start = card_table.addr_from_card(card);
            let end = unsafe { start.add(CardTable::CARD_SIZE) };
            let mut contains_reference = false;
            live_bitmap.visit_marked_range(start, end, |obj| {
                if visitor(obj) {
                    contains_reference = true;
                }
            });
            if !contains_reference {
                remove_cards.push(card);
            }
        }
        for card in remove_cards {
            self.dirty_cards.remove(&card);
        }
    }
}

unsafe impl Send for ModUnionTable {}
unsafe impl Send for RememberedSet {}
